//! 画像の前処理とデータ拡張

use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::Rng;

use crate::model::Preprocessing;

/// ImageNetの平均と標準偏差
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 学習時のデータ拡張
#[derive(Debug, Clone, Copy)]
pub struct Augmentation {
    /// 左右反転の確率
    pub flip_probability: f64,
    /// 回転角の最大値（度、±）
    pub max_rotation_degrees: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            flip_probability: 0.5,
            max_rotation_degrees: 15.0,
        }
    }
}

impl Augmentation {
    pub fn apply<R: Rng + ?Sized>(&self, image: RgbImage, rng: &mut R) -> RgbImage {
        let image = if rng.gen_bool(self.flip_probability) {
            image::imageops::flip_horizontal(&image)
        } else {
            image
        };

        if self.max_rotation_degrees <= 0.0 {
            return image;
        }
        let degrees = rng.gen_range(-self.max_rotation_degrees..=self.max_rotation_degrees);
        rotate_about_center(&image, degrees.to_radians(), Interpolation::Bilinear, Rgb([0, 0, 0]))
    }
}

/// プロファイルのサイズにリサイズしたRGB画像
pub fn resize_rgb(image: &DynamicImage, preprocessing: Preprocessing) -> RgbImage {
    let size = preprocessing.size();
    image.resize_exact(size, size, FilterType::Triangle).to_rgb8()
}

/// RGB画像を (C, H, W) の順で平坦化した f32 列に変換
///
/// 画像はすでにプロファイルのサイズであること。
pub fn to_chw(image: &RgbImage, preprocessing: Preprocessing) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = image.get_pixel(x, y)[channel] as f32 / 255.0;
                let value = match preprocessing {
                    Preprocessing::ImageNet { .. } => (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
                    Preprocessing::UnitScale { .. } => value,
                };
                data.push(value);
            }
        }
    }

    data
}

/// 推論用の前処理（リサイズ + 正規化）
pub fn preprocess(image: &DynamicImage, preprocessing: Preprocessing) -> Vec<f32> {
    to_chw(&resize_rgb(image, preprocessing), preprocessing)
}
