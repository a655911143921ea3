use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

use crate::types::LabeledSample;

/// ラベルごとの比率を保ったまま学習用と検証用に分割
///
/// ラベルごとに `round(n * val_ratio)` 件を検証用に回します。
/// 2件以上あるラベルは学習・検証の両方に最低1件ずつ入ります。
/// 同じシードなら結果は常に同じです。
pub fn stratified_split(
    samples: Vec<LabeledSample>,
    val_ratio: f64,
    seed: u64,
) -> anyhow::Result<(Vec<LabeledSample>, Vec<LabeledSample>)> {
    if !(0.0..1.0).contains(&val_ratio) {
        anyhow::bail!("val_ratio は 0 以上 1 未満である必要があります: {}", val_ratio);
    }

    let mut by_label: BTreeMap<String, Vec<LabeledSample>> = BTreeMap::new();
    for sample in samples {
        by_label.entry(sample.label.clone()).or_default().push(sample);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut val = Vec::new();

    for (label, mut group) in by_label {
        group.shuffle(&mut rng);

        let n_val = validation_count(group.len(), val_ratio);
        let train_part = group.split_off(n_val);
        tracing::debug!(label = %label, train = train_part.len(), val = group.len(), "split");

        val.extend(group);
        train.extend(train_part);
    }

    Ok((train, val))
}

fn validation_count(n: usize, val_ratio: f64) -> usize {
    let raw = (n as f64 * val_ratio).round() as usize;
    if val_ratio > 0.0 && n >= 2 {
        raw.clamp(1, n - 1)
    } else {
        raw.min(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn samples(label: &str, n: usize) -> Vec<LabeledSample> {
        (0..n)
            .map(|i| LabeledSample {
                image_id: format!("{label}_{i:04}"),
                diagnosis_code: label.to_lowercase(),
                label: label.to_string(),
            })
            .collect()
    }

    fn count(samples: &[LabeledSample], label: &str) -> usize {
        samples.iter().filter(|s| s.label == label).count()
    }

    #[test]
    fn test_stratified_proportions() {
        let mut all = samples("Benign", 100);
        all.extend(samples("Melanoma", 30));
        all.extend(samples("Carcinoma", 10));

        let (train, val) = stratified_split(all, 0.2, 42).unwrap();

        assert_eq!(count(&val, "Benign"), 20);
        assert_eq!(count(&val, "Melanoma"), 6);
        assert_eq!(count(&val, "Carcinoma"), 2);
        assert_eq!(count(&train, "Benign"), 80);
        assert_eq!(train.len() + val.len(), 140);

        // 各サンプルはどちらか一方にだけ入る
        let train_ids: HashSet<_> = train.iter().map(|s| &s.image_id).collect();
        assert!(val.iter().all(|s| !train_ids.contains(&s.image_id)));
    }

    #[test]
    fn test_deterministic_for_seed() {
        let all = samples("Benign", 50);
        let (_, val_a) = stratified_split(all.clone(), 0.2, 7).unwrap();
        let (_, val_b) = stratified_split(all.clone(), 0.2, 7).unwrap();
        let (_, val_c) = stratified_split(all, 0.2, 8).unwrap();

        assert_eq!(val_a, val_b);
        assert_ne!(val_a, val_c);
    }

    #[test]
    fn test_small_classes_keep_both_sides() {
        let (train, val) = stratified_split(samples("Rare", 2), 0.2, 42).unwrap();
        assert_eq!(train.len(), 1);
        assert_eq!(val.len(), 1);

        let (train, val) = stratified_split(samples("Single", 1), 0.2, 42).unwrap();
        assert_eq!(train.len(), 1);
        assert!(val.is_empty());
    }

    #[test]
    fn test_zero_ratio_and_invalid_ratio() {
        let (train, val) = stratified_split(samples("Benign", 5), 0.0, 42).unwrap();
        assert_eq!((train.len(), val.len()), (5, 0));

        assert!(stratified_split(samples("Benign", 5), 1.0, 42).is_err());
        assert!(stratified_split(samples("Benign", 5), -0.1, 42).is_err());
    }
}
