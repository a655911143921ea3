pub mod ml_model;
pub mod resnet;
pub mod preprocess;
pub mod training;
pub mod inference;

pub use ml_model::{CompactCnn, CompactCnnConfig, ImageClassifier};
pub use resnet::{ResNet18, ResNet18Config};
pub use preprocess::{preprocess, Augmentation};
pub use training::{train_model, EpochReport, ImageFolderDataset, TrainingOutcome};
pub use inference::{ClassifierNet, InferenceEngine};
