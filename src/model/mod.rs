pub mod model_metadata;
pub mod model_storage;
pub mod label_set;
pub mod config;

pub use model_metadata::{Architecture, ModelMetadata, Preprocessing};
pub use model_storage::{archive_path, save_model_with_metadata, load_metadata, load_model_with_metadata, log_metadata_info};
pub use label_set::{ClassLabelSet, LabelSetError};
pub use config::{AppConfig, DeviceType, PreparationSettings, TrainingSettings, ServerSettings};
