//! Infrastructure layer: job storage and queueing, orchestration, adapters, config.

pub mod adapters;
pub mod artifacts;
pub mod config;
pub mod datasets;
pub mod jobs;

pub use artifacts::{ArtifactError, ArtifactStore, DirectoryArtifactStore, InMemoryArtifactStore};
pub use config::{AppConfig, Backend, ConfigError};
pub use datasets::{
    DatasetError, DatasetLoader, DirectoryDatasetLoader, InMemoryDatasetLoader,
    SyntheticDatasetLoader,
};
