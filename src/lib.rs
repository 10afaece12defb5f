pub mod api;
pub mod broadcaster;
pub mod broker;
pub mod camera;
pub mod config;
pub mod consolidator;
pub mod correlation;
pub mod error;
pub mod maintenance;
pub mod persistence;
pub mod radar;
pub mod types;
pub mod weather;

pub use config::AppConfig;
pub use error::{ErrorKind, PipelineError};
pub use types::{
    AlertLevel, CameraClassification, ConsolidatedEvent, Direction, LocalWeatherReading,
    ProcessingMetadata, RadarSample, RemoteWeatherReading,
};
