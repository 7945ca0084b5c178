pub mod config;
pub mod metrics_file;
pub mod registry;

pub use config::{load_cameras, parse_cameras, AgentConfig, CameraDefinition};
pub use metrics_file::write_metrics_file;
pub use registry::CameraRegistry;
