pub mod best_effort;
pub mod camera;
pub mod env;
pub mod validation;

pub use best_effort::BestEffort;
pub use camera::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
