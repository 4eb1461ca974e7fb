pub mod metrics;
pub mod tracing;

pub use metrics::{serve_metrics, Metrics};
pub use tracing::init_tracing;
