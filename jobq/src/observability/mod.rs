pub mod metrics;
pub mod layer;

#[cfg(feature = "tracing-basic")]
pub mod tracing;

pub use metrics::{LiveMetrics, QueueMetrics};
pub use layer::{BoxStream, ObservabilityLayer};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
