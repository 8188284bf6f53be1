//! System resource monitoring and worker scaling advice.

mod metrics;
mod monitor;
mod source;

pub use metrics::{ResourceLimits, ResourceMetrics, ResourceSummary};
pub use monitor::{
    MAX_RECOMMENDED_THREADS, ResourceEvent, ResourceKind, ResourceMonitor, ScalingAction,
};
pub use source::{MetricsSource, SystemMetricsSource, SystemSnapshot};
