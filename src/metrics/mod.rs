// Client metrics
// In-process counters for cache behaviour, token refreshes and latency

mod collector;

pub use collector::{ClientMetrics, FamilyStats, MetricsSnapshot};
