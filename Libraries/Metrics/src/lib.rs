mod metrics;
mod server;

pub use metrics::{get_metrics, Metrics, MetricsBuilder};
pub use server::metrics_handler;
