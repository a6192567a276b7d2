pub mod capture;
pub mod worker;

pub use capture::UsageCapture;
pub use worker::{MetricsWorker, MetricsWorkerConfig};
