pub mod batcher;
pub mod limiter;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod targets;

pub use orchestrator::Orchestrator;
pub use progress::{EventSink, NullSink, ProgressStreamer, SinkClosed};
pub use retry::RetryPolicy;
