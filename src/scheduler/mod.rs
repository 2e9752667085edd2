pub mod dispatch;
pub mod job;
pub mod queue;

pub use dispatch::{DispatchReport, Dispatcher, JobOutcome};
pub use job::JobDescription;
pub use queue::{JobQueue, QueueConsumer, QueueProducer, QueueSet};
