pub mod engine;
pub mod event_store;
pub mod processor;

pub use engine::{AggregationRequest, Aggregator, OPERATION_TYPE_PROPERTY};
pub use event_store::{EventStore, IngestOutcome};
pub use processor::{RefreshProcessor, RefreshReport, RefreshTarget};
