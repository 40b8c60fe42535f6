pub mod aggregator;
pub mod config;
pub mod distributed;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod seed;
pub mod storage;
pub mod telemetry;

pub use config::BillingConfig;
pub use engine::{
    BillingEngine, Collaborators, CurrentUsage, InvoiceHook, InvoiceRequest, NoopInvoiceHook,
    UsageQuery,
};
pub use error::{BillingError, Result};
