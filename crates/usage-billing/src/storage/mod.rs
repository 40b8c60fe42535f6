pub mod aggregations;
pub mod catalog;
pub mod events;
pub mod fees;
pub mod invoices;
pub mod usage;
pub mod wallets;

use std::sync::Arc;

pub use aggregations::{AggregationRepository, InMemoryAggregationRepository};

pub use catalog::{CatalogRepository, InMemoryCatalogRepository};

pub use events::{EventInsert, EventQuery, EventRepository, InMemoryEventRepository};

pub use fees::{FeeRepository, InMemoryFeeRepository};

pub use invoices::{InMemoryInvoiceRepository, InvoiceInsert, InvoiceRepository};

pub use usage::{InMemoryUsageRepository, UsageRepository};

pub use wallets::{InMemoryWalletRepository, WalletRepository};

/// Every repository the engine talks to
#[derive(Clone)]
pub struct Repositories {
    pub events: Arc<dyn EventRepository>,
    pub aggregations: Arc<dyn AggregationRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub fees: Arc<dyn FeeRepository>,
    pub invoices: Arc<dyn InvoiceRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub usage: Arc<dyn UsageRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventRepository::new()),
            aggregations: Arc::new(InMemoryAggregationRepository::new()),
            catalog: Arc::new(InMemoryCatalogRepository::new()),
            fees: Arc::new(InMemoryFeeRepository::new()),
            invoices: Arc::new(InMemoryInvoiceRepository::new()),
            wallets: Arc::new(InMemoryWalletRepository::new()),
            usage: Arc::new(InMemoryUsageRepository::new()),
        }
    }
}
