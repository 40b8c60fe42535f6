mod event_ingestion;
mod fee_calculation;
mod invoice_lifecycle;
mod usage_aggregation;
mod wallet_credits;
