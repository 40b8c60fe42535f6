pub mod aggregation;
pub mod charges;
pub mod coupons;
pub mod currency;
pub mod events;
pub mod expression;
pub mod fee_calculator;
pub mod fees;
pub mod filters;
pub mod invoice_assembler;
pub mod invoices;
pub mod metrics;
pub mod plans;
pub mod taxes;
pub mod types;
pub mod wallet_ledger;
pub mod wallets;

pub use aggregation::{CachedAggregation, QuantifiedEvent, QuantifiedState};
pub use charges::{Charge, ChargeFilter, ChargeModel, FilterPolicy, PercentageRange, PricingRange};
pub use coupons::{AppliedCoupon, Coupon, CouponFrequency, CouponKind, CouponLimitation};
pub use currency::{Currency, CurrencyProvider, StaticCurrencies};
pub use events::{Event, EventInput, EventProperties, NewEvent, PropertyValue};
pub use fee_calculator::{FeeCalculator, UsageQuantity};
pub use fees::{Fee, FeeKind};
pub use filters::{FilterMatch, GroupedBy};
pub use invoice_assembler::{AssemblyContext, InvoiceAssembler, PricedInvoice};
pub use invoices::{Invoice, InvoiceStatus, InvoicingReason};
pub use metrics::{AggregationType, BillableMetric, RoundingPolicy};
pub use plans::{Customer, Plan, PlanInterval, Subscription, UsageThreshold};
pub use taxes::{StaticTaxRates, TaxRate, TaxRateProvider};
pub use types::{BillingBounds, Lifecycle, TenantContext};
pub use wallet_ledger::{ConsumeOutcome, WalletApplication, WalletLedger};
pub use wallets::{RecurringTransactionRule, RuleMethod, RuleTrigger, Wallet, WalletTransaction};
