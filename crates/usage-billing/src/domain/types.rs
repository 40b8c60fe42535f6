use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{BillingError, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

uuid_id!(
    /// Tenant (billing entity) identifier
    OrganizationId
);
uuid_id!(CustomerId);
uuid_id!(PlanId);
uuid_id!(SubscriptionId);
uuid_id!(BillableMetricId);
uuid_id!(BillableMetricFilterId);
uuid_id!(ChargeId);
uuid_id!(ChargeFilterId);
uuid_id!(FeeId);
uuid_id!(InvoiceId);
uuid_id!(CreditNoteId);
uuid_id!(CouponId);
uuid_id!(AppliedCouponId);
uuid_id!(WalletId);
uuid_id!(WalletTransactionId);
uuid_id!(RecurringRuleId);

string_id!(
    /// Subscription identifier as supplied by the customer's systems
    ExternalSubscriptionId
);
string_id!(ExternalCustomerId);
string_id!(
    /// Client-supplied idempotency key of a usage event
    TransactionId
);
string_id!(
    /// Billable metric code referenced by events
    MetricCode
);

/// Explicit tenant scope threaded through every engine call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: OrganizationId,
}

impl TenantContext {
    pub fn new(organization_id: OrganizationId) -> Self {
        Self { organization_id }
    }

    /// Fails when a record belongs to another tenant
    pub fn ensure_owns(&self, organization_id: OrganizationId, entity: &'static str) -> Result<()> {
        if self.organization_id != organization_id {
            return Err(BillingError::not_found(entity, organization_id));
        }
        Ok(())
    }
}

/// Lifecycle replacing soft-deletion; archived records remain readable by id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Archived { at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }

    pub fn archive(&mut self, at: DateTime<Utc>) {
        if self.is_active() {
            *self = Lifecycle::Archived { at };
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::Active
    }
}

/// Billing period boundaries of one invoice/subscription pair.
///
/// `from_datetime..to_datetime` is the full billing period; the charges window
/// is the part of it the subscription is billable for (narrower when the
/// subscription starts or terminates mid-period). All ranges are half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingBounds {
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub charges_from_datetime: DateTime<Utc>,
    pub charges_to_datetime: DateTime<Utc>,
}

impl BillingBounds {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        Self::with_charges_window(from, to, from, to)
    }

    pub fn with_charges_window(
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        charges_from: DateTime<Utc>,
        charges_to: DateTime<Utc>,
    ) -> Result<Self> {
        if to <= from {
            return Err(BillingError::validation(
                "to_datetime",
                "billing period must end after it starts",
            ));
        }
        if charges_to < charges_from || charges_from < from || charges_to > to {
            return Err(BillingError::validation(
                "charges_datetime",
                "charges window must lie within the billing period",
            ));
        }
        Ok(Self {
            from_datetime: from,
            to_datetime: to,
            charges_from_datetime: charges_from,
            charges_to_datetime: charges_to,
        })
    }

    pub fn period_seconds(&self) -> i64 {
        (self.to_datetime - self.from_datetime).num_seconds()
    }

    pub fn charges_seconds(&self) -> i64 {
        (self.charges_to_datetime - self.charges_from_datetime).num_seconds()
    }

    /// Share of the full period covered by the charges window
    pub fn proration_factor(&self) -> Decimal {
        let total = self.period_seconds();
        if total <= 0 {
            return Decimal::ONE;
        }
        Decimal::from(self.charges_seconds()) / Decimal::from(total)
    }

    pub fn is_full_period(&self) -> bool {
        self.charges_from_datetime == self.from_datetime
            && self.charges_to_datetime == self.to_datetime
    }

    pub fn charges_contain(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.charges_from_datetime && timestamp < self.charges_to_datetime
    }

    pub fn period_contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.from_datetime && timestamp < self.to_datetime
    }

    /// Same period, charges window cut off at `until`
    pub fn truncated_at(&self, until: DateTime<Utc>) -> Self {
        let charges_to = until
            .max(self.charges_from_datetime)
            .min(self.charges_to_datetime);
        Self {
            charges_to_datetime: charges_to,
            ..*self
        }
    }
}

/// Overlap in seconds between two half-open intervals
pub fn overlap_seconds(
    a_from: DateTime<Utc>,
    a_to: DateTime<Utc>,
    b_from: DateTime<Utc>,
    b_to: DateTime<Utc>,
) -> i64 {
    let start = a_from.max(b_from);
    let end = a_to.min(b_to);
    if end > start {
        (end - start).num_seconds()
    } else {
        0
    }
}
