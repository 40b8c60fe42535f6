use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::currency::round_cents;
use crate::domain::filters::GroupedBy;
use crate::domain::types::{
    ChargeFilterId, ChargeId, FeeId, InvoiceId, OrganizationId, PlanId, SubscriptionId,
    TransactionId,
};
use crate::error::Result;

/// What a fee bills for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeeKind {
    Charge {
        charge_id: ChargeId,
        charge_filter_id: Option<ChargeFilterId>,
    },
    /// Shortfall up to a charge's minimum amount
    TrueUp {
        charge_id: ChargeId,
        parent_fee_id: FeeId,
    },
    /// Shortfall up to the plan's minimum commitment
    Commitment { plan_id: PlanId },
    Subscription { plan_id: PlanId },
    /// Usage that arrived after its period was invoiced
    Adjustment {
        charge_id: ChargeId,
        charge_filter_id: Option<ChargeFilterId>,
        original_invoice_id: InvoiceId,
    },
}

/// Per-range breakdown of a tiered charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDetail {
    pub from_value: Decimal,
    pub to_value: Option<Decimal>,
    pub units: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_unit_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<Decimal>,
    pub flat_amount: Decimal,
    pub amount: Decimal,
}

/// Tax applied to a single fee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeTax {
    pub tax_code: String,
    pub rate: Decimal,
    pub precise_amount_cents: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub id: FeeId,
    pub organization_id: OrganizationId,
    pub subscription_id: SubscriptionId,
    pub invoice_id: Option<InvoiceId>,
    pub kind: FeeKind,
    #[serde(default)]
    pub grouped_by: GroupedBy,
    pub currency: String,
    pub units: Decimal,
    pub events_count: u64,
    /// Major units per unit
    pub precise_unit_amount: Decimal,
    pub amount_cents: i64,
    pub precise_amount_cents: Decimal,
    #[serde(default)]
    pub precise_coupons_amount_cents: Decimal,
    #[serde(default)]
    pub taxes_rate: Decimal,
    #[serde(default)]
    pub taxes_precise_amount_cents: Decimal,
    #[serde(default)]
    pub applied_taxes: Vec<FeeTax>,
    #[serde(default)]
    pub amount_details: Vec<RangeDetail>,
    pub pay_in_advance: bool,
    pub invoiceable: bool,
    #[serde(default)]
    pub pay_in_advance_transaction_id: Option<TransactionId>,
    pub properties_from: DateTime<Utc>,
    pub properties_to: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Fee {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organization_id: OrganizationId,
        subscription_id: SubscriptionId,
        kind: FeeKind,
        currency: impl Into<String>,
        units: Decimal,
        precise_unit_amount: Decimal,
        precise_amount_cents: Decimal,
        period: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Self> {
        Ok(Self {
            id: FeeId::new(),
            organization_id,
            subscription_id,
            invoice_id: None,
            kind,
            grouped_by: GroupedBy::new(),
            currency: currency.into(),
            units,
            events_count: 0,
            precise_unit_amount,
            amount_cents: round_cents(precise_amount_cents)?,
            precise_amount_cents,
            precise_coupons_amount_cents: Decimal::ZERO,
            taxes_rate: Decimal::ZERO,
            taxes_precise_amount_cents: Decimal::ZERO,
            applied_taxes: Vec::new(),
            amount_details: Vec::new(),
            pay_in_advance: false,
            invoiceable: true,
            pay_in_advance_transaction_id: None,
            properties_from: period.0,
            properties_to: period.1,
            created_at: Utc::now(),
        })
    }

    pub fn charge_id(&self) -> Option<ChargeId> {
        match &self.kind {
            FeeKind::Charge { charge_id, .. }
            | FeeKind::TrueUp { charge_id, .. }
            | FeeKind::Adjustment { charge_id, .. } => Some(*charge_id),
            FeeKind::Commitment { .. } | FeeKind::Subscription { .. } => None,
        }
    }

    pub fn charge_filter_id(&self) -> Option<ChargeFilterId> {
        match &self.kind {
            FeeKind::Charge {
                charge_filter_id, ..
            }
            | FeeKind::Adjustment {
                charge_filter_id, ..
            } => *charge_filter_id,
            _ => None,
        }
    }

    pub fn true_up_parent_fee_id(&self) -> Option<FeeId> {
        match &self.kind {
            FeeKind::TrueUp { parent_fee_id, .. } => Some(*parent_fee_id),
            _ => None,
        }
    }

    pub fn coupons_amount_cents(&self) -> Result<i64> {
        round_cents(self.precise_coupons_amount_cents)
    }

    pub fn taxes_amount_cents(&self) -> Result<i64> {
        round_cents(self.taxes_precise_amount_cents)
    }

    /// Amount remaining after coupons, the base taxes are computed on
    pub fn taxable_precise_cents(&self) -> Decimal {
        (self.precise_amount_cents - self.precise_coupons_amount_cents).max(Decimal::ZERO)
    }

    pub fn is_pending_in_advance(&self) -> bool {
        self.pay_in_advance && self.invoiceable && self.invoice_id.is_none()
    }
}
