//! Catalog snapshots and event files used to replay billing offline.
//!
//! A catalog is one JSON document holding the serialized metrics, plans,
//! customers, subscriptions, coupons and wallets of a single organization.
//! Events are read from JSON Lines, one ingestion payload per line.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::domain::coupons::{AppliedCoupon, Coupon};
use crate::domain::events::EventInput;
use crate::domain::metrics::BillableMetric;
use crate::domain::plans::{Customer, Plan, Subscription};
use crate::domain::types::{OrganizationId, TenantContext};
use crate::domain::wallets::Wallet;
use crate::error::{BillingError, Result};
use crate::storage::Repositories;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub metrics: Vec<BillableMetric>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub customers: Vec<Customer>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub coupons: Vec<Coupon>,
    #[serde(default)]
    pub applied_coupons: Vec<AppliedCoupon>,
    #[serde(default)]
    pub wallets: Vec<Wallet>,
}

impl Catalog {
    pub fn new(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            metrics: Vec::new(),
            plans: Vec::new(),
            customers: Vec::new(),
            subscriptions: Vec::new(),
            coupons: Vec::new(),
            applied_coupons: Vec::new(),
            wallets: Vec::new(),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let catalog: Catalog = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        catalog
            .validate()
            .map_err(|e| anyhow!("Invalid catalog {}: {}", path.display(), e))?;
        Ok(catalog)
    }

    pub fn tenant(&self) -> TenantContext {
        TenantContext::new(self.organization_id)
    }

    /// Checks every record belongs to the catalog's organization and passes
    /// its own write-time validation
    pub fn validate(&self) -> Result<()> {
        let owners = self
            .metrics
            .iter()
            .map(|m| ("billable_metric", m.organization_id))
            .chain(self.plans.iter().map(|p| ("plan", p.organization_id)))
            .chain(self.customers.iter().map(|c| ("customer", c.organization_id)))
            .chain(
                self.subscriptions
                    .iter()
                    .map(|s| ("subscription", s.organization_id)),
            )
            .chain(self.coupons.iter().map(|c| ("coupon", c.organization_id)))
            .chain(self.wallets.iter().map(|w| ("wallet", w.organization_id)));
        for (entity, organization_id) in owners {
            if organization_id != self.organization_id {
                return Err(BillingError::validation(
                    entity,
                    format!("belongs to organization {}", organization_id),
                ));
            }
        }

        for metric in &self.metrics {
            metric.validate()?;
        }
        for plan in &self.plans {
            plan.validate()?;
        }
        for coupon in &self.coupons {
            coupon.validate()?;
        }
        for wallet in &self.wallets {
            wallet.validate()?;
        }
        Ok(())
    }

    pub async fn install(&self, repos: &Repositories) -> Result<()> {
        self.validate()?;
        let catalog = &repos.catalog;
        for metric in &self.metrics {
            catalog.save_metric(metric).await?;
        }
        for plan in &self.plans {
            catalog.save_plan(plan).await?;
        }
        for customer in &self.customers {
            catalog.save_customer(customer).await?;
        }
        for subscription in &self.subscriptions {
            catalog.save_subscription(subscription).await?;
        }
        for coupon in &self.coupons {
            catalog.save_coupon(coupon).await?;
        }
        for applied in &self.applied_coupons {
            catalog.save_applied_coupon(applied).await?;
        }
        for wallet in &self.wallets {
            repos.wallets.create_wallet(wallet).await?;
        }

        info!(
            "Installed catalog for organization {}: {} metrics, {} plans, {} subscriptions",
            self.organization_id,
            self.metrics.len(),
            self.plans.len(),
            self.subscriptions.len()
        );
        Ok(())
    }
}

/// Reads a JSON Lines file of ingestion payloads; blank lines are skipped
pub fn load_events(path: &Path) -> anyhow::Result<Vec<EventInput>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<EventInput>(line).with_context(|| {
                format!("Invalid event on line {} of {}", index + 1, path.display())
            })
        })
        .collect()
}
