use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::coupons::{AppliedCoupon, Coupon};
use crate::domain::metrics::BillableMetric;
use crate::domain::plans::{Customer, Plan, Subscription, SubscriptionStatus};
use crate::domain::types::{
    BillableMetricId, CouponId, CustomerId, ExternalSubscriptionId, MetricCode, OrganizationId,
    PlanId, SubscriptionId,
};
use crate::error::Result;

/// Read-mostly billing configuration: metrics, plans, customers,
/// subscriptions and coupons
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_metric(&self, id: &BillableMetricId) -> Result<Option<BillableMetric>>;
    /// Active metric with the given code
    async fn find_metric_by_code(
        &self,
        organization_id: OrganizationId,
        code: &MetricCode,
    ) -> Result<Option<BillableMetric>>;
    async fn save_metric(&self, metric: &BillableMetric) -> Result<()>;

    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>>;
    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>>;
    async fn save_customer(&self, customer: &Customer) -> Result<()>;

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>>;
    async fn find_subscription(
        &self,
        organization_id: OrganizationId,
        external_id: &ExternalSubscriptionId,
    ) -> Result<Option<Subscription>>;
    async fn list_subscriptions(
        &self,
        organization_id: OrganizationId,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>>;
    async fn save_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn get_coupon(&self, id: &CouponId) -> Result<Option<Coupon>>;
    async fn save_coupon(&self, coupon: &Coupon) -> Result<()>;
    async fn list_applied_coupons(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<(AppliedCoupon, Coupon)>>;
    async fn save_applied_coupon(&self, applied: &AppliedCoupon) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryCatalogRepository {
    metrics: Arc<RwLock<HashMap<BillableMetricId, BillableMetric>>>,
    plans: Arc<RwLock<HashMap<PlanId, Plan>>>,
    customers: Arc<RwLock<HashMap<CustomerId, Customer>>>,
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
    coupons: Arc<RwLock<HashMap<CouponId, Coupon>>>,
    applied_coupons: Arc<RwLock<Vec<AppliedCoupon>>>,
}

impl InMemoryCatalogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn get_metric(&self, id: &BillableMetricId) -> Result<Option<BillableMetric>> {
        Ok(self.metrics.read().await.get(id).cloned())
    }

    async fn find_metric_by_code(
        &self,
        organization_id: OrganizationId,
        code: &MetricCode,
    ) -> Result<Option<BillableMetric>> {
        let metrics = self.metrics.read().await;
        Ok(metrics
            .values()
            .find(|m| m.organization_id == organization_id && &m.code == code && m.is_active())
            .cloned())
    }

    async fn save_metric(&self, metric: &BillableMetric) -> Result<()> {
        self.metrics.write().await.insert(metric.id, metric.clone());
        Ok(())
    }

    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>> {
        Ok(self.plans.read().await.get(id).cloned())
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.plans.write().await.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        Ok(self.customers.read().await.get(id).cloned())
    }

    async fn save_customer(&self, customer: &Customer) -> Result<()> {
        self.customers
            .write()
            .await
            .insert(customer.id, customer.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn find_subscription(
        &self,
        organization_id: OrganizationId,
        external_id: &ExternalSubscriptionId,
    ) -> Result<Option<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .find(|s| s.organization_id == organization_id && &s.external_id == external_id)
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        organization_id: OrganizationId,
        status: Option<SubscriptionStatus>,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        let mut list: Vec<Subscription> = subscriptions
            .values()
            .filter(|s| s.organization_id == organization_id)
            .filter(|s| status.map_or(true, |status| s.status == status))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(list)
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_coupon(&self, id: &CouponId) -> Result<Option<Coupon>> {
        Ok(self.coupons.read().await.get(id).cloned())
    }

    async fn save_coupon(&self, coupon: &Coupon) -> Result<()> {
        self.coupons.write().await.insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn list_applied_coupons(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<(AppliedCoupon, Coupon)>> {
        let applied = self.applied_coupons.read().await;
        let coupons = self.coupons.read().await;
        Ok(applied
            .iter()
            .filter(|a| &a.customer_id == customer_id)
            .filter_map(|a| coupons.get(&a.coupon_id).map(|c| (a.clone(), c.clone())))
            .collect())
    }

    async fn save_applied_coupon(&self, applied: &AppliedCoupon) -> Result<()> {
        let mut list = self.applied_coupons.write().await;
        match list.iter_mut().find(|a| a.id == applied.id) {
            Some(existing) => *existing = applied.clone(),
            None => list.push(applied.clone()),
        }
        Ok(())
    }
}
