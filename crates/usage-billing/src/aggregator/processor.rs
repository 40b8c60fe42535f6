use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use crate::config::RefreshConfig;
use crate::error::{BillingError, Result};

/// Outcome of one background refresh pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub aggregations_recomputed: usize,
    pub drafts_refreshed: usize,
    pub invoices_finalized: usize,
    pub lifetime_usage_refreshed: usize,
    pub progressive_invoices: usize,
    pub wallet_rules_fired: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RefreshReport {
    pub fn processed(&self) -> usize {
        self.aggregations_recomputed
            + self.drafts_refreshed
            + self.invoices_finalized
            + self.lifetime_usage_refreshed
            + self.progressive_invoices
            + self.wallet_rules_fired
    }

    pub fn is_idle(&self) -> bool {
        self.processed() == 0 && self.failed == 0
    }
}

/// Work the refresh loop drives: recomputing invalidated aggregations,
/// refreshing and auto-finalizing drafts, lifetime usage, wallet rules
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    async fn refresh_pending(&self, batch_size: usize) -> Result<RefreshReport>;
}

pub struct RefreshProcessor {
    target: Arc<dyn RefreshTarget>,
    batch_size: usize,
    processing_interval: Duration,
    is_running: Arc<RwLock<bool>>,
    last_report: Arc<Mutex<Option<RefreshReport>>>,
}

impl RefreshProcessor {
    pub fn new(target: Arc<dyn RefreshTarget>, config: &RefreshConfig) -> Self {
        Self {
            target,
            batch_size: config.batch_size,
            processing_interval: Duration::from_secs(config.interval_seconds.max(1)),
            is_running: Arc::new(RwLock::new(false)),
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.is_running.write().await;
        if *running {
            return Err(BillingError::InvalidState {
                message: "Refresh processor is already running".to_string(),
            });
        }
        *running = true;
        drop(running);

        let processor = self.clone();
        tokio::spawn(async move {
            processor.processing_loop().await;
        });

        info!(
            "Refresh processor started (every {:?}, batch size {})",
            self.processing_interval, self.batch_size
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut running = self.is_running.write().await;
        *running = false;

        info!("Refresh processor stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn last_report(&self) -> Option<RefreshReport> {
        self.last_report.lock().await.clone()
    }

    async fn processing_loop(&self) {
        let mut ticker = interval(self.processing_interval);

        while *self.is_running.read().await {
            ticker.tick().await;
            if !*self.is_running.read().await {
                break;
            }

            if let Err(e) = self.process_batch().await {
                error!("Error refreshing pending work: {}", e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }

    pub async fn process_batch(&self) -> Result<RefreshReport> {
        let started_at = Utc::now();
        let mut report = self.target.refresh_pending(self.batch_size).await?;
        report.started_at = Some(started_at);
        report.completed_at = Some(Utc::now());

        if report.is_idle() {
            debug!("Nothing pending to refresh");
        } else if report.failed > 0 {
            warn!(
                "Refresh pass completed: {} processed, {} failed",
                report.processed(),
                report.failed
            );
        } else {
            info!(
                "Refresh pass completed: {} aggregations, {} drafts, {} finalized, {} lifetime usage, {} progressive, {} wallet rules",
                report.aggregations_recomputed,
                report.drafts_refreshed,
                report.invoices_finalized,
                report.lifetime_usage_refreshed,
                report.progressive_invoices,
                report.wallet_rules_fired
            );
        }

        *self.last_report.lock().await = Some(report.clone());
        Ok(report)
    }
}

impl Clone for RefreshProcessor {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            batch_size: self.batch_size,
            processing_interval: self.processing_interval,
            is_running: self.is_running.clone(),
            last_report: self.last_report.clone(),
        }
    }
}
