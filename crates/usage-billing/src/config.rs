use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    pub service: ServiceConfig,
    pub aggregation: AggregationConfig,
    pub wallet: WalletConfig,
    pub refresh: RefreshConfig,
    pub invoicing: InvoicingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_id: String,
    pub environment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Decimal places kept on aggregated values when a metric has no rounding policy
    pub default_precision: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl WalletConfig {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(6));
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub interval_seconds: u64,
    pub batch_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvoicingConfig {
    pub number_prefix: String,
    pub default_currency: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                service_id: "usage-billing".to_string(),
                environment: "development".to_string(),
            },
            aggregation: AggregationConfig {
                default_precision: 12,
            },
            wallet: WalletConfig {
                max_retries: 5,
                base_backoff_ms: 10,
            },
            refresh: RefreshConfig {
                interval_seconds: 30,
                batch_size: 100,
            },
            invoicing: InvoicingConfig {
                number_prefix: "INV".to_string(),
                default_currency: "USD".to_string(),
            },
            metrics: MetricsConfig { enabled: true },
        }
    }
}

impl BillingConfig {
    pub fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(BillingConfig::default()));

        if let Some(path) = path_override {
            if !path.exists() {
                return Err(anyhow!("Configuration file {} not found", path.display()));
            }
            figment = figment.merge(Toml::file(&path));
        } else {
            let default_path = PathBuf::from("usage-billing.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }

        figment = figment.merge(Env::prefixed("USAGE_BILLING_").split("__"));

        let config: BillingConfig = figment
            .extract()
            .map_err(|e| anyhow!("Configuration error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh.batch_size == 0 {
            return Err(anyhow!("refresh.batch_size must be greater than zero"));
        }
        if self.refresh.interval_seconds == 0 {
            return Err(anyhow!("refresh.interval_seconds must be greater than zero"));
        }
        if self.invoicing.number_prefix.trim().is_empty() {
            return Err(anyhow!("invoicing.number_prefix must not be empty"));
        }
        if self.aggregation.default_precision > 28 {
            return Err(anyhow!("aggregation.default_precision cannot exceed 28"));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_seconds)
    }
}
