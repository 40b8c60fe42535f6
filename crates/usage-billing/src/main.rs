use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use usage_billing::aggregator::{RefreshProcessor, RefreshTarget};
use usage_billing::config::BillingConfig;
use usage_billing::domain::invoices::InvoicingReason;
use usage_billing::logging::{init_logging, DEFAULT_FILTER};
use usage_billing::seed::{load_events, Catalog};
use usage_billing::{BillingEngine, InvoiceRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "usage-billing")]
#[command(about = "Replays usage events against a billing catalog and prints the invoices")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Path to the JSON catalog snapshot")]
    catalog: Option<PathBuf>,

    #[arg(long, help = "Path to a JSON Lines file of usage events")]
    events: Option<PathBuf>,

    #[arg(long, requires = "to", help = "Start of the billed period (RFC 3339)")]
    from: Option<DateTime<Utc>>,

    #[arg(long, requires = "from", help = "End of the billed period (RFC 3339)")]
    to: Option<DateTime<Utc>>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[arg(long, help = "Dry run mode (validate config and catalog without billing)")]
    dry_run: bool,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.verbose, DEFAULT_FILTER)?;

    if args.gen_config {
        let config = BillingConfig::default();
        let toml = toml::to_string_pretty(&config)?;
        println!("{}", toml);
        return Ok(());
    }

    let config = BillingConfig::load(args.config)?;
    info!(
        "Starting usage billing replay ({} / {})",
        config.service.service_id, config.service.environment
    );

    let catalog_path = args
        .catalog
        .ok_or_else(|| anyhow!("--catalog is required unless --gen-config is set"))?;
    let catalog = Catalog::from_path(&catalog_path)?;
    let events = match &args.events {
        Some(path) => load_events(path)?,
        None => Vec::new(),
    };

    if args.dry_run {
        info!(
            "Configuration and catalog validated successfully (dry-run mode, {} events)",
            events.len()
        );
        return Ok(());
    }

    let engine = Arc::new(BillingEngine::in_memory(config.clone())?);
    catalog.install(engine.repositories()).await?;
    let tenant = catalog.tenant();

    let mut ingested: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (index, result) in engine
        .ingest_batch(&tenant, events)
        .await
        .into_iter()
        .enumerate()
    {
        match result {
            Ok(outcome) => *ingested.entry(outcome.as_str()).or_default() += 1,
            Err(e) => {
                warn!("Event {} rejected: {}", index + 1, e);
                *ingested.entry("invalid").or_default() += 1;
            }
        }
    }
    info!("Ingestion finished: {:?}", ingested);

    let target: Arc<dyn RefreshTarget> = engine.clone();
    let report = RefreshProcessor::new(target, &config.refresh)
        .process_batch()
        .await?;

    let mut requests = Vec::with_capacity(catalog.subscriptions.len());
    for subscription in &catalog.subscriptions {
        let bounds = match (args.from, args.to) {
            (Some(from), Some(to)) => Some((from, to)),
            _ => engine
                .billing_period(&tenant, &subscription.id, Utc::now())
                .await?
                .map(|b| (b.from_datetime, b.to_datetime)),
        };
        let Some((from_datetime, to_datetime)) = bounds else {
            debug!("Subscription {} has not started yet", subscription.id);
            continue;
        };
        requests.push(InvoiceRequest {
            subscription_id: subscription.id,
            from_datetime,
            to_datetime,
            invoicing_reason: InvoicingReason::SubscriptionPeriodic,
        });
    }

    let mut invoices = Vec::new();
    let mut failures = Vec::new();
    for (request, result) in requests
        .iter()
        .zip(engine.generate_invoices(&tenant, requests.clone()).await)
    {
        match result {
            Ok(invoice) => invoices.push(invoice),
            Err(e) => failures.push(json!({
                "subscription_id": request.subscription_id,
                "error": e.to_string(),
            })),
        }
    }

    if config.metrics.enabled {
        debug!("Engine metrics:\n{}", engine.metrics().render());
    }

    let output = json!({
        "ingested": ingested,
        "refresh": report,
        "invoices": invoices,
        "failures": failures,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    info!(
        "Generated {} invoice(s), {} failure(s)",
        invoices.len(),
        failures.len()
    );
    Ok(())
}
