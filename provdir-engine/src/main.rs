//! provdir - provider directory reconciliation engine
//!
//! Batch entry points for registry reconciliation, geocoding, confidence rescoring and
//! plan matching, plus JSON-lines ingestion and operator actions. Batch commands are
//! dry runs unless `--apply` is given. Ctrl-C stops a run at the next record boundary.
//!
//! Exit status is non-zero only for hard failures: a fatal external error that aborted the
//! run, or loss of the store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use provdir_common::config::TomlConfig;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use provdir_engine::config::{
    resolve_geocoder_api_key, ConfidenceSettings, GeocodeSettings, ReconcileSettings,
};
use provdir_engine::services::{
    resolve_discrepancy, DeactivationCleanup, GeocodingProcessor, GoogleGeocoder, ImportService,
    NppesClient, PlanMatcher, RegistryAuditor, VerificationService,
};
use provdir_engine::utils::RetryPolicy;
use provdir_engine::{BatchOptions, BatchReport};

/// Command-line arguments for provdir
#[derive(Parser, Debug)]
#[command(name = "provdir")]
#[command(about = "Provider directory reconciliation and confidence scoring")]
#[command(version)]
struct Args {
    /// Bootstrap TOML config file
    #[arg(long, global = true, env = "PROVDIR_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config file)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by batch commands
#[derive(ClapArgs, Debug, Clone, Copy)]
struct BatchArgs {
    /// Write changes (default is a dry run)
    #[arg(long)]
    apply: bool,

    /// Stop after this many records
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile providers against the NPI registry
    Reconcile {
        #[command(flatten)]
        batch: BatchArgs,

        /// Only visit providers never reconciled
        #[arg(long)]
        resume: bool,
    },
    /// Geocode unique ungeocoded addresses
    Geocode {
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Recompute confidence scores of verified acceptances
    Rescore {
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Match observed network names to canonical plans
    MatchPlans {
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Ingest a JSON-lines file of normalized records
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Ingest a JSON-lines file of crowd verifications
    Verify {
        #[arg(long)]
        file: PathBuf,
    },
    /// Delete deactivated providers and everything depending on them
    CleanupDeactivated {
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Mark a discrepancy resolved
    ResolveDiscrepancy {
        id: i64,
    },
    /// Show the current confidence of one acceptance
    ShowConfidence {
        #[arg(long)]
        npi: String,

        #[arg(long)]
        plan: String,

        /// Location row id (provider-wide acceptance when omitted)
        #[arg(long)]
        location: Option<i64>,

        /// Evaluate as of this RFC 3339 instant instead of now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
}

impl BatchArgs {
    fn options(self, cancel: &CancellationToken) -> BatchOptions {
        BatchOptions {
            dry_run: !self.apply,
            limit: self.limit,
            resume: false,
            cancel: cancel.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = provdir_common::config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&config);

    info!(
        "Starting provdir v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let db_path = provdir_common::config::resolve_database_path(args.database.as_deref(), &config);
    info!("Database: {}", db_path.display());
    let db = provdir_common::db::init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let report = match args.command {
        Command::Reconcile { batch, resume } => {
            let registry = NppesClient::from_config(&config.registry)?;
            let auditor = RegistryAuditor::new(
                db.clone(),
                Arc::new(registry),
                RetryPolicy::new(config.registry.max_attempts),
                ReconcileSettings::from(&config),
            );
            let mut options = batch.options(&cancel);
            options.resume = resume;
            auditor.run(&options).await?
        }
        Command::Geocode { batch } => run_geocoding(&db, &config, batch.options(&cancel)).await?,
        Command::Rescore { batch } => {
            let service = VerificationService::new(db.clone(), ConfidenceSettings::from(&config));
            service
                .rescore(&batch.options(&cancel), provdir_common::time::now())
                .await?
        }
        Command::MatchPlans { batch } => {
            let matcher = PlanMatcher::new(db.clone(), ConfidenceSettings::from(&config));
            let run = matcher.run(&batch.options(&cancel)).await?;
            for found in &run.ambiguous {
                println!(
                    "ambiguous: '{}' -> {} ('{}', score {:.2})",
                    found.network_name, found.plan_id, found.matched_text, found.score
                );
            }
            run.report
        }
        Command::Import { file } => {
            let service = ImportService::new(db.clone(), ConfidenceSettings::from(&config));
            service.import_file(&file, &apply_options(&cancel)).await?
        }
        Command::Verify { file } => {
            let service = ImportService::new(db.clone(), ConfidenceSettings::from(&config));
            service
                .import_verification_file(&file, &apply_options(&cancel))
                .await?
        }
        Command::CleanupDeactivated { batch } => {
            DeactivationCleanup::new(db.clone())
                .run(&batch.options(&cancel))
                .await?
        }
        Command::ResolveDiscrepancy { id } => {
            let discrepancy = resolve_discrepancy(&db, id).await?;
            println!("{}", serde_json::to_string_pretty(&discrepancy)?);
            return Ok(());
        }
        Command::ShowConfidence {
            npi,
            plan,
            location,
            as_of,
        } => {
            let service = VerificationService::new(db.clone(), ConfidenceSettings::from(&config));
            let as_of = as_of.unwrap_or_else(provdir_common::time::now);
            match service.confidence_at(&npi, &plan, location, as_of).await? {
                Some(reading) => println!("{}", serde_json::to_string_pretty(&reading)?),
                None => println!("No acceptance for {} / {}", npi, plan),
            }
            return Ok(());
        }
    };

    finish(report)
}

/// Initialize tracing: `RUST_LOG` wins over the TOML `[logging] level`
fn init_tracing(config: &TomlConfig) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Non-batch ingestion always writes
fn apply_options(cancel: &CancellationToken) -> BatchOptions {
    BatchOptions {
        cancel: cancel.clone(),
        ..BatchOptions::apply()
    }
}

async fn run_geocoding(db: &SqlitePool, config: &TomlConfig, options: BatchOptions) -> Result<BatchReport> {
    let settings = GeocodeSettings::from(config);

    // A dry run never calls out, so it does not need a key
    let api_key = match resolve_geocoder_api_key(db, config).await {
        Ok(key) => key,
        Err(err) if options.dry_run => {
            warn!("{}", err);
            String::new()
        }
        Err(err) => return Err(err.into()),
    };

    let geocoder = GoogleGeocoder::from_config(&config.geocoding, api_key)?;
    let processor = GeocodingProcessor::new(
        db.clone(),
        Arc::new(geocoder),
        RetryPolicy::new(config.geocoding.max_attempts),
        settings,
    );
    Ok(processor.run(&options).await?)
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, stopping at the next record boundary");
        cancel.cancel();
    }
}

/// Print the report and map hard failures to a non-zero exit
fn finish(report: BatchReport) -> Result<()> {
    println!("{}", report.summary_line());
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_hard_failure() {
        anyhow::bail!(
            "{} run failed: {}",
            report.kind.as_str(),
            report.fatal.as_deref().unwrap_or("unknown cause")
        );
    }
    Ok(())
}
