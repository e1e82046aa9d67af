use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use incidentbot::config::{AppConfig, LoggingConfig};
use incidentbot::detect::{Incident, IncidentStatus};
use incidentbot::storage::TimeSeriesStore;
use incidentbot::telemetry::{LogEntry, LogLevel, Metric};
use incidentbot::Components;

/// Upper bound on waiting for webhook deliveries before a one-shot command exits.
const ALERT_DRAIN_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Parser)]
#[command(
    name = "incidentbot",
    about = "Metric and log driven incident detection and alerting",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + detection loop)
    Serve {
        /// Bind address, overrides the configured one
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one detection pass over every known service
    Detect,

    /// Send a test alert to the configured webhook
    TestAlert,

    /// Inspect and manage incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },

    /// Record telemetry directly into the store
    Ingest {
        #[command(subcommand)]
        kind: IngestKind,
    },
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List incidents, newest first
    List {
        /// Only incidents with this status
        #[arg(long)]
        status: Option<String>,

        /// Only incidents for this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Show one incident as JSON
    Show { id: i64 },

    /// Incident counts by status
    Stats,

    /// Change the status of an incident
    Update {
        id: i64,

        /// OPEN, INVESTIGATING or RESOLVED
        #[arg(long)]
        status: String,

        #[arg(long)]
        resolved_by: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum IngestKind {
    /// Record a single metric sample
    Metric {
        #[arg(long)]
        name: String,

        #[arg(long)]
        value: f64,

        #[arg(long)]
        service: String,

        #[arg(long)]
        pod: Option<String>,

        #[arg(long)]
        namespace: Option<String>,

        #[arg(long)]
        unit: Option<String>,
    },

    /// Record a single log entry
    Log {
        #[arg(long, default_value = "INFO")]
        level: String,

        #[arg(long)]
        message: String,

        #[arg(long)]
        service: String,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting incidentbot daemon");
            incidentbot::serve(config).await?;
        }
        Commands::Detect => {
            let components = Components::build(&config)?;
            let summary = components.scheduler.trigger_now().await?;
            println!(
                "Evaluated {} service(s), opened {} incident(s).",
                summary.services, summary.incidents_created
            );
            if !components.alerts.drain(ALERT_DRAIN_TIMEOUT).await {
                eprintln!("Warning: some alerts were still being delivered at exit.");
            }
        }
        Commands::TestAlert => {
            let components = Components::build(&config)?;
            if !components.alerts.send_test_alert().await {
                bail!("test alert was not delivered");
            }
            println!("Test alert sent.");
        }
        Commands::Incidents { action } => {
            let components = Components::build(&config)?;
            let manager = &components.incidents;

            match action {
                IncidentAction::List { status, service } => {
                    let mut incidents = match (&status, &service) {
                        (_, Some(service)) => manager.list_by_service(service).await?,
                        (Some(status), None) => manager.list_by_status(status.parse()?).await?,
                        (None, None) => manager.list_all().await?,
                    };
                    if let (Some(status), Some(_)) = (&status, &service) {
                        let status: IncidentStatus = status.parse()?;
                        incidents.retain(|i| i.status == status);
                    }
                    print_incidents(&incidents);
                }
                IncidentAction::Show { id } => match manager.get(id).await? {
                    Some(incident) => println!("{}", serde_json::to_string_pretty(&incident)?),
                    None => bail!("incident {} not found", id),
                },
                IncidentAction::Stats => {
                    let stats = manager.stats().await?;
                    println!("Open:           {}", stats.open);
                    println!("Investigating:  {}", stats.investigating);
                    println!("Resolved:       {}", stats.resolved);
                    println!("Critical open:  {}", stats.critical_open);
                    println!("High open:      {}", stats.high_open);
                }
                IncidentAction::Update {
                    id,
                    status,
                    resolved_by,
                    notes,
                } => match manager.update_status(id, &status, resolved_by, notes).await? {
                    Some(incident) => println!("Incident {} is now {}.", incident.id, incident.status),
                    None => bail!("incident {} not found", id),
                },
            }
        }
        Commands::Ingest { kind } => {
            let components = Components::build(&config)?;
            match kind {
                IngestKind::Metric {
                    name,
                    value,
                    service,
                    pod,
                    namespace,
                    unit,
                } => {
                    if !value.is_finite() {
                        bail!("metric value must be a finite number");
                    }
                    let mut metric = Metric::new(name, value, service);
                    metric.pod_name = pod;
                    metric.namespace = namespace;
                    metric.unit = unit;
                    let id = components.store.record_metric(&metric).await?;
                    println!("Recorded metric {}.", id);
                }
                IngestKind::Log {
                    level,
                    message,
                    service,
                } => {
                    let level: LogLevel = level
                        .parse()
                        .map_err(anyhow::Error::msg)
                        .context("invalid log level")?;
                    let id = components
                        .store
                        .record_log(&LogEntry::new(level, message, service))
                        .await?;
                    println!("Recorded log entry {}.", id);
                }
            }
        }
    }

    Ok(())
}

fn print_incidents(incidents: &[Incident]) {
    if incidents.is_empty() {
        println!("No incidents found.");
        return;
    }

    println!(
        "{:<6} | {:<20} | {:<8} | {:<13} | {:<20} | Detected",
        "ID", "Type", "Severity", "Status", "Service"
    );
    println!("{:-<6}-|-{:-<20}-|-{:-<8}-|-{:-<13}-|-{:-<20}-|-{:-<25}", "", "", "", "", "", "");
    for i in incidents {
        println!(
            "{:<6} | {:<20} | {:<8} | {:<13} | {:<20} | {}",
            i.id,
            i.incident_type.as_str(),
            i.severity.as_str(),
            i.status.as_str(),
            i.service_name,
            i.detected_at.to_rfc3339()
        );
    }
}
