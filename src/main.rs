use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod aggregation;
mod catalog;
mod cleanup;
mod config;
mod db;
mod error;
mod models;
mod monitor;
mod notifier;
mod report;
mod repository;
mod server;
mod store;
mod timestamp;

use aggregation::Dimension;
use config::{AppConfig, EscalationConfig};
use models::{AggregatedStat, BreakdownEntry, DefectRecord, NestedBreakdown, OperatorStat, ParetoPoint};
use monitor::{OperatorContext, ThresholdMonitor, ThresholdState};
use notifier::{HttpNotifier, LogTransport, Notifier, TemplateNotifier};
use repository::{DefectFilters, DefectRepository};
use store::{LocalCache, PgDocumentStore, RecordStore, RemoteStore};

#[derive(Parser)]
#[command(name = "defect-escalation-tracker")]
#[command(about = "Manufacturing defect tracking with per-operator escalation", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "QUALITY_CONFIG")]
    config: Option<PathBuf>,
    /// Remote document database; the local cache is used alone when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Only defects detected in the last N days
    #[arg(long)]
    since_days: Option<i64>,
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    operator: Option<String>,
}

impl FilterArgs {
    fn to_filters(&self) -> DefectFilters {
        let start = self
            .from
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .or_else(|| {
                self.since_days
                    .map(|days| Utc::now() - chrono::Duration::days(days.max(1)))
            });
        DefectFilters {
            start_date: start,
            end_date: self
                .to
                .and_then(|d| d.and_hms_opt(23, 59, 59))
                .map(|d| d.and_utc()),
            category: self.category.clone(),
            operator_name: self.operator.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the remote database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import defects from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record one defect occurrence
    Record {
        #[arg(long)]
        operator: String,
        #[arg(long)]
        matricule: Option<String>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        nature: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        workstation: Option<String>,
        #[arg(long)]
        line: Option<u32>,
        #[arg(long)]
        shift_leader: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        ref1: Option<String>,
        #[arg(long)]
        ref2: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        /// Detection time (RFC 3339 or YYYY-MM-DD); defaults to now
        #[arg(long)]
        detected_at: Option<String>,
        /// Run a monitoring pass right after the write
        #[arg(long)]
        monitor: bool,
    },
    /// List defects
    List {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// Correct or annotate an existing defect
    Update {
        id: String,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        nature: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Delete a defect
    Delete { id: String },
    /// List distinct operator names and defect types
    Operators,
    /// Print aggregated statistics
    Stats {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run one threshold monitoring pass
    Monitor {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Send an escalation regardless of history
    Escalate {
        #[arg(long)]
        operator: String,
        #[arg(long)]
        level: u32,
    },
    /// Delete demo and test records
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Serve the escalation endpoint
    Serve,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsOutput {
    operators: Vec<OperatorStat>,
    by_category: Vec<BreakdownEntry>,
    by_workstation: Vec<BreakdownEntry>,
    by_line: Vec<BreakdownEntry>,
    by_shift_leader: Vec<BreakdownEntry>,
    by_project: Vec<BreakdownEntry>,
    by_operator_and_type: Vec<AggregatedStat>,
    pareto: Vec<ParetoPoint>,
    operator_by_line: Vec<NestedBreakdown>,
    operator_by_line_and_leader: Vec<NestedBreakdown>,
    major_defects_by_operator: Vec<NestedBreakdown>,
    major_defects_by_workstation: Vec<NestedBreakdown>,
}

impl StatsOutput {
    fn compute(defects: &[DefectRecord]) -> Self {
        Self {
            operators: aggregation::per_operator(defects),
            by_category: aggregation::breakdown(defects, Dimension::Category),
            by_workstation: aggregation::breakdown(defects, Dimension::Workstation),
            by_line: aggregation::breakdown(defects, Dimension::Line),
            by_shift_leader: aggregation::breakdown(defects, Dimension::ShiftLeader),
            by_project: aggregation::breakdown(defects, Dimension::Project),
            by_operator_and_type: repository::aggregate_by_operator_and_type(defects),
            pareto: aggregation::pareto_by(defects, Dimension::DefectType),
            operator_by_line: aggregation::cross_breakdown(
                defects,
                Dimension::Operator,
                &[Dimension::Line],
            ),
            operator_by_line_and_leader: aggregation::cross_breakdown(
                defects,
                Dimension::Operator,
                &[Dimension::Line, Dimension::ShiftLeader],
            ),
            major_defects_by_operator: aggregation::major_defects(
                defects,
                Dimension::DefectType,
                &[Dimension::Operator],
            ),
            major_defects_by_workstation: aggregation::major_defects(
                defects,
                Dimension::DefectType,
                &[Dimension::Workstation],
            ),
        }
    }
}

fn build_notifier(cfg: &EscalationConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    Ok(match &cfg.endpoint {
        Some(endpoint) => Arc::new(HttpNotifier::new(
            endpoint.clone(),
            Duration::from_secs_f64(cfg.timeout_seconds.max(1.0)),
        )?),
        None => Arc::new(TemplateNotifier::new(cfg.levels.clone(), Arc::new(LogTransport))),
    })
}

async fn run_monitor(
    config: &AppConfig,
    repo: &DefectRepository,
    filters: &DefectFilters,
) -> anyhow::Result<()> {
    let defects = repo.get_defects(filters).await?;
    let state = ThresholdState::load(&config.escalation.state_file)
        .await
        .context("failed to load threshold state")?;
    let mut monitor = ThresholdMonitor::new(
        state,
        config.escalation.thresholds(),
        build_notifier(&config.escalation)?,
    );

    let escalations = monitor.monitor_all(&defects).await;
    let state = monitor.into_state();
    state
        .save(&config.escalation.state_file)
        .await
        .context("failed to save threshold state")?;

    if escalations.is_empty() {
        println!("No new threshold crossings ({} operators tracked).", state.len());
    }
    for escalation in escalations {
        let status = if escalation.outcome.success { "sent" } else { "FAILED" };
        println!(
            "- {} crossed {} ({} -> {} defects): notification {}",
            escalation.event.operator_name,
            escalation.event.threshold_level,
            escalation.event.previous_count,
            escalation.event.defect_count,
            status
        );
    }
    Ok(())
}

fn print_defect(record: &DefectRecord) {
    let detected = record
        .detected_at
        .map(|at: DateTime<Utc>| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown date".to_string());
    println!(
        "{} | {} | {} | {} x{} | {}",
        record.id,
        detected,
        record.operator_name,
        record.defect_name().unwrap_or_else(|| record.defect_type()),
        record.occurrences(),
        record.workstation.as_deref().unwrap_or("-")
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(config::resolve_config_path(cli.config.clone()))?;

    let database_url = cli.database_url.clone().or_else(|| config.store.database_url.clone());
    let remote = database_url
        .as_deref()
        .map(|url| {
            PgDocumentStore::connect_lazy(
                url,
                Duration::from_secs(config.store.acquire_timeout_seconds.max(1)),
            )
        })
        .transpose()
        .context("invalid DATABASE_URL")?;
    if remote.is_none() {
        info!("no remote database configured, running on the local cache only");
    }

    let store = RecordStore::new(
        config.store.collection.clone(),
        remote
            .clone()
            .map(|pg| Arc::new(pg) as Arc<dyn RemoteStore>),
        LocalCache::new(config.store.cache_dir.clone(), config.store.cache_prefix.clone()),
    );
    let repo = DefectRepository::new(store.clone(), config.filters.clone());

    match cli.command {
        Commands::InitDb => {
            let pg = remote.context("init-db requires DATABASE_URL")?;
            db::init_db(pg.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = db::seed(&store).await?;
            println!("Inserted {inserted} seed defects.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&store, &csv).await?;
            println!("Inserted {inserted} defects from {}.", csv.display());
        }
        Commands::Record {
            operator,
            matricule,
            code,
            nature,
            category,
            count,
            workstation,
            line,
            shift_leader,
            project,
            ref1,
            ref2,
            comment,
            detected_at,
            monitor,
        } => {
            let detected_at = match detected_at {
                Some(raw) => timestamp::normalize_timestamp(&Value::String(raw.clone()))
                    .with_context(|| format!("unreadable --detected-at {raw:?}"))?,
                None => Utc::now(),
            };
            let category = category.or_else(|| {
                code.as_deref()
                    .and_then(catalog::category_of)
                    .map(String::from)
            });
            let record = DefectRecord {
                operator_name: operator,
                matricule,
                detected_at: Some(detected_at),
                workstation,
                production_line: line,
                shift_leader_name: shift_leader,
                project,
                defect_code: code,
                defect_nature: nature,
                category,
                occurrence_count: count.max(1),
                ref1,
                ref2,
                comment,
                ..Default::default()
            };
            let id = store.create(db::to_document(&record)?).await?;
            println!("Recorded defect {id}.");

            if monitor {
                run_monitor(&config, &repo, &DefectFilters::default()).await?;
            }
        }
        Commands::List { filters, json } => {
            let defects = repo.get_defects(&filters.to_filters()).await?;
            if json {
                let rows: Vec<Value> = defects
                    .iter()
                    .map(|d| -> anyhow::Result<Value> {
                        let mut value = serde_json::to_value(d)?;
                        value["id"] = json!(d.id);
                        Ok(value)
                    })
                    .collect::<anyhow::Result<_>>()?;
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if defects.is_empty() {
                println!("No defects found for these filters.");
            } else {
                defects.iter().for_each(print_defect);
            }
        }
        Commands::Update {
            id,
            count,
            nature,
            comment,
        } => {
            let mut patch = serde_json::Map::new();
            if let Some(count) = count {
                patch.insert("occurrenceCount".to_string(), json!(count.max(1)));
            }
            if let Some(nature) = nature {
                patch.insert("defectNature".to_string(), json!(nature));
            }
            if let Some(comment) = comment {
                patch.insert("comment".to_string(), json!(comment));
            }
            if patch.is_empty() {
                anyhow::bail!("nothing to update: pass --count, --nature or --comment");
            }
            store.update(&id, patch).await?;
            println!("Updated defect {id}.");
        }
        Commands::Delete { id } => {
            store.delete(&id).await?;
            println!("Deleted defect {id}.");
        }
        Commands::Operators => {
            println!("Operators:");
            for name in repo.get_unique_operator_names().await? {
                println!("- {name}");
            }
            println!("Defect types:");
            for defect_type in repo.get_unique_defect_types().await? {
                println!("- {defect_type}");
            }
        }
        Commands::Stats { filters, json } => {
            let defects = repo.get_defects(&filters.to_filters()).await?;
            let stats = StatsOutput::compute(&defects);
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            if stats.operators.is_empty() {
                println!("No defects found for these filters.");
                return Ok(());
            }
            println!("Operators by defect count:");
            for stat in stats.operators.iter() {
                println!("- {} {} ({})", stat.operator_name, stat.count, stat.alert_level.label());
            }
            println!("Pareto by defect type:");
            for point in stats.pareto.iter() {
                println!(
                    "- {} {} ({}%, cumulative {}%)",
                    point.label, point.count, point.percentage, point.cumulative_percentage
                );
            }
            println!("By line:");
            for entry in stats.by_line.iter() {
                println!("- {} {}", entry.label, entry.count);
            }
        }
        Commands::Monitor { filters } => {
            run_monitor(&config, &repo, &filters.to_filters()).await?;
        }
        Commands::Escalate { operator, level } => {
            if config.escalation.template(level).is_none() {
                anyhow::bail!(
                    "level {level} is not configured (known: {:?})",
                    config.escalation.thresholds()
                );
            }
            let defects = repo
                .get_defects(&DefectFilters {
                    operator_name: Some(operator.clone()),
                    ..Default::default()
                })
                .await?;
            let count = models::total_occurrences(&defects);
            let state = ThresholdState::load(&config.escalation.state_file).await?;
            let monitor = ThresholdMonitor::new(
                state,
                config.escalation.thresholds(),
                build_notifier(&config.escalation)?,
            );
            let context = OperatorContext::latest_for(&defects, &operator);
            let escalation = monitor.escalate_now(&operator, count, level, &context).await;
            println!("{}", serde_json::to_string_pretty(&escalation.outcome)?);
        }
        Commands::Cleanup { dry_run } => {
            let report = cleanup::cleanup_virtual_data(&store, &config.filters, dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Report { filters, out } => {
            let defect_filters = filters.to_filters();
            let defects = repo.get_defects(&defect_filters).await?;
            let report = report::build_report(
                filters.operator.as_deref().or(filters.category.as_deref()),
                defect_filters.start_date,
                &defects,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Serve => {
            let state = server::AppState::new(config.escalation.clone(), Arc::new(LogTransport));
            server::serve(state, &config.server).await?;
        }
    }

    Ok(())
}
