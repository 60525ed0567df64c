//! pg-linkage CLI - record linkage, merge and dedup jobs against PostgreSQL.

use clap::{Parser, Subcommand};
use pg_linkage::{Config, Engine, Job, JobConfig, LinkageError, PgPool, RunPlan, SchemaSource};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-linkage")]
#[command(about = "Record linkage and merge engine for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML job file
    #[arg(short, long, default_value = "linkage.yaml")]
    config: PathBuf,

    /// Output JSON results to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match and merge (or deduplicate)
    Run {
        /// Only run the named job
        #[arg(long)]
        job: Option<String>,
    },

    /// Match and report per-group counts without changing any table
    Audit {
        /// Only audit the named job
        #[arg(long)]
        job: Option<String>,
    },

    /// Print the statements a run would execute
    Plan {
        /// Only plan the named job
        #[arg(long)]
        job: Option<String>,

        /// Plan an audit instead of a run
        #[arg(long)]
        audit: bool,
    },

    /// Test the database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), LinkageError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(LinkageError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run { job } => {
            let cancel_token = setup_signal_handler().await?;
            let pool = PgPool::new(&config.database).await?;
            let executor = pool.executor().await?;
            let engine = Engine::new(config.capabilities()?).with_config_hash(config.hash());

            for job_config in config.select_jobs(job.as_deref())? {
                let job = Job::resolve(job_config, Some(&executor)).await?;
                let report = engine.run(&executor, &job, &cancel_token).await?;

                if cli.output_json {
                    println!("{}", report.to_json()?);
                } else {
                    println!("\n{} '{}' completed", report.kind, report.job);
                    println!("  Run ID: {}", report.run_id);
                    println!("  Duration: {:.2}s", report.duration_seconds);
                    println!("  Statements: {}", report.statements_executed);
                    println!("  Rows linked: {}", report.rows_linked);
                    if let Some(n) = report.rows_updated {
                        println!("  Rows updated: {}", n);
                    }
                    if let Some(n) = report.rows_inserted {
                        println!("  Rows inserted: {}", n);
                    }
                    if let Some(n) = report.rows_merged {
                        println!("  Duplicates merged: {}", n);
                    }
                }
            }
        }

        Commands::Audit { job } => {
            let cancel_token = setup_signal_handler().await?;
            let pool = PgPool::new(&config.database).await?;
            let executor = pool.executor().await?;
            let engine = Engine::new(config.capabilities()?).with_config_hash(config.hash());

            for job_config in config.select_jobs(job.as_deref())? {
                let job = Job::resolve(job_config, Some(&executor)).await?;
                let report = engine.audit(&executor, &job, &cancel_token).await?;

                if cli.output_json {
                    println!("{}", report.to_json()?);
                } else if let Some(audit) = &report.audit_result {
                    println!("\nAudit of '{}':", report.job);
                    print!("{}", audit);
                }
            }
        }

        Commands::Plan { job, audit } => {
            let selected = config.select_jobs(job.as_deref())?;
            let engine = Engine::new(config.capabilities()?);

            // Jobs that declare all their columns are planned without connecting.
            let pool = if selected.iter().all(|j| j.is_self_describing()) {
                None
            } else {
                Some(PgPool::new(&config.database).await?)
            };
            let executor = match &pool {
                Some(pool) => Some(pool.executor().await?),
                None => None,
            };
            let schema = executor.as_ref().map(|e| e as &dyn SchemaSource);

            let plans = plan_jobs(&engine, &selected, schema, audit).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    println!("-- {} '{}'", plan.kind, plan.job);
                    for stmt in plan.statements() {
                        println!("{}\n", stmt);
                    }
                }
            }
        }

        Commands::HealthCheck => {
            let start = std::time::Instant::now();
            let pool = PgPool::new(&config.database).await?;
            let version = pool.server_version().await?;
            let latency_ms = start.elapsed().as_millis();

            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "healthy": true,
                        "server_version": version,
                        "latency_ms": latency_ms,
                    }))?
                );
            } else {
                println!("Health Check Results:");
                println!("  PostgreSQL {}: OK ({}ms)", version, latency_ms);
            }
        }
    }

    Ok(())
}

async fn plan_jobs(
    engine: &Engine,
    jobs: &[&JobConfig],
    schema: Option<&dyn SchemaSource>,
    audit: bool,
) -> Result<Vec<RunPlan>, LinkageError> {
    let mut plans = Vec::with_capacity(jobs.len());
    for job_config in jobs {
        let job = Job::resolve(job_config, schema).await?;
        plans.push(engine.plan(&job, audit)?);
    }
    Ok(plans)
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancel the running job on SIGINT or SIGTERM. Cancellation takes effect
/// before the next statement and rolls the run back.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, LinkageError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Rolling back..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Rolling back..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, LinkageError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Rolling back...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
