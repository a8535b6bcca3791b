use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use govcon_storage::{with_lock, BackfillFilter, LockKey};
use govcon_sync::{posted_window, AppConfig, AppContext, BackfillConfig, BackfillOutcome};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "govcon")]
#[command(about = "Procurement opportunity ingestion and description pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the posted window from the listing API.
    Ingest {
        #[arg(long)]
        window_days: Option<i64>,
    },
    /// Reprocess stored descriptions in bulk.
    Backfill {
        /// missing-ai-input, stale-normalization, unfetched or all
        #[arg(long)]
        filter: Option<BackfillFilter>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print one description as JSON, fetching it if needed.
    Describe {
        notice_id: String,
        #[arg(long)]
        refresh: bool,
    },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    Migrate,
}

/// Process status for a finished run: nonzero when any record failed.
fn run_status(errors: usize) -> u8 {
    u8::from(errors > 0)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest { window_days: None }) {
        Commands::Ingest { window_days } => {
            let days = window_days.unwrap_or(config.ingestion_window_days);
            let context = AppContext::connect(config).await?;
            let service = context.ingestion_service()?;
            let (from, to) = posted_window(chrono::Utc::now().date_naive(), days);

            let locked = with_lock(context.mutex.as_ref(), LockKey::INGESTION, || async move {
                service.ingest(&from, &to).await.map_err(anyhow::Error::from)
            })
            .await?;
            let Some(stats) = locked else {
                info!("ingestion already running elsewhere");
                return Ok(ExitCode::SUCCESS);
            };
            println!("{}", serde_json::to_string(&stats)?);
            if stats.errors > 0 {
                warn!(errors = stats.errors, "ingestion finished with record errors");
            }
            return Ok(ExitCode::from(run_status(stats.errors)));
        }
        Commands::Backfill {
            filter,
            limit,
            dry_run,
            workers,
        } => {
            let backfill = BackfillConfig {
                filter: filter.unwrap_or(config.backfill.filter),
                limit,
                dry_run,
                workers: workers.unwrap_or(config.backfill.workers),
                ..config.backfill.clone()
            };
            let context = AppContext::connect(config).await?;
            match context.backfill(backfill).run().await? {
                BackfillOutcome::AlreadyRunning => {
                    println!("backfill already running; nothing to do");
                }
                BackfillOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string(&report)?);
                    return Ok(ExitCode::from(run_status(report.errors)));
                }
            }
        }
        Commands::Describe { notice_id, refresh } => {
            let context = AppContext::connect(config).await?;
            let view = context.description_service().get_description(&notice_id, refresh).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            let context = AppContext::connect(config).await?;
            govcon_web::serve(govcon_web::AppState::from_context(&context), port).await?;
        }
        Commands::Migrate => {
            let context = AppContext::connect(config).await?;
            context.store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_errors_fail_the_run() {
        assert_eq!(run_status(0), 0);
        assert_eq!(run_status(1), 1);
        assert_eq!(run_status(250), 1);
    }

    #[test]
    fn backfill_flags_parse() {
        let cli = Cli::try_parse_from([
            "govcon",
            "backfill",
            "--filter",
            "stale-normalization",
            "--limit",
            "5",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Backfill {
                filter,
                limit,
                dry_run,
                workers,
            }) => {
                assert_eq!(filter, Some(BackfillFilter::StaleNormalization));
                assert_eq!(limit, Some(5));
                assert!(dry_run);
                assert_eq!(workers, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["govcon", "backfill", "--filter", "everything"]).is_err());
    }

    #[test]
    fn no_subcommand_defaults_to_ingest() {
        let cli = Cli::try_parse_from(["govcon"]).unwrap();
        assert!(cli.command.is_none());
    }
}
