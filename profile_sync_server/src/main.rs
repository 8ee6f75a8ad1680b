use clap::Parser;
use profile_sync_core::config::ProfileSyncConfig;
use profile_sync_server::cli::{Cli, Commands};
use profile_sync_server::wiring::{self, Runtime};
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    profile_sync_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();
    let config = ProfileSyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let rt = Runtime::build(config).await?;
            let scheduler = rt.scheduler()?;
            if scheduler.jobs().is_empty() {
                tracing::warn!("no data types enabled; set PROFILE_SYNC_UPSTREAM_<DATA_TYPE>");
            }

            let shutdown = CancellationToken::new();
            let handles = scheduler.start(shutdown.clone());
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received; stopping sync loops");
                }
                trigger.cancel();
            });

            let mut failed = false;
            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(%e, "sync loop ended with error");
                        failed = true;
                    }
                    Err(e) => {
                        tracing::error!(%e, "sync loop task panicked");
                        failed = true;
                    }
                }
            }
            if failed {
                anyhow::bail!("one or more sync loops stopped on an unrecoverable error");
            }
        }
        Commands::Migrate => {
            config.validate()?;
            wiring::build_stores(&config).await?;
            tracing::info!("profile sync schema applied");
        }
        Commands::SyncOnce { data_type } => {
            let rt = Runtime::build(config).await?;
            let job = rt.job(data_type)?;
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    trigger.cancel();
                }
            });
            let outcome = job.run_once(&shutdown).await?;
            println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn outcome_json(outcome: &profile_sync_core::jobs::JobOutcome) -> serde_json::Value {
    use profile_sync_core::jobs::JobOutcome;
    match outcome {
        JobOutcome::Ran { report, lease_lost } => serde_json::json!({
            "status": "ran",
            "data_type": report.data_type,
            "pages": report.pages,
            "applied": report.applied,
            "skipped": report.skipped,
            "start_cursor": report.start_cursor.to_cursor_string(),
            "final_cursor": report.final_cursor.to_cursor_string(),
            "outcome": format!("{:?}", report.outcome),
            "lease_lost": lease_lost,
        }),
        JobOutcome::Skipped { retry_after } => serde_json::json!({
            "status": "skipped",
            "retry_after_ms": retry_after.as_millis() as u64,
        }),
    }
}
