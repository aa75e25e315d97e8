use anyhow::Context;
use kube_version_checker::config::load_config;
use kube_version_checker::gatherer::{DataGatherer, ResultRecord};
use std::env;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the JSON report
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    info!("Starting kube-version-checker {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let gatherer = Arc::new(
        DataGatherer::new(&config)
            .await
            .context("Failed to initialize the data gatherer")?,
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    match env::var("CRON_SCHEDULE") {
        Ok(cron_schedule) => run_scheduled(gatherer, cron_schedule, cancel).await,
        Err(_) => {
            let records = gatherer.fetch(&cancel).await.context("Failed to check images")?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

async fn run_scheduled(
    gatherer: Arc<DataGatherer>,
    cron_schedule: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("Executing job scheduler at cron schedule {}", cron_schedule);
    let mut scheduler = JobScheduler::new().await?;

    let job_cancel = cancel.clone();
    let job = Job::new_async(cron_schedule.as_str(), move |_uuid, _lock| {
        let gatherer = gatherer.clone();
        let cancel = job_cancel.clone();
        Box::pin(async move {
            match gatherer.fetch(&cancel).await {
                Ok(records) => log_summary(&records),
                Err(e) => error!("Error running version check: {:?}", e),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    cancel.cancelled().await;
    scheduler.shutdown().await?;
    Ok(())
}

fn log_summary(records: &[ResultRecord]) {
    let mut outdated = 0;
    let mut failed = 0;
    for record in records {
        let pod = record.pod.metadata.name.as_deref().unwrap_or_default();
        match &record.outcome {
            Ok(verdict) if !verdict.is_latest && !verdict.latest_version.is_empty() => {
                outdated += 1;
                warn!(
                    "Pod {} runs {} but {} is available",
                    pod, record.image, verdict.latest_version
                );
            }
            Ok(_) => {}
            Err(_) => failed += 1,
        }
    }
    info!(
        "Checked {} containers: {} outdated, {} could not be checked",
        records.len(),
        outdated,
        failed
    );
}
