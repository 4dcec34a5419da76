//! Demo binary exercising every run policy against a local runtime.
//!
//! The main thread plays the GUI owner thread: it builds the guard, then
//! pumps the owner loop while the workload runs on the tokio runtime.
//! Progress lines and result callbacks are printed from the owner thread;
//! the final health report is printed as JSON on stdout.
//!
//! Usage: `taskguard-demo [config.toml]`. `TASKGUARD_*` environment
//! variables override file values. All tracing output goes to stderr.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_stream::stream;
use taskguard::{GuardConfig, RetryOptions, TaskError, TaskGuard, TaskSupervisor};

fn load_config() -> anyhow::Result<GuardConfig> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(GuardConfig::default_config_path);
    let base = if path.exists() {
        GuardConfig::from_file(&path)
            .with_context(|| format!("cannot load config from {}", path.display()))?
    } else {
        GuardConfig::default()
    };
    let config = base.with_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn workload(supervisor: TaskSupervisor) -> anyhow::Result<()> {
    let total = supervisor
        .run_with_progress(
            |reporter| async move {
                let mut sum = 0u64;
                for step in 1..=5u64 {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    sum += step;
                    reporter.report(step as f64 / 5.0);
                }
                Ok::<_, std::io::Error>(sum)
            },
            |value| println!("progress: {:>3.0}%", value * 100.0),
        )
        .await?;
    tracing::info!(total, "progress task finished");

    supervisor
        .run_progress_stream(
            stream! {
                for i in 1..=4 {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    yield Ok::<f64, std::io::Error>(f64::from(i) / 4.0);
                }
            },
            |value| println!("stream progress: {:>3.0}%", value * 100.0),
        )
        .await?;

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let value = supervisor
        .run_with_retry(
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(format!("flaky dependency (attempt {attempt})"))
                    } else {
                        Ok("payload")
                    }
                }
            },
            RetryOptions::new()
                .retry_delay(Duration::from_millis(20))
                .breaker_key("flaky"),
        )
        .await?;
    tracing::info!(value, attempts = attempts.load(Ordering::SeqCst), "flaky call succeeded");

    match supervisor
        .run_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, std::io::Error>(())
            },
            Some(Duration::from_millis(100)),
        )
        .await
    {
        Err(TaskError::Timeout { task_id, timeout }) => {
            tracing::warn!(task_id = %task_id, ?timeout, "slow task timed out as expected");
        }
        other => anyhow::bail!("expected a timeout, got {other:?}"),
    }

    // Three failures open the "down" circuit; the fourth call is rejected untried.
    for _ in 0..4 {
        let result = supervisor
            .run_with_retry(
                || async { Err::<(), _>("dependency down") },
                RetryOptions::new().max_retries(0).breaker_key("down"),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(kind = ?e.kind(), "call to failing dependency: {e}");
        }
    }

    supervisor.spawn_with_callback(
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, std::io::Error>("background result")
        },
        |result| println!("callback on owner thread: {result:?}"),
    )?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Tracing to stderr; stdout carries the demo output and the health report.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!("taskguard-demo starting");

    let runtime = tokio::runtime::Runtime::new().context("cannot start tokio runtime")?;
    let config = GuardConfig {
        enable_circuit_breaker: true,
        circuit_breaker_threshold: 3,
        ..config
    };
    let (guard, owner) = TaskGuard::new(config, runtime.handle().clone())?;
    guard.monitor().start_performance_monitoring()?;

    let driver = runtime.spawn(workload(guard.supervisor().clone()));
    owner.run_until(|| driver.is_finished(), Duration::from_millis(10));
    owner.pump();

    runtime
        .block_on(driver)
        .context("demo workload panicked")?
        .map_err(|e| {
            tracing::error!(error = %e, "taskguard-demo workload failed");
            e
        })?;

    guard.monitor().sample_now();
    let health = guard.health();
    println!("{}", serde_json::to_string_pretty(&health)?);

    guard.shutdown();
    tracing::info!(verdict = %health.verdict, "taskguard-demo shut down cleanly");
    Ok(())
}
