use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Keep a task alive: run it, and when it returns an error or panics, log,
/// wait `delay` and start a fresh instance. Returns once `shutdown` is
/// cancelled and the current instance has finished.
pub async fn supervise<F, Fut>(name: &'static str, shutdown: CancellationToken, delay: Duration, make: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        // A spawned task turns a panic into a JoinError instead of unwinding here
        match tokio::spawn(make()).await {
            Ok(Ok(())) if shutdown.is_cancelled() => break,
            Ok(Ok(())) => tracing::warn!(task = name, "Task exited unexpectedly, restarting"),
            Ok(Err(e)) => tracing::error!(task = name, "Task failed: {:#}", e),
            Err(e) if e.is_panic() => tracing::error!(task = name, "Task panicked: {}", e),
            Err(e) => tracing::error!(task = name, "Task was cancelled: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!(task = name, "Task stopped");
}
