use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-stage teardown deadlines
#[derive(Debug, Clone, Copy)]
pub struct ShutdownDeadlines {
    /// Each worker slot gets this long to finish its in-flight job
    pub per_worker: Duration,
    /// Queue obliteration deadline
    pub obliterate: Duration,
    /// Whole-teardown deadline; missing it forces a non-zero exit
    pub total: Duration,
}

impl Default for ShutdownDeadlines {
    fn default() -> Self {
        Self {
            per_worker: Duration::from_secs(10),
            obliterate: Duration::from_secs(5),
            total: Duration::from_secs(25),
        }
    }
}

/// Block until SIGTERM or SIGINT arrives
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            result = tokio::signal::ctrl_c() => {
                result.ok();
                info!("SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupt received");
    }
}

/// Drive the ordered teardown under the top-level deadline.
///
/// Returns the process exit code: 0 when every stage finished in time,
/// 1 when the deadline forced the teardown.
pub async fn run_with_deadline<F>(teardown: F, deadlines: ShutdownDeadlines) -> i32
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(deadlines.total, teardown).await {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            0
        }
        Ok(Err(e)) => {
            error!("Shutdown failed: {}", e);
            1
        }
        Err(_) => {
            warn!(
                "Shutdown missed the {:?} deadline, forcing exit",
                deadlines.total
            );
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clean_teardown_exits_zero() {
        let code = run_with_deadline(async { Ok(()) }, ShutdownDeadlines::default()).await;
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_failed_teardown_exits_one() {
        let code = run_with_deadline(
            async { Err(anyhow::anyhow!("queue backend unreachable")) },
            ShutdownDeadlines::default(),
        )
        .await;
        assert_eq!(code, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_teardown_is_forced() {
        let deadlines = ShutdownDeadlines {
            total: Duration::from_millis(50),
            ..Default::default()
        };
        let code = run_with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
            deadlines,
        )
        .await;
        assert_eq!(code, 1);
    }
}
