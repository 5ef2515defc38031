// Background loop supervision

use crate::errors::RuntimeError;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Spawn a long-running loop whose failure is fatal for the process
///
/// A loop returning `Err` has its error forwarded on `errors`; the
/// receiving side decides to shut down. A clean return is only logged.
pub fn spawn_supervised<F>(
    name: &'static str,
    errors: mpsc::Sender<RuntimeError>,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), RuntimeError>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => info!(task = name, "Background task stopped"),
            Err(e) => {
                error!(task = name, error = %e, "Background task failed");
                if errors.send(e).await.is_err() {
                    error!(task = name, "Error channel closed, failure not reported");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = spawn_supervised("failing", tx, async {
            Err(RuntimeError::Watch {
                key: "/jobs".to_string(),
                message: "boom".to_string(),
            })
        });
        handle.await.unwrap();
        assert!(matches!(rx.recv().await, Some(RuntimeError::Watch { .. })));
    }

    #[tokio::test]
    async fn test_clean_exit_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(1);
        spawn_supervised("clean", tx, async { Ok(()) }).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
