use crate::error::EngineError;
use std::time::Duration;
use tokio::task;
use tokio::time::timeout;

/// Runs filesystem work off the event loop and gives up on it after `limit`.
pub async fn blocking<T, F>(limit: Duration, what: &str, work: F) -> Result<T, EngineError>
where
    F: FnOnce() -> color_eyre::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(limit, task::spawn_blocking(work)).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(EngineError::Io(format!("{}: {:#}", what, err))),
        Ok(Err(join)) => Err(EngineError::Io(format!("{}: {}", what, join))),
        Err(_) => Err(EngineError::Timeout(format!("{} after {:?}", what, limit))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[tokio::test]
    async fn returns_value_of_work() {
        let value = blocking(Duration::from_secs(1), "add", || Ok(2 + 2))
            .await
            .unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn failures_become_io_errors() {
        let err = blocking::<(), _>(Duration::from_secs(1), "read control", || {
            Err(eyre!("disk on fire"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Io(ref msg) if msg.contains("read control")));
    }

    #[tokio::test]
    async fn slow_work_times_out() {
        let err = blocking(Duration::from_millis(20), "slow write", || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
