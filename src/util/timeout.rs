use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;

/// Runs a network operation with an optional deadline. `None` blocks for as long as the
///  operation takes.
pub async fn with_timeout<T>(timeout: Option<Duration>, what: &str, f: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match timeout {
        None => f.await,
        Some(timeout) => tokio::time::timeout(timeout, f).await
            .map_err(|_| anyhow!("{} timed out after {:?}", what, timeout))?,
    }
}
