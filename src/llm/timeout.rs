use std::future::Future;
use std::time::Duration;

use crate::error::ExternalServiceError;

/// Run one external call under an explicit deadline, mapping both backend
/// failures and elapsed deadlines into [`ExternalServiceError`].
pub async fn with_timeout<T, F>(
    service: &str,
    timeout: Duration,
    call: F,
) -> Result<T, ExternalServiceError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExternalServiceError::failed(service, format!("{e:#}"))),
        Err(_) => Err(ExternalServiceError::Timeout {
            service: service.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
