use crate::{Connection, ConnectionSettings, Connector, Result, RetryPolicy};
use std::sync::Arc;
use tracing::{info, warn};

/// Connect to the broker, retrying at a fixed interval unless retry is disabled.
///
/// With [`RetryPolicy::Fixed`] this only returns once a connection succeeds;
/// callers that need to give up race it against their own shutdown signal.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    settings: &ConnectionSettings,
    retry: RetryPolicy,
) -> Result<Arc<dyn Connection>> {
    loop {
        match connector.connect(settings).await {
            Ok(connection) => {
                info!("Connected to {}", settings.url());
                return Ok(connection);
            }
            Err(e) => match retry {
                RetryPolicy::Disabled => return Err(e),
                RetryPolicy::Fixed(interval) => {
                    warn!(
                        "Could not connect to {}: {}. Trying again in {:?}.",
                        settings.url(),
                        e,
                        interval
                    );
                    tokio::time::sleep(interval).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyConnector {
        failures: usize,
        attempts: AtomicUsize,
    }

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
            Err(TransportError::ConnectionClosed)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Connection>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(TransportError::ConnectionFailed {
                    url: settings.url(),
                    reason: "refused".to_string(),
                });
            }
            Ok(Arc::new(NullConnection))
        }
    }

    #[tokio::test]
    async fn test_retries_until_connected() {
        let connector = FlakyConnector {
            failures: 3,
            attempts: AtomicUsize::new(0),
        };

        let retry = RetryPolicy::Fixed(Duration::from_millis(10));
        let connection = connect_with_retry(&connector, &ConnectionSettings::default(), retry)
            .await
            .unwrap();

        assert!(connection.is_open());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_disabled_retry_fails_fast() {
        let connector = FlakyConnector {
            failures: 1,
            attempts: AtomicUsize::new(0),
        };

        let result =
            connect_with_retry(&connector, &ConnectionSettings::default(), RetryPolicy::Disabled)
                .await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }
}
