//! # Feed Module
//!
//! Keeps the upstream session alive for the lifetime of the process. The
//! [`FeedSupervisor`] runs one session and returns; this module calls it again
//! after an exponential backoff until it is stopped.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Module;
use crate::core::supervisor::{FeedExit, FeedSupervisor, UpstreamConnector};
use crate::error::{BoxError, RelayError};

/// Delay between upstream sessions.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// # Feed Module
pub struct FeedModule<C> {
    supervisor: Arc<FeedSupervisor<C>>,
    policy: ReconnectPolicy,
    scope: CancellationToken,
    /// Held by `run` while it loops; `stop` waits on it.
    running: Mutex<()>,
}

impl<C: UpstreamConnector + 'static> FeedModule<C> {
    pub fn new(supervisor: Arc<FeedSupervisor<C>>, policy: ReconnectPolicy) -> Self {
        Self {
            supervisor,
            policy,
            scope: CancellationToken::new(),
            running: Mutex::new(()),
        }
    }

    pub fn supervisor(&self) -> &Arc<FeedSupervisor<C>> {
        &self.supervisor
    }

    async fn keep_alive(&self) -> Result<(), RelayError> {
        let _running = self.running.lock().await;
        let mut attempt = 0u32;

        while !self.scope.is_cancelled() {
            match self.supervisor.start(&self.scope).await {
                Ok(FeedExit::Cancelled) => break,
                Ok(exit) => {
                    // The session was streaming, so the upstream is reachable again.
                    attempt = 0;
                    log::info!("Feed session over ({}), reconnecting", exit);
                }
                // Neither clears up by retrying.
                Err(err @ (RelayError::Conflict(_) | RelayError::Configuration(_))) => {
                    return Err(err);
                }
                Err(err) => log::warn!("Feed connect failed: {}", err),
            }

            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            log::info!("Next upstream attempt in {:?}", delay);
            tokio::select! {
                _ = self.scope.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::info!("Feed module finished");
        Ok(())
    }
}

impl<C: UpstreamConnector + 'static> Module for FeedModule<C> {
    fn name(&self) -> &str {
        "feed"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move { self.keep_alive().await.map_err(BoxError::from) })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.scope.cancel();
            let _stopped = self.running.lock().await;
            Ok(())
        })
    }
}
