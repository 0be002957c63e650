//! # Module Lifecycle
//!
//! A process is a set of long-running [`Module`]s (the feed, the gateway)
//! that start together and stop together. [`ModuleSet::run_all`] spawns every
//! module, waits for a shutdown trigger or for a module to fail, then stops all
//! of them. Each stop is bounded by the graceful timeout; a module that does not
//! stop in time is reported and left behind so the others still shut down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time;

use crate::error::BoxError;

/// Upstream feed module.
pub mod feed;

pub use feed::{FeedModule, ReconnectPolicy};

/// A long-running unit of the process.
pub trait Module: Send + Sync {
    /// Human readable module name used in logs.
    fn name(&self) -> &str;

    /// Runs until the module is stopped or fails.
    fn run(&self) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Asks a running module to stop and waits for it to wind down.
    fn stop(&self) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// # Module Error
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {module} returned error: {source}")]
    Run {
        module: String,
        #[source]
        source: BoxError,
    },

    #[error("module {module} stopped with error: {source}")]
    Stop {
        module: String,
        #[source]
        source: BoxError,
    },

    #[error("module {0} stopped by timeout")]
    StopTimeout(String),

    #[error("module task failed: {0}")]
    Join(#[from] JoinError),
}

/// Timing and failure policy of a [`ModuleSet`].
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Upper bound for a single module's `stop`.
    pub graceful_timeout: Duration,
    /// Stop everything when one module returns an error.
    pub fail_fast: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(15),
            fail_fast: true,
        }
    }
}

/// # Module Set
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<Arc<dyn Module>>,
    config: LifecycleConfig,
}

impl ModuleSet {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            modules: Vec::new(),
            config,
        }
    }

    /// Adds a module; modules start in insertion order.
    pub fn with(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    /// # Run All
    ///
    /// Spawns every module's `run` and waits until `shutdown` resolves, every
    /// module finished, or (with `fail_fast`) one module failed. Then stops all
    /// modules and waits up to the graceful timeout for their tasks to exit.
    ///
    /// Returns the error of the module that triggered a fail-fast shutdown.
    pub async fn run_all<F>(&self, shutdown: F) -> Result<(), ModuleError>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        for module in &self.modules {
            let module = Arc::clone(module);
            log::info!("Starting module {}", module.name());
            tasks.spawn(async move {
                let result = module.run().await;
                (module.name().to_string(), result)
            });
        }

        tokio::pin!(shutdown);
        let mut failure = None;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, stopping {} modules", self.modules.len());
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => {
                        log::info!("All modules finished work");
                        return Ok(());
                    }
                    Some(joined) => {
                        if let Err(err) = Self::finished(joined) {
                            if self.config.fail_fast {
                                log::error!("Stopping all modules: {}", err);
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                },
            }
        }

        self.stop_all().await;

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                let _ = Self::finished(joined);
            }
        };
        if time::timeout(self.config.graceful_timeout, drain).await.is_err() {
            log::warn!("{} module tasks still running, aborting", tasks.len());
            tasks.abort_all();
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finished(
        joined: Result<(String, Result<(), BoxError>), JoinError>,
    ) -> Result<(), ModuleError> {
        match joined {
            Ok((module, Ok(()))) => {
                log::info!("Module {} finished work", module);
                Ok(())
            }
            Ok((module, Err(source))) => {
                log::error!("Module {} returned error: {}", module, source);
                Err(ModuleError::Run { module, source })
            }
            Err(err) => {
                log::error!("Module task failed: {}", err);
                Err(ModuleError::Join(err))
            }
        }
    }

    /// # Stop All
    ///
    /// Stops every module concurrently, each bounded by the graceful timeout.
    /// Failures and timeouts are logged and returned; they never prevent the
    /// other modules from stopping.
    pub async fn stop_all(&self) -> Vec<ModuleError> {
        let timeout = self.config.graceful_timeout;
        let stops = self.modules.iter().map(|module| async move {
            let name = module.name().to_string();
            match time::timeout(timeout, module.stop()).await {
                Ok(Ok(())) => {
                    log::info!("Module {} stopped", name);
                    None
                }
                Ok(Err(source)) => {
                    log::warn!("Module {} stopped with error: {}", name, source);
                    Some(ModuleError::Stop { module: name, source })
                }
                Err(_) => {
                    log::warn!("Module {} stopped by timeout", name);
                    Some(ModuleError::StopTimeout(name))
                }
            }
        });

        let errors: Vec<_> = join_all(stops).await.into_iter().flatten().collect();
        log::info!("All modules were stopped");
        errors
    }
}
