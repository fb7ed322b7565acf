//! Owner of the sender task.
//!
//! The module runs the [`SenderLoop`] on its own named thread with the
//! configured stack size, hosting a single-threaded tokio runtime. Stopping
//! signals the loop and joins the thread, so the buffer is never released
//! while a cycle is still using it.

use std::fmt;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::client::TransmitError;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::identity::DeviceIdentity;
use crate::platform::Platform;
use crate::sender::{LoopStats, SenderLoop};

const SENDER_THREAD_NAME: &str = "metrics_sender_task";

/// Errors returned by [`MetricsModule::start`].
#[derive(Debug)]
pub enum ModuleError {
    /// The metrics buffer could not be reserved
    NotAllocated,

    /// `start` was called while the sender task is running
    AlreadyRunning,

    /// The sender could not be set up
    Transmitter(TransmitError),

    /// The sender thread or its runtime could not be created
    SpawnFailed(std::io::Error),
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::NotAllocated => write!(f, "Metrics buffer is not allocated"),
            ModuleError::AlreadyRunning => write!(f, "Sender task already running"),
            ModuleError::Transmitter(e) => write!(f, "Failed to set up transmitter: {}", e),
            ModuleError::SpawnFailed(e) => write!(f, "Failed to create metrics sender task: {}", e),
        }
    }
}

impl std::error::Error for ModuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModuleError::Transmitter(e) => Some(e),
            ModuleError::SpawnFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransmitError> for ModuleError {
    fn from(err: TransmitError) -> Self {
        ModuleError::Transmitter(err)
    }
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<(SenderLoop, LoopStats)>,
}

/// Collects and sends device metrics in the background.
///
/// # Example
///
/// ```no_run
/// use metrics_sender::config::Config;
/// use metrics_sender::module::MetricsModule;
/// use metrics_sender::platform::Platform;
///
/// let config = Config::from_env().expect("Failed to load config");
/// let mut module = MetricsModule::new(config, None, Some("TestLocation"), None, Platform::host());
/// module.start().expect("Failed to start metrics module");
/// // ...
/// let stats = module.stop();
/// ```
pub struct MetricsModule {
    config: Config,
    endpoint: Endpoint,
    identity: DeviceIdentity,
    /// Lent to the sender thread while running, handed back by `stop`
    sender: Option<SenderLoop>,
    /// Why the loop could not be built, reported by every `start`
    setup_error: Option<String>,
    task: Option<RunningTask>,
}

impl MetricsModule {
    /// Create the module. `None` fields fall back to the configured defaults.
    ///
    /// The buffer and the device identity are created here and live as long as
    /// the module.
    pub fn new(
        config: Config,
        database_url: Option<&str>,
        device_location: Option<&str>,
        token: Option<&str>,
        platform: Platform,
    ) -> Self {
        if database_url.is_none() {
            warn!(url = %config.database_url, "No database URL provided, using default");
        }
        if device_location.is_none() {
            warn!(location = %config.device_location, "No device location provided, using default");
        }

        let endpoint = Endpoint::resolve(database_url, device_location, token, &config);
        let identity = DeviceIdentity::generate();
        info!(device_id = %identity, url = %endpoint.target_url(), "MetricsModule created");

        let (sender, setup_error) =
            match SenderLoop::new(&config, &endpoint, identity.clone(), platform.clone()) {
                Ok(sender) => (Some(sender), None),
                Err(e) => {
                    error!(error = %e, "Failed to set up metrics sender");
                    let reason = match e {
                        TransmitError::ClientInitFailed(reason) => reason,
                        other => other.to_string(),
                    };
                    (None, Some(reason))
                }
            };

        Self {
            config,
            endpoint,
            identity,
            sender,
            setup_error,
            task: None,
        }
    }

    /// Spawn the sender task.
    ///
    /// Returns `Ok` without spawning when the module is disabled.
    pub fn start(&mut self) -> Result<(), ModuleError> {
        if let Some(reason) = &self.setup_error {
            return Err(ModuleError::Transmitter(TransmitError::ClientInitFailed(
                reason.clone(),
            )));
        }
        if self.task.is_some() {
            error!("Sender task already running");
            return Err(ModuleError::AlreadyRunning);
        }
        let Some(sender) = self.sender.take() else {
            error!("Metrics buffer is not allocated");
            return Err(ModuleError::NotAllocated);
        };
        if !sender.buffer().is_allocated() {
            error!("Metrics buffer is not allocated");
            self.sender = Some(sender);
            return Err(ModuleError::NotAllocated);
        }
        if !self.config.enabled {
            warn!("MetricsModule is disabled, set METRICS_SENDER_ENABLED=true to enable it");
            self.sender = Some(sender);
            return Ok(());
        }

        self.spawn(sender)
    }

    fn spawn(&mut self, mut sender: SenderLoop) -> Result<(), ModuleError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::io::Result<()>>(1);

        info!(
            stack_size = self.config.task_stack_size,
            priority = self.config.task_priority,
            "Starting metrics sender task"
        );

        // The runtime is built on the sender thread; it must never be dropped
        // from inside the caller's async context.
        let spawned = thread::Builder::new()
            .name(SENDER_THREAD_NAME.to_string())
            .stack_size(self.config.task_stack_size)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        let stats = sender.stats().clone();
                        return (sender, stats);
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let stats = runtime.block_on(sender.run(shutdown_rx));
                (sender, stats)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The closure, and the loop with it, is gone; a later start
                // reports the buffer as missing.
                error!(error = %e, "Failed to create metrics sender task");
                return Err(ModuleError::SpawnFailed(e));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.task = Some(RunningTask {
                    shutdown: shutdown_tx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to build sender runtime");
                if let Ok((sender, _)) = handle.join() {
                    self.sender = Some(sender);
                }
                Err(ModuleError::SpawnFailed(e))
            }
            Err(_) => {
                error!("Metrics sender task exited before starting");
                Err(ModuleError::SpawnFailed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "sender thread exited before starting",
                )))
            }
        }
    }

    /// Signal the sender task and wait for it to finish its current cycle.
    ///
    /// The loop and its buffer are kept for the next `start`. Returns the loop
    /// statistics, or `None` if the task was not running.
    pub fn stop(&mut self) -> Option<LoopStats> {
        let task = self.task.take()?;
        info!("Stopping metrics sender task");
        // A send error only means the loop already exited
        let _ = task.shutdown.send(true);

        match task.handle.join() {
            Ok((sender, stats)) => {
                self.sender = Some(sender);
                Some(stats)
            }
            Err(_) => {
                error!("Metrics sender task panicked");
                None
            }
        }
    }

    /// The idle sender loop, `None` while the task is running.
    pub fn sender(&self) -> Option<&SenderLoop> {
        self.sender.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for MetricsModule {
    fn drop(&mut self) {
        if self.stop().is_some() {
            info!("MetricsModule destroyed");
        }
    }
}
