//! Metrics Sender Library
//!
//! This library periodically samples device health metrics, serializes them
//! into a bounded JSON document and posts it to a metrics database:
//!
//! - **config**: Environment-based configuration for the sender
//! - **identity**: Random per-run device identifier
//! - **buffer**: Fixed-capacity JSON document builder
//! - **platform**: Clock, network, memory, task and radio probes
//! - **collectors**: Metric collection into an open document
//! - **gate**: Readiness check before transmission
//! - **endpoint**: Database URL, location and token
//! - **client**: HTTP transmitter for finished documents
//! - **sender**: The periodic reset, collect, send, sleep loop
//! - **module**: Lifecycle of the background sender task
//!
//! # Example
//!
//! ```no_run
//! use metrics_sender::config::Config;
//! use metrics_sender::module::MetricsModule;
//! use metrics_sender::platform::Platform;
//!
//! fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Create the module with host probes and start the sender task
//!     let mut module = MetricsModule::new(config, None, Some("TestLocation"), None, Platform::host());
//!     module.start().expect("Failed to start metrics module");
//!
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!
//!     // Stop the task and wait for the current cycle to finish
//!     if let Some(stats) = module.stop() {
//!         println!("Sent {} documents", stats.sent);
//!     }
//! }
//! ```

// Module declarations
pub mod buffer;
pub mod client;
pub mod collectors;
pub mod config;
pub mod endpoint;
pub mod gate;
pub mod identity;
pub mod module;
pub mod platform;
pub mod sender;

// Re-export commonly used types at crate root for convenience
pub use buffer::{BufferError, DocumentView, MetricBuffer, MetricValue, OpenDocument};
pub use client::{SendOutcome, TransmitError, Transmitter};
pub use collectors::{CollectError, CollectionReport, Collector, MetricCollectors};
pub use config::{ClockPolicy, Config, ConfigError, DocumentLayout};
pub use endpoint::Endpoint;
pub use gate::ReadinessGate;
pub use identity::DeviceIdentity;
pub use module::{MetricsModule, ModuleError};
pub use platform::{HeapStats, Platform, TaskInfo};
pub use sender::{CycleOutcome, LoopState, LoopStats, SenderLoop};
