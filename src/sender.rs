//! The periodic send cycle.
//!
//! Each cycle resets the buffer, opens a document, runs the collectors,
//! optionally prints the document, checks readiness and sends. Whatever
//! happens, the loop then sleeps exactly one period. The loop owns the buffer
//! outright, so no other context can observe a half-built document.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferError, MetricBuffer};
use crate::client::{SendOutcome, TransmitError, Transmitter};
use crate::collectors::MetricCollectors;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::gate::ReadinessGate;
use crate::identity::DeviceIdentity;
use crate::platform::Platform;

/// Step the loop is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Resetting,
    Collecting,
    Gating,
    Sending,
    Sleeping,
}

/// How a single cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The buffer could not be reset or the document not opened
    Aborted(BufferError),

    /// The document was built but the readiness gate was closed
    NotReady,

    /// The document was handed to the transport
    Sent(SendOutcome),

    /// The transport reported an error; the document is dropped
    SendFailed(TransmitError),
}

/// Counters accumulated over the loop's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub not_ready: u64,
    pub aborted: u64,
    /// Entries rejected by the buffer across all cycles
    pub rejected_entries: u64,
}

/// Drives reset → collect → gate → send → sleep forever.
pub struct SenderLoop {
    buffer: MetricBuffer,
    collectors: MetricCollectors,
    gate: ReadinessGate,
    transmitter: Transmitter,
    period: Duration,
    print_buffer: bool,
    state: LoopState,
    stats: LoopStats,
}

impl SenderLoop {
    /// Build a loop and all its parts from the configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransmitError::ClientInitFailed` if the HTTP client cannot be
    /// set up for the endpoint.
    pub fn new(
        config: &Config,
        endpoint: &Endpoint,
        identity: DeviceIdentity,
        platform: Platform,
    ) -> Result<Self, TransmitError> {
        let transmitter = Transmitter::new(endpoint, config.http_timeout)?;
        let gate = ReadinessGate::new(platform.network.clone(), config.clock_policy);
        let collectors = MetricCollectors::new(identity, endpoint, config.min_valid_year, platform);
        let buffer = MetricBuffer::new(config.buffer_size, config.document_layout);

        Ok(Self::from_parts(
            buffer,
            collectors,
            gate,
            transmitter,
            config.send_period,
            config.print_buffer,
        ))
    }

    pub fn from_parts(
        buffer: MetricBuffer,
        collectors: MetricCollectors,
        gate: ReadinessGate,
        transmitter: Transmitter,
        period: Duration,
        print_buffer: bool,
    ) -> Self {
        Self {
            buffer,
            collectors,
            gate,
            transmitter,
            period,
            print_buffer,
            state: LoopState::Idle,
            stats: LoopStats::default(),
        }
    }

    /// Run one complete cycle, without the trailing sleep.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        self.state = LoopState::Resetting;
        if let Err(e) = self.buffer.reset() {
            error!(error = %e, "Failed to reset buffer");
            self.stats.aborted += 1;
            return CycleOutcome::Aborted(e);
        }

        self.state = LoopState::Collecting;
        let report = {
            let mut doc = match self.buffer.open_document() {
                Ok(doc) => doc,
                Err(e) => {
                    error!(error = %e, "Failed to add prefix JSON to buffer");
                    self.stats.aborted += 1;
                    return CycleOutcome::Aborted(e);
                }
            };
            let report = self.collectors.collect_all(&mut doc);
            doc.close();
            report
        };
        self.stats.rejected_entries += self.buffer.rejected() as u64;

        if self.print_buffer {
            info!(
                url = %self.transmitter.url(),
                entries = report.entries,
                "Metrics buffer:\n{}",
                self.buffer.finalize().as_str()
            );
        }

        self.state = LoopState::Gating;
        if !self.gate.is_ready_to_send(report.clock_valid) {
            warn!(
                period_secs = self.period.as_secs(),
                "No network connection or time not correct, skipping send"
            );
            self.stats.not_ready += 1;
            return CycleOutcome::NotReady;
        }

        self.state = LoopState::Sending;
        match self.transmitter.send(self.buffer.finalize()).await {
            Ok(outcome) => {
                self.stats.sent += 1;
                CycleOutcome::Sent(outcome)
            }
            Err(e) => {
                error!(error = %e, "Failed to send buffered metrics");
                self.stats.send_failures += 1;
                CycleOutcome::SendFailed(e)
            }
        }
    }

    /// Run cycles until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown is only observed between cycles, while sleeping. The loop and
    /// its buffer stay usable afterwards, so `run` can be called again.
    /// Returns the statistics accumulated over every run so far.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        info!(
            period_secs = self.period.as_secs(),
            device_id = %self.collectors.identity(),
            "Metrics sender loop started"
        );

        while !*shutdown.borrow() {
            let outcome = self.run_cycle().await;
            self.state = LoopState::Sleeping;
            debug!(outcome = ?outcome, "Cycle finished");

            if sleep_or_shutdown(self.period, &mut shutdown).await {
                break;
            }
        }

        self.state = LoopState::Idle;
        info!(
            cycles = self.stats.cycles,
            sent = self.stats.sent,
            send_failures = self.stats.send_failures,
            not_ready = self.stats.not_ready,
            aborted = self.stats.aborted,
            "Metrics sender loop stopped"
        );
        self.stats.clone()
    }

    pub fn buffer(&self) -> &MetricBuffer {
        &self.buffer
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Sleep for `period`. Returns true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(period);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if !*shutdown.borrow() => continue,
                // Sender gone: nobody can stop us later, so stop now
                _ => return true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::tests::{fake_platform, Fakes};
    use crate::config::DocumentLayout;
    use std::sync::atomic::Ordering;

    fn config_for(url: &str) -> Config {
        Config {
            database_url: url.to_string(),
            device_location: "lab".to_string(),
            document_layout: DocumentLayout::Flat,
            buffer_size: 1024,
            send_period: Duration::from_millis(50),
            http_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    fn sender(config: &Config, network_up: bool) -> (SenderLoop, Fakes) {
        let (platform, fakes) = fake_platform(2024, network_up);
        let endpoint = Endpoint::from_config(config);
        let sender = SenderLoop::new(config, &endpoint, DeviceIdentity::generate(), platform)
            .expect("sender should build");
        (sender, fakes)
    }

    #[tokio::test]
    async fn test_cycle_sends_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/lab")
            .match_header("content-type", "application/json")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (mut sender, _) = sender(&config_for(&server.url()), true);
        let outcome = sender.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Sent(SendOutcome::Delivered(_))));
        assert_eq!(sender.state(), LoopState::Sending);
        assert_eq!(sender.stats().sent, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_ready_skips_send_but_builds_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/lab").expect(0).create_async().await;

        let config = Config {
            print_buffer: true,
            ..config_for(&server.url())
        };
        let (mut sender, _) = sender(&config, false);
        let outcome = sender.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::NotReady));
        assert_eq!(sender.stats().not_ready, 1);

        let view = sender.buffer().finalize();
        assert!(view.is_closed());
        let doc: serde_json::Value = serde_json::from_str(view.as_str()).unwrap();
        assert_eq!(doc["location"], "lab");
        assert_eq!(doc["freeHeap"], 180_000);
        assert_eq!(doc["IDLE_1"], 880);
        assert_eq!(doc["rssi"], -61);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_require_clock_blocks_send_on_bad_clock() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/lab").expect(0).create_async().await;

        let config = Config {
            clock_policy: crate::config::ClockPolicy::RequireClock,
            ..config_for(&server.url())
        };
        let (platform, fakes) = fake_platform(1999, true);
        let endpoint = Endpoint::from_config(&config);
        let mut sender =
            SenderLoop::new(&config, &endpoint, DeviceIdentity::generate(), platform).unwrap();

        assert!(matches!(sender.run_cycle().await, CycleOutcome::NotReady));
        assert_eq!(fakes.clock.resyncs.load(Ordering::SeqCst), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_only_sends_without_clock() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/lab").expect(1).create_async().await;

        let config = config_for(&server.url());
        let (platform, _) = fake_platform(1999, true);
        let endpoint = Endpoint::from_config(&config);
        let mut sender =
            SenderLoop::new(&config, &endpoint, DeviceIdentity::generate(), platform).unwrap();

        assert!(matches!(sender.run_cycle().await, CycleOutcome::Sent(_)));
        let doc: serde_json::Value =
            serde_json::from_str(sender.buffer().finalize().as_str()).unwrap();
        assert!(doc.get("timestamp").is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unallocated_buffer_aborts_cycle() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/lab").expect(0).create_async().await;

        let (sender, _) = sender(&config_for(&server.url()), true);
        let SenderLoop {
            collectors,
            gate,
            transmitter,
            ..
        } = sender;
        let mut sender = SenderLoop::from_parts(
            MetricBuffer::new(0, DocumentLayout::Flat),
            collectors,
            gate,
            transmitter,
            Duration::from_millis(10),
            false,
        );

        let outcome = sender.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Aborted(BufferError::NotAllocated)));
        assert_eq!(sender.state(), LoopState::Resetting);
        assert_eq!(sender.stats().aborted, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_open_failure_aborts_cycle() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/lab").expect(0).create_async().await;

        let config = Config {
            buffer_size: 8,
            document_layout: DocumentLayout::Fields,
            ..config_for(&server.url())
        };
        let (mut sender, _) = sender(&config, true);

        let outcome = sender.run_cycle().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Aborted(BufferError::BufferFull { .. })
        ));
        assert_eq!(sender.state(), LoopState::Collecting);
        assert!(sender.buffer().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let (mut sender, _) = sender(&config_for("http://127.0.0.1:1"), true);
        let outcome = sender.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::SendFailed(TransmitError::RequestFailed(_))));
        assert_eq!(sender.stats().send_failures, 1);
        assert_eq!(sender.stats().sent, 0);
    }

    #[tokio::test]
    async fn test_small_buffer_counts_rejections() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/lab").expect(1).create_async().await;

        let config = Config {
            buffer_size: 96,
            ..config_for(&server.url())
        };
        let (mut sender, _) = sender(&config, true);

        assert!(matches!(sender.run_cycle().await, CycleOutcome::Sent(_)));
        assert!(sender.stats().rejected_entries > 0);
        assert!(sender.buffer().len() <= 95);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/lab")
            .with_status(204)
            .expect_at_least(2)
            .create_async()
            .await;

        let (mut sender, _) = sender(&config_for(&server.url()), true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sender.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(180)).await;
        shutdown_tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop")
            .expect("loop should not panic");
        assert!(stats.cycles >= 2);
        assert_eq!(stats.sent, stats.cycles);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_sleeps_a_full_period() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/lab").create_async().await;

        let config = Config {
            send_period: Duration::from_secs(60),
            ..config_for(&server.url())
        };
        let (mut sender, _) = sender(&config, true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sender.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.cycles, 1);
    }

    #[tokio::test]
    async fn test_run_exits_when_sender_dropped() {
        let (mut sender, _) = sender(&config_for("http://127.0.0.1:1"), false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sender.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(shutdown_tx);

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.not_ready, stats.cycles);
    }

    #[tokio::test]
    async fn test_run_with_shutdown_already_set() {
        let (mut sender, _) = sender(&config_for("http://127.0.0.1:1"), true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let stats = sender.run(shutdown_rx).await;
        assert_eq!(stats, LoopStats::default());
    }

    #[tokio::test]
    async fn test_run_again_reuses_buffer() {
        let (mut sender, _) = sender(&config_for("http://127.0.0.1:1"), false);
        let capacity = sender.buffer().capacity();

        let (tx, rx) = watch::channel(false);
        drop(tx);
        let first = sender.run(rx).await;
        assert_eq!(first.cycles, 1);
        assert_eq!(sender.state(), LoopState::Idle);

        let (tx, rx) = watch::channel(false);
        drop(tx);
        let second = sender.run(rx).await;
        assert_eq!(second.cycles, 2);
        assert_eq!(sender.buffer().capacity(), capacity);
        assert!(sender.buffer().is_allocated());
    }
}
