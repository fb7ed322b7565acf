//! Metric producers writing into the open document each cycle.
//!
//! Collectors run in a fixed order. Each one is best-effort: a failure is
//! logged and the next collector still runs, so a partial document is sent
//! rather than none.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::Datelike;
use tracing::{debug, warn};

use crate::buffer::{BufferError, MetricValue, OpenDocument};
use crate::endpoint::Endpoint;
use crate::identity::DeviceIdentity;
use crate::platform::{Platform, TaskInfo};

/// Errors a single collector can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    /// The wall clock is before the plausibility threshold
    ClockNotReady { year: i32 },

    /// At least one entry did not fit; the first rejection is kept
    Buffer(BufferError),

    /// The collaborator had nothing to report
    DataUnavailable(&'static str),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::ClockNotReady { year } => {
                write!(f, "Clock is not synchronized (year {})", year)
            }
            CollectError::Buffer(e) => write!(f, "{}", e),
            CollectError::DataUnavailable(what) => write!(f, "{} is unavailable", what),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Buffer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BufferError> for CollectError {
    fn from(err: BufferError) -> Self {
        CollectError::Buffer(err)
    }
}

/// The producers, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collector {
    Timestamp,
    DeviceId,
    Location,
    Token,
    Heap,
    TaskStacks,
    SignalStrength,
}

impl Collector {
    pub const ORDER: [Collector; 7] = [
        Collector::Timestamp,
        Collector::DeviceId,
        Collector::Location,
        Collector::Token,
        Collector::Heap,
        Collector::TaskStacks,
        Collector::SignalStrength,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collector::Timestamp => "timestamp",
            Collector::DeviceId => "device_id",
            Collector::Location => "location",
            Collector::Token => "token",
            Collector::Heap => "heap",
            Collector::TaskStacks => "task_stacks",
            Collector::SignalStrength => "signal_strength",
        }
    }
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionReport {
    /// The timestamp collector saw a plausible clock
    pub clock_valid: bool,

    /// Entries written by all collectors
    pub entries: usize,

    /// Collectors that reported an error
    pub failures: usize,
}

/// Fixed, ordered set of metric producers.
pub struct MetricCollectors {
    identity: DeviceIdentity,
    location: Option<String>,
    token: Option<String>,
    min_valid_year: i32,
    platform: Platform,
}

impl MetricCollectors {
    pub fn new(
        identity: DeviceIdentity,
        endpoint: &Endpoint,
        min_valid_year: i32,
        platform: Platform,
    ) -> Self {
        Self {
            identity,
            location: endpoint.location().map(str::to_string),
            token: endpoint.token().map(str::to_string),
            min_valid_year,
            platform,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Run every collector in order against `doc`.
    pub fn collect_all(&self, doc: &mut OpenDocument<'_>) -> CollectionReport {
        let mut report = CollectionReport::default();
        let start_entries = doc.entries();

        for collector in Collector::ORDER {
            let result = self.collect(collector, doc);
            if collector == Collector::Timestamp {
                report.clock_valid = result.is_ok();
            }

            match result {
                Ok(()) => {}
                Err(CollectError::ClockNotReady { year }) => {
                    report.failures += 1;
                    warn!(year = year, "Time is not correct, skipping timestamp metric");
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(collector = collector.name(), error = %e, "Failed to add metrics");
                }
            }
        }

        report.entries = doc.entries() - start_entries;
        debug!(
            entries = report.entries,
            failures = report.failures,
            clock_valid = report.clock_valid,
            "Collection finished"
        );
        report
    }

    /// Run a single collector.
    pub fn collect(&self, collector: Collector, doc: &mut OpenDocument<'_>) -> Result<(), CollectError> {
        match collector {
            Collector::Timestamp => self.collect_timestamp(doc),
            Collector::DeviceId => Ok(doc.append("deviceId", self.identity.as_str())?),
            Collector::Location => match &self.location {
                Some(location) => Ok(doc.append("location", location.as_str())?),
                None => Ok(()),
            },
            Collector::Token => match &self.token {
                Some(token) => Ok(doc.append("token", token.as_str())?),
                None => Ok(()),
            },
            Collector::Heap => self.collect_heap(doc),
            Collector::TaskStacks => self.collect_task_stacks(doc),
            Collector::SignalStrength => self.collect_signal(doc),
        }
    }

    fn collect_timestamp(&self, doc: &mut OpenDocument<'_>) -> Result<(), CollectError> {
        let now = self.platform.clock.now();
        if now.year() < self.min_valid_year {
            self.platform.clock.request_resync();
            return Err(CollectError::ClockNotReady { year: now.year() });
        }
        doc.append("timestamp", now)?;
        Ok(())
    }

    fn collect_heap(&self, doc: &mut OpenDocument<'_>) -> Result<(), CollectError> {
        let stats = self
            .platform
            .heap
            .heap_stats()
            .ok_or(CollectError::DataUnavailable("heap statistics"))?;

        append_all(
            doc,
            [
                ("freeHeap", MetricValue::unsigned(stats.free)),
                ("minFreeHeap", MetricValue::unsigned(stats.min_free)),
                ("largestFreeBlock", MetricValue::unsigned(stats.largest_free_block)),
            ],
        )
    }

    fn collect_task_stacks(&self, doc: &mut OpenDocument<'_>) -> Result<(), CollectError> {
        let tasks = self
            .platform
            .tasks
            .tasks()
            .filter(|tasks| !tasks.is_empty())
            .ok_or(CollectError::DataUnavailable("task list"))?;

        let keys = task_metric_names(&tasks);
        append_all(
            doc,
            keys.iter()
                .zip(&tasks)
                .map(|(key, task)| (key.as_str(), MetricValue::unsigned(task.stack_headroom))),
        )
    }

    fn collect_signal(&self, doc: &mut OpenDocument<'_>) -> Result<(), CollectError> {
        let rssi = self
            .platform
            .radio
            .signal_strength()
            .ok_or(CollectError::DataUnavailable("access point info"))?;
        doc.append("rssi", rssi)?;
        Ok(())
    }
}

/// Append every entry even after a rejection; report the first rejection.
fn append_all<'n, 'v, I>(doc: &mut OpenDocument<'_>, entries: I) -> Result<(), CollectError>
where
    I: IntoIterator<Item = (&'n str, MetricValue<'v>)>,
{
    let mut first_error = None;
    for (name, value) in entries {
        if let Err(e) = doc.append(name, value) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(CollectError::Buffer(e)),
        None => Ok(()),
    }
}

/// Metric key for each task: its name, or `<name>_<id>` when several tasks
/// share the name.
///
/// A suffixed key can still land on another task's literal name (`IDLE` id 0
/// against a task called `IDLE_0`). Keys that collide after suffixing get
/// `_<id>` and then a counter appended until every key is unique.
pub fn task_metric_names(tasks: &[TaskInfo]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for task in tasks {
        *counts.entry(task.name.as_str()).or_default() += 1;
    }

    let mut keys: Vec<String> = tasks
        .iter()
        .map(|task| {
            if counts[task.name.as_str()] > 1 {
                format!("{}_{}", task.name, task.id)
            } else {
                task.name.clone()
            }
        })
        .collect();

    let mut key_counts: HashMap<String, usize> = HashMap::new();
    for key in &keys {
        *key_counts.entry(key.clone()).or_default() += 1;
    }

    let mut taken: HashSet<String> = keys
        .iter()
        .filter(|key| key_counts[key.as_str()] == 1)
        .cloned()
        .collect();

    for (key, task) in keys.iter_mut().zip(tasks) {
        if key_counts[key.as_str()] == 1 {
            continue;
        }
        let base = format!("{}_{}", key, task.id);
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        taken.insert(candidate.clone());
        *key = candidate;
    }

    keys
}
