//! Device-state collaborators the collectors and the readiness gate consume.
//!
//! Each concern is a small trait so tests can substitute fakes. [`Platform::host`]
//! wires the Linux implementations reading `/proc`.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Wall-clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Ask the clock to resynchronize. Fire-and-forget.
    fn request_resync(&self);
}

/// Reports whether the default outbound interface is up with a usable address.
pub trait NetworkProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Memory pressure snapshot, all values in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub free: u64,
    pub min_free: u64,
    pub largest_free_block: u64,
}

pub trait HeapProbe: Send + Sync {
    fn heap_stats(&self) -> Option<HeapStats>;
}

/// One schedulable unit as seen by the task-introspection provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub id: u64,
    /// Remaining unused stack in bytes
    pub stack_headroom: u64,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, id: u64, stack_headroom: u64) -> Self {
        Self {
            name: name.into(),
            id,
            stack_headroom,
        }
    }
}

pub trait TaskProbe: Send + Sync {
    /// Snapshot of all units at the moment of the call, `None` if unavailable.
    fn tasks(&self) -> Option<Vec<TaskInfo>>;
}

pub trait RadioProbe: Send + Sync {
    /// Signal strength of the current access point in dBm.
    fn signal_strength(&self) -> Option<i32>;
}

/// The set of collaborators a sender works against.
#[derive(Clone)]
pub struct Platform {
    pub clock: Arc<dyn Clock>,
    pub network: Arc<dyn NetworkProbe>,
    pub heap: Arc<dyn HeapProbe>,
    pub tasks: Arc<dyn TaskProbe>,
    pub radio: Arc<dyn RadioProbe>,
}

impl Platform {
    /// Collaborators backed by the running Linux host.
    pub fn host() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            network: Arc::new(RouteProbe::default()),
            heap: Arc::new(ProcHeapProbe::default()),
            tasks: Arc::new(ProcTaskProbe::default()),
            radio: Arc::new(WirelessProbe::default()),
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// System wall clock. Synchronization is left to the host's time daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn request_resync(&self) {
        warn!("System clock looks unsynchronized; relying on the host time service to correct it");
    }
}

/// Checks for a route to a public address by connecting a UDP socket.
///
/// Connecting a datagram socket only selects a route and a local address, no
/// packet leaves the host.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    target: SocketAddr,
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self {
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
        }
    }
}

impl RouteProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl NetworkProbe for RouteProbe {
    fn is_connected(&self) -> bool {
        let bind_addr: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = match UdpSocket::bind(bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "Failed to open probe socket");
                return false;
            }
        };

        if let Err(e) = socket.connect(self.target) {
            debug!(error = %e, target = %self.target, "No route to probe target");
            return false;
        }

        match socket.local_addr() {
            Ok(addr) => !addr.ip().is_unspecified(),
            Err(e) => {
                debug!(error = %e, "Failed to read local address");
                false
            }
        }
    }
}

/// Heap statistics from `/proc/meminfo` and `/proc/buddyinfo`.
#[derive(Debug)]
pub struct ProcHeapProbe {
    proc_root: PathBuf,
    page_size: u64,
    min_free: AtomicU64,
}

impl Default for ProcHeapProbe {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcHeapProbe {
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            page_size: 4096,
            min_free: AtomicU64::new(u64::MAX),
        }
    }
}

impl HeapProbe for ProcHeapProbe {
    fn heap_stats(&self) -> Option<HeapStats> {
        let meminfo = fs::read_to_string(self.proc_root.join("meminfo")).ok()?;
        let free = parse_meminfo_kb(&meminfo, "MemFree")? * 1024;

        let min_free = self.min_free.fetch_min(free, Ordering::Relaxed).min(free);

        let largest_free_block = fs::read_to_string(self.proc_root.join("buddyinfo"))
            .ok()
            .and_then(|text| largest_buddy_order(&text))
            .map(|order| self.page_size << order)
            .unwrap_or(0);

        Some(HeapStats {
            free,
            min_free,
            largest_free_block,
        })
    }
}

fn parse_meminfo_kb(meminfo: &str, key: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Highest allocation order with at least one free block across all zones.
fn largest_buddy_order(buddyinfo: &str) -> Option<u32> {
    buddyinfo
        .lines()
        .filter_map(|line| {
            // "Node 0, zone   Normal   12  5  3 ..."
            let counts = line.split_once("zone")?.1.split_whitespace().skip(1);
            counts
                .enumerate()
                .filter(|(_, count)| count.parse::<u64>().map(|c| c > 0).unwrap_or(false))
                .map(|(order, _)| order as u32)
                .last()
        })
        .max()
}

/// Threads of this process from `/proc/self/task`.
///
/// Linux does not expose per-thread stack usage, so only the main thread
/// (whose stack limit and usage are known) reports a headroom.
#[derive(Debug)]
pub struct ProcTaskProbe {
    proc_self: PathBuf,
}

impl Default for ProcTaskProbe {
    fn default() -> Self {
        Self::with_root("/proc/self")
    }
}

impl ProcTaskProbe {
    pub fn with_root(proc_self: impl Into<PathBuf>) -> Self {
        Self {
            proc_self: proc_self.into(),
        }
    }

    fn main_thread_headroom(&self) -> Option<u64> {
        let limits = fs::read_to_string(self.proc_self.join("limits")).ok()?;
        let limit = parse_stack_limit(&limits)?;
        let status = fs::read_to_string(self.proc_self.join("status")).ok()?;
        let used = parse_meminfo_kb(&status, "VmStk")? * 1024;
        Some(limit.saturating_sub(used))
    }
}

impl TaskProbe for ProcTaskProbe {
    fn tasks(&self) -> Option<Vec<TaskInfo>> {
        let pid: u64 = fs::read_link(&self.proc_self)
            .ok()
            .and_then(|p| p.file_name()?.to_str()?.parse().ok())
            .or_else(|| {
                let status = fs::read_to_string(self.proc_self.join("status")).ok()?;
                parse_meminfo_kb(&status, "Tgid")
            })?;
        let headroom = self.main_thread_headroom()?;

        let mut tasks = Vec::new();
        for entry in fs::read_dir(self.proc_self.join("task")).ok()? {
            let Ok(entry) = entry else { continue };
            let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if tid != pid {
                continue;
            }
            let name = fs::read_to_string(entry.path().join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "main".to_string());
            tasks.push(TaskInfo::new(name, tid, headroom));
        }

        if tasks.is_empty() {
            None
        } else {
            Some(tasks)
        }
    }
}

/// Soft "Max stack size" from a `limits` file, `None` when unlimited.
fn parse_stack_limit(limits: &str) -> Option<u64> {
    let line = limits.lines().find(|l| l.starts_with("Max stack size"))?;
    let soft = line.trim_start_matches("Max stack size").split_whitespace().next()?;
    soft.parse().ok()
}

/// Signal level of the first interface in `/proc/net/wireless`.
#[derive(Debug)]
pub struct WirelessProbe {
    path: PathBuf,
}

impl Default for WirelessProbe {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/net/wireless"),
        }
    }
}

impl WirelessProbe {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RadioProbe for WirelessProbe {
    fn signal_strength(&self) -> Option<i32> {
        let text = fs::read_to_string(&self.path).ok()?;
        parse_wireless_level(&text)
    }
}

fn parse_wireless_level(text: &str) -> Option<i32> {
    // Two header lines, then "wlan0: 0000   70.  -40.  -256  ..."
    text.lines().skip(2).find_map(|line| {
        let (_, stats) = line.split_once(':')?;
        let level = stats.split_whitespace().nth(2)?;
        let level: f64 = level.trim_end_matches('.').parse().ok()?;
        Some(level as i32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16314628 kB\nMemFree:         1203456 kB\nMemAvailable:    9021340 kB\n";

    const BUDDYINFO: &str = "\
Node 0, zone      DMA      1      1      1      0      2      1      1      0      1      1      3
Node 0, zone    DMA32      5      8      6      4      3      2      1      1      0      0      0
Node 0, zone   Normal    120     88     40     10      2      0      0      0      0      0      0
";

    const WIRELESS: &str = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
wlp2s0: 0000   58.  -52.  -256        0      0      0      0     12        0
";

    #[test]
    fn test_parse_meminfo() {
        assert_eq!(parse_meminfo_kb(MEMINFO, "MemFree"), Some(1_203_456));
        assert_eq!(parse_meminfo_kb(MEMINFO, "Missing"), None);
    }

    #[test]
    fn test_largest_buddy_order() {
        assert_eq!(largest_buddy_order(BUDDYINFO), Some(10));
        assert_eq!(largest_buddy_order(""), None);
    }

    #[test]
    fn test_parse_wireless_level() {
        assert_eq!(parse_wireless_level(WIRELESS), Some(-52));
        let header_only: String = WIRELESS.lines().take(2).collect::<Vec<_>>().join("\n");
        assert_eq!(parse_wireless_level(&header_only), None);
    }

    #[test]
    fn test_parse_stack_limit() {
        let limits = "Limit                     Soft Limit           Hard Limit           Units\n\
                      Max stack size            8388608              unlimited            bytes\n";
        assert_eq!(parse_stack_limit(limits), Some(8_388_608));

        let unlimited = "Max stack size            unlimited            unlimited            bytes\n";
        assert_eq!(parse_stack_limit(unlimited), None);
    }

    #[test]
    fn test_heap_probe_tracks_minimum() {
        let dir = std::env::temp_dir().join(format!("metrics-sender-heap-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("meminfo"), MEMINFO).unwrap();
        fs::write(dir.join("buddyinfo"), BUDDYINFO).unwrap();

        let probe = ProcHeapProbe::with_root(&dir);
        let first = probe.heap_stats().unwrap();
        assert_eq!(first.free, 1_203_456 * 1024);
        assert_eq!(first.min_free, first.free);
        assert_eq!(first.largest_free_block, 4096 << 10);

        fs::write(dir.join("meminfo"), "MemFree:  2000000 kB\n").unwrap();
        let second = probe.heap_stats().unwrap();
        assert_eq!(second.free, 2_000_000 * 1024);
        assert_eq!(second.min_free, first.free);

        fs::remove_dir_all(&dir).ok();
    }

    fn task_fixture(name: &str, limits: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "metrics-sender-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(dir.join("task/4242")).unwrap();
        fs::create_dir_all(dir.join("task/4243")).unwrap();
        fs::write(dir.join("limits"), limits).unwrap();
        fs::write(
            dir.join("status"),
            "Name:\tmetrics-sender\nTgid:\t4242\nPid:\t4242\nVmStk:\t     132 kB\n",
        )
        .unwrap();
        fs::write(dir.join("task/4242/comm"), "metrics-sender\n").unwrap();
        fs::write(dir.join("task/4243/comm"), "metrics_sender_task\n").unwrap();
        dir
    }

    #[test]
    fn test_task_probe_reports_main_thread() {
        let dir = task_fixture(
            "tasks",
            "Limit                     Soft Limit           Hard Limit           Units\n\
             Max stack size            8388608              unlimited            bytes\n",
        );

        let tasks = ProcTaskProbe::with_root(&dir).tasks().unwrap();
        assert_eq!(
            tasks,
            vec![TaskInfo::new("metrics-sender", 4242, 8_388_608 - 132 * 1024)]
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_task_probe_unlimited_stack_is_unavailable() {
        let dir = task_fixture(
            "tasks-unlimited",
            "Max stack size            unlimited            unlimited            bytes\n",
        );

        assert_eq!(ProcTaskProbe::with_root(&dir).tasks(), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_task_probe_missing_root() {
        let probe = ProcTaskProbe::with_root("/nonexistent/proc/self");
        assert_eq!(probe.tasks(), None);
    }

    #[test]
    fn test_route_probe_loopback_is_connected() {
        let probe = RouteProbe::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9));
        assert!(probe.is_connected());
    }

    #[test]
    fn test_wireless_probe_missing_file() {
        let probe = WirelessProbe::with_path("/nonexistent/proc/net/wireless");
        assert_eq!(probe.signal_strength(), None);
    }

    #[test]
    fn test_system_clock_is_plausible() {
        use chrono::Datelike;
        assert!(SystemClock.now().year() >= 2020);
    }
}
