//! Best-effort link-level "online" signal.
//!
//! Two sources feed one `watch` channel: transitions pushed by the platform
//! ([`ConnectivityMonitor::report`]) and a fixed-interval [`LinkProbe`] poll
//! that catches a stale or missing passive signal. This never talks to the
//! attendance server; a reachable link with a dead server shows up as a sync
//! error instead.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Active check of link state.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Reports online when any non-loopback interface under `/sys/class/net`
/// is carrying traffic.
///
/// `operstate` `up` counts directly. Tunnels, PPP/LTE modems and some wifi
/// drivers report `unknown` (or `dormant`) while passing traffic; those count
/// unless `carrier` reads `0`. `down`, `lowerlayerdown` and `notpresent` never
/// count.
///
/// If the directory cannot be read the probe answers `true`: with no way to
/// tell, network attempts are allowed and their own failures are reported.
pub struct SysfsLinkProbe {
    root: PathBuf,
}

impl SysfsLinkProbe {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsLinkProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkProbe for SysfsLinkProbe {
    async fn probe(&self) -> bool {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(root = %self.root.display(), error = %e, "link state unreadable; assuming online");
                return true;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name() == "lo" {
                continue;
            }
            if interface_is_up(&entry.path()).await {
                tracing::trace!(interface = ?entry.file_name(), "link up");
                return true;
            }
        }
        false
    }
}

async fn interface_is_up(dir: &Path) -> bool {
    let Ok(state) = tokio::fs::read_to_string(dir.join("operstate")).await else {
        return false;
    };
    match state.trim() {
        "up" => true,
        "down" | "lowerlayerdown" | "notpresent" => false,
        // `carrier` is unreadable on some virtual devices.
        _ => !matches!(
            tokio::fs::read_to_string(dir.join("carrier")).await.as_deref().map(str::trim),
            Ok("0")
        ),
    }
}

/// Last known link state plus change notification.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Record an observed link state. Only transitions notify subscribers.
    pub fn report(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    /// Poll `probe` every `every` and feed the result into [`report`](Self::report).
    /// The task runs until aborted.
    pub fn spawn_poller(self: &Arc<Self>, probe: Arc<dyn LinkProbe>, every: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let online = probe.probe().await;
                monitor.report(online);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl LinkProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_report_updates_state() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());
        monitor.report(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions_only() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.report(true);
        assert!(!rx.has_changed().unwrap());

        monitor.report(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_poller_reflects_probe() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
        let mut rx = monitor.subscribe();
        let poller = monitor.spawn_poller(probe.clone(), Duration::from_millis(10));

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("poller should report the link coming up")
            .unwrap();
        assert!(monitor.is_online());

        probe.0.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("poller should report the link going down")
            .unwrap();
        assert!(!monitor.is_online());
        poller.abort();
    }

    #[tokio::test]
    async fn test_sysfs_probe_reads_operstate() {
        let dir = tempfile::tempdir().unwrap();
        let lo = dir.path().join("lo");
        let eth = dir.path().join("eth0");
        std::fs::create_dir_all(&lo).unwrap();
        std::fs::create_dir_all(&eth).unwrap();
        std::fs::write(lo.join("operstate"), "unknown\n").unwrap();
        std::fs::write(eth.join("operstate"), "down\n").unwrap();

        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(!probe.probe().await);

        std::fs::write(eth.join("operstate"), "up\n").unwrap();
        assert!(probe.probe().await);
    }

    #[tokio::test]
    async fn test_sysfs_probe_counts_unknown_state_tunnels() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["lo", "wg0", "ppp0"] {
            let iface = dir.path().join(name);
            std::fs::create_dir_all(&iface).unwrap();
            std::fs::write(iface.join("operstate"), "unknown\n").unwrap();
        }
        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(probe.probe().await);

        let wg0 = dir.path().join("wg0");
        std::fs::write(wg0.join("carrier"), "1\n").unwrap();
        std::fs::remove_dir_all(dir.path().join("ppp0")).unwrap();
        assert!(probe.probe().await);

        std::fs::write(wg0.join("carrier"), "0\n").unwrap();
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn test_sysfs_probe_lower_layer_down_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let wlan = dir.path().join("wlan0");
        std::fs::create_dir_all(&wlan).unwrap();
        std::fs::write(wlan.join("operstate"), "lowerlayerdown\n").unwrap();
        std::fs::write(wlan.join("carrier"), "1\n").unwrap();
        assert!(!SysfsLinkProbe::with_root(dir.path()).probe().await);
    }

    #[tokio::test]
    async fn test_sysfs_probe_ignores_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let lo = dir.path().join("lo");
        std::fs::create_dir_all(&lo).unwrap();
        std::fs::write(lo.join("operstate"), "up\n").unwrap();
        assert!(!SysfsLinkProbe::with_root(dir.path()).probe().await);
    }

    #[tokio::test]
    async fn test_sysfs_probe_missing_root_assumes_online() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SysfsLinkProbe::with_root(dir.path().join("absent")).probe().await);
    }
}
