use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Attendance server API root.
    pub api_url: String,
    /// Kiosk identifier registered on the server.
    pub kiosk_id: Option<String>,
    /// Admin/pairing code paired with the kiosk id.
    pub admin_code: Option<String>,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance threshold for a positive match (lower = stricter).
    pub match_threshold: f32,
    /// Seconds between scheduled full syncs.
    pub sync_interval_secs: u64,
    /// Seconds between link-state polls.
    pub online_check_secs: u64,
    /// Timeout in seconds for each request to the server.
    pub request_timeout_secs: u64,
    /// Whether to sync on start-up and on a schedule.
    pub auto_sync: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ATTEND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("attend");

        let db_path = std::env::var("ATTEND_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("kiosk.db"));

        Self {
            api_url: std::env::var("ATTEND_API_URL")
                .unwrap_or_else(|_| "http://localhost:8080/api".to_string()),
            kiosk_id: std::env::var("ATTEND_KIOSK_ID").ok(),
            admin_code: std::env::var("ATTEND_ADMIN_CODE").ok(),
            db_path,
            match_threshold: env_f32("ATTEND_MATCH_THRESHOLD", 0.6),
            sync_interval_secs: env_u64("ATTEND_SYNC_INTERVAL_SECS", 30 * 60),
            online_check_secs: env_u64("ATTEND_ONLINE_CHECK_SECS", 10),
            request_timeout_secs: env_u64("ATTEND_REQUEST_TIMEOUT_SECS", 30),
            auto_sync: env_flag("ATTEND_AUTO_SYNC", true),
            session_bus: env_flag("ATTEND_DBUS_SESSION", false),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn online_check_interval(&self) -> Duration {
        Duration::from_secs(self.online_check_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
