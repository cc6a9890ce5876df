//! Global config singleton. Tunable constants from spec.md §4 with environment
//! and settings-file overrides, loaded once: the first caller does the work,
//! later callers get the same instance.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached tunables for session timeouts, debounce, persistence throttling
/// and tombstone bookkeeping. All durations are in milliseconds on the wire
/// (`settings.json`) and env vars, converted to [`Duration`] once here.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long an accepted socket may wait for `connect` before being dropped.
    pub session_start_wait: Duration,
    /// How long a `Connected` session may go without any inbound message.
    pub session_idle_timeout: Duration,
    /// Grace window after cancellation before a session is hard-removed.
    pub session_removal_wait: Duration,
    /// Debounce window for batching `patch`/`push_result` frames (one 60Hz frame).
    pub data_message_debounce: Duration,
    /// Trailing-throttle window between persistence writes.
    pub persist_throttle: Duration,
    /// Interval at which the session janitor sweeps for idle/closed sessions.
    pub janitor_interval: Duration,
    /// Upper bound on retained tombstones before pruning.
    pub max_tombstones: usize,
    /// Number of extra tombstones dropped once `max_tombstones` is exceeded.
    pub tombstone_prune_buffer: usize,
    /// Frame payload size above which a message is chunked.
    pub max_safe_message_size: usize,
    /// Directory backing the sqlite blob store (`rooms.db` lives here).
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_start_wait: Duration::from_secs(10),
            session_idle_timeout: Duration::from_secs(20),
            session_removal_wait: Duration::from_secs(10),
            data_message_debounce: Duration::from_millis(16),
            persist_throttle: Duration::from_secs(10),
            janitor_interval: Duration::from_secs(2),
            max_tombstones: 3000,
            tombstone_prune_buffer: 300,
            max_safe_message_size: 256 * 1024,
            data_dir: default_data_dir(),
        }
    }
}

/// Ensure config is loaded (idempotent). Reads `SYNC_*` env vars and an
/// optional `settings.json` in the data dir on first call; later calls return
/// the same instance.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(load_config)
}

fn load_config() -> Config {
    let mut cfg = Config::default();

    if let Ok(dir) = std::env::var("SYNC_DATA_DIR") {
        if !dir.trim().is_empty() {
            cfg.data_dir = PathBuf::from(dir);
        }
    }
    if let Some(ms) = env_millis("SYNC_SESSION_IDLE_TIMEOUT_MS") {
        cfg.session_idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_millis("SYNC_PERSIST_THROTTLE_MS") {
        cfg.persist_throttle = Duration::from_millis(ms);
    }
    if let Some(ms) = env_millis("SYNC_SESSION_REMOVAL_WAIT_MS") {
        cfg.session_removal_wait = Duration::from_millis(ms);
    }
    if let Some(ms) = env_millis("SYNC_JANITOR_INTERVAL_MS") {
        cfg.janitor_interval = Duration::from_millis(ms);
    }
    if let Some(n) = env_usize("SYNC_MAX_TOMBSTONES") {
        cfg.max_tombstones = n;
    }
    if let Some(n) = env_usize("SYNC_MAX_SAFE_MESSAGE_SIZE") {
        cfg.max_safe_message_size = n;
    }

    let settings_path = cfg.data_dir.join("settings.json");
    if let Ok(data) = std::fs::read_to_string(&settings_path) {
        if let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) {
            apply_settings_overrides(&mut cfg, &root);
        } else {
            tracing::warn!(path = %settings_path.display(), "ignoring unparseable settings.json");
        }
    }

    cfg
}

fn apply_settings_overrides(cfg: &mut Config, root: &serde_json::Value) {
    if let Some(ms) = root.get("session_idle_timeout_ms").and_then(|v| v.as_u64()) {
        cfg.session_idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = root.get("persist_throttle_ms").and_then(|v| v.as_u64()) {
        cfg.persist_throttle = Duration::from_millis(ms);
    }
    if let Some(n) = root.get("max_tombstones").and_then(|v| v.as_u64()) {
        cfg.max_tombstones = n as usize;
    }
}

fn env_millis(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".sync-core")
}
