use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// User preferences persisted between sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default)]
    pub camera_enabled_on_join: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: false,
        }
    }
}

/// Tunables for one meeting session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
}

/// Signaling channel reconnect and queueing policy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the signaling server (ws:// or wss://).
    pub url: String,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// Relative jitter applied to every backoff delay (0.2 = ±20%).
    pub reconnect_jitter: f64,
    /// Give up and surface a fatal error after this long without a connection.
    pub max_reconnect_duration_ms: u64,
    pub connect_timeout_ms: u64,
    /// Outbound messages kept while disconnected.
    pub outbox_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/signaling".to_string(),
            reconnect_base_ms: 500,
            reconnect_cap_ms: 10_000,
            reconnect_jitter: 0.2,
            max_reconnect_duration_ms: 60_000,
            connect_timeout_ms: 15_000,
            outbox_capacity: 64,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn max_reconnect_duration(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_duration_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-peer negotiation retry policy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub answer_timeout_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_ms: 1_000,
            answer_timeout_ms: 10_000,
        }
    }
}

impl NegotiationConfig {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base…
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor))
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to persist settings: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring corrupt settings file {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert_eq!(s.display_name, None);
        assert!(s.mic_enabled_on_join);
        assert!(!s.camera_enabled_on_join);
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_display_name_and_devices_persist() {
        let dir = temp_dir();
        {
            let store = SettingsStore::new(dir.path());
            store.set_display_name(Some("Alice Martin".to_string()));
            store.set_mic_enabled_on_join(false);
            store.set_camera_enabled_on_join(true);
        }
        let s = SettingsStore::new(dir.path()).get();
        assert_eq!(s.display_name.as_deref(), Some("Alice Martin"));
        assert!(!s.mic_enabled_on_join);
        assert!(s.camera_enabled_on_join);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        fs::write(dir.path().join("settings.json"), "not json!!!").unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        fs::write(dir.path().join("settings.json"), r#"{"display_name":"Eve"}"#).unwrap();
        let s = SettingsStore::new(dir.path()).get();
        assert_eq!(s.display_name.as_deref(), Some("Eve"));
        assert!(s.mic_enabled_on_join);
        assert!(!s.camera_enabled_on_join);
    }

    #[test]
    fn session_config_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.signaling.reconnect_base(), Duration::from_millis(500));
        assert_eq!(cfg.signaling.reconnect_cap(), Duration::from_secs(10));
        assert_eq!(cfg.signaling.max_reconnect_duration(), Duration::from_secs(60));
        assert_eq!(cfg.negotiation.max_retries, 3);
    }

    #[test]
    fn session_config_partial_json() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"signaling":{"url":"wss://meet.example.com/ws"}}"#).unwrap();
        assert_eq!(cfg.signaling.url, "wss://meet.example.com/ws");
        assert_eq!(cfg.signaling.outbox_capacity, 64);
        assert_eq!(cfg.negotiation, NegotiationConfig::default());
    }

    #[test]
    fn retry_delay_doubles() {
        let n = NegotiationConfig::default();
        assert_eq!(n.retry_delay(1), Duration::from_secs(1));
        assert_eq!(n.retry_delay(2), Duration::from_secs(2));
        assert_eq!(n.retry_delay(3), Duration::from_secs(4));
    }
}
