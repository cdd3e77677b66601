use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Default bound on how long an occupancy probe may take.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default)]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub preferred_camera: Option<String>,
    #[serde(default)]
    pub preferred_microphone: Option<String>,
    #[serde(default)]
    pub preferred_speaker: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: false,
            preferred_camera: None,
            preferred_microphone: None,
            preferred_speaker: None,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

/// `settings.json` in a data directory. Missing or unreadable files fall
/// back to defaults; writes are best-effort.
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

    fn guard(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Settings {
        self.guard().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.guard().display_name = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.guard().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.guard().camera_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_preferred_devices(
        &self,
        camera: Option<String>,
        microphone: Option<String>,
        speaker: Option<String>,
    ) {
        {
            let mut s = self.guard();
            s.preferred_camera = camera;
            s.preferred_microphone = microphone;
            s.preferred_speaker = speaker;
        }
        self.save();
    }

    pub fn set_probe_timeout_ms(&self, timeout_ms: u64) {
        self.guard().probe_timeout_ms = timeout_ms;
        self.save();
    }

    fn save(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!("settings not saved: {e}");
        }
    }

    fn persist(&self) -> Result<(), SettingsError> {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&settings)?;
        std::fs::write(&self.file_path, json)?;
        Ok(())
    }

    fn load(path: &Path) -> Settings {
        match Self::read(path) {
            Ok(settings) => settings,
            Err(SettingsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Settings::default()
            }
            Err(e) => {
                tracing::warn!("ignoring {}: {e}", path.display());
                Settings::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Settings, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
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
        assert_eq!(s.probe_timeout_ms, DEFAULT_PROBE_TIMEOUT_MS);
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_set_display_name_persists() {
        let dir = temp_dir();
        {
            let store = SettingsStore::new(dir.path());
            store.set_display_name(Some("Alice".to_string()));
        }
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get().display_name, Some("Alice".to_string()));
    }

    #[test]
    fn test_devices_and_timeout_persist() {
        let dir = temp_dir();
        {
            let store = SettingsStore::new(dir.path());
            store.set_preferred_devices(Some("cam-2".into()), Some("default".into()), None);
            store.set_probe_timeout_ms(750);
            store.set_mic_enabled_on_join(false);
            store.set_camera_enabled_on_join(true);
        }
        let s = SettingsStore::new(dir.path()).get();
        assert_eq!(s.preferred_camera.as_deref(), Some("cam-2"));
        assert_eq!(s.preferred_microphone.as_deref(), Some("default"));
        assert_eq!(s.preferred_speaker, None);
        assert_eq!(s.probe_timeout_ms, 750);
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
        assert_eq!(s.display_name, Some("Eve".to_string()));
        assert!(s.mic_enabled_on_join);
        assert!(!s.camera_enabled_on_join);
        assert_eq!(s.probe_timeout_ms, DEFAULT_PROBE_TIMEOUT_MS);
    }
}
