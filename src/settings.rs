//! Volume persisted as a small JSON document.
//!
//! Saves run on a background task so the Playback tick never waits on the disk.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::player::io::SettingsStore;
use crate::player::state::{DEFAULT_VOLUME, MAX_VOLUME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub volume: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self { volume: DEFAULT_VOLUME }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("decoding {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self, SettingsError> {
        let data = fs::read(path).await.map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| SettingsError::Json {
            path: path.to_owned(),
            source,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let io_error = |source| SettingsError::Io {
            path: path.to_owned(),
            source,
        };
        let data = serde_json::to_vec_pretty(self).map_err(|source| SettingsError::Json {
            path: path.to_owned(),
            source,
        })?;
        // replaced in one rename
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await.map_err(io_error)?;
        fs::rename(&tmp, path).await.map_err(io_error)
    }
}

/// [`SettingsStore`] backed by a JSON file.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    settings: Settings,
    /// The last save started, each save waits for the one before it.
    saving: Option<JoinHandle<()>>,
}

impl JsonSettings {
    /// Loads `path`, falling back to defaults when it is missing or unreadable.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match Settings::load(&path).await {
            Ok(settings) => settings,
            Err(SettingsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file yet");
                Settings::default()
            }
            Err(e) => {
                warn!("using default settings: {e}");
                Settings::default()
            }
        };
        Self {
            path,
            settings,
            saving: None,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Waits until every save started so far is on disk.
    pub async fn flush(&mut self) {
        if let Some(saving) = self.saving.take() {
            if let Err(e) = saving.await {
                warn!("settings save task failed: {e}");
            }
        }
    }
}

impl SettingsStore for JsonSettings {
    fn load_volume(&self) -> Option<u8> {
        Some(self.settings.volume.min(MAX_VOLUME))
    }

    fn save_volume(&mut self, volume: u8) {
        if self.settings.volume == volume {
            return;
        }
        self.settings.volume = volume;
        let settings = self.settings;
        let path = self.path.clone();
        let previous = self.saving.take();
        self.saving = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match settings.save(&path).await {
                Ok(()) => debug!(volume, "volume saved"),
                Err(e) => warn!("could not save the volume: {e}"),
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("discplay-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("settings.json")
    }

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let path = scratch("missing");
        let _ = std::fs::remove_file(&path);
        let store = JsonSettings::open(&path).await;
        assert_eq!(store.load_volume(), Some(DEFAULT_VOLUME));
    }

    #[tokio::test]
    async fn corrupt_file_gives_defaults() {
        let path = scratch("corrupt");
        std::fs::write(&path, b"{ volume: ").unwrap();
        assert_eq!(JsonSettings::open(&path).await.settings(), Settings::default());
    }

    #[tokio::test]
    async fn saved_volume_survives_reopening() {
        let path = scratch("roundtrip");
        let _ = std::fs::remove_file(&path);
        let mut store = JsonSettings::open(&path).await;
        store.save_volume(85);
        store.flush().await;
        assert_eq!(JsonSettings::open(&path).await.load_volume(), Some(85));
    }

    #[tokio::test]
    async fn saving_returns_before_the_write_and_keeps_order() {
        let path = scratch("ordered");
        let _ = std::fs::remove_file(&path);
        let mut store = JsonSettings::open(&path).await;
        for volume in [10, 40, 70] {
            store.save_volume(volume);
        }
        // the current-thread runtime has not run a single save yet
        assert!(!path.exists());
        store.flush().await;
        assert_eq!(JsonSettings::open(&path).await.load_volume(), Some(70));
    }

    #[tokio::test]
    async fn unknown_fields_and_missing_volume() {
        let path = scratch("partial");
        std::fs::write(&path, br#"{"theme": "dark"}"#).unwrap();
        assert_eq!(JsonSettings::open(&path).await.load_volume(), Some(DEFAULT_VOLUME));
    }
}
