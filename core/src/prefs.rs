//! Persisted preferences: primary server, hub credential, local identity

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hub::HubHostDevice;
use crate::{Error, Result};

const PREFS_FILE: &str = "preferences.json";

/// PEM-encoded local identity as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub name: String,
    pub private_key_pem: String,
    pub certificate_pem: String,
}

/// Read/write contract for the state this crate persists between runs
pub trait Preferences: Send + Sync {
    /// The LAN server the connector reconnects to
    fn primary_server(&self) -> Option<String>;
    fn set_primary_server(&self, name: Option<&str>) -> Result<()>;

    fn hub_device(&self) -> Option<HubHostDevice>;
    fn set_hub_device(&self, device: Option<HubHostDevice>) -> Result<()>;

    fn identity(&self) -> Option<StoredIdentity>;
    fn set_identity(&self, identity: StoredIdentity) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PrefsData {
    #[serde(default)]
    primary_server: Option<String>,
    #[serde(default)]
    hub_device: Option<HubHostDevice>,
    #[serde(default)]
    identity: Option<StoredIdentity>,
}

/// Preferences held only in memory
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    data: Mutex<PrefsData>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&PrefsData) -> T) -> Option<T> {
        self.data.lock().ok().map(|data| f(&data))
    }

    fn write(&self, f: impl FnOnce(&mut PrefsData)) -> Result<PrefsData> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Config("preferences lock poisoned".to_string()))?;
        f(&mut data);
        Ok(data.clone())
    }
}

impl Preferences for MemoryPreferences {
    fn primary_server(&self) -> Option<String> {
        self.read(|d| d.primary_server.clone()).flatten()
    }

    fn set_primary_server(&self, name: Option<&str>) -> Result<()> {
        self.write(|d| d.primary_server = name.map(str::to_string))
            .map(|_| ())
    }

    fn hub_device(&self) -> Option<HubHostDevice> {
        self.read(|d| d.hub_device.clone()).flatten()
    }

    fn set_hub_device(&self, device: Option<HubHostDevice>) -> Result<()> {
        self.write(|d| d.hub_device = device).map(|_| ())
    }

    fn identity(&self) -> Option<StoredIdentity> {
        self.read(|d| d.identity.clone()).flatten()
    }

    fn set_identity(&self, identity: StoredIdentity) -> Result<()> {
        self.write(|d| d.identity = Some(identity)).map(|_| ())
    }
}

/// Preferences persisted as one JSON file, rewritten atomically on every change
#[derive(Debug)]
pub struct JsonPreferences {
    path: PathBuf,
    cache: MemoryPreferences,
    // Held from the cache update until the file is renamed into place, so the
    // file always reflects the latest change
    write_lock: Mutex<()>,
}

impl JsonPreferences {
    /// Open `preferences.json` in `data_dir`, starting empty if it does not exist
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(PREFS_FILE);
        let data = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            debug!(path = %path.display(), "no preferences yet");
            PrefsData::default()
        };

        Ok(Self {
            path,
            cache: MemoryPreferences {
                data: Mutex::new(data),
            },
            write_lock: Mutex::new(()),
        })
    }

    fn update(&self, f: impl FnOnce(&mut PrefsData)) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Config("preferences lock poisoned".to_string()))?;
        let data = self.cache.write(f)?;
        self.persist(&data)
    }

    fn persist(&self, data: &PrefsData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Preferences for JsonPreferences {
    fn primary_server(&self) -> Option<String> {
        self.cache.primary_server()
    }

    fn set_primary_server(&self, name: Option<&str>) -> Result<()> {
        self.update(|d| d.primary_server = name.map(str::to_string))
    }

    fn hub_device(&self) -> Option<HubHostDevice> {
        self.cache.hub_device()
    }

    fn set_hub_device(&self, device: Option<HubHostDevice>) -> Result<()> {
        self.update(|d| d.hub_device = device)
    }

    fn identity(&self) -> Option<StoredIdentity> {
        self.cache.identity()
    }

    fn set_identity(&self, identity: StoredIdentity) -> Result<()> {
        self.update(|d| d.identity = Some(identity))
    }
}
