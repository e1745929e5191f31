//! Persistence ports for the trust stores

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::Certificate;
use crate::{Error, Result};

const STORE_VERSION: u32 = 1;

/// Where a trust store keeps its entries
pub trait TrustBackend: Send + Sync {
    fn load(&self) -> Result<BTreeMap<String, Certificate>>;
    fn save(&self, entries: &BTreeMap<String, Certificate>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    name: String,
    certificate_pem: String,
}

/// On-disk layout, versioned for future migrations
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<StoredEntry>,
}

/// JSON file backend; writes go to a temp file first and are renamed over the original
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrustBackend for JsonFileBackend {
    fn load(&self) -> Result<BTreeMap<String, Certificate>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no trust file yet");
            return Ok(BTreeMap::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        let file: StoreFile = serde_json::from_str(&contents)?;
        if file.version != STORE_VERSION {
            return Err(Error::Certificate(format!(
                "unsupported trust store version {} in {}",
                file.version,
                self.path.display()
            )));
        }

        file.entries
            .into_iter()
            .map(|entry| Ok((entry.name, Certificate::from_pem(&entry.certificate_pem)?)))
            .collect()
    }

    fn save(&self, entries: &BTreeMap<String, Certificate>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = StoreFile {
            version: STORE_VERSION,
            entries: entries
                .iter()
                .map(|(name, cert)| StoredEntry {
                    name: name.clone(),
                    certificate_pem: cert.to_pem(),
                })
                .collect(),
        };

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Volatile backend for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Certificate>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustBackend for MemoryBackend {
    fn load(&self) -> Result<BTreeMap<String, Certificate>> {
        Ok(self
            .entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }

    fn save(&self, entries: &BTreeMap<String, Certificate>) -> Result<()> {
        if let Ok(mut stored) = self.entries.lock() {
            *stored = entries.clone();
        }
        Ok(())
    }
}
