/*!
 * Persistence of the single paired controller address.
 */
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use poolflow_core::types::DeviceAddress;

use crate::error::{DeviceError, Result};

/// Durable storage for the paired address
#[async_trait]
pub trait PairingStore: Send + Sync + Debug {
    /// Stored address, or `None` when nothing is paired
    async fn load(&self) -> Result<Option<DeviceAddress>>;

    /// Store an address; `None` removes the pairing
    async fn save(&self, address: Option<DeviceAddress>) -> Result<()>;
}

/// Load the pairing, treating any storage failure as "unpaired"
pub async fn load_or_unpaired(store: &dyn PairingStore) -> Option<DeviceAddress> {
    match store.load().await {
        Ok(address) => address,
        Err(e) => {
            error!("Failed to load pairing, continuing unpaired: {}", e);
            None
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PairingRecord {
    paired_pool_ip: DeviceAddress,
}

/// Pairing stored as a small JSON document
#[derive(Debug, Clone)]
pub struct FilePairingStore {
    path: PathBuf,
}

impl FilePairingStore {
    /// Store the pairing at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Location of the pairing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PairingStore for FilePairingStore {
    async fn load(&self) -> Result<Option<DeviceAddress>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: PairingRecord = serde_json::from_str(&contents).map_err(|e| {
            DeviceError::storage(format!("Corrupt pairing file {}: {}", self.path.display(), e))
        })?;
        debug!("Loaded pairing {} from {}", record.paired_pool_ip, self.path.display());
        Ok(Some(record.paired_pool_ip))
    }

    async fn save(&self, address: Option<DeviceAddress>) -> Result<()> {
        let Some(address) = address else {
            return match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    info!("Removed pairing file {}", self.path.display());
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let record = PairingRecord {
            paired_pool_ip: address,
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| DeviceError::storage(e.to_string()))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        info!("Saved pairing {} to {}", address, self.path.display());
        Ok(())
    }
}

/// In-memory pairing, for tests and ephemeral sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryPairingStore {
    address: Arc<Mutex<Option<DeviceAddress>>>,
    failing: bool,
}

impl MemoryPairingStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// A store already holding `address`
    pub fn with_address(address: DeviceAddress) -> Self {
        Self {
            address: Arc::new(Mutex::new(Some(address))),
            failing: false,
        }
    }

    /// A store whose every operation fails
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Current contents, bypassing the failure flag
    pub fn peek(&self) -> Option<DeviceAddress> {
        *self.address.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(DeviceError::storage("pairing storage unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn load(&self) -> Result<Option<DeviceAddress>> {
        self.check()?;
        Ok(self.peek())
    }

    async fn save(&self, address: Option<DeviceAddress>) -> Result<()> {
        self.check()?;
        *self.address.lock().unwrap_or_else(|e| e.into_inner()) = address;
        Ok(())
    }
}
