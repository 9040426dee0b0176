use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const REGISTRATION_FILE: &str = "registration.yaml";
const FINGERPRINT_FILE: &str = "fingerprint.yaml";

pub const DEFAULT_SIMILARITY_THRESHOLD: u8 = 40;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("no instance id available: the agent is not registered and none is configured")]
    Unresolved,
    #[error("similarity threshold {0} is out of range (1..=100)")]
    ThresholdOutOfRange(u8),
    #[error("io error: `{0}`")]
    Io(#[from] io::Error),
    #[error("serialization error: `{0}`")]
    Serialization(#[from] serde_yaml::Error),
}

/// Persisted by registration; the agent cannot work without it (or a
/// configured override).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub instance_id: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    pub similarity_threshold: u8,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// On-disk identity records under the data root.
pub struct IdentityStore {
    data_root: PathBuf,
}

impl IdentityStore {
    pub fn new(data_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
        }
    }

    pub fn load_registration(&self) -> Result<Option<RegistrationRecord>, IdentityError> {
        match fs::read_to_string(self.data_root.join(REGISTRATION_FILE)) {
            Ok(contents) => Ok(Some(serde_yaml::from_str(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save_registration(&self, record: &RegistrationRecord) -> Result<(), IdentityError> {
        fs::create_dir_all(&self.data_root)?;
        fs::write(
            self.data_root.join(REGISTRATION_FILE),
            serde_yaml::to_string(record)?,
        )?;
        info!(instance_id = record.instance_id, "registration record saved");
        Ok(())
    }

    pub fn clear_registration(&self) -> Result<(), IdentityError> {
        match fs::remove_file(self.data_root.join(REGISTRATION_FILE)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn load_fingerprint(&self) -> Result<FingerprintConfig, IdentityError> {
        match fs::read_to_string(self.data_root.join(FINGERPRINT_FILE)) {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FingerprintConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists the hardware-fingerprint similarity threshold (percent).
    pub fn save_similarity_threshold(&self, threshold: u8) -> Result<(), IdentityError> {
        if threshold == 0 || threshold > 100 {
            return Err(IdentityError::ThresholdOutOfRange(threshold));
        }
        fs::create_dir_all(&self.data_root)?;
        fs::write(
            self.data_root.join(FINGERPRINT_FILE),
            serde_yaml::to_string(&FingerprintConfig {
                similarity_threshold: threshold,
            })?,
        )?;
        Ok(())
    }
}

/// Resolves the instance identity from the configured override or the
/// registration record. Failure here is fatal for the supervisor.
pub fn resolve_identity(
    configured_instance_id: Option<&str>,
    configured_region: Option<&str>,
    store: &IdentityStore,
) -> Result<(String, String), IdentityError> {
    let registration = store.load_registration()?;
    let instance_id = configured_instance_id
        .map(str::to_string)
        .or_else(|| registration.as_ref().map(|r| r.instance_id.clone()))
        .ok_or(IdentityError::Unresolved)?;
    let region = configured_region
        .map(str::to_string)
        .or_else(|| registration.as_ref().map(|r| r.region.clone()))
        .ok_or(IdentityError::Unresolved)?;
    Ok((instance_id, region))
}
