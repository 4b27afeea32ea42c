//! Worker identity: the credential the channel authenticates with.
//!
//! Generated once on first start and persisted as JSON; every later start
//! reads the same file. A missing file is created, a corrupt one is fatal.

use std::path::Path;

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentityError;

/// Immutable `(machine_id, secret_key)` pair.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    machine_id: String,
    secret_key: SecretString,
}

/// On-disk representation.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    machine_id: String,
    secret_key: String,
}

impl WorkerIdentity {
    /// Build an identity from known values. Both must be non-empty.
    pub fn new(
        machine_id: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, String> {
        let machine_id = machine_id.into().trim().to_string();
        let secret_key = secret_key.into();
        if machine_id.is_empty() {
            return Err("machineId is empty".to_string());
        }
        if secret_key.trim().is_empty() {
            return Err("secretKey is empty".to_string());
        }
        Ok(Self {
            machine_id,
            secret_key: SecretString::from(secret_key),
        })
    }

    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            machine_id: format!("worker-{}", &short[..8]),
            secret_key: SecretString::from(hex::encode(secret)),
        }
    }

    /// Read the identity at `path`, creating and persisting one if absent.
    pub async fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(path, &raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.persist(path).await?;
                tracing::info!(
                    machine_id = %identity.machine_id,
                    path = %path.display(),
                    "Generated new worker identity"
                );
                Ok(identity)
            }
            Err(source) => Err(IdentityError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, IdentityError> {
        let file: IdentityFile =
            serde_json::from_str(raw).map_err(|e| IdentityError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::new(file.machine_id, file.secret_key).map_err(|reason| IdentityError::Corrupt {
            path: path.to_path_buf(),
            reason,
        })
    }

    async fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let write_err = |source| IdentityError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let file = IdentityFile {
            machine_id: self.machine_id.clone(),
            secret_key: self.secret_key.expose_secret().to_string(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| IdentityError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(path, json).await.map_err(write_err)
    }

    /// Display name and routing key on the coordinator.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Channel auth credential.
    pub fn secret_key(&self) -> &SecretString {
        &self.secret_key
    }
}
