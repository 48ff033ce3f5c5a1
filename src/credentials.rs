//! Client credential persistence
//!
//! Stores one [`ClientCredential`] per provider in a flat JSON document.
//! Writes go to a sibling temp file created with owner-only permissions and
//! are renamed over the target, so a crash mid-write never corrupts the
//! store. Directory hardening runs once at startup, not on every save.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// OIDC client registration secrets for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredential {
    /// Client id issued by the provider
    pub client_id: String,
    /// Client secret issued by the provider
    pub client_secret: String,
    /// Redirect URIs the client was registered with
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Persisted mapping of provider name to registration secrets.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One-time startup hardening: create the parent directory with
    /// owner-only permissions and require it to be exclusive to this store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the directory holds unrelated files.
    pub fn harden(&self) -> Result<()> {
        let Some(dir) = self.path.parent() else {
            return Ok(());
        };

        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        // Pre-existing directories get the same owner-only mode
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }

        // Dotfiles and our own temp file are tolerated; anything else means
        // the operator pointed the store at a shared directory.
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || entry.path() == self.path || name.ends_with(".tmp") {
                continue;
            }
            return Err(Error::Config(format!(
                "Credential directory {} contains unrelated file '{}'; \
                 use a directory exclusive to the credential store",
                dir.display(),
                name
            )));
        }

        Ok(())
    }

    /// Load the provider to credential mapping.
    ///
    /// A missing file yields an empty mapping; a present but malformed file
    /// is a configuration error.
    pub fn load(&self) -> Result<HashMap<String, ClientCredential>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential file, starting empty");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Malformed credential file {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Atomically persist the mapping: write a temp file next to the target
    /// (created 0o600) and rename it into place.
    pub fn save(&self, credentials: &HashMap<String, ClientCredential>) -> Result<()> {
        let content = serde_json::to_string_pretty(credentials)?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut tmp = options.open(&tmp_path)?;
            tmp.write_all(content.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        info!(
            path = %self.path.display(),
            providers = credentials.len(),
            "Saved client credentials"
        );
        Ok(())
    }
}
