//! Persistent config store
//!
//! Two independent documents live under fixed paths below the storage root.
//! Both follow the same discipline: a missing file loads as absent, a file that
//! fails to parse is removed and loads as absent, a save overwrites in place.

use crate::{diagnostics::Diagnostics, document::StateDocument, network_stack::NetworkCredentials};
use anyhow::{Context, Result, ensure};
use log::debug;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Application state document
pub const STATE_DOCUMENT_PATH: &str = "/config.json";
/// Network credentials document
pub const CREDENTIALS_PATH: &str = "/wifi_config.json";

#[derive(Clone, Debug)]
pub struct ConfigStore {
    root: PathBuf,
    diagnostics: Diagnostics,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>, diagnostics: Diagnostics) -> Self {
        Self {
            root: root.into(),
            diagnostics,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make sure the storage root is usable
    ///
    /// # Returns
    /// Error if the root cannot be created or is not a writable directory
    pub fn mount(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .context(format!("failed to create storage root {:?}", self.root))?;

        let metadata = fs::metadata(&self.root)
            .context(format!("failed to get metadata of {:?}", self.root))?;

        ensure!(metadata.is_dir(), "storage root {:?} is not a directory", self.root);
        ensure!(
            !metadata.permissions().readonly(),
            "storage root {:?} is read-only",
            self.root
        );

        Ok(())
    }

    /// Resolve a well-known document path below the storage root
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Load and parse a document
    ///
    /// # Arguments
    /// * `path` - Well-known document path, e.g. [`STATE_DOCUMENT_PATH`]
    /// * `parse` - Parser applied to the raw file content
    ///
    /// # Returns
    /// `None` if the file does not exist or is corrupt; corrupt files are removed
    pub fn load<T>(&self, path: &str, parse: impl FnOnce(&[u8]) -> Result<T>) -> Option<T> {
        let file = self.resolve(path);

        let content = match fs::read(&file) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{path} does not exist");
                return None;
            }
            Err(e) => {
                self.diagnostics.error(format!("failed to read {path}: {e}"));
                return None;
            }
        };

        match parse(&content) {
            Ok(document) => Some(document),
            Err(e) => {
                self.diagnostics
                    .warn(format!("{path} is corrupt and will be removed: {e:#}"));

                if let Err(e) = fs::remove_file(&file) {
                    self.diagnostics
                        .error(format!("failed to remove corrupt {path}: {e}"));
                }

                None
            }
        }
    }

    pub fn load_json<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.load(path, |content| {
            serde_json::from_slice(content).context(format!("failed to parse {path}"))
        })
    }

    /// Overwrite a document in place
    ///
    /// # Returns
    /// Number of bytes written
    pub fn save(&self, path: &str, content: &[u8]) -> Result<usize> {
        fs::write(self.resolve(path), content).context(format!("failed to write {path}"))?;
        Ok(content.len())
    }

    pub fn save_json<T: Serialize>(&self, path: &str, value: &T) -> Result<usize> {
        let json = serde_json::to_vec(value).context(format!("failed to serialize {path}"))?;
        self.save(path, &json)
    }

    pub fn load_state(&self, budget: usize) -> Option<StateDocument> {
        self.load(STATE_DOCUMENT_PATH, |content| {
            StateDocument::parse(content, budget)
        })
    }

    pub fn save_state(&self, document: &StateDocument, budget: usize) -> Result<usize> {
        let json = document.to_json(budget)?;
        self.save(STATE_DOCUMENT_PATH, json.as_bytes())
    }

    pub fn load_credentials(&self) -> Option<NetworkCredentials> {
        self.load_json(CREDENTIALS_PATH)
    }

    pub fn save_credentials(&self, credentials: &NetworkCredentials) -> Result<usize> {
        self.save_json(CREDENTIALS_PATH, credentials)
    }
}
