//! Update staging
//!
//! An uploaded image is copied next to the persisted documents where the
//! platform picks it up on the following restart.

use actix_multipart::form::tempfile::TempFile;
use anyhow::{Context, Result, ensure};
use log::{debug, info};
use std::{fs, os::unix::fs::PermissionsExt, path::Path};

/// File name of the staged image below the storage root
pub const UPDATE_FILE_NAME: &str = "update.bin";

pub struct FirmwareService;

impl FirmwareService {
    /// Stage an uploaded update image
    ///
    /// # Arguments
    /// * `tmp_file` - The temporary uploaded file
    /// * `target` - Where the image is staged
    ///
    /// # Returns
    /// Number of staged bytes
    pub fn stage_update(tmp_file: TempFile, target: &Path) -> Result<u64> {
        debug!("stage_update() called with {:?}", tmp_file.file_name);

        ensure!(tmp_file.size > 0, "uploaded update is empty");

        Self::stage_file(tmp_file.file.path(), target)
    }

    fn stage_file(source: &Path, target: &Path) -> Result<u64> {
        let size = fs::copy(source, target).context("failed to copy update to storage")?;
        ensure!(size > 0, "staged update is empty");

        let mut perm = fs::metadata(target)
            .context("failed to get update metadata")?
            .permissions();
        perm.set_mode(0o640);
        fs::set_permissions(target, perm).context("failed to set update permissions")?;

        info!("staged update of {size} bytes at {target:?}");
        Ok(size)
    }
}
