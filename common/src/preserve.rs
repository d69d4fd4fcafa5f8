use anyhow::{Context, Result};
use std::os::unix::prelude::PermissionsExt;
use tracing::{event, Level};

/// Which source attributes are carried over to the copy.
#[derive(Copy, Clone, Debug)]
pub struct Settings {
    pub mode_mask: u32,
    pub time: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode_mask: 0o0777,
            time: true,
        }
    }
}

impl Settings {
    pub fn none() -> Self {
        Self {
            mode_mask: 0,
            time: false,
        }
    }
}

fn set_times(metadata: &std::fs::Metadata, path: &std::path::Path) -> Result<()> {
    event!(Level::DEBUG, "setting timestamps");
    let atime = filetime::FileTime::from_last_access_time(metadata);
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    filetime::set_symlink_file_times(path, atime, mtime)
        .with_context(|| format!("failed setting timestamps for {:?}", &path))
}

/// Applies mode and times of `metadata` to the regular file or directory at `path`.
pub fn set_permissions(
    settings: &Settings,
    metadata: &std::fs::Metadata,
    path: &std::path::Path,
) -> Result<()> {
    if settings.mode_mask != 0 {
        let permissions =
            std::fs::Permissions::from_mode(metadata.permissions().mode() & settings.mode_mask);
        std::fs::set_permissions(path, permissions.clone())
            .with_context(|| format!("cannot set {:?} permissions to {:?}", &path, &permissions))?;
    }
    if settings.time {
        set_times(metadata, path)?;
    }
    Ok(())
}

/// Symlinks only get their own timestamps, never the target's mode.
pub fn set_symlink_permissions(
    settings: &Settings,
    metadata: &std::fs::Metadata,
    path: &std::path::Path,
) -> Result<()> {
    if settings.time {
        set_times(metadata, path)?;
    }
    Ok(())
}

/// Metadata is best effort: a failure is logged and the copy still counts.
pub fn apply_or_warn(settings: &Settings, metadata: &std::fs::Metadata, path: &std::path::Path) {
    let result = if metadata.file_type().is_symlink() {
        set_symlink_permissions(settings, metadata, path)
    } else {
        set_permissions(settings, metadata, path)
    };
    if let Err(error) = result {
        tracing::warn!("{:#}", error);
    }
}
