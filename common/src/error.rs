use std::path::{Path, PathBuf};

/// Classified failure of a single walk, transfer or benchmark step.
///
/// Per-item variants are collected into a [`crate::Report`] and never stop the
/// operation on their own. [`Error::VolumeUnusable`] is the one fatal
/// classification: once seen, no further work items are dispatched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot access {path:?}: no such file or directory")]
    NotFound { path: PathBuf },

    #[error("cannot access {path:?}: permission denied")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient space writing {path:?}: {source}")]
    InsufficientSpace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("destination volume unusable at {path:?}: {source}")]
    VolumeUnusable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} is a directory (not copied or removed without --recursive)")]
    IsDirectory { path: PathBuf },

    #[error("{path:?}: unsupported file type")]
    Unsupported { path: PathBuf },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("operation cancelled by user")]
    UserAborted,

    #[error("benchmark failed: {source:#}")]
    BenchmarkFailure {
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// Classifies an I/O error observed while operating on `path`.
    pub fn from_io(path: &Path, source: std::io::Error) -> Self {
        let path = path.to_owned();
        match source.raw_os_error() {
            Some(libc::ENOSPC) | Some(libc::EDQUOT) => {
                return Self::InsufficientSpace { path, source };
            }
            Some(libc::EROFS)
            | Some(libc::ENODEV)
            | Some(libc::ENXIO)
            | Some(libc::ESTALE)
            | Some(libc::ENOTCONN) => return Self::VolumeUnusable { path, source },
            _ => {}
        }
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
            _ => Self::Io { path, source },
        }
    }

    pub fn benchmark(source: impl Into<anyhow::Error>) -> Self {
        Self::BenchmarkFailure {
            source: source.into(),
        }
    }

    /// Fatal errors stop dispatch of all remaining work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VolumeUnusable { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::NotFound { path }
            | Self::PermissionDenied { path, .. }
            | Self::InsufficientSpace { path, .. }
            | Self::VolumeUnusable { path, .. }
            | Self::Io { path, .. }
            | Self::IsDirectory { path }
            | Self::Unsupported { path } => Some(path),
            Self::InvalidArgument(_) | Self::UserAborted | Self::BenchmarkFailure { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_error(code: i32) -> std::io::Error {
        std::io::Error::from_raw_os_error(code)
    }

    #[test]
    fn classifies_resource_errors() {
        let path = Path::new("/mnt/backup/file");
        assert!(matches!(
            Error::from_io(path, os_error(libc::ENOSPC)),
            Error::InsufficientSpace { .. }
        ));
        assert!(matches!(
            Error::from_io(path, os_error(libc::EDQUOT)),
            Error::InsufficientSpace { .. }
        ));
        let fatal = Error::from_io(path, os_error(libc::EROFS));
        assert!(matches!(fatal, Error::VolumeUnusable { .. }));
        assert!(fatal.is_fatal());
        assert_eq!(fatal.path(), Some(path));
    }

    #[test]
    fn classifies_access_errors() {
        let path = Path::new("missing");
        assert!(matches!(
            Error::from_io(path, os_error(libc::ENOENT)),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            Error::from_io(path, os_error(libc::EACCES)),
            Error::PermissionDenied { .. }
        ));
        let other = Error::from_io(path, os_error(libc::EIO));
        assert!(matches!(other, Error::Io { .. }));
        assert!(!other.is_fatal());
        assert!(!Error::UserAborted.is_fatal());
    }
}
