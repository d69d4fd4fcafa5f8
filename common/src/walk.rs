use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::error::Error;
use crate::summary::Failure;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Directory,
    Symlink,
}

/// One enumerated entry. Directories carry no bytes and only need creating (or removing).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub kind: ItemKind,
    pub size: u64,
}

impl WorkItem {
    /// Short name shown as the current item in progress output.
    pub fn display_name(&self) -> String {
        self.source
            .file_name()
            .unwrap_or(self.source.as_os_str())
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Clone, Debug)]
pub enum Mode {
    Copy { destination: PathBuf },
    Delete,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct WalkSettings {
    pub recursive: bool,
    pub follow_symlinks: bool,
}

/// Enumerated work with totals fixed before any transfer starts.
#[derive(Debug, Default)]
pub struct TransferPlan {
    pub items: Vec<WorkItem>,
    pub total_bytes: u64,
    /// Entries skipped during enumeration, the subtree below them is not in `items`.
    pub warnings: Vec<Failure>,
}

impl TransferPlan {
    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Files and symlinks, the entries that move bytes or links.
    pub fn entries(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|item| item.kind != ItemKind::Directory)
    }

    pub fn directories(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|item| item.kind == ItemKind::Directory)
    }

    fn push(&mut self, item: WorkItem) {
        self.total_bytes += item.size;
        self.items.push(item);
    }
}

fn root_metadata(root: &Path, settings: &WalkSettings) -> Result<std::fs::Metadata, Error> {
    let metadata = if settings.follow_symlinks {
        std::fs::metadata(root)
    } else {
        std::fs::symlink_metadata(root)
    };
    metadata.map_err(|err| Error::from_io(root, err))
}

fn root_name(root: &Path) -> Result<std::ffi::OsString, Error> {
    if let Some(name) = root.file_name() {
        return Ok(name.to_owned());
    }
    // ".", ".." and the like have no final component until resolved
    std::fs::canonicalize(root)
        .map_err(|err| Error::from_io(root, err))?
        .file_name()
        .map(|name| name.to_owned())
        .ok_or_else(|| Error::InvalidArgument(format!("cannot copy {root:?} by name")))
}

/// Destination of each root: `DEST/<name>` when copying into a directory, `DEST` otherwise.
fn resolve_roots(sources: &[PathBuf], mode: &Mode) -> Result<Vec<Option<PathBuf>>, Error> {
    let Mode::Copy { destination } = mode else {
        return Ok(vec![None; sources.len()]);
    };
    let dest_metadata = std::fs::metadata(destination).ok();
    let dest_is_dir = dest_metadata.as_ref().is_some_and(|md| md.is_dir());
    if sources.len() > 1 && dest_metadata.is_some() && !dest_is_dir {
        return Err(Error::InvalidArgument(format!(
            "target {destination:?} is not a directory"
        )));
    }
    let into = dest_is_dir || sources.len() > 1;
    sources
        .iter()
        .map(|root| {
            if into {
                Ok(Some(destination.join(root_name(root)?)))
            } else {
                Ok(Some(destination.clone()))
            }
        })
        .collect()
}

/// Absolute form of `path`, resolving whatever prefix of it exists.
fn canonical_target(path: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::fs::canonicalize(path) {
        return Some(path);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    canonical_target(parent).map(|parent| parent.join(name))
}

/// True when `destination` is `root` itself or lies somewhere below it.
fn is_inside(root: &Path, destination: &Path) -> bool {
    match (std::fs::canonicalize(root), canonical_target(destination)) {
        (Ok(root), Some(destination)) => destination.starts_with(root),
        _ => false,
    }
}

fn walk_tree(
    plan: &mut TransferPlan,
    root: &Path,
    root_dest: Option<&Path>,
    settings: &WalkSettings,
) {
    let walker = walkdir::WalkDir::new(root)
        .follow_links(settings.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().unwrap_or(root).to_owned();
                tracing::warn!("skipping {:?}: {}", &path, &err);
                let error = match err.into_io_error() {
                    Some(io) => Error::from_io(&path, io),
                    None => Error::InvalidArgument(format!("filesystem loop at {path:?}")),
                };
                plan.warnings.push(Failure::new(path, error));
                continue;
            }
        };
        let destination = root_dest.map(|dest| match entry.path().strip_prefix(root) {
            Ok(relative) if relative.as_os_str().is_empty() => dest.to_owned(),
            Ok(relative) => dest.join(relative),
            Err(_) => dest.to_owned(),
        });
        let file_type = entry.file_type();
        let (kind, size) = if file_type.is_dir() {
            (ItemKind::Directory, 0)
        } else if file_type.is_symlink() {
            (ItemKind::Symlink, 0)
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(metadata) => (ItemKind::File, metadata.len()),
                Err(err) => {
                    let path = entry.path().to_owned();
                    tracing::warn!("skipping {:?}: {}", &path, &err);
                    let error = match err.into_io_error() {
                        Some(io) => Error::from_io(&path, io),
                        None => Error::Unsupported { path: path.clone() },
                    };
                    plan.warnings.push(Failure::new(path, error));
                    continue;
                }
            }
        } else {
            let path = entry.path().to_owned();
            tracing::warn!("skipping {:?}: unsupported file type", &path);
            plan.warnings
                .push(Failure::new(path.clone(), Error::Unsupported { path }));
            continue;
        };
        plan.push(WorkItem {
            source: entry.into_path(),
            destination,
            kind,
            size,
        });
    }
}

/// Enumerates every source root into a [`TransferPlan`].
///
/// A root that does not exist fails the whole walk before anything is enumerated.
/// Entries below a root that cannot be read become warnings and their subtree
/// is skipped. Items come out in pre-order with each directory's entries sorted
/// by name, so a directory always precedes its contents.
#[instrument]
pub fn walk(
    sources: &[PathBuf],
    mode: &Mode,
    settings: &WalkSettings,
) -> Result<TransferPlan, Error> {
    let mut roots = Vec::with_capacity(sources.len());
    for root in sources {
        roots.push(root_metadata(root, settings)?);
    }
    let destinations = resolve_roots(sources, mode)?;
    let mut plan = TransferPlan::default();
    for ((root, metadata), root_dest) in sources.iter().zip(roots).zip(destinations) {
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            if !settings.recursive {
                tracing::warn!("{:?} is a directory, skipping (use --recursive)", root);
                plan.warnings.push(Failure::new(
                    root.clone(),
                    Error::IsDirectory { path: root.clone() },
                ));
                continue;
            }
            if let Some(dest) = root_dest.as_deref().filter(|dest| is_inside(root, dest)) {
                tracing::warn!("cannot copy {:?} into itself ({:?})", root, dest);
                plan.warnings.push(Failure::new(
                    root.clone(),
                    Error::InvalidArgument(format!(
                        "cannot copy directory {root:?} into itself, {dest:?}"
                    )),
                ));
                continue;
            }
            walk_tree(&mut plan, root, root_dest.as_deref(), settings);
        } else if file_type.is_symlink() {
            plan.push(WorkItem {
                source: root.clone(),
                destination: root_dest,
                kind: ItemKind::Symlink,
                size: 0,
            });
        } else if file_type.is_file() {
            plan.push(WorkItem {
                source: root.clone(),
                destination: root_dest,
                kind: ItemKind::File,
                size: metadata.len(),
            });
        } else {
            plan.warnings.push(Failure::new(
                root.clone(),
                Error::Unsupported { path: root.clone() },
            ));
        }
    }
    tracing::debug!(
        "walked {} items, {} bytes, {} warnings",
        plan.total_items(),
        plan.total_bytes,
        plan.warnings.len()
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use anyhow::Result;
    use tracing_test::traced_test;

    fn relative(plan: &TransferPlan, root: &Path) -> Vec<String> {
        plan.items
            .iter()
            .map(|item| {
                item.source
                    .strip_prefix(root)
                    .unwrap_or(&item.source)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn totals_match_sum_of_items() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let plan = walk(
            &[tmp_dir.join("foo")],
            &Mode::Delete,
            &WalkSettings {
                recursive: true,
                ..Default::default()
            },
        )?;
        assert_eq!(
            plan.total_bytes,
            plan.items.iter().map(|item| item.size).sum::<u64>()
        );
        // 5 files, 2 symlinks, 3 directories (including the root)
        assert_eq!(plan.entries().count(), 7);
        assert_eq!(plan.directories().count(), 3);
        assert_eq!(plan.total_items(), 10);
        assert!(plan.warnings.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn order_is_deterministic_preorder() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let settings = WalkSettings {
            recursive: true,
            ..Default::default()
        };
        let first = walk(&[tmp_dir.join("foo")], &Mode::Delete, &settings)?;
        let second = walk(&[tmp_dir.join("foo")], &Mode::Delete, &settings)?;
        assert_eq!(first.items, second.items);
        assert_eq!(
            relative(&first, &tmp_dir.join("foo")),
            vec![
                "", "0.txt", "bar", "bar/1.txt", "bar/2.txt", "bar/3.txt", "baz", "baz/4.txt",
                "baz/5.txt", "baz/6.txt",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_root_fails_before_enumeration() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let result = walk(
            &[tmp_dir.join("foo"), tmp_dir.join("nope")],
            &Mode::Delete,
            &WalkSettings {
                recursive: true,
                ..Default::default()
            },
        );
        match result {
            Err(Error::NotFound { path }) => assert_eq!(path, tmp_dir.join("nope")),
            other => panic!("expected NotFound, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_without_recursive_is_a_warning() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let plan = walk(
            &[tmp_dir.join("foo"), tmp_dir.join("foo/0.txt")],
            &Mode::Delete,
            &WalkSettings::default(),
        )?;
        assert_eq!(plan.total_items(), 1);
        assert_eq!(plan.warnings.len(), 1);
        assert!(matches!(
            plan.warnings[0].error,
            Error::IsDirectory { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_into_existing_directory_appends_name() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let target = tmp_dir.join("target");
        tokio::fs::create_dir(&target).await?;
        let plan = walk(
            &[tmp_dir.join("foo")],
            &Mode::Copy {
                destination: target.clone(),
            },
            &WalkSettings {
                recursive: true,
                ..Default::default()
            },
        )?;
        assert_eq!(plan.items[0].destination, Some(target.join("foo")));
        assert!(plan
            .items
            .iter()
            .any(|item| item.destination == Some(target.join("foo/bar/2.txt"))));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_to_new_path_uses_it_as_target() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let plan = walk(
            &[tmp_dir.join("foo/0.txt")],
            &Mode::Copy {
                destination: tmp_dir.join("renamed.txt"),
            },
            &WalkSettings::default(),
        )?;
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].destination, Some(tmp_dir.join("renamed.txt")));
        assert_eq!(plan.items[0].kind, ItemKind::File);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_copied_onto_itself_is_rejected() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let settings = WalkSettings {
            recursive: true,
            ..Default::default()
        };
        // foo copied into its own parent resolves back to foo
        for destination in [tmp_dir.clone(), tmp_dir.join("foo/bar"), tmp_dir.join("foo/new/deeper")] {
            let plan = walk(
                &[tmp_dir.join("foo")],
                &Mode::Copy {
                    destination: destination.clone(),
                },
                &settings,
            )?;
            assert!(plan.is_empty(), "{destination:?}");
            assert_eq!(plan.warnings.len(), 1);
            assert!(matches!(plan.warnings[0].error, Error::InvalidArgument(_)));
            assert!(plan.warnings[0].error.to_string().contains("into itself"));
        }
        // a sibling whose name shares the prefix is fine
        let plan = walk(
            &[tmp_dir.join("foo")],
            &Mode::Copy {
                destination: tmp_dir.join("foobar"),
            },
            &settings,
        )?;
        assert_eq!(plan.total_items(), 10);
        assert!(plan.warnings.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn multiple_sources_require_directory_target() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let result = walk(
            &[tmp_dir.join("foo/0.txt"), tmp_dir.join("foo/bar/1.txt")],
            &Mode::Copy {
                destination: tmp_dir.join("foo/baz/4.txt"),
            },
            &WalkSettings::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unreadable_directory_is_skipped_with_warning() -> Result<()> {
        if unsafe { libc::geteuid() } == 0 {
            // permission bits do not restrict root
            return Ok(());
        }
        use std::os::unix::fs::PermissionsExt;
        let tmp_dir = testutils::setup_test_dir().await?;
        let locked = tmp_dir.join("foo/bar");
        tokio::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).await?;
        let plan = walk(
            &[tmp_dir.join("foo")],
            &Mode::Delete,
            &WalkSettings {
                recursive: true,
                ..Default::default()
            },
        );
        tokio::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).await?;
        let plan = plan?;
        assert_eq!(plan.warnings.len(), 1);
        assert!(matches!(
            plan.warnings[0].error,
            Error::PermissionDenied { .. }
        ));
        assert!(!plan
            .items
            .iter()
            .any(|item| item.source.starts_with(locked.join("1.txt"))));
        Ok(())
    }
}
