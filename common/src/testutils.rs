use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::overwrite::Prompt;

pub async fn create_temp_dir() -> anyhow::Result<PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("cprm_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub async fn setup_test_dir() -> anyhow::Result<PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt")).await?;
    Ok(tmp_dir)
}

/// Writes `size` bytes of a position-dependent pattern so misplaced chunks are detectable.
pub async fn write_patterned(path: &Path, size: usize) -> anyhow::Result<()> {
    let data: Vec<u8> = (0..size).map(|i| ((i * 31 + i / 251) % 256) as u8).collect();
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// Asserts both trees hold the same entries, file contents and symlink targets.
pub fn check_dirs_identical(left: &Path, right: &Path) {
    let collect = |root: &Path| -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| {
                entry
                    .expect("walk test tree")
                    .path()
                    .strip_prefix(root)
                    .expect("entry below root")
                    .to_owned()
            })
            .collect();
        paths.sort();
        paths
    };
    let left_paths = collect(left);
    assert_eq!(left_paths, collect(right));
    for relative in left_paths {
        let (lpath, rpath) = (left.join(&relative), right.join(&relative));
        let lmeta = std::fs::symlink_metadata(&lpath).expect("left metadata");
        let rmeta = std::fs::symlink_metadata(&rpath).expect("right metadata");
        assert_eq!(lmeta.file_type(), rmeta.file_type(), "{relative:?}");
        if lmeta.file_type().is_symlink() {
            assert_eq!(
                std::fs::read_link(&lpath).expect("left link"),
                std::fs::read_link(&rpath).expect("right link"),
                "{relative:?}"
            );
        } else if lmeta.is_file() {
            assert_eq!(
                std::fs::read(&lpath).expect("left contents"),
                std::fs::read(&rpath).expect("right contents"),
                "{relative:?}"
            );
        }
    }
}

/// Answers prompts from a fixed script; end of script reads as end of input.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: parking_lot::Mutex<VecDeque<String>>,
    asked: AtomicUsize,
    notices: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: parking_lot::Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }

    pub fn notices(&self) -> usize {
        self.notices.load(Ordering::SeqCst)
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&self, _question: &str) -> std::io::Result<Option<String>> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answers.lock().pop_front())
    }

    fn notify(&self, _message: &str) {
        self.notices.fetch_add(1, Ordering::SeqCst);
    }
}
