use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Worker count when no benchmark has been recorded.
pub const DEFAULT_WORKERS: usize = 4;

/// Persisted autotuning result. Keys this tool does not know are kept as they were.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TuningRecord {
    #[serde(
        rename = "optimal_parallel_workers",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub optimal_worker_count: Option<usize>,
    /// RFC 3339 timestamp of the run that produced the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_date: Option<String>,
    /// Worker count (as a string key) to best elapsed seconds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub benchmark_results: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct TuningStore {
    path: PathBuf,
}

impl TuningStore {
    /// `$HOME/.config/cprm/config.json`.
    pub fn default_location() -> Result<Self> {
        let dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self::at(
            dirs.home_dir()
                .join(".config")
                .join("cprm")
                .join("config.json"),
        ))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent and unparsable files both read as "no record".
    pub fn load(&self) -> Result<Option<TuningRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {:?}", &self.path))
            }
        };
        match serde_json::from_str::<TuningRecord>(&text) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!("ignoring unreadable tuning record {:?}: {}", &self.path, err);
                Ok(None)
            }
        }
    }

    /// Replaces the record through a temporary file so readers never see half of it.
    pub fn save(&self, record: &TuningRecord) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating config directory {:?}", parent))?;
        let text = serde_json::to_string_pretty(record).context("failed encoding tuning record")?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed creating temporary file in {:?}", parent))?;
        std::io::Write::write_all(&mut tmp, text.as_bytes())
            .with_context(|| format!("failed writing {:?}", tmp.path()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed replacing {:?}", &self.path))?;
        Ok(())
    }

    /// Recorded worker count, or [`DEFAULT_WORKERS`] when nothing usable is stored.
    pub fn optimal_workers(&self) -> usize {
        match self.load() {
            Ok(Some(record)) => record
                .optimal_worker_count
                .filter(|workers| *workers >= 1)
                .unwrap_or(DEFAULT_WORKERS),
            Ok(None) => DEFAULT_WORKERS,
            Err(err) => {
                tracing::warn!("{:#}, using {} workers", err, DEFAULT_WORKERS);
                DEFAULT_WORKERS
            }
        }
    }
}
