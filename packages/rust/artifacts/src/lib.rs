//! Run-date-partitioned artifact tree.
//!
//! ```text
//! <data_dir>/
//!   linetag.db
//!   <run_date>/
//!     manifest.json
//!     line/chunk_<index>.json
//!     item/chunk_<index>.json
//!     merged/merged_<run_date>.json
//! ```
//!
//! Reruns for the same date overwrite the same paths. Every file is written
//! to a temp name first and renamed into place; the manifest records each
//! file's SHA-256 and size.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use linetag_shared::{LinetagError, PassKind, Record, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const MANIFEST_FILE: &str = "manifest.json";
const MERGED_DIR: &str = "merged";
const DB_FILE_NAME: &str = "linetag.db";

// ---------------------------------------------------------------------------
// Chunk output files
// ---------------------------------------------------------------------------

/// How a chunk fared in its pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// The backend answered (or nothing in the chunk was eligible).
    Completed,
    /// Every attempt failed; records are carried unchanged.
    Failed,
}

/// Contents of one `chunk_<index>.json` file.
///
/// Always holds every record of the chunk, including records the pass
/// carried without sending them to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOutput {
    pub pass: PassKind,
    pub chunk_index: usize,
    pub status: ChunkStatus,
    /// Attempts made; 0 when no record was eligible.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub records: Vec<Record>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Metadata for a single artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Path relative to the run directory.
    pub path: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// `manifest.json` of a run date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_date: String,
    pub updated_at: DateTime<Utc>,
    /// Keyed by relative path.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactMeta>,
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Paths and file operations for one run date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    data_dir: PathBuf,
    run_date: NaiveDate,
}

impl ArtifactLayout {
    pub fn new(data_dir: impl Into<PathBuf>, run_date: NaiveDate) -> Self {
        Self {
            data_dir: data_dir.into(),
            run_date,
        }
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    /// Run date as used in paths (`YYYY-MM-DD`).
    pub fn run_date_str(&self) -> String {
        self.run_date.format("%Y-%m-%d").to_string()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Run database shared by all run dates.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.data_dir.join(self.run_date_str())
    }

    pub fn pass_dir(&self, pass: PassKind) -> PathBuf {
        self.run_dir().join(pass.as_str())
    }

    pub fn chunk_path(&self, pass: PassKind, index: usize) -> PathBuf {
        self.pass_dir(pass).join(format!("chunk_{index}.json"))
    }

    pub fn merged_path(&self) -> PathBuf {
        self.run_dir()
            .join(MERGED_DIR)
            .join(format!("merged_{}.json", self.run_date_str()))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir().join(MANIFEST_FILE)
    }

    /// Empty a pass's chunk directory so a rerun never mixes old and new files.
    pub fn reset_pass_dir(&self, pass: PassKind) -> Result<PathBuf> {
        let dir = self.pass_dir(pass);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| LinetagError::io(&dir, e))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| LinetagError::io(&dir, e))?;
        debug!(path = %dir.display(), "pass directory reset");
        Ok(dir)
    }

    /// Write one chunk output file.
    pub fn write_chunk_output(&self, output: &ChunkOutput) -> Result<ArtifactMeta> {
        let path = self.chunk_path(output.pass, output.chunk_index);
        self.write_json(&path, output)
    }

    /// Read every chunk output file of a pass, sorted by chunk index.
    pub fn read_pass_outputs(&self, pass: PassKind) -> Result<Vec<ChunkOutput>> {
        let dir = self.pass_dir(pass);
        let entries = std::fs::read_dir(&dir).map_err(|e| LinetagError::io(&dir, e))?;

        let mut outputs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LinetagError::io(&dir, e))?.path();
            let is_chunk = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("chunk_") && n.ends_with(".json"));
            if !is_chunk {
                continue;
            }
            let output: ChunkOutput = read_json(&path)?;
            if output.pass != pass {
                return Err(LinetagError::parse(format!(
                    "{} belongs to pass '{}', found under '{pass}'",
                    path.display(),
                    output.pass
                )));
            }
            outputs.push(output);
        }

        outputs.sort_by_key(|o| o.chunk_index);
        debug!(%pass, chunks = outputs.len(), "read pass outputs");
        Ok(outputs)
    }

    /// Write the merged table.
    pub fn write_merged<T: Serialize>(&self, table: &T) -> Result<ArtifactMeta> {
        let meta = self.write_json(&self.merged_path(), table)?;
        info!(path = %self.merged_path().display(), sha256 = %meta.sha256, "merged table written");
        Ok(meta)
    }

    /// Read the merged table back.
    pub fn read_merged<T: DeserializeOwned>(&self) -> Result<T> {
        read_json(&self.merged_path())
    }

    /// Replace every manifest entry under `prefix` with `metas`.
    pub fn update_manifest(&self, prefix: &str, metas: &[ArtifactMeta]) -> Result<RunManifest> {
        let path = self.manifest_path();
        let mut manifest = if path.exists() {
            read_json::<RunManifest>(&path)?
        } else {
            RunManifest {
                run_date: self.run_date_str(),
                updated_at: Utc::now(),
                artifacts: BTreeMap::new(),
            }
        };

        manifest.artifacts.retain(|key, _| !key.starts_with(prefix));
        for meta in metas {
            manifest.artifacts.insert(meta.path.clone(), meta.clone());
        }
        manifest.updated_at = Utc::now();

        let json = to_pretty_json(&manifest)?;
        write_atomic(&path, json.as_bytes())?;
        debug!(entries = manifest.artifacts.len(), "manifest updated");
        Ok(manifest)
    }

    /// Read the manifest, if one exists.
    pub fn read_manifest(&self) -> Result<Option<RunManifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<ArtifactMeta> {
        let json = to_pretty_json(data)?;
        write_atomic(path, json.as_bytes())?;

        let relative = path
            .strip_prefix(self.run_dir())
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        debug!(path = %relative, size = json.len(), "wrote artifact");
        Ok(ArtifactMeta {
            path: relative,
            sha256: sha256_hex(json.as_bytes()),
            size_bytes: json.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn to_pretty_json<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string_pretty(data)
        .map_err(|e| LinetagError::validation(format!("JSON serialization failed: {e}")))
}

/// Write to a temp file next to `path`, then rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| LinetagError::validation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| LinetagError::io(parent, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let temp = parent.join(format!(".{file_name}.tmp"));

    std::fs::write(&temp, bytes).map_err(|e| LinetagError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| LinetagError::io(path, e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| LinetagError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| LinetagError::parse(format!("invalid JSON in {}: {e}", path.display())))
}
