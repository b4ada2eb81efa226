use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dvt_api::Row;
use dvt_error::{DvResult, ErrorCode, dv_err, err};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `manifest.json` at the root of a data archive directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    pub tool_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_environment: Option<String>,
    pub exported_at: DateTime<Utc>,
    /// entity -> row count, in `<entity>.jsonl` files beside the manifest.
    pub entities: BTreeMap<String, usize>,
    /// relationship -> pair count, in `<relationship>.links.jsonl` files.
    #[serde(default)]
    pub relationships: BTreeMap<String, usize>,
}

/// One m2m pair in a `*.links.jsonl` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipPair {
    pub first: Uuid,
    pub second: Uuid,
}

/// A directory archive: `manifest.json` plus one JSONL rows file per entity.
#[derive(Debug, Clone)]
pub struct DataArchive {
    root: PathBuf,
    manifest: ArchiveManifest,
}

impl DataArchive {
    pub fn open(root: &Path) -> DvResult<Self> {
        let manifest_path = root.join("manifest.json");
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            dv_err!(
                ErrorCode::ArchiveError,
                "cannot read archive manifest {}: {e}",
                manifest_path.display()
            )
        })?;
        let manifest: ArchiveManifest = serde_json::from_str(&raw).map_err(|e| {
            dv_err!(
                ErrorCode::ArchiveError,
                "malformed archive manifest {}: {e}",
                manifest_path.display()
            )
        })?;
        Ok(DataArchive { root: root.to_path_buf(), manifest })
    }

    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn row_count(&self, entity: &str) -> usize {
        self.manifest.entities.get(entity).copied().unwrap_or(0)
    }

    /// Streams an entity's rows. Malformed lines fail with their line number
    /// so the bad record is addressable.
    pub fn read_rows(&self, entity: &str) -> DvResult<Vec<Row>> {
        let path = self.root.join(format!("{entity}.jsonl"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| {
            dv_err!(ErrorCode::ArchiveError, "cannot open {}: {e}", path.display())
        })?;
        let mut rows = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                dv_err!(ErrorCode::ArchiveError, "i/o error in {}: {e}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(&line).map_err(|e| {
                dv_err!(
                    ErrorCode::ArchiveError,
                    "malformed row at {}:{}: {e}",
                    path.display(),
                    index + 1
                )
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Pairs of a many-to-many relationship; an absent file is an empty set.
    pub fn read_links(&self, relationship: &str) -> DvResult<Vec<RelationshipPair>> {
        let path = self.root.join(format!("{relationship}.links.jsonl"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| {
            dv_err!(ErrorCode::ArchiveError, "cannot open {}: {e}", path.display())
        })?;
        let mut pairs = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                dv_err!(ErrorCode::ArchiveError, "i/o error in {}: {e}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let pair: RelationshipPair = serde_json::from_str(&line).map_err(|e| {
                dv_err!(
                    ErrorCode::ArchiveError,
                    "malformed link at {}:{}: {e}",
                    path.display(),
                    index + 1
                )
            })?;
            pairs.push(pair);
        }
        Ok(pairs)
    }
}

/// Builds an archive directory; used by the export path and by tests.
pub struct ArchiveWriter {
    root: PathBuf,
    manifest: ArchiveManifest,
}

impl ArchiveWriter {
    pub fn create(root: &Path, source_environment: Option<String>) -> DvResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(ArchiveWriter {
            root: root.to_path_buf(),
            manifest: ArchiveManifest {
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                source_environment,
                exported_at: Utc::now(),
                entities: BTreeMap::new(),
                relationships: BTreeMap::new(),
            },
        })
    }

    /// Appends rows to `<entity>.jsonl`, creating it on first call.
    pub fn write_rows(&mut self, entity: &str, rows: &[Row]) -> DvResult<usize> {
        let path = self.root.join(format!("{entity}.jsonl"));
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for row in rows {
            let line = serde_json::to_string(row)?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        *self.manifest.entities.entry(entity.to_string()).or_insert(0) += rows.len();
        Ok(rows.len())
    }

    pub fn write_links(&mut self, relationship: &str, pairs: &[RelationshipPair]) -> DvResult<usize> {
        let path = self.root.join(format!("{relationship}.links.jsonl"));
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for pair in pairs {
            let line = serde_json::to_string(pair)?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        *self.manifest.relationships.entry(relationship.to_string()).or_insert(0) += pairs.len();
        Ok(pairs.len())
    }

    /// Writes the manifest; must be the last step.
    pub fn finish(self) -> DvResult<DataArchive> {
        if self.manifest.entities.is_empty() && self.manifest.relationships.is_empty() {
            return err!(ErrorCode::ArchiveError, "archive holds no rows");
        }
        let manifest_path = self.root.join("manifest.json");
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&self.manifest)?)?;
        Ok(DataArchive { root: self.root, manifest: self.manifest })
    }
}
