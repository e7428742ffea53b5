use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use worldhost_state::WorldSnapshot;

use crate::migrate::{migrate_document, CURRENT_SCHEMA_VERSION};

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schema_version: i64,
    snapshot: Value,
    #[serde(default)]
    metadata: Option<EnvelopeMetadata>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EnvelopeMetadata {
    #[serde(default)]
    saved_at_epoch_millis: u64,
    #[serde(default)]
    snapshot_sha256: Option<String>,
    #[serde(default)]
    migration_history: Vec<String>,
}

/// What happened to a state file on its way through the load path.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub path: PathBuf,
    pub from_version: i64,
    pub to_version: i64,
    pub migrated: bool,
    pub applied_steps: Vec<String>,
    /// Prior history from the envelope plus the steps applied on this load.
    pub migration_history: Vec<String>,
    pub warnings: Vec<String>,
}

/// A successfully loaded snapshot together with its migration report.
#[derive(Debug)]
pub struct LoadResult {
    pub snapshot: WorldSnapshot,
    pub report: MigrationReport,
}

/// Single-file JSON state store with schema versioning, checksums, and
/// atomic replace on save.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot at the current schema version. The checksum covers
    /// the canonical (sorted-key) JSON form of the snapshot, so it is stable
    /// across field ordering. The file is replaced atomically via a sibling
    /// temp file.
    pub fn save(
        &self,
        snapshot: &WorldSnapshot,
        migration_history: &[String],
    ) -> Result<(), StoreError> {
        let snapshot_value = serde_json::to_value(snapshot)?;
        let checksum = canonical_sha256(&snapshot_value)?;
        let envelope = Envelope {
            schema_version: CURRENT_SCHEMA_VERSION,
            snapshot: snapshot_value,
            metadata: Some(EnvelopeMetadata {
                saved_at_epoch_millis: epoch_millis(),
                snapshot_sha256: Some(checksum),
                migration_history: migration_history.to_vec(),
            }),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, &bytes)?;
        if std::fs::rename(&tmp, &self.path).is_err() {
            // Some platforms refuse to rename over an existing file.
            let _ = std::fs::remove_file(&self.path);
            std::fs::rename(&tmp, &self.path)?;
        }
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "state saved");
        Ok(())
    }

    /// Load the snapshot, upgrading older files in memory. Returns `None`
    /// when the file does not exist.
    pub fn load(&self) -> Result<Option<WorldSnapshot>, StoreError> {
        Ok(self.load_with_report()?.map(|r| r.snapshot))
    }

    /// Load the snapshot together with a report of any migrations and
    /// warnings. A checksum mismatch is reported as a warning, never an
    /// error: the snapshot still loads.
    pub fn load_with_report(&self) -> Result<Option<LoadResult>, StoreError> {
        let Some((envelope, mut report)) = self.read_envelope()? else {
            return Ok(None);
        };

        if report.from_version >= CURRENT_SCHEMA_VERSION {
            if let Some(metadata) = &envelope.metadata {
                if let Some(expected) = &metadata.snapshot_sha256 {
                    let actual = canonical_sha256(&envelope.snapshot)?;
                    if *expected != actual {
                        report.warnings.push(format!(
                            "checksum mismatch: stored {expected}, computed {actual}"
                        ));
                    }
                }
            }
        }
        for warning in &report.warnings {
            tracing::warn!(path = %self.path.display(), "{warning}");
        }

        let snapshot: WorldSnapshot = serde_json::from_value(envelope.snapshot)?;
        if report.migrated {
            tracing::info!(
                path = %self.path.display(),
                from = report.from_version,
                to = report.to_version,
                steps = report.applied_steps.len(),
                "state file migrated on load"
            );
        }
        Ok(Some(LoadResult { snapshot, report }))
    }

    /// Report on a state file without restoring anything from it.
    pub fn inspect(&self) -> Result<Option<MigrationReport>, StoreError> {
        Ok(self.load_with_report()?.map(|r| r.report))
    }

    /// Upgrade the file on disk to the current schema version. A no-op for
    /// files already current. Returns the report, or `None` if the file does
    /// not exist.
    pub fn migrate_in_place(&self) -> Result<Option<MigrationReport>, StoreError> {
        let Some(result) = self.load_with_report()? else {
            return Ok(None);
        };
        if result.report.migrated {
            self.save(&result.snapshot, &result.report.migration_history)?;
            tracing::info!(
                path = %self.path.display(),
                to = result.report.to_version,
                "state file rewritten at current schema"
            );
        }
        Ok(Some(result.report))
    }

    fn read_envelope(&self) -> Result<Option<(Envelope, MigrationReport)>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let doc: Value = serde_json::from_slice(&bytes)?;
        let outcome = migrate_document(doc);
        let envelope: Envelope = serde_json::from_value(outcome.document)?;
        let mut history = envelope
            .metadata
            .as_ref()
            .map(|m| m.migration_history.clone())
            .unwrap_or_default();
        history.extend(outcome.applied_steps.iter().cloned());
        let report = MigrationReport {
            path: self.path.clone(),
            from_version: outcome.from_version,
            to_version: outcome.to_version,
            migrated: !outcome.applied_steps.is_empty(),
            applied_steps: outcome.applied_steps,
            migration_history: history,
            warnings: outcome.warnings,
        };
        Ok(Some((envelope, report)))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Hex sha256 over the canonical JSON bytes of a snapshot value. The generic
/// JSON tree keeps object keys sorted, so the same state always hashes the
/// same regardless of how the document was produced.
fn canonical_sha256(snapshot: &Value) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(snapshot)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worldhost_state::WorldState;

    fn sample_snapshot() -> WorldSnapshot {
        let state = WorldState::new("world");
        state.create_world("Nether", 42).unwrap();
        state
            .join_player("Alex", "world", worldhost_common::Position::new(10.0, 70.0, 5.0))
            .unwrap();
        state.set_inventory_item("Alex", 0, "iron_ingot");
        state
            .spawn_entity("sheep", "world", worldhost_common::Position::new(1.0, 64.0, 1.0))
            .unwrap();
        state.snapshot()
    }

    #[test]
    fn save_load_round_trip_is_deep_equal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state.json"));
        let snapshot = sample_snapshot();
        store.save(&snapshot, &[]).unwrap();

        let result = store.load_with_report().unwrap().unwrap();
        assert_eq!(result.snapshot, snapshot);
        assert!(!result.report.migrated);
        assert!(result.report.warnings.is_empty());
        assert_eq!(result.report.from_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("absent.json"));
        assert!(store.load().unwrap().is_none());
        assert!(store.inspect().unwrap().is_none());
        assert!(store.migrate_in_place().unwrap().is_none());
    }

    #[test]
    fn v0_bare_snapshot_migrates_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let snapshot = sample_snapshot();
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let store = StateStore::new(&path);
        let result = store.load_with_report().unwrap().unwrap();
        assert!(result.report.migrated);
        assert_eq!(result.report.from_version, 0);
        assert_eq!(result.report.to_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(result.report.applied_steps.len(), 2);
        assert_eq!(result.snapshot, snapshot);
    }

    #[test]
    fn v1_envelope_migrates_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let snapshot = sample_snapshot();
        let doc = json!({
            "schema_version": 1,
            "snapshot": serde_json::to_value(&snapshot).unwrap(),
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let result = StateStore::new(&path).load_with_report().unwrap().unwrap();
        assert!(result.report.migrated);
        assert_eq!(result.report.applied_steps.len(), 1);
        assert_eq!(result.snapshot, snapshot);
    }

    #[test]
    fn tampered_checksum_warns_but_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let store = StateStore::new(&path);
        let snapshot = sample_snapshot();
        store.save(&snapshot, &[]).unwrap();

        let mut doc: Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        doc["metadata"]["snapshot_sha256"] = json!("deadbeef");
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let result = store.load_with_report().unwrap().unwrap();
        assert_eq!(result.snapshot, snapshot);
        assert!(result
            .report
            .warnings
            .iter()
            .any(|w| w.contains("checksum mismatch")));
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let store = StateStore::new(&path);
        store.save(&sample_snapshot(), &[]).unwrap();
        store.save(&sample_snapshot(), &[]).unwrap(); // replace existing
        assert!(path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn migrate_in_place_rewrites_at_current_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let snapshot = sample_snapshot();
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let store = StateStore::new(&path);
        let report = store.migrate_in_place().unwrap().unwrap();
        assert!(report.migrated);
        assert_eq!(report.migration_history.len(), 2);

        let doc: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["schema_version"], json!(CURRENT_SCHEMA_VERSION));
        assert_eq!(doc["metadata"]["migration_history"].as_array().unwrap().len(), 2);

        // Second pass is a no-op.
        let report = store.migrate_in_place().unwrap().unwrap();
        assert!(!report.migrated);
        // History persisted through the rewrite has a valid checksum now.
        let result = store.load_with_report().unwrap().unwrap();
        assert!(result.report.warnings.is_empty());
        assert_eq!(result.snapshot, snapshot);
    }

    #[test]
    fn negative_schema_version_loads_as_v0() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let snapshot = sample_snapshot();
        let mut doc = serde_json::to_value(&snapshot).unwrap();
        doc["schema_version"] = json!(-1);
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let result = StateStore::new(&path).load_with_report().unwrap().unwrap();
        assert_eq!(result.report.from_version, -1);
        assert_eq!(result.report.to_version, CURRENT_SCHEMA_VERSION);
        assert!(!result.report.warnings.is_empty());
        assert_eq!(result.snapshot, snapshot);
    }
}
