//! Schema migration chain for the on-disk envelope document.
//!
//! Each step is a pure function over the generic JSON tree, upgrading one
//! version to the next. Steps are applied in order until the document is at
//! [`CURRENT_SCHEMA_VERSION`]; each applied step records its label so the
//! upgrade path is visible in the load report and the envelope's
//! `migration_history`.

use serde_json::{json, Value};

/// Schema version written by the current save path.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

struct MigrationStep {
    from: i64,
    label: &'static str,
    apply: fn(Value) -> Value,
}

const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        from: 0,
        label: "0->1: wrap bare snapshot in versioned envelope",
        apply: wrap_bare_snapshot,
    },
    MigrationStep {
        from: 1,
        label: "1->2: add envelope metadata block",
        apply: add_metadata_block,
    },
];

/// Result of running a document through the migration chain.
pub(crate) struct MigrationOutcome {
    pub document: Value,
    pub from_version: i64,
    pub to_version: i64,
    pub applied_steps: Vec<String>,
    pub warnings: Vec<String>,
}

/// Read the version stamp of a document. Bare snapshots (no stamp) are
/// version 0.
pub(crate) fn document_version(doc: &Value) -> i64 {
    doc.get("schema_version").and_then(Value::as_i64).unwrap_or(0)
}

/// Upgrade a document to the current schema version.
///
/// A negative version stamp is treated as version 0 with a warning. A stamp
/// newer than [`CURRENT_SCHEMA_VERSION`] is left untouched with a warning;
/// unknown envelope fields are ignored downstream, so a newer file still
/// loads on a best-effort basis.
pub(crate) fn migrate_document(mut doc: Value) -> MigrationOutcome {
    let mut warnings = Vec::new();
    let mut version = document_version(&doc);
    let from_version = version;
    if version < 0 {
        warnings.push(format!(
            "negative schema version {version}, treating document as version 0"
        ));
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("schema_version");
        }
        version = 0;
    }
    if version > CURRENT_SCHEMA_VERSION {
        warnings.push(format!(
            "schema version {version} is newer than supported {CURRENT_SCHEMA_VERSION}, loading as-is"
        ));
        return MigrationOutcome {
            document: doc,
            from_version,
            to_version: version,
            applied_steps: Vec::new(),
            warnings,
        };
    }

    let mut applied_steps = Vec::new();
    for step in MIGRATIONS {
        if version == step.from {
            doc = (step.apply)(doc);
            applied_steps.push(step.label.to_string());
            version = document_version(&doc);
        }
    }
    MigrationOutcome {
        document: doc,
        from_version,
        to_version: version,
        applied_steps,
        warnings,
    }
}

fn wrap_bare_snapshot(doc: Value) -> Value {
    json!({
        "schema_version": 1,
        "snapshot": doc,
    })
}

fn add_metadata_block(mut doc: Value) -> Value {
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("schema_version".to_string(), json!(2));
        obj.insert(
            "metadata".to_string(),
            json!({
                "saved_at_epoch_millis": 0,
                "snapshot_sha256": null,
                "migration_history": [],
            }),
        );
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_snapshot_migrates_through_full_chain() {
        let doc = json!({"worlds": [], "players": []});
        let outcome = migrate_document(doc);
        assert_eq!(outcome.from_version, 0);
        assert_eq!(outcome.to_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(outcome.applied_steps.len(), 2);
        assert!(outcome.document.get("snapshot").is_some());
        assert!(outcome.document.get("metadata").is_some());
    }

    #[test]
    fn v1_envelope_gains_metadata() {
        let doc = json!({"schema_version": 1, "snapshot": {"worlds": []}});
        let outcome = migrate_document(doc);
        assert_eq!(outcome.from_version, 1);
        assert_eq!(outcome.to_version, 2);
        assert_eq!(outcome.applied_steps.len(), 1);
    }

    #[test]
    fn current_version_is_untouched() {
        let doc = json!({"schema_version": 2, "snapshot": {}, "metadata": {}});
        let outcome = migrate_document(doc.clone());
        assert_eq!(outcome.document, doc);
        assert!(outcome.applied_steps.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn negative_version_treated_as_bare_snapshot() {
        let doc = json!({"schema_version": -3, "worlds": []});
        let outcome = migrate_document(doc);
        assert_eq!(outcome.from_version, -3);
        assert_eq!(outcome.to_version, CURRENT_SCHEMA_VERSION);
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn newer_version_loads_as_is_with_warning() {
        let doc = json!({"schema_version": 99, "snapshot": {}});
        let outcome = migrate_document(doc.clone());
        assert_eq!(outcome.document, doc);
        assert_eq!(outcome.to_version, 99);
        assert_eq!(outcome.warnings.len(), 1);
    }
}
