//! Metadata document patcher.
//!
//! A Thanos block `meta.json` carries its external labels under
//! `thanos.labels`.  The patcher adds one label there when it is missing.
//! It never overwrites: a key that is already present, whatever its value,
//! means the document is left alone.
//!
//! Output is deterministic: keys are emitted in sorted order and nested
//! levels are indented with a single tab, so the same input always yields
//! the same bytes and backups stay diffable.

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

use crate::errors::PatchError;

/// Top-level key holding Thanos-specific metadata.
pub const THANOS_KEY: &str = "thanos";

/// Key under [`THANOS_KEY`] holding the external labels.
pub const LABELS_KEY: &str = "labels";

/// Result of a successful patch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The label was inserted; carries the re-serialized document.
    Patched(Vec<u8>),
    /// The label key was already present.  Nothing to write.
    Unchanged,
}

/// Inserts a fixed label key into metadata documents.
#[derive(Debug, Clone)]
pub struct Patcher {
    label_key: String,
}

impl Patcher {
    pub fn new(label_key: impl Into<String>) -> Self {
        Self {
            label_key: label_key.into(),
        }
    }

    pub fn label_key(&self) -> &str {
        &self.label_key
    }

    /// Add `label_key = value` to `thanos.labels` in `data`.
    pub fn patch(&self, data: &[u8], value: &str) -> Result<PatchOutcome, PatchError> {
        let mut document: Map<String, Value> =
            serde_json::from_slice(data).map_err(PatchError::Unparseable)?;

        let labels = labels_mut(&mut document)?;
        if labels.contains_key(&self.label_key) {
            return Ok(PatchOutcome::Unchanged);
        }
        labels.insert(self.label_key.clone(), Value::String(value.to_string()));

        to_canonical_json(&document).map(PatchOutcome::Patched)
    }
}

/// Walk `thanos` -> `labels`, reporting which level is missing.
fn labels_mut(document: &mut Map<String, Value>) -> Result<&mut Map<String, Value>, PatchError> {
    let thanos = document
        .get_mut(THANOS_KEY)
        .and_then(Value::as_object_mut)
        .ok_or(PatchError::MissingStructure { path: "thanos" })?;
    thanos
        .get_mut(LABELS_KEY)
        .and_then(Value::as_object_mut)
        .ok_or(PatchError::MissingStructure {
            path: "thanos.labels",
        })
}

/// Serialize with sorted keys and tab indentation.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, PatchError> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser).map_err(PatchError::Serialize)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const META: &str = r#"{
        "ulid": "01DXB9D0MTR7Y2E1KDXCJ6HK5E",
        "minTime": 1574640000000,
        "maxTime": 1574647200000,
        "stats": {"numSamples": 1200, "numSeries": 10},
        "compaction": {"level": 1, "sources": ["01DXB9D0MTR7Y2E1KDXCJ6HK5E"]},
        "version": 1,
        "thanos": {
            "labels": {"replica": "a", "cluster": "east-1"},
            "downsample": {"resolution": 0},
            "source": "sidecar"
        }
    }"#;

    fn patcher() -> Patcher {
        Patcher::new("promenv")
    }

    fn parse(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_inserts_missing_label() {
        let out = patcher().patch(META.as_bytes(), "east").unwrap();
        let PatchOutcome::Patched(bytes) = out else {
            panic!("expected a patched document");
        };
        let doc = parse(&bytes);
        assert_eq!(doc["thanos"]["labels"]["promenv"], "east");
        // Existing labels and unrelated fields survive.
        assert_eq!(doc["thanos"]["labels"]["replica"], "a");
        assert_eq!(doc["thanos"]["source"], "sidecar");
        assert_eq!(doc["stats"]["numSamples"], 1200);
        assert_eq!(doc["compaction"]["sources"][0], "01DXB9D0MTR7Y2E1KDXCJ6HK5E");
    }

    #[test]
    fn test_existing_label_is_unchanged_regardless_of_value() {
        for existing in [r#""east""#, r#""west""#, r#""""#, "null", "42"] {
            let doc = format!(r#"{{"thanos": {{"labels": {{"promenv": {existing}}}}}}}"#);
            assert_eq!(
                patcher().patch(doc.as_bytes(), "east").unwrap(),
                PatchOutcome::Unchanged,
                "existing value {existing} must not be overwritten"
            );
        }
    }

    #[test]
    fn test_patch_is_idempotent() {
        let PatchOutcome::Patched(once) = patcher().patch(META.as_bytes(), "east").unwrap() else {
            panic!("expected a patched document");
        };
        assert_eq!(patcher().patch(&once, "east").unwrap(), PatchOutcome::Unchanged);
        assert_eq!(patcher().patch(&once, "west").unwrap(), PatchOutcome::Unchanged);
    }

    #[test]
    fn test_missing_thanos() {
        let err = patcher().patch(br#"{"version": 1}"#, "east").unwrap_err();
        assert!(matches!(err, PatchError::MissingStructure { path: "thanos" }));
    }

    #[test]
    fn test_thanos_not_a_map() {
        let err = patcher().patch(br#"{"thanos": "sidecar"}"#, "east").unwrap_err();
        assert!(matches!(err, PatchError::MissingStructure { path: "thanos" }));
    }

    #[test]
    fn test_missing_labels() {
        let err = patcher()
            .patch(br#"{"thanos": {"source": "compactor"}}"#, "east")
            .unwrap_err();
        assert!(matches!(
            err,
            PatchError::MissingStructure {
                path: "thanos.labels"
            }
        ));
    }

    #[test]
    fn test_labels_null_is_missing() {
        let err = patcher()
            .patch(br#"{"thanos": {"labels": null}}"#, "east")
            .unwrap_err();
        assert!(matches!(
            err,
            PatchError::MissingStructure {
                path: "thanos.labels"
            }
        ));
    }

    #[test]
    fn test_unparseable() {
        let inputs: [&[u8]; 4] = [b"not json", b"", b"[1, 2]", b"{\"thanos\":"];
        for bad in inputs {
            let err = patcher().patch(bad, "east").unwrap_err();
            assert!(matches!(err, PatchError::Unparseable(_)));
        }
    }

    #[test]
    fn test_output_is_sorted_and_tab_indented() {
        let PatchOutcome::Patched(bytes) = patcher()
            .patch(br#"{"zeta": 1, "thanos": {"labels": {"b": "2", "a": "1"}}, "alpha": 2}"#, "east")
            .unwrap()
        else {
            panic!("expected a patched document");
        };
        let expected = "{\n\t\"alpha\": 2,\n\t\"thanos\": {\n\t\t\"labels\": {\n\t\t\t\"a\": \"1\",\n\t\t\t\"b\": \"2\",\n\t\t\t\"promenv\": \"east\"\n\t\t}\n\t},\n\t\"zeta\": 1\n}";
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn test_canonical_serialization_is_deterministic() {
        let doc: Map<String, Value> = serde_json::from_str(META).unwrap();
        let first = to_canonical_json(&doc).unwrap();
        let second = to_canonical_json(&doc).unwrap();
        assert_eq!(first, second);

        let reparsed: Map<String, Value> = serde_json::from_slice(&first).unwrap();
        assert_eq!(to_canonical_json(&reparsed).unwrap(), first);
    }

    #[test]
    fn test_same_input_same_patched_bytes() {
        let a = patcher().patch(META.as_bytes(), "east").unwrap();
        let b = patcher().patch(META.as_bytes(), "east").unwrap();
        assert_eq!(a, b);
    }
}
