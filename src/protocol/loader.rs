//! Protocol files -> decoded documents.
//!
//! `.json` files are read with `serde_json`; everything else is treated as YAML.
//! Both decode into the same `serde_json::Value` tree consumed by validation.

use serde_json::Value;
use std::path::Path;

use crate::error::{AppResult, ExperimentError};

/// Read and decode a protocol document without validating it.
pub fn load_document(path: &Path) -> AppResult<Value> {
    let section = path.display().to_string();
    let text = std::fs::read_to_string(path)
        .map_err(|e| ExperimentError::validation(&section, format!("cannot read file: {}", e)))?;

    if is_json(path) {
        serde_json::from_str(&text)
            .map_err(|e| ExperimentError::validation(&section, format!("invalid JSON: {}", e)))
    } else {
        serde_yaml::from_str(&text)
            .map_err(|e| ExperimentError::validation(&section, format!("invalid YAML: {}", e)))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("p.yaml");
        std::fs::write(&yaml, "version: 1\nblock:\n  conditions:\n    - id: A\n").unwrap();
        let doc = load_document(&yaml).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["block"]["conditions"][0]["id"], "A");

        let json = dir.path().join("p.json");
        std::fs::write(&json, r#"{"version": 1}"#).unwrap();
        assert_eq!(load_document(&json).unwrap()["version"], 1);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "version: [1\n").unwrap();
        let err = load_document(&path).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("broken.yaml"));
    }
}
