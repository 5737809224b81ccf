// src/models/school.rs

//! Target schools, the unit of pagination.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A school to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSchool {
    /// Stable school identifier used by the listing endpoint
    pub id: String,

    /// Display name, stored alongside every record and history row
    pub name: String,
}

impl TargetSchool {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Load targets from a JSON array of `{ "id", "name" }` objects.
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Drop every target whose name exactly matches a blocklist entry.
pub fn apply_blocklist(targets: Vec<TargetSchool>, blocklist: &[String]) -> Vec<TargetSchool> {
    targets
        .into_iter()
        .filter(|t| {
            let blocked = blocklist.iter().any(|b| b == &t.name);
            if blocked {
                log::info!("Excluding blocklisted school {} ({})", t.name, t.id);
            }
            !blocked
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocklist_exact_match_only() {
        let targets = vec![
            TargetSchool::new("1", "EEEF CENTRAL"),
            TargetSchool::new("2", "EEEF CENTRAL ANEXO"),
            TargetSchool::new("3", "eeef central"),
        ];
        let kept = apply_blocklist(targets, &["EEEF CENTRAL".to_string()]);

        let ids: Vec<_> = kept.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn test_load_all_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        fs::write(&path, r#"[{"id": "10", "name": "Escola A"}]"#).unwrap();

        let targets = TargetSchool::load_all(&path).unwrap();
        assert_eq!(targets, vec![TargetSchool::new("10", "Escola A")]);
    }
}
