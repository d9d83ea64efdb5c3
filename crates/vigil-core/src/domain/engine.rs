//! Engine version metadata recorded on a task at scan time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of the scanning engine and its databases, as reported by
/// `<engine> version --format json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "VulnerabilityDB", default, skip_serializing_if = "Option::is_none")]
    pub vulnerability_db: Option<DatabaseInfo>,
    #[serde(rename = "JavaDB", default, skip_serializing_if = "Option::is_none")]
    pub java_db: Option<DatabaseInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "UpdatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "NextUpdate", default, skip_serializing_if = "Option::is_none")]
    pub next_update: Option<DateTime<Utc>>,
    #[serde(rename = "DownloadedAt", default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl EngineVersion {
    /// Human-readable lines for the task transcript.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![format!("Engine version: {}", self.version)];
        let db_line = |label: &str, db: &DatabaseInfo| match db.updated_at {
            Some(at) => format!("{label}: v{} (updated: {})", db.version, at.to_rfc3339()),
            None => format!("{label}: v{}", db.version),
        };
        if let Some(db) = &self.vulnerability_db {
            lines.push(db_line("Vulnerability DB", db));
        }
        if let Some(db) = &self.java_db {
            lines.push(db_line("Java DB", db));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_version_output() {
        let raw = r#"{
            "Version": "0.50.1",
            "VulnerabilityDB": {
                "Version": 2,
                "NextUpdate": "2024-04-10T06:11:39Z",
                "UpdatedAt": "2024-04-10T00:11:39Z",
                "DownloadedAt": "2024-04-10T01:00:00Z"
            }
        }"#;
        let version: EngineVersion = serde_json::from_str(raw).unwrap();
        assert_eq!(version.version, "0.50.1");
        assert!(version.java_db.is_none());

        let lines = version.describe();
        assert_eq!(lines[0], "Engine version: 0.50.1");
        assert!(lines[1].starts_with("Vulnerability DB: v2 (updated: 2024-04-10T00:11:39"));
    }
}
