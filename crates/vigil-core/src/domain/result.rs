//! Scan result payload and the summary derived from it.

use serde::{Deserialize, Serialize};

/// Result of a successful scan.
///
/// `data` is the raw engine output. It is stored as its own artifact next to
/// the task record, so it is not part of the serialized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub format: String,
    #[serde(skip)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<VulnerabilitySummary>,
}

impl ScanResult {
    /// Build a result from raw output. The summary is only derived for JSON
    /// output, and a payload that does not parse just has no summary.
    pub fn from_output(format: &str, data: String) -> Self {
        let summary = if format == "json" {
            match VulnerabilitySummary::from_json(&data) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::warn!(error = %e, "could not derive vulnerability summary");
                    None
                }
            }
        } else {
            None
        };
        Self {
            format: format.to_string(),
            data,
            summary,
        }
    }

    /// File extension used for the raw artifact. Anything that is not a
    /// plain token falls back to `out`.
    pub fn artifact_extension(&self) -> &str {
        match self.format.as_str() {
            "table" => "txt",
            other
                if !other.is_empty()
                    && other.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
            {
                other
            }
            _ => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilitySummary {
    pub total: u32,
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
}

#[derive(Deserialize)]
struct EngineReport {
    #[serde(rename = "Results", default)]
    results: Option<Vec<EngineTarget>>,
}

#[derive(Deserialize)]
struct EngineTarget {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<EngineVulnerability>>,
}

#[derive(Deserialize)]
struct EngineVulnerability {
    #[serde(rename = "Severity", default)]
    severity: String,
}

impl VulnerabilitySummary {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let report: EngineReport = serde_json::from_str(raw)?;
        let mut summary = Self::default();
        let vulns = report
            .results
            .unwrap_or_default()
            .into_iter()
            .flat_map(|t| t.vulnerabilities.unwrap_or_default());
        for vuln in vulns {
            summary.record(&vuln.severity);
        }
        Ok(summary)
    }

    fn record(&mut self, severity: &str) {
        self.total += 1;
        match severity {
            "CRITICAL" => self.critical += 1,
            "HIGH" => self.high += 1,
            "MEDIUM" => self.medium += 1,
            "LOW" => self.low += 1,
            _ => self.unknown += 1,
        }
    }
}
