//! Scan request and the normalized configuration stored on a task.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::VigilError;

pub const DEFAULT_SCANNER: &str = "vuln";
pub const DEFAULT_DETECTION_PRIORITY: &str = "precise";
pub const DEFAULT_FORMAT: &str = "json";

pub const MAX_IMAGE_LEN: usize = 512;

/// Report formats the engine can be asked for.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "json",
    "table",
    "sarif",
    "cyclonedx",
    "spdx",
    "spdx-json",
    "github",
    "cosign-vuln",
];

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>', '\\', '\n', '\r'];

/// `[registry[:port]/][namespace/]repository[:tag|@sha256:digest]`
static IMAGE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?(:[0-9]+)?(/[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?)*(@sha256:[a-fA-F0-9]{64}|:[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?)?$",
    )
    .expect("image reference regex should compile")
});

/// Check an already trimmed image reference.
pub fn validate_image(image: &str) -> Result<(), VigilError> {
    if image.is_empty() {
        return Err(VigilError::InvalidInput("image must not be empty".into()));
    }
    if image.len() > MAX_IMAGE_LEN {
        return Err(VigilError::InvalidInput(format!(
            "image reference exceeds {MAX_IMAGE_LEN} characters"
        )));
    }
    if let Some(c) = image.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(VigilError::InvalidInput(format!(
            "image reference contains invalid character {c:?}"
        )));
    }
    if !IMAGE_REFERENCE.is_match(image) {
        return Err(VigilError::InvalidInput(format!(
            "image reference {image:?} is not valid"
        )));
    }
    Ok(())
}

/// What a caller submits. Everything except `image` is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub image: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Defaults to `true` when absent.
    #[serde(default)]
    pub tls_verify: Option<bool>,
    #[serde(default)]
    pub severity: Vec<String>,
    #[serde(default)]
    pub ignore_unfixed: bool,
    #[serde(default)]
    pub scanners: Vec<String>,
    #[serde(default)]
    pub detection_priority: Option<String>,
    #[serde(default)]
    pub pkg_types: Vec<String>,
    #[serde(default)]
    pub format: Option<String>,
}

impl ScanRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate and apply defaults. Returns the trimmed image reference and
    /// the configuration to persist.
    pub fn normalize(self) -> Result<(String, ScanConfig), VigilError> {
        let image = self.image.trim().to_string();
        validate_image(&image)?;

        let non_blank = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let cleaned = |v: Vec<String>| -> Vec<String> {
            v.into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let mut scanners = cleaned(self.scanners);
        if scanners.is_empty() {
            scanners.push(DEFAULT_SCANNER.to_string());
        }

        let format = non_blank(self.format)
            .map(|f| f.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(VigilError::InvalidInput(format!(
                "unsupported format {format:?}, expected one of {}",
                SUPPORTED_FORMATS.join(", ")
            )));
        }

        let config = ScanConfig {
            username: non_blank(self.username),
            password: non_blank(self.password),
            tls_verify: self.tls_verify.unwrap_or(true),
            severity: cleaned(self.severity)
                .into_iter()
                .map(|s| s.to_ascii_uppercase())
                .collect(),
            ignore_unfixed: self.ignore_unfixed,
            scanners,
            detection_priority: non_blank(self.detection_priority)
                .unwrap_or_else(|| DEFAULT_DETECTION_PRIORITY.to_string()),
            pkg_types: cleaned(self.pkg_types),
            format,
        };
        Ok((image, config))
    }
}

/// Normalized scan options. Opaque to the scheduler except when building the
/// engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub tls_verify: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub severity: Vec<String>,
    pub ignore_unfixed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scanners: Vec<String>,
    pub detection_priority: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pkg_types: Vec<String>,
    pub format: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            tls_verify: true,
            severity: Vec::new(),
            ignore_unfixed: false,
            scanners: vec![DEFAULT_SCANNER.to_string()],
            detection_priority: DEFAULT_DETECTION_PRIORITY.to_string(),
            pkg_types: Vec::new(),
            format: DEFAULT_FORMAT.to_string(),
        }
    }
}
