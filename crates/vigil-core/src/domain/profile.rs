//! Named scan settings an owner saves and reuses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::VigilError;
use super::scan_config::ScanRequest;

pub const MAX_PROFILE_NAME_LEN: usize = 64;

static PROFILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("profile name regex should compile"));

/// Names end up in file names, so only a small alphabet is accepted.
pub fn validate_profile_name(name: &str) -> Result<(), VigilError> {
    if name.is_empty() {
        return Err(VigilError::InvalidInput("profile name must not be empty".into()));
    }
    if name.len() > MAX_PROFILE_NAME_LEN {
        return Err(VigilError::InvalidInput(format!(
            "profile name exceeds {MAX_PROFILE_NAME_LEN} characters"
        )));
    }
    if name.contains("..") || !PROFILE_NAME.is_match(name) {
        return Err(VigilError::InvalidInput(format!(
            "profile name {name:?} may only contain letters, digits, '.', '_' and '-'"
        )));
    }
    Ok(())
}

fn default_tls_verify() -> bool {
    true
}

/// Stored form of a profile (`config_<name>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigProfile {
    /// Prepended to images that do not already start with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub severity: Vec<String>,
    #[serde(default)]
    pub ignore_unfixed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scanners: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pkg_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Default for ConfigProfile {
    fn default() -> Self {
        Self {
            image_prefix: None,
            username: None,
            password: None,
            tls_verify: true,
            severity: Vec::new(),
            ignore_unfixed: false,
            scanners: Vec::new(),
            detection_priority: None,
            pkg_types: Vec::new(),
            format: None,
        }
    }
}

impl ConfigProfile {
    /// Capture the settings of `request`, without its image.
    pub fn from_request(request: &ScanRequest) -> Self {
        Self {
            image_prefix: None,
            username: request.username.clone(),
            password: request.password.clone(),
            tls_verify: request.tls_verify.unwrap_or(true),
            severity: request.severity.clone(),
            ignore_unfixed: request.ignore_unfixed,
            scanners: request.scanners.clone(),
            detection_priority: request.detection_priority.clone(),
            pkg_types: request.pkg_types.clone(),
            format: request.format.clone(),
        }
    }

    /// Request for `image` with this profile's settings.
    pub fn request_for(&self, image: &str) -> ScanRequest {
        let image = image.trim();
        let image = match self.image_prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) if !image.starts_with(prefix) => format!("{prefix}{image}"),
            _ => image.to_string(),
        };
        ScanRequest {
            image,
            username: self.username.clone(),
            password: self.password.clone(),
            tls_verify: Some(self.tls_verify),
            severity: self.severity.clone(),
            ignore_unfixed: self.ignore_unfixed,
            scanners: self.scanners.clone(),
            detection_priority: self.detection_priority.clone(),
            pkg_types: self.pkg_types.clone(),
            format: self.format.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("default")]
    #[case("prod-registry_v2.1")]
    #[case(&"a".repeat(64))]
    fn accepted_names(#[case] name: &str) {
        assert!(validate_profile_name(name).is_ok());
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_long(&"a".repeat(65))]
    #[case::separator("team/prod")]
    #[case::backslash("team\\prod")]
    #[case::parent("..")]
    #[case::dots_inside("a..b")]
    #[case::space("my profile")]
    fn rejected_names(#[case] name: &str) {
        assert!(validate_profile_name(name).is_err());
    }

    #[test]
    fn prefix_is_applied_once() {
        let profile = ConfigProfile {
            image_prefix: Some("registry.local/".into()),
            severity: vec!["HIGH".into()],
            ..ConfigProfile::default()
        };
        assert_eq!(profile.request_for("alpine").image, "registry.local/alpine");
        assert_eq!(
            profile.request_for("registry.local/alpine").image,
            "registry.local/alpine"
        );
        assert_eq!(profile.request_for(" nginx ").severity, vec!["HIGH"]);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let profile: ConfigProfile = serde_json::from_str(r#"{"format":"table"}"#).unwrap();
        assert!(profile.tls_verify);
        assert_eq!(profile.format.as_deref(), Some("table"));

        let request = profile.request_for("alpine");
        assert_eq!(request.tls_verify, Some(true));
        assert_eq!(ConfigProfile::from_request(&request), profile);
    }
}
