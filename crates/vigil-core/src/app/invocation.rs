//! Engine command line for one scan.

use std::time::Duration;

use crate::domain::ScanTask;

const MASK: &str = "***";

/// Arguments for `<engine> image ...`, image reference last.
pub fn build_scan_args(task: &ScanTask, server: Option<&str>, timeout: Duration) -> Vec<String> {
    let config = &task.config;
    let mut args: Vec<String> = vec!["image".into()];
    let mut flag = |name: &str, value: Option<String>| {
        args.push(name.to_string());
        if let Some(value) = value {
            args.push(value);
        }
    };

    if let Some(server) = server {
        flag("--server", Some(server.to_string()));
    }
    flag("--skip-db-update", None);
    flag("--image-src", Some("remote".into()));
    flag(
        "--timeout",
        Some(humantime::format_duration(timeout).to_string().replace(' ', "")),
    );
    if let Some(username) = &config.username {
        flag("--username", Some(username.clone()));
    }
    if let Some(password) = &config.password {
        flag("--password", Some(password.clone()));
    }
    if !config.tls_verify {
        flag("--insecure", None);
    }
    if !config.severity.is_empty() {
        flag("--severity", Some(config.severity.join(",")));
    }
    if config.ignore_unfixed {
        flag("--ignore-unfixed", None);
    }
    if !config.scanners.is_empty() {
        flag("--scanners", Some(config.scanners.join(",")));
    }
    if !config.detection_priority.is_empty() {
        flag("--detection-priority", Some(config.detection_priority.clone()));
    }
    if !config.pkg_types.is_empty() {
        flag("--pkg-types", Some(config.pkg_types.join(",")));
    }
    if !config.format.is_empty() {
        flag("--format", Some(config.format.clone()));
    }

    args.push(task.image.clone());
    args
}

/// Copy of `args` with registry credentials replaced, for logging.
pub fn mask_credentials(args: &[String]) -> Vec<String> {
    let mut masked = args.to_vec();
    for i in 0..masked.len().saturating_sub(1) {
        if masked[i] == "--username" || masked[i] == "--password" {
            masked[i + 1] = MASK.to_string();
        }
    }
    masked
}
