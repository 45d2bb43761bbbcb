//! Validate Command

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use tandem_common::CollaborativeScript;

use crate::output::{print_error, print_json, print_success, OutputFormat};

#[derive(Args)]
pub struct ValidateArgs {
    /// Script file, or a directory searched for .yaml/.yml/.json scripts
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub valid: bool,
    pub devices: usize,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationReport {
    fn checked(path: PathBuf, script: &CollaborativeScript) -> Self {
        let error = script.validate().err().map(|e| e.to_string());
        Self {
            path,
            valid: error.is_none(),
            devices: script.devices.len(),
            steps: script.total_steps(),
            error,
        }
    }

    fn unreadable(path: PathBuf, error: impl ToString) -> Self {
        Self {
            path,
            valid: false,
            devices: 0,
            steps: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Parse and validate every script under `path`
pub fn check(path: &Path) -> Result<Vec<ValidationReport>> {
    if path.is_dir() {
        let mut reports = Vec::new();
        for (file, script) in CollaborativeScript::load_all(path)? {
            reports.push(ValidationReport::checked(file, &script));
        }
        return Ok(reports);
    }

    Ok(vec![match CollaborativeScript::from_file(path) {
        Ok(script) => ValidationReport::checked(path.to_path_buf(), &script),
        Err(e) => ValidationReport::unreadable(path.to_path_buf(), e),
    }])
}

/// Returns whether every script is valid
pub fn execute(args: ValidateArgs, format: OutputFormat) -> Result<bool> {
    let reports = check(&args.path)?;
    let all_valid = reports.iter().all(|r| r.valid);

    match format {
        OutputFormat::Json => print_json(&reports),
        OutputFormat::Table => {
            if reports.is_empty() {
                println!("No scripts found under {}", args.path.display());
            }
            for report in &reports {
                match &report.error {
                    None => print_success(&format!(
                        "{} ({} devices, {} steps)",
                        report.path.display(),
                        report.devices,
                        report.steps
                    )),
                    Some(error) => print_error(&format!("{}: {}", report.path.display(), error)),
                }
            }
        }
    }

    Ok(all_valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
devices:
  host: { kind: browser }
  guest: { kind: browser }
flow:
  - type: device
    device: host
    steps:
      - type: action
        instruction: "click #start"
  - type: sync
    id: started
  - type: device
    device: guest
    steps:
      - type: assert
        assertion: "visible #lobby"
"#;

    const UNKNOWN_ALIAS: &str = r#"
devices:
  host: { kind: browser }
flow:
  - type: device
    device: ghost
    steps: []
"#;

    #[test]
    fn test_single_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.yaml");
        std::fs::write(&path, GOOD).unwrap();

        let reports = check(&path).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].valid);
        assert_eq!(reports[0].devices, 2);
        assert_eq!(reports[0].steps, 2);
    }

    #[test]
    fn test_directory_reports_each_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), GOOD).unwrap();
        std::fs::write(dir.path().join("b.yml"), UNKNOWN_ALIAS).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let reports = check(dir.path()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].valid);
        assert!(!reports[1].valid);
        assert!(reports[1].error.as_deref().unwrap_or_default().contains("ghost"));
    }

    #[test]
    fn test_unparseable_file_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let reports = check(&path).unwrap();
        assert!(!reports[0].valid);
        assert!(reports[0].error.is_some());
    }
}
