//! # Security scanning
//!
//! Every workbook is scanned before it is read: for macro projects (by extension class and by
//! container structure) and for links or cell text that use a deny-listed URI scheme. The
//! [`MacroPolicy`] decides whether findings block processing.
mod package;
pub mod scheme;

use crate::error::IngestError;
use crate::helpers::cfb::Cfb;
use crate::helpers::reader::UnifiedReader;
use crate::security::package::CfbScan;
use crate::spreadsheet::ContainerKind;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use zip::ZipArchive;

/// Extensions of workbook classes that can carry macros
const MACRO_EXTENSIONS: [&str; 5] = ["xlsm", "xltm", "xlam", "xla", "xlsb"];

/// What to do when the scanner finds a macro or an unsafe reference.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacroPolicy {
    /// Any finding makes the workbook invalid
    Strict,
    /// Findings are recorded as warnings
    #[default]
    Warn,
    /// Findings are reported only
    Allow,
}

impl FromStr for MacroPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(MacroPolicy::Strict),
            "warn" => Ok(MacroPolicy::Warn),
            "allow" => Ok(MacroPolicy::Allow),
            other => Err(format!("expected 'strict', 'warn' or 'allow', got '{other}'")),
        }
    }
}

impl Display for MacroPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MacroPolicy::Strict => "strict",
            MacroPolicy::Warn => "warn",
            MacroPolicy::Allow => "allow",
        };
        write!(f, "{name}")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Macro,
    ExternalReference,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A single finding, located by part name, record or cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub kind: IssueKind,
    pub location: String,
    pub severity: Severity,
    pub detail: String,
}

impl SecurityIssue {
    pub fn new(kind: IssueKind, location: &str, severity: Severity, detail: &str) -> SecurityIssue {
        SecurityIssue {
            kind,
            location: location.to_owned(),
            severity,
            detail: detail.to_owned(),
        }
    }
}

impl Display for SecurityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            IssueKind::Macro => "macro",
            IssueKind::ExternalReference => "unsafe reference",
        };
        write!(f, "{kind} at {}: {}", self.location, self.detail)
    }
}

/// Outcome of a scan. Built once through [`ValidationResultBuilder`] and read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    is_valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
    security_issues: Vec<SecurityIssue>,
    policy: MacroPolicy,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn security_issues(&self) -> &[SecurityIssue] {
        &self.security_issues
    }

    pub fn policy(&self) -> MacroPolicy {
        self.policy
    }

    pub fn has_macros(&self) -> bool {
        self.security_issues.iter().any(|issue| issue.kind == IssueKind::Macro)
    }
}

pub struct ValidationResultBuilder {
    policy: MacroPolicy,
    errors: Vec<String>,
    warnings: Vec<String>,
    security_issues: Vec<SecurityIssue>,
}

impl ValidationResultBuilder {
    pub fn new(policy: MacroPolicy) -> ValidationResultBuilder {
        ValidationResultBuilder {
            policy,
            errors: Vec::new(),
            warnings: Vec::new(),
            security_issues: Vec::new(),
        }
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }

    pub fn warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }

    /// Adds findings, dropping repeats of the same kind at the same location.
    pub fn issues(mut self, issues: impl IntoIterator<Item = SecurityIssue>) -> Self {
        for issue in issues {
            let seen = self
                .security_issues
                .iter()
                .any(|known| known.kind == issue.kind && known.location == issue.location);
            if !seen {
                self.security_issues.push(issue);
            }
        }
        self
    }

    /// Applies the policy: `strict` turns each finding into an error, `warn` mirrors it
    /// into the warnings and `allow` leaves it in the issue list only.
    pub fn build(mut self) -> ValidationResult {
        match self.policy {
            MacroPolicy::Strict => {
                let blocked = self.security_issues.iter().map(|issue| format!("blocked by strict policy: {issue}"));
                self.errors.extend(blocked);
            }
            MacroPolicy::Warn => {
                self.warnings.extend(self.security_issues.iter().map(ToString::to_string));
            }
            MacroPolicy::Allow => (),
        }
        ValidationResult {
            is_valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
            security_issues: self.security_issues,
            policy: self.policy,
        }
    }
}

/// Scans workbook files under one policy. Holds no state between scans.
#[derive(Copy, Clone, Debug, Default)]
pub struct SecurityScanner {
    policy: MacroPolicy,
}

impl SecurityScanner {
    pub fn new(policy: MacroPolicy) -> SecurityScanner {
        SecurityScanner { policy }
    }

    /// Runs the macro and external-reference checks.
    ///
    /// Fails with [`IngestError::UnreadableFile`] when the file cannot be opened, is not a
    /// spreadsheet container, or is encrypted. Findings never fail the scan itself; whether
    /// they invalidate the workbook is up to the policy.
    pub fn scan(&self, path: &Path) -> Result<ValidationResult, IngestError> {
        let unreadable = |reason: String| IngestError::UnreadableFile {
            path: path.display().to_string(),
            reason,
        };
        let mut reader = UnifiedReader::open(path)?;
        let kind = ContainerKind::sniff(&reader.head(8)?);
        let mut builder = ValidationResultBuilder::new(self.policy);
        let mut issues = Vec::new();

        if let Some(expected) = ContainerKind::expected_for(path) {
            if expected != kind && kind != ContainerKind::Unknown {
                tracing::warn!("{} is labeled as {:?} but contains {:?}", path.display(), expected, kind);
                builder = builder.warning(format!(
                    "file extension does not match its content: expected a {expected:?} container, found {kind:?}"
                ));
            }
        }
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if MACRO_EXTENSIONS.contains(&extension.as_str()) {
            let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
            issues.push(SecurityIssue::new(IssueKind::Macro, &name, Severity::Medium, "macro-capable file type"));
        }

        match kind {
            ContainerKind::Zip => {
                let mut zip = ZipArchive::new(reader).map_err(|error| unreadable(format!("corrupt package: {error}")))?;
                package::scan_zip(&mut zip, &mut issues)?;
            }
            ContainerKind::Cfb => {
                let cfb = Cfb::new(&mut reader).map_err(|error| unreadable(error.to_string()))?;
                if cfb.exists("EncryptedPackage") || package::scan_cfb(&cfb, &mut issues)? == CfbScan::Encrypted {
                    return Err(unreadable("the workbook is encrypted (password protected)".to_owned()));
                }
            }
            ContainerKind::Unknown => return Err(unreadable("not a spreadsheet container".to_owned())),
        }

        let result = builder.issues(issues).build();
        tracing::debug!(
            "Scanned {} under {} policy: {} issue(s), valid={}",
            path.display(),
            self.policy,
            result.security_issues().len(),
            result.is_valid()
        );
        Ok(result)
    }
}
