//! Dependency resolver: install packages the generated project declares.
//!
//! Best effort only. A package that cannot be checked or installed becomes a
//! [`DependencyInstallWarning`] and the project runs anyway; if it really
//! needed the package, the crash trace tells the model.

use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::feedback::truncate_tail;
use crate::io::config::DependencyConfig;
use crate::io::materialize::Materialization;

const INSTALL_ERROR_LIMIT: usize = 2_000;

/// Abstraction over the runtime's package manager.
pub trait PackageInstaller {
    /// Whether the installed packages already satisfy `spec`, version
    /// constraints included.
    fn is_satisfied(&self, spec: &str) -> Result<bool>;
    /// Install `spec` (a requirement line such as `flask>=3`).
    fn install(&self, spec: &str) -> Result<()>;
}

impl<T: PackageInstaller + ?Sized> PackageInstaller for &T {
    fn is_satisfied(&self, spec: &str) -> Result<bool> {
        (**self).is_satisfied(spec)
    }

    fn install(&self, spec: &str) -> Result<()> {
        (**self).install(spec)
    }
}

/// Runs the configured pip commands.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    check_command: Vec<String>,
    install_command: Vec<String>,
}

impl PipInstaller {
    pub fn new(config: &DependencyConfig) -> Self {
        Self {
            check_command: config.check_command.clone(),
            install_command: config.install_command.clone(),
        }
    }
}

fn command(argv: &[String], last: &str) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty package manager command");
    };
    let mut cmd = Command::new(program);
    cmd.args(args).arg(last);
    Ok(cmd)
}

impl PackageInstaller for PipInstaller {
    fn is_satisfied(&self, spec: &str) -> Result<bool> {
        let output = command(&self.check_command, spec)?
            .output()
            .with_context(|| format!("run {}", self.check_command.join(" ")))?;
        Ok(output.status.success())
    }

    fn install(&self, spec: &str) -> Result<()> {
        let output = command(&self.install_command, spec)?
            .output()
            .with_context(|| format!("run {}", self.install_command.join(" ")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} exited with {}: {}",
            self.install_command.join(" "),
            output.status,
            truncate_tail(stderr.trim(), INSTALL_ERROR_LIMIT)
        )
    }
}

/// One package reference from a requirements file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    /// Distribution name without version, extras or markers.
    pub name: String,
    /// The requirement line as written, minus comments.
    pub spec: String,
}

/// Extract package references from requirements-file text.
///
/// Options (`-r`, `--index-url`, ...), URLs and blank lines are skipped.
pub fn parse_requirements(text: &str) -> Vec<Requirement> {
    static NAME_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)").unwrap());

    text.lines()
        .filter_map(|line| {
            let spec = line.split(" #").next().unwrap_or_default().trim();
            if spec.is_empty() || spec.starts_with('#') || spec.starts_with('-') {
                return None;
            }
            if spec.contains("://") {
                debug!(line = spec, "skipping url requirement");
                return None;
            }
            let name = NAME_RE.captures(spec)?.get(1)?.as_str().to_string();
            Some(Requirement {
                name,
                spec: spec.to_string(),
            })
        })
        .collect()
}

/// A package the resolver could not make available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyInstallWarning {
    pub package: String,
    pub message: String,
}

impl fmt::Display for DependencyInstallWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not install {}: {}", self.package, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyAction {
    AlreadyInstalled,
    Installed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyDecision {
    pub package: String,
    pub spec: String,
    pub action: DependencyAction,
}

/// Audit record of one resolver run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    /// Manifest path relative to the project root, if one was found.
    pub manifest: Option<String>,
    pub decisions: Vec<DependencyDecision>,
    pub warnings: Vec<DependencyInstallWarning>,
}

/// Install whatever the materialized manifest declares and is missing.
///
/// Returns `None` when resolution is disabled or already ran for this
/// materialization.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn resolve_dependencies<P: PackageInstaller + ?Sized>(
    materialization: &mut Materialization,
    root: &Path,
    installer: &P,
    config: &DependencyConfig,
) -> Option<DependencyReport> {
    if !config.enabled {
        debug!("dependency resolution disabled");
        return None;
    }
    if !materialization.claim_dependency_resolution() {
        debug!("dependencies already resolved for this materialization");
        return None;
    }

    let mut report = DependencyReport::default();
    let manifest_path = root.join(&config.manifest);
    let text = match fs::read_to_string(&manifest_path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(manifest = %config.manifest, "no dependency manifest");
            return Some(report);
        }
        Err(err) => {
            let warning = DependencyInstallWarning {
                package: config.manifest.clone(),
                message: format!("unreadable manifest: {err}"),
            };
            warn!(%warning, "dependency manifest unreadable");
            report.warnings.push(warning);
            return Some(report);
        }
    };
    report.manifest = Some(config.manifest.clone());

    for requirement in parse_requirements(&text) {
        let action = match ensure_installed(installer, &requirement) {
            Ok(action) => action,
            Err(err) => {
                let warning = DependencyInstallWarning {
                    package: requirement.name.clone(),
                    message: format!("{err:#}"),
                };
                warn!(%warning, "dependency install failed");
                report.warnings.push(warning);
                DependencyAction::Failed
            }
        };
        report.decisions.push(DependencyDecision {
            package: requirement.name,
            spec: requirement.spec,
            action,
        });
    }

    info!(
        packages = report.decisions.len(),
        warnings = report.warnings.len(),
        "dependencies resolved"
    );
    Some(report)
}

fn ensure_installed<P: PackageInstaller + ?Sized>(
    installer: &P,
    requirement: &Requirement,
) -> Result<DependencyAction> {
    if installer.is_satisfied(&requirement.spec)? {
        debug!(spec = %requirement.spec, "already satisfied");
        return Ok(DependencyAction::AlreadyInstalled);
    }
    info!(spec = %requirement.spec, "installing package");
    installer.install(&requirement.spec)?;
    Ok(DependencyAction::Installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::response::parse_response;
    use crate::io::materialize::{Project, materialize};
    use crate::test_support::{ScriptedInstaller, project_response};

    fn materialized(files: &[(&str, &str)]) -> (tempfile::TempDir, Materialization) {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut project = Project::fresh(temp.path(), false).expect("fresh");
        let response = parse_response(&project_response(files)).expect("parse");
        let materialization = materialize(&mut project, &response).expect("materialize");
        (temp, materialization)
    }

    #[test]
    fn parses_names_from_requirement_lines() {
        let text = "\
# web stack
flask>=3.0
requests[socks] == 2.31 ; python_version > '3.8'
-r other.txt
--index-url https://example.invalid/simple
git+https://example.invalid/repo.git
Django_REST-framework  # api

";
        let names: Vec<String> = parse_requirements(text)
            .into_iter()
            .map(|req| req.name)
            .collect();
        assert_eq!(names, vec!["flask", "requests", "Django_REST-framework"]);
    }

    #[test]
    fn installs_only_missing_packages_and_warns_on_failure() {
        let (temp, mut materialization) = materialized(&[
            ("main.py", "import flask"),
            ("requirements.txt", "flask\nnumpy==1.26\nbrokenpkg\n"),
        ]);
        let installer = ScriptedInstaller::new(&["flask==3.0"], &["brokenpkg"]);

        let report = resolve_dependencies(
            &mut materialization,
            temp.path(),
            &installer,
            &DependencyConfig::default(),
        )
        .expect("report");

        assert_eq!(installer.installs(), vec!["numpy==1.26", "brokenpkg"]);
        let actions: Vec<&DependencyAction> = report.decisions.iter().map(|d| &d.action).collect();
        assert_eq!(
            actions,
            vec![
                &DependencyAction::AlreadyInstalled,
                &DependencyAction::Installed,
                &DependencyAction::Failed,
            ]
        );
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].package, "brokenpkg");
    }

    #[test]
    fn installed_package_with_wrong_version_is_reinstalled() {
        let (temp, mut materialization) = materialized(&[
            ("main.py", "import flask"),
            ("requirements.txt", "flask==3.0\nrequests\n"),
        ]);
        let installer = ScriptedInstaller::new(&["flask==2.2", "requests==2.31"], &[]);

        let report = resolve_dependencies(
            &mut materialization,
            temp.path(),
            &installer,
            &DependencyConfig::default(),
        )
        .expect("report");

        assert_eq!(installer.installs(), vec!["flask==3.0"]);
        assert_eq!(report.decisions[0].action, DependencyAction::Installed);
        assert_eq!(report.decisions[1].action, DependencyAction::AlreadyInstalled);
    }

    #[test]
    fn runs_at_most_once_per_materialization() {
        let (temp, mut materialization) =
            materialized(&[("main.py", "x"), ("requirements.txt", "numpy\n")]);
        let installer = ScriptedInstaller::new(&[], &[]);
        let config = DependencyConfig::default();

        assert!(resolve_dependencies(&mut materialization, temp.path(), &installer, &config).is_some());
        assert!(resolve_dependencies(&mut materialization, temp.path(), &installer, &config).is_none());
        assert_eq!(installer.installs(), vec!["numpy"]);
    }

    #[test]
    fn missing_manifest_and_disabled_config_do_nothing() {
        let (temp, mut materialization) = materialized(&[("main.py", "x")]);
        let installer = ScriptedInstaller::new(&[], &[]);
        let disabled = DependencyConfig {
            enabled: false,
            ..DependencyConfig::default()
        };
        assert!(resolve_dependencies(&mut materialization, temp.path(), &installer, &disabled).is_none());

        let report = resolve_dependencies(
            &mut materialization,
            temp.path(),
            &installer,
            &DependencyConfig::default(),
        )
        .expect("report");
        assert_eq!(report.manifest, None);
        assert!(installer.installs().is_empty());
    }

    #[test]
    fn pip_installer_runs_configured_commands() {
        let installer = PipInstaller::new(&DependencyConfig {
            check_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "test \"$0\" = 'present==1.0'".to_string(),
            ],
            install_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo \"no such package $0\" >&2; exit 1".to_string(),
            ],
            ..DependencyConfig::default()
        });

        assert!(installer.is_satisfied("present==1.0").expect("check"));
        assert!(!installer.is_satisfied("present==2.0").expect("check"));
        assert!(!installer.is_satisfied("absent").expect("check"));
        let err = installer.install("absent").unwrap_err();
        assert!(format!("{err:#}").contains("no such package absent"));
    }
}
