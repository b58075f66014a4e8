//! Package requirement resolution ahead of a run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::report::{EventKind, ReportLevel, ReportSink};

/// A declared package requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    /// Package name; empty means nothing to do.
    pub package_name: String,
    /// Requested version, if any.
    #[serde(default)]
    pub package_version: Option<String>,
    /// Require the exact version instead of a compatible one.
    #[serde(default)]
    pub version_strict: bool,
    /// Package index to download from.
    #[serde(default)]
    pub mirror_url: Option<String>,
}

impl DependencySpec {
    /// Requirement on `name` with no version constraint.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            package_name: name.into(),
            package_version: None,
            version_strict: false,
            mirror_url: None,
        }
    }

    /// Same requirement pinned to `version`.
    pub fn with_version(mut self, version: impl Into<String>, strict: bool) -> Self {
        self.package_version = Some(version.into());
        self.version_strict = strict;
        self
    }

    fn requested(&self) -> Option<&str> {
        self.package_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Argument handed to the package manager.
    pub fn install_spec(&self) -> String {
        let name = self.package_name.trim();
        match self.requested() {
            Some(version) if self.version_strict => format!("{name}=={version}"),
            Some(version) => match major(version) {
                Some(m) => format!("{name}>={version},<{}", m + 1),
                None => format!("{name}=={version}"),
            },
            None => name.to_string(),
        }
    }

    /// Whether `installed` meets the requirement.
    pub fn is_satisfied_by(&self, installed: &str) -> bool {
        let Some(requested) = self.requested() else {
            return true;
        };
        if self.version_strict {
            return installed.trim() == requested;
        }
        let (have, want) = (components(installed), components(requested));
        match (have.first(), want.first()) {
            (Some(h), Some(w)) if h == w => compare(&have, &want).is_ge(),
            _ => false,
        }
    }
}

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

fn major(version: &str) -> Option<u64> {
    components(version).first().copied()
}

fn compare(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering.is_ne() {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}

/// Dependency resolution failures.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// The package manager reported a failure.
    #[error("failed to install {package}: {message}")]
    Install {
        /// Package name.
        package: String,
        /// Package manager output.
        message: String,
    },

    /// The installed version still does not meet the requirement.
    #[error("{package} {found} does not satisfy {wanted}")]
    VersionMismatch {
        /// Package name.
        package: String,
        /// Install spec.
        wanted: String,
        /// Version found after installing.
        found: String,
    },

    /// The package manager did not finish in time.
    #[error("installing {package} timed out after {seconds}s")]
    Timeout {
        /// Package name.
        package: String,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// Could not start the package manager.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for dependency resolution.
pub type DependencyResult<T> = std::result::Result<T, DependencyError>;

/// Package manager operations.
pub trait Installer: Send + Sync {
    /// Installed version of `package`, if any.
    fn installed_version(&self, package: &str) -> DependencyResult<Option<String>>;

    /// Download `spec` into `cache_dir`.
    fn download(&self, spec: &str, cache_dir: &Path, mirror: Option<&str>) -> DependencyResult<()>;

    /// Install `spec` from `cache_dir` only.
    fn install_offline(&self, spec: &str, cache_dir: &Path) -> DependencyResult<()>;

    /// Install `spec` from the index.
    fn install(&self, spec: &str, mirror: Option<&str>) -> DependencyResult<()>;
}

/// Drives a pip-style command line.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: PathBuf,
    base_args: Vec<String>,
    timeout: Duration,
}

impl CommandInstaller {
    /// Installer invoking `program` with a hard timeout per command.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            timeout,
        }
    }

    /// Arguments placed before every subcommand (`-m pip` and the like).
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run one package manager command to completion, draining its output
    /// while waiting. Must not be called from inside a tokio runtime.
    fn run(&self, package: &str, args: &[&str]) -> DependencyResult<(bool, String)> {
        tracing::debug!(program = %self.program.display(), ?args, "running package manager");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let waited = runtime.block_on(async {
            let child = tokio::process::Command::new(&self.program)
                .args(&self.base_args)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            Ok::<_, std::io::Error>(
                tokio::time::timeout(self.timeout, child.wait_with_output()).await,
            )
        })?;
        // On timeout the child was dropped, which kills it.
        let output = match waited {
            Ok(output) => output?,
            Err(_) => {
                return Err(DependencyError::Timeout {
                    package: package.to_string(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text))
    }

    fn run_checked(&self, package: &str, args: &[&str]) -> DependencyResult<()> {
        let (ok, output) = self.run(package, args)?;
        if ok {
            Ok(())
        } else {
            Err(DependencyError::Install {
                package: package.to_string(),
                message: output.trim().to_string(),
            })
        }
    }
}

impl Installer for CommandInstaller {
    fn installed_version(&self, package: &str) -> DependencyResult<Option<String>> {
        let (ok, output) = self.run(package, &["show", package])?;
        if !ok {
            return Ok(None);
        }
        Ok(output
            .lines()
            .find_map(|line| line.strip_prefix("Version:"))
            .map(|v| v.trim().to_string()))
    }

    fn download(&self, spec: &str, cache_dir: &Path, mirror: Option<&str>) -> DependencyResult<()> {
        let dir = cache_dir.to_string_lossy();
        let mut args = vec!["download", spec, "-d", dir.as_ref()];
        if let Some(mirror) = mirror {
            args.extend(["-i", mirror]);
        }
        self.run_checked(spec, &args)
    }

    fn install_offline(&self, spec: &str, cache_dir: &Path) -> DependencyResult<()> {
        let dir = cache_dir.to_string_lossy();
        self.run_checked(
            spec,
            &["install", "--no-index", "--find-links", dir.as_ref(), spec],
        )
    }

    fn install(&self, spec: &str, mirror: Option<&str>) -> DependencyResult<()> {
        let mut args = vec!["install", spec];
        if let Some(mirror) = mirror {
            args.extend(["-i", mirror]);
        }
        self.run_checked(spec, &args)
    }
}

/// What resolving one requirement did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to resolve (empty name or already handled in this process).
    Skipped,
    /// An acceptable version was already installed.
    Satisfied(String),
    /// The package was installed; carries the verified version.
    Installed(String),
}

/// Ensures requirements are installed, caching successes.
pub struct DependencyResolver {
    installer: Arc<dyn Installer>,
    cache_dir: PathBuf,
    resolved: Mutex<HashSet<String>>,
}

impl DependencyResolver {
    /// Resolver downloading into `cache_dir`.
    pub fn new(installer: Arc<dyn Installer>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            installer,
            cache_dir: cache_dir.into(),
            resolved: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve every requirement in order, stopping at the first failure.
    pub fn resolve_all(
        &self,
        specs: &[DependencySpec],
        sink: Option<&ReportSink>,
    ) -> DependencyResult<Vec<Resolution>> {
        specs.iter().map(|spec| self.resolve(spec, sink)).collect()
    }

    /// Make sure `spec` is installed.
    pub fn resolve(
        &self,
        spec: &DependencySpec,
        sink: Option<&ReportSink>,
    ) -> DependencyResult<Resolution> {
        let name = spec.package_name.trim();
        if name.is_empty() {
            return Ok(Resolution::Skipped);
        }
        let install_spec = spec.install_spec();
        if self.resolved.lock().contains(&install_spec) {
            return Ok(Resolution::Skipped);
        }
        if let Some(version) = self.installer.installed_version(name)? {
            if spec.is_satisfied_by(&version) {
                tracing::debug!(package = name, %version, "requirement already satisfied");
                self.resolved.lock().insert(install_spec);
                return Ok(Resolution::Satisfied(version));
            }
        }

        tip(sink, "downloading", name, &install_spec);
        let mirror = spec.mirror_url.as_deref().filter(|m| !m.is_empty());
        let cached = self
            .installer
            .download(&install_spec, &self.cache_dir, mirror)
            .and_then(|()| self.installer.install_offline(&install_spec, &self.cache_dir));
        if let Err(err) = cached {
            tracing::warn!(package = name, error = %err, "cached install failed, installing directly");
            self.installer.install(&install_spec, mirror)?;
        }
        tip(sink, "downloaded", name, &install_spec);

        let found = self.installer.installed_version(name)?;
        match found {
            Some(version) if spec.is_satisfied_by(&version) => {
                tracing::info!(package = name, %version, "installed requirement");
                self.resolved.lock().insert(install_spec);
                Ok(Resolution::Installed(version))
            }
            Some(version) => Err(DependencyError::VersionMismatch {
                package: name.to_string(),
                wanted: install_spec,
                found: version,
            }),
            None => Err(DependencyError::Install {
                package: name.to_string(),
                message: "package not found after install".to_string(),
            }),
        }
    }
}

fn tip(sink: Option<&ReportSink>, status: &str, package: &str, spec: &str) {
    if let Some(sink) = sink {
        sink.emit(
            ReportLevel::Info,
            EventKind::Tip,
            json!({ "status": status, "package": package, "spec": spec }),
        );
    }
}
