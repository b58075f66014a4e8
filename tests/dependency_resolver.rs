//! Integration tests for dependency resolution
//!
//! A scripted installer stands in for the package manager.

mod common;

use common::{WAIT, add, calc_backend, project};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use weft::runtime::dependency::{DependencyError, DependencyResult, Resolution};
use weft::runtime::report::CollectingObserver;
use weft::runtime::{
    DependencyResolver, DependencySpec, Engine, EngineConfig, EventKind, Installer, Outcome,
    ReportObserver, ReportSink,
};

#[derive(Default)]
struct FakeInstaller {
    installed: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    fail_download: bool,
    fail_install: bool,
    /// Version installed regardless of the request, when set.
    forced_version: Option<String>,
}

impl FakeInstaller {
    fn with_installed(name: &str, version: &str) -> Self {
        let fake = Self::default();
        fake.installed.lock().insert(name.into(), version.into());
        fake
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn put(&self, spec: &str) {
        let (name, version) = match spec.split_once("==").or_else(|| spec.split_once(">=")) {
            Some((name, rest)) => (name, rest.split(',').next().unwrap_or(rest)),
            None => (spec, "1.0.0"),
        };
        let version = self.forced_version.as_deref().unwrap_or(version);
        self.installed.lock().insert(name.into(), version.into());
    }
}

impl Installer for FakeInstaller {
    fn installed_version(&self, package: &str) -> DependencyResult<Option<String>> {
        Ok(self.installed.lock().get(package).cloned())
    }

    fn download(&self, spec: &str, _cache_dir: &Path, _mirror: Option<&str>) -> DependencyResult<()> {
        self.calls.lock().push(format!("download {spec}"));
        if self.fail_download {
            return Err(DependencyError::Install {
                package: spec.into(),
                message: "offline".into(),
            });
        }
        Ok(())
    }

    fn install_offline(&self, spec: &str, _cache_dir: &Path) -> DependencyResult<()> {
        self.calls.lock().push(format!("offline {spec}"));
        self.put(spec);
        Ok(())
    }

    fn install(&self, spec: &str, _mirror: Option<&str>) -> DependencyResult<()> {
        self.calls.lock().push(format!("install {spec}"));
        if self.fail_install {
            return Err(DependencyError::Install {
                package: spec.into(),
                message: "no matching distribution".into(),
            });
        }
        self.put(spec);
        Ok(())
    }
}

fn resolver(fake: Arc<FakeInstaller>) -> DependencyResolver {
    DependencyResolver::new(fake, std::env::temp_dir().join("weft-test-packages"))
}

#[test]
fn satisfied_requirement_is_not_reinstalled() {
    let fake = Arc::new(FakeInstaller::with_installed("requests", "2.31.0"));
    let resolver = resolver(fake.clone());
    let spec = DependencySpec::named("requests").with_version("2.28", false);
    assert_eq!(
        resolver.resolve(&spec, None).unwrap(),
        Resolution::Satisfied("2.31.0".into())
    );
    assert!(fake.calls().is_empty());
}

#[test]
fn missing_package_goes_through_the_cache_with_tips() {
    let fake = Arc::new(FakeInstaller::default());
    let resolver = resolver(fake.clone());
    let collector = Arc::new(CollectingObserver::new());
    let sink = ReportSink::new("exec", 16, vec![collector.clone() as Arc<dyn ReportObserver>]);

    let spec = DependencySpec::named("numpy").with_version("1.26.0", true);
    let resolution = resolver.resolve(&spec, Some(&sink)).unwrap();
    assert_eq!(resolution, Resolution::Installed("1.26.0".into()));
    assert_eq!(fake.calls(), vec!["download numpy==1.26.0", "offline numpy==1.26.0"]);

    sink.close();
    let tips: Vec<String> = collector
        .of_kind(EventKind::Tip)
        .iter()
        .map(|e| e.data["status"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(tips, vec!["downloading", "downloaded"]);

    // Second resolution hits the in-process cache.
    assert_eq!(resolver.resolve(&spec, None).unwrap(), Resolution::Skipped);
    assert_eq!(fake.calls().len(), 2);
}

#[test]
fn failed_download_falls_back_to_direct_install() {
    let fake = Arc::new(FakeInstaller {
        fail_download: true,
        ..FakeInstaller::default()
    });
    let resolver = resolver(fake.clone());
    let spec = DependencySpec::named("lxml").with_version("5.1", false);
    assert_eq!(
        resolver.resolve(&spec, None).unwrap(),
        Resolution::Installed("5.1".into())
    );
    assert_eq!(fake.calls(), vec!["download lxml>=5.1,<6", "install lxml>=5.1,<6"]);
}

#[test]
fn wrong_version_after_install_is_an_error() {
    let fake = Arc::new(FakeInstaller {
        forced_version: Some("3.0.0".into()),
        ..FakeInstaller::default()
    });
    let resolver = resolver(fake);
    let spec = DependencySpec::named("pillow").with_version("2.0.0", true);
    assert!(matches!(
        resolver.resolve(&spec, None),
        Err(DependencyError::VersionMismatch { found, .. }) if found == "3.0.0"
    ));
}

#[test]
fn empty_names_are_ignored() {
    let fake = Arc::new(FakeInstaller::default());
    let resolver = resolver(fake.clone());
    assert_eq!(
        resolver.resolve(&DependencySpec::named("  "), None).unwrap(),
        Resolution::Skipped
    );
    assert!(fake.calls().is_empty());
}

#[test]
fn dependency_failure_stops_the_run_before_any_step() {
    let fake = Arc::new(FakeInstaller {
        fail_download: true,
        fail_install: true,
        ..FakeInstaller::default()
    });
    let collector = Arc::new(CollectingObserver::new());
    let engine = Engine::new(EngineConfig::default(), Arc::new(calc_backend()))
        .with_resolver(Arc::new(resolver(fake)))
        .with_observer(collector.clone());

    let mut project = project(vec![add(json!(1), json!(2), "x")]);
    project.requirements.push(DependencySpec::named("missing-lib"));
    let handle = engine.run(&project, BTreeMap::new()).unwrap();

    let Some(Outcome::Failed(failure)) = handle.wait_timeout(WAIT) else {
        panic!("expected failure");
    };
    assert!(failure.reason.contains("missing-lib"));
    assert!(collector.of_kind(EventKind::Code).is_empty());
    assert_eq!(collector.of_kind(EventKind::TaskError).len(), 1);
}
