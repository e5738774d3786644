//! Installer abstraction and registry.
//!
//! An [`Installer`] drives one package through its lifecycle — pre-check,
//! install, post-configure, verify — using the host-execution substrate and
//! the package's own playbook. Installers never talk to the event bus
//! directly; progress and log lines go through the [`TaskEmitter`] handed to
//! them in the [`InstallContext`].

pub mod java;
pub mod python;
pub mod zookeeper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{HostSpec, LogLevel, PackageSpec};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::executor::{HostExecutor, PlaybookEvent, PlaybookRequest, RunStatus};
use crate::model::TaskHandle;

pub use java::JavaInstaller;
pub use python::PythonInstaller;
pub use zookeeper::ZookeeperInstaller;

/// Install progress is capped here until the lifecycle finishes; the engine
/// sets 100 on completion.
const PROGRESS_CEILING: u8 = 90;

// ============================================================================
// Task emitter
// ============================================================================

/// Publishes progress and log lines for one task, updating the task's
/// progress field as a side effect.
#[derive(Clone)]
pub struct TaskEmitter {
    bus: EventBus,
    task: TaskHandle,
}

impl TaskEmitter {
    pub fn new(bus: EventBus, task: TaskHandle) -> Self {
        Self { bus, task }
    }

    /// Sets absolute progress (non-decreasing) and publishes it.
    pub fn progress(&self, percent: u8) {
        let (host, task_id, percent) = {
            let mut task = self.task.write();
            task.set_progress(percent);
            (task.host.name.clone(), task.id.clone(), task.progress)
        };
        self.bus.publish(Event::TaskProgress { host, task_id, percent });
    }

    /// Advances progress by `step`, staying under the install ceiling.
    pub fn bump(&self, step: u8) {
        let current = self.task.read().progress;
        self.progress(current.saturating_add(step).min(PROGRESS_CEILING));
    }

    /// Publishes one line of remote output attributed to the task.
    pub fn log(&self, level: LogLevel, line: impl Into<String>) {
        let (host, task_id) = {
            let task = self.task.read();
            (task.host.name.clone(), task.id.clone())
        };
        self.bus.publish(Event::TaskLog {
            host,
            task_id,
            level,
            line: line.into(),
        });
    }
}

// ============================================================================
// Install context
// ============================================================================

/// Everything an installer needs for one (host, package) task.
pub struct InstallContext<'a> {
    pub exec: &'a dyn HostExecutor,
    pub host: Arc<HostSpec>,
    pub pkg: Arc<PackageSpec>,
    /// Dry run: ask the runner for check mode and skip verification.
    pub check_mode: bool,
    pub cancel: CancellationToken,
    pub emitter: TaskEmitter,
}

impl InstallContext<'_> {
    /// The extra-vars every playbook receives.
    pub fn base_vars(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut vars = serde_json::Map::new();
        vars.insert("install_path".into(), self.pkg.install_path.display().to_string().into());
        vars.insert("version".into(), self.pkg.version.clone().into());
        vars.insert("source".into(), self.pkg.source.to_string().into());
        if let Some(source_path) = &self.pkg.source_path {
            vars.insert("source_path".into(), source_path.clone().into());
        }
        vars
    }

    /// Runs a playbook with the super credentials, streaming its task events
    /// into the emitter and honoring the package timeout.
    pub async fn run_playbook(
        &self,
        playbook: &str,
        extra_vars: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let emitter = self.emitter.clone();
        let mut req = PlaybookRequest::new(Arc::clone(&self.host), playbook);
        req.extra_vars = extra_vars;
        req.check_mode = self.check_mode;
        req.timeout = self.pkg.timeout_seconds().map(Duration::from_secs);
        req.cancel = self.cancel.clone();
        req.on_event = Some(Arc::new(move |event: PlaybookEvent| match event {
            PlaybookEvent::TaskStart { name } => emitter.log(LogLevel::Info, format!("TASK {name}")),
            PlaybookEvent::TaskOk { name } | PlaybookEvent::TaskChanged { name } => {
                emitter.bump(8);
                emitter.log(LogLevel::Debug, format!("ok: {name}"));
            }
            PlaybookEvent::TaskFailed { name, detail } => {
                emitter.log(LogLevel::Error, format!("failed: {name}: {detail}"));
            }
            PlaybookEvent::Unreachable { detail } => {
                emitter.log(LogLevel::Error, format!("unreachable: {detail}"));
            }
        }));

        let outcome = self.exec.run_playbook(req).await?;
        match outcome.status {
            RunStatus::Ok => Ok(()),
            RunStatus::Cancelled => Err(Error::Cancelled),
            RunStatus::Unreachable => {
                Err(Error::unreachable(&self.host.name, outcome.stderr_tail))
            }
            RunStatus::Failed => Err(Error::install_failed(
                &self.pkg.name,
                &self.host.name,
                outcome.stderr_tail,
            )),
        }
    }
}

// ============================================================================
// Installer trait
// ============================================================================

/// Verdict of an installer's package-specific pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Go ahead with the install.
    Proceed,
    /// Nothing to do (e.g. already installed at the right version); the task
    /// ends Skipped with this reason.
    Skip(String),
}

/// A package lifecycle driver.
#[async_trait]
pub trait Installer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the declared version string is one this installer can handle.
    fn supports_version(&self, version: &str) -> bool;

    /// Package-specific gating beyond the generic checker framework.
    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<Gate>;

    /// Runs the package's playbook. Must report progress at least at start
    /// and end, and observe `ctx.cancel`.
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()>;

    /// Optional post-install configuration.
    async fn post_config(&self, _ctx: &InstallContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Probes that the installed artifact exists at the expected version.
    async fn verify(&self, _ctx: &InstallContext<'_>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Maps package names to installers.
pub struct InstallerRegistry {
    installers: HashMap<String, Arc<dyn Installer>>,
}

impl InstallerRegistry {
    pub fn new() -> Self {
        Self {
            installers: HashMap::new(),
        }
    }

    /// The built-in set: java, python, zookeeper.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JavaInstaller));
        registry.register(Arc::new(PythonInstaller));
        registry.register(Arc::new(ZookeeperInstaller));
        registry
    }

    pub fn register(&mut self, installer: Arc<dyn Installer>) {
        self.installers.insert(installer.name().to_string(), installer);
    }

    /// Unknown names fail the task, not the run; the caller maps `None`.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Installer>> {
        self.installers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.installers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for InstallerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_by_name() {
        let registry = InstallerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["java", "python", "zookeeper"]);
        assert!(registry.resolve("java").is_some());
        assert!(registry.resolve("nginx").is_none());
    }

    #[test]
    fn version_predicates() {
        let registry = InstallerRegistry::with_builtins();
        let java = registry.resolve("java").unwrap();
        assert!(java.supports_version("11"));
        assert!(java.supports_version("1.8"));
        assert!(!java.supports_version("9"));

        let python = registry.resolve("python").unwrap();
        assert!(python.supports_version("2.7"));
        assert!(python.supports_version("3.12"));
        assert!(!python.supports_version("2.6"));

        let zookeeper = registry.resolve("zookeeper").unwrap();
        assert!(zookeeper.supports_version("3.8"));
        assert!(zookeeper.supports_version("3.6.3"));
        assert!(!zookeeper.supports_version("3.5"));
    }
}
