//! Task catalog for a deployment run.
//!
//! One [`Task`] exists per (host, package) pair, built from the configuration
//! at run start. A task is mutated only by the worker that owns its host;
//! everything else observes tasks through [`TaskView`] snapshots carried in
//! event payloads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{DeployConfig, HostSpec, PackageSpec};

/// Lifecycle state of a task. Transitions are monotonic: a terminal state is
/// never left, and `Running` never returns to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// True for `Completed`, `Failed`, and `Skipped`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// The unit of scheduling: install one package on one host.
#[derive(Debug, Clone)]
pub struct Task {
    /// `{host}_{package}_{version}`; unique because host names are unique
    /// and a host lists a package version at most once.
    pub id: String,
    pub host: Arc<HostSpec>,
    pub package: Arc<PackageSpec>,
    pub status: TaskStatus,
    /// 0..=100; reaches 100 exactly when the task completes.
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure or skip reason; empty on success.
    pub error: String,
}

impl Task {
    fn new(host: Arc<HostSpec>, package: Arc<PackageSpec>) -> Self {
        Self {
            id: format!("{}_{}_{}", host.name, package.name, package.version),
            host,
            package,
            status: TaskStatus::Pending,
            progress: 0,
            started_at: None,
            ended_at: None,
            error: String::new(),
        }
    }

    /// Pending -> Running.
    pub fn start(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Records progress; clamped to 0..=100 and never decreasing.
    pub fn set_progress(&mut self, percent: u8) {
        if self.status == TaskStatus::Running {
            self.progress = self.progress.max(percent.min(100));
        }
    }

    /// Running -> Completed.
    pub fn complete(&mut self) {
        if self.status == TaskStatus::Running {
            self.status = TaskStatus::Completed;
            self.progress = 100;
            self.ended_at = Some(Utc::now());
        }
    }

    /// Pending|Running -> Failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.status.is_terminal() {
            if self.status == TaskStatus::Pending {
                self.started_at = Some(Utc::now());
            }
            self.status = TaskStatus::Failed;
            self.error = error.into();
            self.ended_at = Some(Utc::now());
        }
    }

    /// Pending|Running -> Skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Skipped;
            self.error = reason.into();
            self.ended_at = Some(Utc::now());
        }
    }

    /// An immutable snapshot for event payloads.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            host: self.host.name.clone(),
            package: self.package.name.clone(),
            version: self.package.version.clone(),
            status: self.status,
            progress: self.progress,
            started_at: self.started_at,
            ended_at: self.ended_at,
            error: self.error.clone(),
        }
    }
}

/// Snapshot of a task at event time. Readers use this instead of the live
/// task struct, so no cross-worker locking is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub host: String,
    pub package: String,
    pub version: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Aggregate task counts for a host or for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TaskStats {
    pub(crate) fn add(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
        }
    }

    /// True when every task reached a terminal state.
    pub fn settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Shared handle to one task. The owning host worker takes the write lock;
/// everyone else only reads.
pub type TaskHandle = Arc<RwLock<Task>>;

/// All tasks of a run, in declaration order.
#[derive(Clone, Default)]
pub struct TaskSet {
    tasks: IndexMap<String, TaskHandle>,
    by_host: IndexMap<String, Vec<TaskHandle>>,
    hosts: Vec<Arc<HostSpec>>,
}

impl TaskSet {
    /// Builds the catalog from a validated configuration. Task order within
    /// a host equals the order declared in the config.
    pub fn build(config: &DeployConfig) -> Self {
        let mut set = TaskSet::default();
        for node in &config.nodes {
            let host = Arc::new(node.clone());
            set.hosts.push(Arc::clone(&host));
            let entry = set.by_host.entry(host.name.clone()).or_default();
            for pkg in &node.install {
                let task = Task::new(Arc::clone(&host), Arc::new(pkg.clone()));
                let handle: TaskHandle = Arc::new(RwLock::new(task));
                let id = handle.read().id.clone();
                entry.push(Arc::clone(&handle));
                set.tasks.insert(id, handle);
            }
        }
        set
    }

    pub fn get(&self, id: &str) -> Option<TaskHandle> {
        self.tasks.get(id).cloned()
    }

    /// Tasks for one host, in declaration order.
    pub fn by_host(&self, name: &str) -> Vec<TaskHandle> {
        self.by_host.get(name).cloned().unwrap_or_default()
    }

    /// Hosts in declaration order. Hosts with an empty install list are
    /// included; they still emit host start/complete events.
    pub fn hosts(&self) -> &[Arc<HostSpec>] {
        &self.hosts
    }

    pub fn all(&self) -> Vec<TaskHandle> {
        self.tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Aggregate counts over every task.
    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.tasks.values() {
            stats.add(task.read().status);
        }
        stats
    }

    /// Aggregate counts over one host's tasks.
    pub fn host_stats(&self, name: &str) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.by_host(name) {
            stats.add(task.read().status);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use pretty_assertions::assert_eq;

    fn two_host_config() -> DeployConfig {
        DeployConfig::from_yaml(
            r#"
general: { data_dir: /tmp/r }
log: { dir: /tmp/r/log }
nodes:
  - name: h1
    host: 10.0.0.1
    owner_user: u
    owner_pass: p
    install:
      - { name: java, version: "11", install_path: /opt/java }
      - { name: python, version: "3.9", install_path: /opt/python }
  - name: h2
    host: 10.0.0.2
    owner_user: u
    owner_pass: p
    install:
      - { name: zookeeper, version: "3.8", install_path: /opt/zk, source: url, source_path: x }
"#,
        )
        .unwrap()
    }

    #[test]
    fn build_preserves_declaration_order() {
        let set = TaskSet::build(&two_host_config());
        assert_eq!(set.len(), 3);
        let ids: Vec<_> = set.by_host("h1").iter().map(|t| t.read().id.clone()).collect();
        assert_eq!(ids, vec!["h1_java_11", "h1_python_3.9"]);
        let hosts: Vec<_> = set.hosts().iter().map(|h| h.name.clone()).collect();
        assert_eq!(hosts, vec!["h1", "h2"]);
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let set = TaskSet::build(&two_host_config());
        let handle = set.get("h1_java_11").unwrap();
        {
            let mut task = handle.write();
            task.start();
            assert_eq!(task.status, TaskStatus::Running);
            assert!(task.started_at.is_some());
            task.complete();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.progress, 100);
            assert!(task.ended_at.is_some());

            // Terminal states never regress.
            task.start();
            task.fail("late failure");
            assert_eq!(task.status, TaskStatus::Completed);
            assert!(task.error.is_empty());
        }
    }

    #[test]
    fn skip_from_pending_sets_reason_without_start() {
        let set = TaskSet::build(&two_host_config());
        let handle = set.get("h1_python_3.9").unwrap();
        let mut task = handle.write();
        task.skip("previous task failed");
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(task.error, "previous task failed");
        assert!(task.started_at.is_none());
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn progress_is_clamped_and_non_decreasing() {
        let set = TaskSet::build(&two_host_config());
        let handle = set.get("h2_zookeeper_3.8").unwrap();
        let mut task = handle.write();
        task.start();
        task.set_progress(40);
        task.set_progress(20);
        assert_eq!(task.progress, 40);
        task.set_progress(200);
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn stats_sum_to_total() {
        let set = TaskSet::build(&two_host_config());
        set.get("h1_java_11").unwrap().write().start();
        set.get("h1_python_3.9").unwrap().write().skip("x");
        let stats = set.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(
            stats.pending + stats.running + stats.completed + stats.failed + stats.skipped,
            stats.total
        );
        assert_eq!(stats.running, 1);
        assert_eq!(stats.skipped, 1);
        assert!(!stats.settled());

        let h1 = set.host_stats("h1");
        assert_eq!(h1.total, 2);
    }
}
