//! Shared test harness: a scripted in-memory [`HostExecutor`] plus helpers
//! for building engines and draining event streams.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use rollout::checker::CheckerManager;
use rollout::config::DeployConfig;
use rollout::engine::{DeployEngine, RunContext};
use rollout::error::Result;
use rollout::event::{Event, EventBus, Redactor, Subscription};
use rollout::executor::{
    HostExecutor, PlaybookEvent, PlaybookRequest, ProbeResult, ProbeSpec, RunOutcome, RunStats,
    RunStatus,
};
use rollout::installer::InstallerRegistry;
use rollout::model::TaskSet;

// ============================================================================
// Scripted executor
// ============================================================================

/// Per-host behavior knobs for the scripted executor.
#[derive(Debug, Clone, Default)]
pub struct HostBehavior {
    /// Every contact with this host fails at the connection layer.
    pub unreachable: bool,
    /// Playbooks (by file name) that report a task failure.
    pub failing_playbooks: Vec<String>,
    /// How long each playbook run takes.
    pub install_delay: Duration,
    /// Stderr tail attached to failing playbooks.
    pub failure_stderr: String,
}

/// In-memory [`HostExecutor`] driven by [`HostBehavior`] scripts.
///
/// Successful playbook runs record the package as installed, so subsequent
/// version probes (installer pre-check and verify) see it.
#[derive(Default)]
pub struct ScriptedExecutor {
    behaviors: RwLock<HashMap<String, HostBehavior>>,
    installed: RwLock<HashMap<String, HashMap<String, String>>>,
    /// (host, playbook, check_mode) per run_playbook call.
    pub playbook_calls: Mutex<Vec<(String, String, bool)>>,
    /// (host, module) per probe call.
    pub probe_calls: Mutex<Vec<(String, String)>>,
    /// Set when a cancel signal reached an in-flight playbook run.
    pub cancel_observed: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(self, host: &str, behavior: HostBehavior) -> Self {
        self.behaviors.write().insert(host.to_string(), behavior);
        self
    }

    pub fn mark_installed(&self, host: &str, package: &str, version: &str) {
        self.installed
            .write()
            .entry(host.to_string())
            .or_default()
            .insert(package.to_string(), version.to_string());
    }

    fn behavior(&self, host: &str) -> HostBehavior {
        self.behaviors.read().get(host).cloned().unwrap_or_default()
    }

    fn installed_version(&self, host: &str, package: &str) -> Option<String> {
        self.installed.read().get(host)?.get(package).cloned()
    }

    fn version_probe_reply(&self, host: &str, args: &str) -> Option<ProbeResult> {
        if args.contains("java -version") {
            return Some(match self.installed_version(host, "java") {
                Some(v) => {
                    let banner = if v == "8" || v == "1.8" {
                        "java version \"1.8.0_292\"".to_string()
                    } else {
                        format!("openjdk version \"{v}.0.1\"")
                    };
                    ProbeResult::success(banner)
                }
                None => ProbeResult::failure(127, "java: command not found"),
            });
        }
        if args.contains("/bin/python") {
            return Some(match self.installed_version(host, "python") {
                Some(v) => {
                    let full = if v.matches('.').count() >= 2 {
                        v
                    } else {
                        format!("{v}.2")
                    };
                    ProbeResult::success(format!("Python {full}"))
                }
                None => ProbeResult::failure(127, "python: command not found"),
            });
        }
        if args.contains("zkServer.sh") {
            return Some(match self.installed_version(host, "zookeeper") {
                Some(v) => ProbeResult::success(format!("Apache ZooKeeper, version {v}.0")),
                None => ProbeResult::failure(127, "zkServer.sh: not found"),
            });
        }
        None
    }
}

#[async_trait]
impl HostExecutor for ScriptedExecutor {
    async fn probe(
        &self,
        host: &rollout::config::HostSpec,
        probe: &ProbeSpec,
    ) -> Result<ProbeResult> {
        self.probe_calls
            .lock()
            .push((host.name.clone(), probe.module.clone()));

        if self.behavior(&host.name).unreachable {
            return Ok(ProbeResult::unreachable(
                "ssh: connect to host: Connection refused",
            ));
        }

        let args = probe.args.as_deref().unwrap_or("");
        if let Some(reply) = self.version_probe_reply(&host.name, args) {
            return Ok(reply);
        }

        Ok(match probe.module.as_str() {
            "ping" => {
                let mut result = ProbeResult::success("");
                result.facts.insert("ping".into(), "pong".into());
                result
            }
            "setup" => {
                let mut result = ProbeResult::success("");
                result.facts.insert(
                    "ansible_facts".into(),
                    serde_json::json!({
                        "ansible_distribution": "Ubuntu",
                        "ansible_distribution_version": "22.04",
                        "ansible_kernel": "5.15.0",
                        "ansible_processor_vcpus": 4,
                        "ansible_memtotal_mb": 7936,
                    }),
                );
                result
            }
            "shell" if args.contains("df -Pm") => {
                ProbeResult::success("/dev/sda1 204800 102400 102400 50% /opt")
            }
            "shell" if args.contains("MemAvailable") => {
                ProbeResult::success("MemAvailable:    2097152 kB")
            }
            "shell" if args.contains("ss -ltn") => {
                ProbeResult::success("LISTEN 0 128 0.0.0.0:22 0.0.0.0:*")
            }
            "shell" if args.contains("command -v") => ProbeResult::success("/usr/bin/apt-get"),
            "shell" if args.contains("id -u") => ProbeResult::success("0"),
            _ => ProbeResult::success(""),
        })
    }

    async fn run_playbook(&self, req: PlaybookRequest) -> Result<RunOutcome> {
        let host = req.host.name.clone();
        self.playbook_calls
            .lock()
            .push((host.clone(), req.playbook.clone(), req.check_mode));

        let behavior = self.behavior(&host);
        if behavior.unreachable {
            return Ok(RunOutcome {
                status: RunStatus::Unreachable,
                stderr_tail: "ssh: connect to host: Connection refused".into(),
                stats: RunStats {
                    unreachable: 1,
                    ..Default::default()
                },
            });
        }

        if let Some(on_event) = &req.on_event {
            on_event(PlaybookEvent::TaskStart {
                name: "Gathering Facts".into(),
            });
            on_event(PlaybookEvent::TaskOk {
                name: "Gathering Facts".into(),
            });
        }

        if !behavior.install_delay.is_zero() {
            // Honor the per-call deadline the way the real adapter does.
            let deadline = req.timeout.unwrap_or(Duration::MAX);
            tokio::select! {
                _ = req.cancel.cancelled() => {
                    self.cancel_observed.store(true, Ordering::SeqCst);
                    return Ok(RunOutcome {
                        status: RunStatus::Cancelled,
                        stderr_tail: String::new(),
                        stats: RunStats::default(),
                    });
                }
                _ = tokio::time::sleep(behavior.install_delay) => {}
                _ = tokio::time::sleep(deadline), if deadline < behavior.install_delay => {
                    return Err(rollout::error::Error::Timeout {
                        host: host.clone(),
                        timeout_secs: deadline.as_secs(),
                    });
                }
            }
        }

        if behavior.failing_playbooks.iter().any(|p| p == &req.playbook) {
            if let Some(on_event) = &req.on_event {
                on_event(PlaybookEvent::TaskFailed {
                    name: "install".into(),
                    detail: behavior.failure_stderr.clone(),
                });
            }
            return Ok(RunOutcome {
                status: RunStatus::Failed,
                stderr_tail: behavior.failure_stderr.clone(),
                stats: RunStats {
                    failed: 1,
                    ..Default::default()
                },
            });
        }

        if let Some(on_event) = &req.on_event {
            on_event(PlaybookEvent::TaskChanged {
                name: "install".into(),
            });
        }

        // Only a real (non-check) run mutates the "target".
        if !req.check_mode {
            if let Some(version) = req.extra_vars.get("version").and_then(|v| v.as_str()) {
                let package = req
                    .playbook
                    .trim_end_matches("_post.yml")
                    .trim_end_matches(".yml");
                self.mark_installed(&host, package, version);
            }
        }

        Ok(RunOutcome {
            status: RunStatus::Ok,
            stderr_tail: String::new(),
            stats: RunStats {
                ok: 2,
                changed: 1,
                ..Default::default()
            },
        })
    }
}

// ============================================================================
// Engine rig
// ============================================================================

/// A ready-to-run engine with its bus and a pre-registered subscriber.
pub struct TestRig {
    pub engine: DeployEngine,
    pub bus: EventBus,
    pub exec: Arc<ScriptedExecutor>,
    pub subscription: Subscription,
}

pub fn config_with_nodes(nodes_yaml: &str) -> DeployConfig {
    let yaml = format!(
        "general: {{ data_dir: /tmp/rollout-test }}\nlog: {{ dir: /tmp/rollout-test/log }}\nnodes:\n{nodes_yaml}"
    );
    DeployConfig::from_yaml(&yaml).expect("test config must parse")
}

pub fn rig(config: &DeployConfig, exec: ScriptedExecutor) -> TestRig {
    rig_with(config, exec, false, InstallerRegistry::with_builtins())
}

pub fn rig_with(
    config: &DeployConfig,
    exec: ScriptedExecutor,
    dry_run: bool,
    registry: InstallerRegistry,
) -> TestRig {
    rig_arc(config, Arc::new(exec), dry_run, registry)
}

/// Like [`rig_with`] but shares an existing executor, for multi-run tests.
pub fn rig_arc(
    config: &DeployConfig,
    exec: Arc<ScriptedExecutor>,
    dry_run: bool,
    registry: InstallerRegistry,
) -> TestRig {
    let bus = EventBus::new(Redactor::new(config.secrets()));
    let subscription = bus.subscribe();
    let ctx = RunContext::new(
        config.general.data_dir.clone(),
        config.general.data_dir.join("run/test"),
        config.general.max_concurrent_nodes,
        dry_run,
        bus.clone(),
    );
    let engine = DeployEngine::new(
        ctx,
        TaskSet::build(config),
        Arc::new(CheckerManager::with_defaults()),
        Arc::new(registry),
        Arc::clone(&exec) as Arc<dyn HostExecutor>,
    );
    TestRig {
        engine,
        bus,
        exec,
        subscription,
    }
}

/// Drains a subscription until the bus closes.
pub async fn collect_events(mut subscription: Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = subscription.recv().await {
        events.push(event);
    }
    events
}

/// Event positions by type for ordering assertions.
pub fn positions_of(events: &[Event], event_type: &str) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.event_type() == event_type)
        .map(|(i, _)| i)
        .collect()
}

/// Terminal event kinds per task id, in emission order.
pub fn terminal_events(events: &[Event]) -> HashMap<String, Vec<&'static str>> {
    let mut map: HashMap<String, Vec<&'static str>> = HashMap::new();
    for event in events {
        match event {
            Event::TaskCompleted { task } => {
                map.entry(task.id.clone()).or_default().push("completed")
            }
            Event::TaskFailed { task, .. } => map.entry(task.id.clone()).or_default().push("failed"),
            Event::TaskSkipped { task, .. } => {
                map.entry(task.id.clone()).or_default().push("skipped")
            }
            _ => {}
        }
    }
    map
}

/// All task ids named anywhere in the event stream.
pub fn task_ids(events: &[Event]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for event in events {
        match event {
            Event::TaskStart { task }
            | Event::TaskCompleted { task }
            | Event::TaskFailed { task, .. }
            | Event::TaskSkipped { task, .. } => {
                ids.insert(task.id.clone());
            }
            Event::CheckCompleted { task_id, .. }
            | Event::TaskProgress { task_id, .. }
            | Event::TaskLog { task_id, .. } => {
                ids.insert(task_id.clone());
            }
            _ => {}
        }
    }
    ids
}
