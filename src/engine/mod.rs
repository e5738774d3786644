//! Deployment engine: bounded worker pool with per-host serial pipelines.
//!
//! One worker per host runs that host's tasks in declaration order; a
//! semaphore bounds how many hosts run at once. Within a host the first
//! failure breaks the pipeline and the remaining tasks are skipped
//! (downstream installs may depend on earlier ones); across hosts nothing
//! is shared, so one misbehaving host never affects another. Pause is a
//! barrier honored between tasks only; cancellation is cooperative and
//! reaches into in-flight playbook runs.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checker::CheckerManager;
use crate::config::HostSpec;
use crate::error::Error;
use crate::event::{Event, EventBus, Subscription};
use crate::executor::HostExecutor;
use crate::installer::{Gate, InstallContext, InstallerRegistry, TaskEmitter};
use crate::model::{TaskHandle, TaskSet, TaskStats, TaskStatus, TaskView};

/// Skip reason for tasks behind a failed one in the same host pipeline.
const SKIP_PREVIOUS_FAILED: &str = "previous task failed";

/// Skip reason for tasks queued at cancellation time.
const SKIP_CANCELLED: &str = "cancelled";

// ============================================================================
// Run context
// ============================================================================

/// Global state of one run: directories, limits, the control signals, and
/// the event publisher. Immutable after start except the signals.
pub struct RunContext {
    pub data_dir: PathBuf,
    /// Per-run artifact root: `data_dir/run/<timestamp>`.
    pub run_dir: PathBuf,
    pub max_concurrent_nodes: usize,
    pub dry_run: bool,
    pub cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    pub bus: EventBus,
}

impl RunContext {
    pub fn new(
        data_dir: PathBuf,
        run_dir: PathBuf,
        max_concurrent_nodes: usize,
        dry_run: bool,
        bus: EventBus,
    ) -> Arc<Self> {
        let (pause_tx, _) = watch::channel(false);
        Arc::new(Self {
            data_dir,
            run_dir,
            max_concurrent_nodes: max_concurrent_nodes.max(1),
            dry_run,
            cancel: CancellationToken::new(),
            pause_tx,
            bus,
        })
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Idempotent and safe from any thread.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }
}

/// Cloneable control surface over a running engine, for front-ends.
#[derive(Clone)]
pub struct EngineHandle {
    ctx: Arc<RunContext>,
}

impl EngineHandle {
    pub fn pause(&self) {
        self.ctx.pause();
    }

    pub fn resume(&self) {
        self.ctx.resume();
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn subscribe(&self) -> Subscription {
        self.ctx.bus.subscribe()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Final state of one host pipeline.
#[derive(Debug, Clone)]
pub struct HostReport {
    pub host: String,
    /// The host could not be contacted at all.
    pub unreachable: bool,
    pub stats: TaskStats,
    pub tasks: Vec<TaskView>,
}

/// Final state of the whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: TaskStats,
    pub hosts: Vec<HostReport>,
    pub cancelled: bool,
}

impl RunReport {
    /// CLI exit code: 0 all completed, 2 every host unreachable, 3 task
    /// failures, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            4
        } else if !self.hosts.is_empty() && self.hosts.iter().all(|h| h.unreachable) {
            2
        } else if self.stats.failed > 0 {
            3
        } else {
            0
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code() == 0
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Orchestrates one deployment run.
pub struct DeployEngine {
    ctx: Arc<RunContext>,
    tasks: TaskSet,
    checkers: Arc<CheckerManager>,
    registry: Arc<InstallerRegistry>,
    exec: Arc<dyn HostExecutor>,
    semaphore: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<HostReport>>>,
    started: AtomicBool,
}

impl DeployEngine {
    pub fn new(
        ctx: Arc<RunContext>,
        tasks: TaskSet,
        checkers: Arc<CheckerManager>,
        registry: Arc<InstallerRegistry>,
        exec: Arc<dyn HostExecutor>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(ctx.max_concurrent_nodes));
        Self {
            ctx,
            tasks,
            checkers,
            registry,
            exec,
            semaphore,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    pub fn pause(&self) {
        self.ctx.pause();
    }

    pub fn resume(&self) {
        self.ctx.resume();
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Submits one worker per host and returns immediately.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let hosts = self.tasks.hosts().to_vec();
        info!(hosts = hosts.len(), tasks = self.tasks.len(), "starting deployment run");
        self.ctx.bus.publish(Event::RunStart {
            hosts: hosts.iter().map(|h| h.name.clone()).collect(),
            total_tasks: self.tasks.len(),
        });

        let mut workers = self.workers.lock();
        for host in hosts {
            let worker = HostWorker {
                ctx: Arc::clone(&self.ctx),
                host: Arc::clone(&host),
                tasks: self.tasks.by_host(&host.name),
                checkers: Arc::clone(&self.checkers),
                registry: Arc::clone(&self.registry),
                exec: Arc::clone(&self.exec),
            };
            let semaphore = Arc::clone(&self.semaphore);
            workers.push(tokio::spawn(async move {
                // Closed only on engine drop; a closed pool means shutdown.
                let _permit = semaphore.acquire_owned().await;
                worker.run().await
            }));
        }
    }

    /// Blocks until every worker finished, then publishes the final stats
    /// and closes the bus. Idempotent only in the sense that a second call
    /// returns an empty-host report.
    pub async fn wait(&self) -> RunReport {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let mut hosts = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => hosts.push(report),
                // Workers catch their own panics; a join error here means
                // the runtime tore the task down.
                Err(e) => error!(error = %e, "host worker aborted"),
            }
        }

        let stats = self.tasks.stats();
        self.ctx.bus.publish(Event::RunComplete { stats });
        self.ctx.bus.close();
        RunReport {
            stats,
            hosts,
            cancelled: self.ctx.cancel.is_cancelled(),
        }
    }
}

// ============================================================================
// Host worker
// ============================================================================

/// Outcome of one task's lifecycle, before it is applied to the task struct.
enum TaskOutcome {
    Completed,
    Skipped(String),
    Failed { error: String, unreachable: bool },
}

struct HostWorker {
    ctx: Arc<RunContext>,
    host: Arc<HostSpec>,
    tasks: Vec<TaskHandle>,
    checkers: Arc<CheckerManager>,
    registry: Arc<InstallerRegistry>,
    exec: Arc<dyn HostExecutor>,
}

impl HostWorker {
    async fn run(self) -> HostReport {
        let host_name = self.host.name.clone();
        self.ctx.bus.publish(Event::HostStart {
            host: host_name.clone(),
        });

        // Errors never cross the worker boundary: a panicking pipeline fails
        // its current task, skips the rest, and the pool keeps draining.
        let unreachable = match AssertUnwindSafe(self.run_pipeline()).catch_unwind().await {
            Ok(unreachable) => unreachable,
            Err(panic) => {
                self.abort_after_panic(&panic_message(&panic));
                false
            }
        };

        let stats = host_tasks_stats(&self.tasks);
        self.ctx.bus.publish(Event::HostComplete {
            host: host_name.clone(),
            stats,
        });
        HostReport {
            host: host_name,
            unreachable,
            stats,
            tasks: self.tasks.iter().map(|t| t.read().view()).collect(),
        }
    }

    /// Runs the host's tasks serially; returns whether the host turned out
    /// to be unreachable.
    async fn run_pipeline(&self) -> bool {
        let mut pause_rx = self.ctx.pause_rx();
        let mut unreachable = false;
        let mut break_reason: Option<String> = None;

        for handle in &self.tasks {
            // Cancellation wins over fail-fast for the skip reason.
            if self.ctx.cancel.is_cancelled() {
                self.skip_task(handle, SKIP_CANCELLED.to_string());
                continue;
            }
            if let Some(reason) = &break_reason {
                self.skip_task(handle, reason.clone());
                continue;
            }

            // Pause barrier: honored between tasks, never mid-task.
            pause_point(&mut pause_rx, &self.ctx.cancel).await;
            if self.ctx.cancel.is_cancelled() {
                self.skip_task(handle, SKIP_CANCELLED.to_string());
                continue;
            }

            let view = {
                let mut task = handle.write();
                task.start();
                task.view()
            };
            debug!(task = %view.id, "task started");
            self.ctx.bus.publish(Event::TaskStart { task: view });

            match self.run_task(handle).await {
                TaskOutcome::Completed => {
                    let view = {
                        let mut task = handle.write();
                        task.complete();
                        task.view()
                    };
                    self.ctx.bus.publish(Event::TaskCompleted { task: view });
                }
                TaskOutcome::Skipped(reason) => {
                    // Installer pre-check skip: move on to the next task.
                    self.skip_task(handle, reason);
                }
                TaskOutcome::Failed { error, unreachable: u } => {
                    unreachable |= u;
                    let view = {
                        let mut task = handle.write();
                        task.fail(error.clone());
                        task.view()
                    };
                    self.ctx.bus.publish(Event::TaskFailed { task: view, error });
                    break_reason = Some(SKIP_PREVIOUS_FAILED.to_string());
                }
            }
        }
        unreachable
    }

    /// Checker gate, then the installer lifecycle with a cancellation check
    /// between phases.
    async fn run_task(&self, handle: &TaskHandle) -> TaskOutcome {
        let (task_id, pkg) = {
            let task = handle.read();
            (task.id.clone(), Arc::clone(&task.package))
        };

        let results = self.checkers.run_all(self.exec.as_ref(), &self.host, &pkg).await;
        let mut unreachable = false;
        for result in &results {
            if result.check_name == "connectivity" && result.is_gating() {
                unreachable = true;
            }
            self.ctx.bus.publish(Event::CheckCompleted {
                host: self.host.name.clone(),
                task_id: task_id.clone(),
                result: result.clone(),
            });
        }
        if CheckerManager::has_errors(&results) {
            return TaskOutcome::Failed {
                error: CheckerManager::error_summary(&results),
                unreachable,
            };
        }

        let Some(installer) = self.registry.resolve(&pkg.name) else {
            return TaskOutcome::Failed {
                error: Error::InstallerNotFound(pkg.name.clone()).to_string(),
                unreachable: false,
            };
        };
        if !installer.supports_version(&pkg.version) {
            return TaskOutcome::Failed {
                error: Error::UnsupportedVersion {
                    installer: pkg.name.clone(),
                    version: pkg.version.clone(),
                }
                .to_string(),
                unreachable: false,
            };
        }

        let ictx = InstallContext {
            exec: self.exec.as_ref(),
            host: Arc::clone(&self.host),
            pkg: Arc::clone(&pkg),
            check_mode: self.ctx.dry_run,
            cancel: self.ctx.cancel.clone(),
            emitter: TaskEmitter::new(self.ctx.bus.clone(), Arc::clone(handle)),
        };

        match installer.pre_check(&ictx).await {
            Ok(Gate::Skip(reason)) => return TaskOutcome::Skipped(reason),
            Ok(Gate::Proceed) => {}
            Err(e) => return failed_outcome(&e),
        }

        for phase in [InstallPhase::Install, InstallPhase::PostConfig, InstallPhase::Verify] {
            if self.ctx.cancel.is_cancelled() {
                return TaskOutcome::Failed {
                    error: SKIP_CANCELLED.to_string(),
                    unreachable: false,
                };
            }
            let result = match phase {
                InstallPhase::Install => installer.install(&ictx).await,
                InstallPhase::PostConfig => installer.post_config(&ictx).await,
                InstallPhase::Verify => installer.verify(&ictx).await,
            };
            if let Err(e) = result {
                return failed_outcome(&e);
            }
        }
        TaskOutcome::Completed
    }

    fn skip_task(&self, handle: &TaskHandle, reason: String) {
        let view = {
            let mut task = handle.write();
            task.skip(reason.clone());
            task.view()
        };
        self.ctx.bus.publish(Event::TaskSkipped { task: view, reason });
    }

    /// Applies the internal-error policy after a caught panic.
    fn abort_after_panic(&self, message: &str) {
        error!(host = %self.host.name, message, "host pipeline panicked");
        for handle in &self.tasks {
            let status = handle.read().status;
            if status == TaskStatus::Running {
                let error = format!("internal error: {message}");
                let view = {
                    let mut task = handle.write();
                    task.fail(error.clone());
                    task.view()
                };
                self.ctx.bus.publish(Event::TaskFailed { task: view, error });
            } else if status == TaskStatus::Pending {
                self.skip_task(handle, "aborted after internal error".to_string());
            }
        }
    }
}

enum InstallPhase {
    Install,
    PostConfig,
    Verify,
}

fn failed_outcome(error: &Error) -> TaskOutcome {
    TaskOutcome::Failed {
        error: error.task_reason(),
        unreachable: error.is_unreachable(),
    }
}

fn host_tasks_stats(tasks: &[TaskHandle]) -> TaskStats {
    let mut stats = TaskStats::default();
    for task in tasks {
        stats.add(task.read().status);
    }
    stats
}

/// Blocks while the run is paused; cancellation breaks out immediately.
async fn pause_point(rx: &mut watch::Receiver<bool>, cancel: &CancellationToken) {
    while *rx.borrow() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
