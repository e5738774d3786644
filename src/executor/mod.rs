//! Host execution substrate.
//!
//! Everything that touches a remote host goes through the [`HostExecutor`]
//! trait: single-shot read-only probes for the checker framework, and named
//! playbook runs for the installers. The production implementation wraps an
//! Ansible-style automation runner invoked as a subprocess; tests substitute
//! an in-memory stub.

pub mod ansible;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{CredentialKind, HostSpec};
use crate::error::Result;

pub use ansible::AnsibleExecutor;

/// Default deadline for probes. Installs are uncapped unless the package
/// config supplies one.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Probes
// ============================================================================

/// A short read-only remote invocation (module + arguments).
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    /// Runner module to invoke (`ping`, `shell`, `setup`, ...).
    pub module: String,
    /// Module arguments, if any.
    pub args: Option<String>,
    /// Which credential bundle to connect with.
    pub credential: CredentialKind,
    pub timeout: Duration,
}

impl ProbeSpec {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            args: None,
            credential: CredentialKind::Owner,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// A `shell` probe running the given command line.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("shell").with_args(command)
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn as_super(mut self) -> Self {
        self.credential = CredentialKind::Super;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of a probe that the runner actually executed.
///
/// `Err` from [`HostExecutor::probe`] means the probe could not run at all
/// (runner missing, local I/O failure, timeout); an unreachable target is an
/// `Ok` result with [`ProbeResult::unreachable`] set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Remote command succeeded.
    pub ok: bool,
    /// Connect or auth failure before the module ran.
    pub unreachable: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Structured facts parsed from the module reply, when it returned JSON.
    #[serde(default)]
    pub facts: serde_json::Map<String, serde_json::Value>,
}

impl ProbeResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            exit_code: 0,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            unreachable: true,
            exit_code: -1,
            stderr: detail.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Playbook runs
// ============================================================================

/// Streaming events surfaced while a playbook runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybookEvent {
    TaskStart { name: String },
    TaskOk { name: String },
    TaskChanged { name: String },
    TaskFailed { name: String, detail: String },
    Unreachable { detail: String },
}

/// Callback receiving [`PlaybookEvent`]s as the runner emits them.
pub type PlaybookEventFn = Arc<dyn Fn(PlaybookEvent) + Send + Sync>;

/// One playbook invocation against one host.
#[derive(Clone)]
pub struct PlaybookRequest {
    pub host: Arc<HostSpec>,
    /// Playbook file name, resolved against the runner's playbook directory.
    pub playbook: String,
    /// Extra variables handed to the playbook (`install_path`, `version`,
    /// `source`, `source_path`, plus installer-specific keys).
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    pub credential: CredentialKind,
    /// Ask the runner for check/no-op mode (dry runs).
    pub check_mode: bool,
    /// Overall deadline; `None` means uncapped.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub on_event: Option<PlaybookEventFn>,
}

impl PlaybookRequest {
    pub fn new(host: Arc<HostSpec>, playbook: impl Into<String>) -> Self {
        Self {
            host,
            playbook: playbook.into(),
            extra_vars: serde_json::Map::new(),
            credential: CredentialKind::Super,
            check_mode: false,
            timeout: None,
            cancel: CancellationToken::new(),
            on_event: None,
        }
    }

    fn emit(&self, event: PlaybookEvent) {
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }
}

/// Terminal status of a playbook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
    Unreachable,
    Cancelled,
}

/// Per-run task counters from the runner's recap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub ok: u32,
    pub changed: u32,
    pub failed: u32,
    pub unreachable: u32,
}

/// Result of a playbook invocation that ran to a terminal state.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Last portion of captured stderr, for failure reporting.
    pub stderr_tail: String,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}

// ============================================================================
// The trait
// ============================================================================

/// Adapter to the remote-automation engine. Implementations are stateless
/// per call and must tolerate concurrent calls from different host workers.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Runs a single ad-hoc module invocation against one host.
    async fn probe(&self, host: &HostSpec, probe: &ProbeSpec) -> Result<ProbeResult>;

    /// Runs a named playbook against one host, streaming task events to
    /// `req.on_event` and honoring `req.cancel`.
    async fn run_playbook(&self, req: PlaybookRequest) -> Result<RunOutcome>;
}
