//! Pre-install validation framework.
//!
//! A [`Checker`] runs one read-only probe against a (host, package) pair and
//! reports a [`CheckResult`] with a severity. The [`CheckerManager`] runs a
//! fixed ordered set of them sequentially per host (they are cheap, and
//! stable ordering aids debugging); hosts themselves run in parallel. Only
//! failed Error-level results gate an install; warnings surface through the
//! event stream but do not block.

pub mod connectivity;
pub mod disk_space;
pub mod memory;
pub mod package_manager;
pub mod port;
pub mod sudo;
pub mod system_info;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{HostSpec, PackageSpec};
use crate::error::Error;
use crate::executor::HostExecutor;

pub use connectivity::ConnectivityCheck;
pub use disk_space::DiskSpaceCheck;
pub use memory::MemoryCheck;
pub use package_manager::PackageManagerCheck;
pub use port::PortAvailabilityCheck;
pub use sudo::SudoPrivilegeCheck;
pub use system_info::SystemInfoCheck;

/// Severity of a check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    Info,
    Warning,
    Error,
}

/// Outcome of one checker against one (host, package) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub level: CheckLevel,
    pub passed: bool,
    pub message: String,
    /// Structured facts attached by the checker.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl CheckResult {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            check_name: name.to_string(),
            level: CheckLevel::Info,
            passed: true,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn fail(name: &str, level: CheckLevel, message: impl Into<String>) -> Self {
        Self {
            check_name: name.to_string(),
            level,
            passed: false,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// A checker whose probe could not execute at all. Downgraded to a
    /// failed Warning: it surfaces but does not gate by itself.
    pub fn probe_error(name: &str, error: &Error) -> Self {
        Self::fail(name, CheckLevel::Warning, format!("check could not execute: {error}"))
    }

    pub fn with_details(mut self, details: serde_json::Map<String, serde_json::Value>) -> Self {
        self.details = details;
        self
    }

    /// True when this result blocks the install.
    pub fn is_gating(&self) -> bool {
        self.level == CheckLevel::Error && !self.passed
    }
}

/// One composable pre-install probe.
#[async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        pkg: &PackageSpec,
    ) -> CheckResult;
}

/// Runs the fixed set of checkers in order.
pub struct CheckerManager {
    checkers: Vec<Arc<dyn Checker>>,
}

impl CheckerManager {
    /// The default check sequence: connectivity first (everything else is
    /// pointless on an unreachable host), then resources, then privileges.
    pub fn with_defaults() -> Self {
        Self {
            checkers: vec![
                Arc::new(ConnectivityCheck),
                Arc::new(DiskSpaceCheck),
                Arc::new(MemoryCheck),
                Arc::new(PortAvailabilityCheck),
                Arc::new(SystemInfoCheck),
                Arc::new(PackageManagerCheck),
                Arc::new(SudoPrivilegeCheck),
            ],
        }
    }

    /// A manager with an explicit checker set, for tests and embedders.
    pub fn new(checkers: Vec<Arc<dyn Checker>>) -> Self {
        Self { checkers }
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    /// Runs every checker sequentially and returns all results.
    pub async fn run_all(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        pkg: &PackageSpec,
    ) -> Vec<CheckResult> {
        let mut results = Vec::with_capacity(self.checkers.len());
        for checker in &self.checkers {
            results.push(checker.check(exec, host, pkg).await);
        }
        results
    }

    /// True iff any result is a failed Error.
    pub fn has_errors(results: &[CheckResult]) -> bool {
        results.iter().any(CheckResult::is_gating)
    }

    /// Joined messages of the gating failures, for the task error string.
    pub fn error_summary(results: &[CheckResult]) -> String {
        results
            .iter()
            .filter(|r| r.is_gating())
            .map(|r| format!("{}: {}", r.check_name, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gating_requires_failed_error() {
        let warn = CheckResult::fail("memory", CheckLevel::Warning, "low memory");
        let err = CheckResult::fail("disk_space", CheckLevel::Error, "only 12 MiB free");
        let passed_err_level = CheckResult {
            level: CheckLevel::Error,
            ..CheckResult::pass("connectivity", "pong")
        };

        assert!(!warn.is_gating());
        assert!(err.is_gating());
        assert!(!passed_err_level.is_gating());

        assert!(!CheckerManager::has_errors(&[warn.clone(), passed_err_level]));
        assert!(CheckerManager::has_errors(&[warn, err.clone()]));
        assert_eq!(CheckerManager::error_summary(&[err]), "disk_space: only 12 MiB free");
    }

    #[test]
    fn probe_error_is_failed_warning() {
        let result = CheckResult::probe_error("memory", &Error::RunnerUnavailable("gone".into()));
        assert_eq!(result.level, CheckLevel::Warning);
        assert!(!result.passed);
        assert!(!result.is_gating());
    }
}
