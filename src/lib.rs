//! # Rollout - Multi-Node Software Provisioning
//!
//! Rollout installs software (Java, Python, Zookeeper) onto fleets of hosts
//! over SSH. A declarative inventory names the hosts and the packages each
//! one gets; the engine connects to every host concurrently, runs a set of
//! pre-install validations, then drives each package through its lifecycle
//! (pre-check, install, post-configure, verify) by invoking remote
//! automation playbooks. Progress, logs, and final per-task status fan out
//! to log files and to any number of live subscribers.
//!
//! ## Core Concepts
//!
//! - **Hosts**: remote machines addressed by SSH, declared in the config
//! - **Packages**: software units with a version and install policy
//! - **Tasks**: one (host, package) pair; the unit of scheduling
//! - **Checkers**: composable read-only probes gating an install
//! - **Installers**: lifecycle drivers invoking per-package playbooks
//! - **Event Bus**: fan-out of lifecycle events to sinks and subscribers
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        CLI (batch front-end)                      │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  Deployment Engine (worker pool)                  │
//! │        one worker per host · serial per-host pipelines            │
//! └──────────────────────────────────────────────────────────────────┘
//!            │                    │                      │
//!            ▼                    ▼                      ▼
//! ┌──────────────────┐ ┌───────────────────┐ ┌──────────────────────┐
//! │ Checker Framework │ │ Installer Registry│ │      Event Bus       │
//! │ (pre-install      │ │ (java, python,    │ │ (file sinks + live   │
//! │  validations)     │ │  zookeeper)       │ │  subscribers)        │
//! └──────────────────┘ └───────────────────┘ └──────────────────────┘
//!            │                    │
//!            └──────────┬─────────┘
//!                       ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │              Host Executor (Ansible subprocess adapter)           │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//!                            Target Hosts
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rollout::checker::CheckerManager;
//! use rollout::config::DeployConfig;
//! use rollout::engine::{DeployEngine, RunContext};
//! use rollout::event::{EventBus, Redactor};
//! use rollout::executor::AnsibleExecutor;
//! use rollout::installer::InstallerRegistry;
//! use rollout::model::TaskSet;
//!
//! #[tokio::main]
//! async fn main() -> rollout::error::Result<()> {
//!     let config = DeployConfig::from_file("deploy.yml")?;
//!     let tasks = TaskSet::build(&config);
//!     let bus = EventBus::new(Redactor::new(config.secrets()));
//!
//!     let ctx = RunContext::new(
//!         config.general.data_dir.clone(),
//!         config.general.data_dir.join("run/now"),
//!         config.general.max_concurrent_nodes,
//!         false,
//!         bus,
//!     );
//!     let engine = DeployEngine::new(
//!         ctx,
//!         tasks,
//!         Arc::new(CheckerManager::with_defaults()),
//!         Arc::new(InstallerRegistry::with_builtins()),
//!         Arc::new(AnsibleExecutor::new("playbooks", "/tmp/run")?),
//!     );
//!     engine.start();
//!     let report = engine.wait().await;
//!     println!("exit code {}", report.exit_code());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases for Rollout operations.
pub mod error;

/// Deployment configuration: parsing, validation, and the template.
pub mod config;

/// Task catalog: per-(host, package) tasks, statuses, and run statistics.
pub mod model;

// ============================================================================
// Infrastructure
// ============================================================================

/// Host execution substrate: probes and playbook runs over an automation
/// runner subprocess.
pub mod executor;

/// Event bus: lifecycle events, file sinks, live subscribers, redaction.
pub mod event;

/// Tracing initialization.
pub mod logging;

// ============================================================================
// Deployment Logic
// ============================================================================

/// Pre-install validation framework and the concrete checkers.
pub mod checker;

/// Installer abstraction, registry, and the built-in installers.
pub mod installer;

/// The deployment engine: bounded worker pool, per-host pipelines,
/// pause/resume/cancel.
pub mod engine;

// ============================================================================
// Front-end
// ============================================================================

/// Batch-mode command-line interface.
pub mod cli;

/// Returns the current version of Rollout.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
