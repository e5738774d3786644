//! Deployment configuration loading and validation.
//!
//! The configuration file is a single YAML document with three sections:
//! `general` (work directory, concurrency bound), `log` (level, directory),
//! and `nodes` (the host inventory, each host carrying an ordered `install`
//! list). Parsing and validation happen entirely before any remote I/O;
//! validation collects every problem instead of stopping at the first one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard cap on concurrent host pipelines regardless of configuration.
pub const MAX_CONCURRENT_NODES_CAP: usize = 10;

/// Default minimum free disk space required by the disk-space check, in MiB.
pub const DEFAULT_MIN_FREE_MB: u64 = 1024;

/// Default minimum available memory required by the memory check, in MiB.
pub const DEFAULT_MIN_MEM_MB: u64 = 512;

// ============================================================================
// General / log sections
// ============================================================================

/// The `general` section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root directory for run artifacts (inventories, captured output).
    /// Created on startup if missing.
    pub data_dir: PathBuf,

    /// Maximum number of host pipelines running at once (1..=10).
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
}

fn default_max_concurrent_nodes() -> usize {
    MAX_CONCURRENT_NODES_CAP
}

/// Log verbosity for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// The `log` section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level written to the log sinks.
    #[serde(default)]
    pub level: LogLevel,

    /// Directory holding `deploy.log` and the per-host log files.
    pub dir: PathBuf,
}

// ============================================================================
// Credentials
// ============================================================================

/// A user plus one authentication method (password or private key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Login user.
    pub user: String,

    /// Password authentication. Never logged; see the event bus redaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Path to an SSH private key. The file must exist and be readable by
    /// the owner only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl CredentialBundle {
    /// True when the bundle carries at least one authentication method.
    pub fn has_auth(&self) -> bool {
        self.password.is_some() || self.key_path.is_some()
    }
}

/// Which credential bundle an invocation should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// The ordinary connection user.
    Owner,
    /// The privilege-escalation pair used for root-level actions.
    Super,
}

// ============================================================================
// Package specification
// ============================================================================

/// Where the package payload comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageSource {
    /// The target's package manager (apt/yum/dnf).
    #[default]
    Repository,
    /// A downloadable archive.
    Url,
    /// A path that already exists on the target.
    Local,
}

impl std::fmt::Display for PackageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageSource::Repository => write!(f, "repository"),
            PackageSource::Url => write!(f, "url"),
            PackageSource::Local => write!(f, "local"),
        }
    }
}

/// One software unit to install on a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Installer name (java, python, zookeeper).
    pub name: String,

    /// Requested version; the installer validates it.
    pub version: String,

    /// Absolute installation path on the target.
    pub install_path: PathBuf,

    /// Payload source.
    #[serde(default)]
    pub source: PackageSource,

    /// URL or path; required when `source` is not `repository`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,

    /// Free-form installer-specific settings. Well-known keys have typed
    /// accessors below; unknown keys are surfaced as validation warnings.
    #[serde(default)]
    pub config: IndexMap<String, serde_yaml::Value>,
}

impl PackageSpec {
    fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| match v {
            serde_yaml::Value::Number(n) => n.as_u64(),
            serde_yaml::Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| match v {
            serde_yaml::Value::Bool(b) => Some(*b),
            serde_yaml::Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    /// Install timeout override in seconds; installs are uncapped without it.
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.config_u64("timeout_seconds")
    }

    /// Minimum free disk space for the disk-space check, in MiB.
    pub fn min_free_mb(&self) -> u64 {
        self.config_u64("min_free_mb").unwrap_or(DEFAULT_MIN_FREE_MB)
    }

    /// Minimum available memory for the memory check, in MiB.
    pub fn min_mem_mb(&self) -> u64 {
        self.config_u64("min_mem_mb").unwrap_or(DEFAULT_MIN_MEM_MB)
    }

    /// Whether the Java installer should export JAVA_HOME. Unset means no.
    pub fn set_java_home(&self) -> bool {
        self.config_bool("set_java_home").unwrap_or(false)
    }

    /// TCP ports this package will bind, for the port-availability check.
    ///
    /// Read from `clientPort` (Zookeeper) and `port`/`ports` keys.
    pub fn declared_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for key in ["clientPort", "port"] {
            if let Some(p) = self.config_u64(key) {
                if let Ok(p) = u16::try_from(p) {
                    ports.push(p);
                }
            }
        }
        if let Some(serde_yaml::Value::String(list)) = self.config.get("ports") {
            ports.extend(list.split(',').filter_map(|p| p.trim().parse::<u16>().ok()));
        }
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Keys recognized by the built-in installers and checks.
    const KNOWN_CONFIG_KEYS: &'static [&'static str] = &[
        "timeout_seconds",
        "min_free_mb",
        "min_mem_mb",
        "set_java_home",
        "tickTime",
        "dataDir",
        "clientPort",
        "port",
        "ports",
    ];

    /// Config keys no built-in consumer reads. Ensemble entries
    /// (`server.N`) are part of the Zookeeper contract and not unknown.
    pub fn unknown_config_keys(&self) -> Vec<&str> {
        self.config
            .keys()
            .filter(|k| !Self::KNOWN_CONFIG_KEYS.contains(&k.as_str()))
            .filter(|k| !k.starts_with("server."))
            .map(String::as_str)
            .collect()
    }
}

// ============================================================================
// Host specification
// ============================================================================

/// A target host and the ordered list of packages to install on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    /// Unique host name within the run.
    pub name: String,

    /// IPv4/IPv6 address or resolvable hostname.
    pub host: String,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Ordinary connection user.
    pub owner_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<PathBuf>,

    /// Privilege-escalation user.
    #[serde(default = "default_super_user")]
    pub super_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub super_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub super_key: Option<PathBuf>,

    /// Packages to install, in declaration order.
    #[serde(default)]
    pub install: Vec<PackageSpec>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_super_user() -> String {
    "root".to_string()
}

impl HostSpec {
    /// The owner credential bundle.
    pub fn owner(&self) -> CredentialBundle {
        CredentialBundle {
            user: self.owner_user.clone(),
            password: self.owner_pass.clone(),
            key_path: self.owner_key.clone(),
        }
    }

    /// The super credential bundle.
    pub fn superuser(&self) -> CredentialBundle {
        CredentialBundle {
            user: self.super_user.clone(),
            password: self.super_pass.clone(),
            key_path: self.super_key.clone(),
        }
    }

    /// Every secret value this host carries, for event redaction.
    pub fn secrets(&self) -> Vec<String> {
        [&self.owner_pass, &self.super_pass]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// The full deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub general: GeneralConfig,
    pub log: LogConfig,
    #[serde(default)]
    pub nodes: Vec<HostSpec>,
}

impl DeployConfig {
    /// Loads and parses a configuration file. Validation is separate so the
    /// caller can report every problem at once.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&text).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Parses a configuration document from a YAML string.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Validates the configuration, returning every problem found.
    ///
    /// An empty list means the configuration is safe to run. Warnings
    /// (unknown package config keys) are returned separately.
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.general.max_concurrent_nodes == 0
            || self.general.max_concurrent_nodes > MAX_CONCURRENT_NODES_CAP
        {
            errors.push(format!(
                "general.max_concurrent_nodes must be in 1..={} (got {})",
                MAX_CONCURRENT_NODES_CAP, self.general.max_concurrent_nodes
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                errors.push(format!("duplicate node name '{}'", node.name));
            }
            self.validate_node(node, &mut errors, &mut warnings);
        }

        (errors, warnings)
    }

    fn validate_node(&self, node: &HostSpec, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        if node.name.is_empty() {
            errors.push("node with empty name".to_string());
        }
        if node.host.is_empty() {
            errors.push(format!("node '{}': host must not be empty", node.name));
        }
        if node.port == 0 {
            errors.push(format!("node '{}': port must be in 1..=65535", node.name));
        }
        if node.owner_user.is_empty() {
            errors.push(format!("node '{}': owner_user must not be empty", node.name));
        }
        if !node.owner().has_auth() {
            errors.push(format!(
                "node '{}': owner credentials need a password or a key",
                node.name
            ));
        }
        for (label, key) in [("owner_key", &node.owner_key), ("super_key", &node.super_key)] {
            if let Some(path) = key {
                validate_key_file(&node.name, label, path, errors);
            }
        }
        for pkg in &node.install {
            self.validate_package(node, pkg, errors, warnings);
        }
    }

    fn validate_package(
        &self,
        node: &HostSpec,
        pkg: &PackageSpec,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let ctx = format!("node '{}', package '{}'", node.name, pkg.name);
        if pkg.name.is_empty() {
            errors.push(format!("node '{}': package with empty name", node.name));
        }
        if pkg.version.is_empty() {
            errors.push(format!("{ctx}: version must not be empty"));
        }
        if !pkg.install_path.is_absolute() {
            errors.push(format!(
                "{ctx}: install_path '{}' must be absolute",
                pkg.install_path.display()
            ));
        }
        if pkg.source != PackageSource::Repository && pkg.source_path.is_none() {
            errors.push(format!(
                "{ctx}: source_path is required when source is '{}'",
                pkg.source
            ));
        }
        for key in pkg.unknown_config_keys() {
            warnings.push(format!("{ctx}: unrecognized config key '{key}'"));
        }
    }

    /// All hosts' secret values, for building the event-bus redactor.
    pub fn secrets(&self) -> Vec<String> {
        self.nodes.iter().flat_map(HostSpec::secrets).collect()
    }

    /// Restricts the inventory to the named hosts and packages. Empty
    /// filters mean "everything". Unknown names are reported as errors so a
    /// typo does not silently deploy nothing.
    pub fn filtered(mut self, nodes: &[String], software: &[String]) -> Result<Self> {
        if !nodes.is_empty() {
            let known: HashSet<_> = self.nodes.iter().map(|n| n.name.clone()).collect();
            let missing: Vec<_> = nodes.iter().filter(|n| !known.contains(*n)).cloned().collect();
            if !missing.is_empty() {
                return Err(Error::ConfigInvalid(
                    missing.into_iter().map(|n| format!("unknown node '{n}'")).collect(),
                ));
            }
            self.nodes.retain(|n| nodes.contains(&n.name));
        }
        if !software.is_empty() {
            for node in &mut self.nodes {
                node.install.retain(|p| software.contains(&p.name));
            }
        }
        Ok(self)
    }

    /// The annotated configuration template printed by `generate-config`.
    pub fn template() -> &'static str {
        TEMPLATE
    }
}

/// Key files must exist and be readable by the owner only.
fn validate_key_file(node: &str, label: &str, path: &Path, errors: &mut Vec<String>) {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    let expanded = Path::new(&expanded);
    match std::fs::metadata(expanded) {
        Err(e) => errors.push(format!(
            "node '{node}': {label} '{}' is not readable: {e}",
            path.display()
        )),
        Ok(meta) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = meta.permissions().mode();
                if mode & 0o077 != 0 {
                    errors.push(format!(
                        "node '{node}': {label} '{}' must be owner-read-only (mode {:o})",
                        path.display(),
                        mode & 0o777
                    ));
                }
            }
            #[cfg(not(unix))]
            let _ = meta;
        }
    }
}

const TEMPLATE: &str = r#"# Rollout deployment configuration.
general:
  data_dir: /var/lib/rollout
  # Concurrent host pipelines, 1..=10.
  max_concurrent_nodes: 10

log:
  level: INFO           # DEBUG | INFO | WARN | ERROR
  dir: /var/log/rollout

nodes:
  - name: node-1
    host: 192.168.1.10
    port: 22
    owner_user: deploy
    # One of owner_pass / owner_key is required.
    owner_key: ~/.ssh/id_rsa
    super_user: root
    super_pass: change-me
    install:
      - name: java
        version: "11"
        install_path: /opt/java
        source: repository
        config:
          set_java_home: true
      - name: zookeeper
        version: "3.8"
        install_path: /opt/zookeeper
        source: url
        source_path: https://archive.apache.org/dist/zookeeper/zookeeper-3.8.0/apache-zookeeper-3.8.0-bin.tar.gz
        config:
          tickTime: 2000
          dataDir: /var/lib/zookeeper
          clientPort: 2181
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_yaml() -> &'static str {
        r#"
general:
  data_dir: /tmp/rollout
log:
  level: INFO
  dir: /tmp/rollout/log
nodes:
  - name: h1
    host: 10.0.0.1
    owner_user: deploy
    owner_pass: s3cret
    install:
      - name: java
        version: "11"
        install_path: /opt/java
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = DeployConfig::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(cfg.general.max_concurrent_nodes, 10);
        assert_eq!(cfg.log.level, LogLevel::Info);
        assert_eq!(cfg.nodes.len(), 1);
        let node = &cfg.nodes[0];
        assert_eq!(node.port, 22);
        assert_eq!(node.super_user, "root");
        assert_eq!(node.install[0].source, PackageSource::Repository);
        let (errors, warnings) = cfg.validate();
        assert!(errors.is_empty(), "{errors:?}");
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn template_round_trips() {
        let cfg = DeployConfig::from_yaml(DeployConfig::template()).unwrap();
        assert_eq!(cfg.nodes.len(), 1);
        assert_eq!(cfg.nodes[0].install.len(), 2);
    }

    #[test]
    fn rejects_duplicate_names_and_bad_port() {
        let yaml = r#"
general: { data_dir: /tmp/r }
log: { dir: /tmp/r/log }
nodes:
  - { name: h1, host: 10.0.0.1, port: 0, owner_user: u, owner_pass: p }
  - { name: h1, host: 10.0.0.2, owner_user: u, owner_pass: p }
"#;
        let cfg = DeployConfig::from_yaml(yaml).unwrap();
        let (errors, _) = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("duplicate node name")));
        assert!(errors.iter().any(|e| e.contains("port")));
    }

    #[test]
    fn rejects_missing_auth_and_source_path() {
        let yaml = r#"
general: { data_dir: /tmp/r }
log: { dir: /tmp/r/log }
nodes:
  - name: h1
    host: 10.0.0.1
    owner_user: u
    install:
      - { name: java, version: "11", install_path: /opt/java, source: url }
"#;
        let cfg = DeployConfig::from_yaml(yaml).unwrap();
        let (errors, _) = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("password or a key")));
        assert!(errors.iter().any(|e| e.contains("source_path")));
    }

    #[test]
    fn rejects_relative_install_path() {
        let yaml = r#"
general: { data_dir: /tmp/r }
log: { dir: /tmp/r/log }
nodes:
  - name: h1
    host: 10.0.0.1
    owner_user: u
    owner_pass: p
    install:
      - { name: java, version: "11", install_path: opt/java }
"#;
        let cfg = DeployConfig::from_yaml(yaml).unwrap();
        let (errors, _) = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("must be absolute")));
    }

    #[test]
    fn warns_on_unknown_config_keys() {
        let yaml = r#"
general: { data_dir: /tmp/r }
log: { dir: /tmp/r/log }
nodes:
  - name: h1
    host: 10.0.0.1
    owner_user: u
    owner_pass: p
    install:
      - name: zookeeper
        version: "3.8"
        install_path: /opt/zk
        source: url
        source_path: https://example.com/zk.tgz
        config:
          tickTime: 2000
          "server.1": "10.0.0.1:2888:3888"
          mistyped_knob: 1
"#;
        let cfg = DeployConfig::from_yaml(yaml).unwrap();
        let (errors, warnings) = cfg.validate();
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("mistyped_knob"));
    }

    #[test]
    fn filtered_rejects_unknown_node() {
        let cfg = DeployConfig::from_yaml(minimal_yaml()).unwrap();
        let err = cfg.clone().filtered(&["nope".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("unknown node"));
        let kept = cfg.filtered(&["h1".to_string()], &["python".to_string()]).unwrap();
        assert!(kept.nodes[0].install.is_empty());
    }

    #[test]
    fn declared_ports_merges_sources() {
        let yaml = r#"
name: zookeeper
version: "3.8"
install_path: /opt/zk
config:
  clientPort: 2181
  ports: "2888, 3888"
"#;
        let pkg: PackageSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pkg.declared_ports(), vec![2181, 2888, 3888]);
        assert_eq!(pkg.min_free_mb(), DEFAULT_MIN_FREE_MB);
        assert!(pkg.timeout_seconds().is_none());
    }
}
