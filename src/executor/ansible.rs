//! Ansible subprocess adapter.
//!
//! Wraps the `ansible` / `ansible-playbook` binaries behind [`HostExecutor`].
//! Each invocation materializes its own work directory under the run root
//! with a one-host inventory and an extra-vars file, so concurrent calls
//! from different host workers never share state. The runner's stdout is
//! streamed line by line: captured to `stdout.log` and parsed into
//! [`PlaybookEvent`]s as it arrives.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{CredentialKind, HostSpec};
use crate::error::{Error, Result};

use super::{
    HostExecutor, PlaybookEvent, PlaybookRequest, ProbeResult, ProbeSpec, RunOutcome, RunStats,
    RunStatus,
};

/// How much stderr is kept for failure reporting.
const STDERR_TAIL_BYTES: usize = 4096;

static TASK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^TASK \[(.+?)\] \*+").expect("task regex"));
static OK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ok: \[([^\]]+)\]").expect("ok regex"));
static CHANGED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^changed: \[([^\]]+)\]").expect("changed regex"));
static FATAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:fatal|failed): \[([^\]]+)\][^:]*: (FAILED|UNREACHABLE)! => (.*)$")
        .expect("fatal regex")
});
static RECAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+)\s*:\s*ok=(\d+)\s+changed=(\d+)\s+unreachable=(\d+)\s+failed=(\d+)")
        .expect("recap regex")
});
static ADHOC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+) \| (SUCCESS|CHANGED|FAILED|UNREACHABLE!?)(?: \| rc=(-?\d+))?")
        .expect("adhoc regex")
});

/// Production [`HostExecutor`] driving the Ansible binaries.
pub struct AnsibleExecutor {
    ansible_bin: PathBuf,
    playbook_bin: PathBuf,
    /// Directory holding the installer playbooks (`java.yml`, ...).
    playbook_dir: PathBuf,
    /// Per-run artifact root: `data_dir/run/<timestamp>`.
    run_dir: PathBuf,
    seq: AtomicU64,
}

impl AnsibleExecutor {
    /// Locates the runner binaries and prepares the run directory.
    pub fn new(playbook_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Result<Self> {
        let ansible_bin =
            which::which("ansible").map_err(|e| Error::RunnerUnavailable(format!("ansible: {e}")))?;
        let playbook_bin = which::which("ansible-playbook")
            .map_err(|e| Error::RunnerUnavailable(format!("ansible-playbook: {e}")))?;
        let run_dir = run_dir.into();
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self {
            ansible_bin,
            playbook_bin,
            playbook_dir: playbook_dir.into(),
            run_dir,
            seq: AtomicU64::new(0),
        })
    }

    /// A fresh work directory for one invocation.
    fn invocation_dir(&self, host: &str, label: &str) -> Result<PathBuf> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let dir = self.run_dir.join(host).join(format!("{n:04}-{label}"));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_inventory(
        dir: &Path,
        host: &HostSpec,
        credential: CredentialKind,
    ) -> Result<PathBuf> {
        let path = dir.join("inventory.yml");
        let text = inventory_yaml(host, credential)?;
        write_private(&path, &text)?;
        Ok(path)
    }

    fn base_command(&self, bin: &Path) -> Command {
        let mut cmd = Command::new(bin);
        cmd.env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "False")
            .env("ANSIBLE_FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl HostExecutor for AnsibleExecutor {
    async fn probe(&self, host: &HostSpec, probe: &ProbeSpec) -> Result<ProbeResult> {
        let dir = self.invocation_dir(&host.name, &probe.module)?;
        let inventory = Self::write_inventory(&dir, host, probe.credential)?;

        let mut cmd = self.base_command(&self.ansible_bin);
        cmd.env("ANSIBLE_STDOUT_CALLBACK", "minimal")
            .arg("all")
            .arg("-i")
            .arg(&inventory)
            .arg("-m")
            .arg(&probe.module);
        if let Some(args) = &probe.args {
            cmd.arg("-a").arg(args);
        }

        debug!(host = %host.name, module = %probe.module, "running probe");
        let output = tokio::time::timeout(probe.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                host: host.name.clone(),
                timeout_secs: probe.timeout.as_secs(),
            })?
            .map_err(|e| Error::RunnerUnavailable(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_adhoc_output(&stdout, &stderr))
    }

    async fn run_playbook(&self, req: PlaybookRequest) -> Result<RunOutcome> {
        let dir = self.invocation_dir(&req.host.name, "playbook")?;
        let inventory = Self::write_inventory(&dir, &req.host, req.credential)?;

        let vars_path = dir.join("vars.json");
        write_private(&vars_path, &serde_json::to_string_pretty(&req.extra_vars)?)?;

        let playbook_path = self.playbook_dir.join(&req.playbook);
        let mut cmd = self.base_command(&self.playbook_bin);
        cmd.arg("-i")
            .arg(&inventory)
            .arg(&playbook_path)
            .arg("--extra-vars")
            .arg(format!("@{}", vars_path.display()));
        if req.check_mode {
            cmd.arg("--check");
        }

        debug!(host = %req.host.name, playbook = %req.playbook, check = req.check_mode, "running playbook");
        let timeout = req.timeout;
        let host_name = req.host.name.clone();
        let fut = drive_playbook(cmd, dir.join("stdout.log"), req);
        match timeout {
            Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| Error::Timeout {
                host: host_name,
                timeout_secs: t.as_secs(),
            })?,
            None => fut.await,
        }
    }
}

/// Spawns the runner and pumps its stdout through the line parser until it
/// exits, the caller cancels, or the pipe closes.
async fn drive_playbook(
    mut cmd: Command,
    stdout_log: PathBuf,
    req: PlaybookRequest,
) -> Result<RunOutcome> {
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::RunnerUnavailable(e.to_string()))?;
    let stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let mut log = tokio::fs::File::create(&stdout_log).await?;
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = PlaybookParser::new(&req.host.name);
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = req.cancel.cancelled(), if !cancelled => {
                cancelled = true;
                warn!(host = %req.host.name, "cancelling playbook run");
                let _ = child.start_kill();
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    log.write_all(line.as_bytes()).await?;
                    log.write_all(b"\n").await?;
                    if let Some(event) = parser.feed(&line) {
                        req.emit(event);
                    }
                }
                None => break,
            }
        }
    }
    log.flush().await?;

    let exit = child.wait().await?;
    let stderr_text = stderr_task.await.unwrap_or_default();
    let stderr_tail = tail(&stderr_text, &parser.failure_detail);

    let status = if cancelled {
        RunStatus::Cancelled
    } else if parser.saw_unreachable || parser.stats.unreachable > 0 {
        RunStatus::Unreachable
    } else if !exit.success() || parser.saw_failed || parser.stats.failed > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Ok
    };

    Ok(RunOutcome {
        status,
        stderr_tail,
        stats: parser.stats,
    })
}

fn tail(stderr: &str, failure_detail: &str) -> String {
    let text = if stderr.trim().is_empty() {
        failure_detail
    } else {
        stderr
    };
    let start = text.len().saturating_sub(STDERR_TAIL_BYTES);
    // Stay on a char boundary.
    let start = (start..text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    text[start..].trim().to_string()
}

// ============================================================================
// Output parsing
// ============================================================================

/// Incremental parser over the runner's default stdout format.
struct PlaybookParser {
    host: String,
    current_task: String,
    saw_failed: bool,
    saw_unreachable: bool,
    failure_detail: String,
    stats: RunStats,
}

impl PlaybookParser {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            current_task: String::new(),
            saw_failed: false,
            saw_unreachable: false,
            failure_detail: String::new(),
            stats: RunStats::default(),
        }
    }

    fn feed(&mut self, line: &str) -> Option<PlaybookEvent> {
        if let Some(caps) = TASK_RE.captures(line) {
            self.current_task = caps[1].to_string();
            return Some(PlaybookEvent::TaskStart {
                name: self.current_task.clone(),
            });
        }
        if OK_RE.is_match(line) {
            return Some(PlaybookEvent::TaskOk {
                name: self.current_task.clone(),
            });
        }
        if CHANGED_RE.is_match(line) {
            return Some(PlaybookEvent::TaskChanged {
                name: self.current_task.clone(),
            });
        }
        if let Some(caps) = FATAL_RE.captures(line) {
            let detail = caps[3].to_string();
            self.failure_detail = detail.clone();
            if &caps[2] == "UNREACHABLE" {
                self.saw_unreachable = true;
                return Some(PlaybookEvent::Unreachable { detail });
            }
            self.saw_failed = true;
            return Some(PlaybookEvent::TaskFailed {
                name: self.current_task.clone(),
                detail,
            });
        }
        if let Some(caps) = RECAP_RE.captures(line) {
            if caps[1] == self.host {
                self.stats = RunStats {
                    ok: caps[2].parse().unwrap_or(0),
                    changed: caps[3].parse().unwrap_or(0),
                    unreachable: caps[4].parse().unwrap_or(0),
                    failed: caps[5].parse().unwrap_or(0),
                };
            }
        }
        None
    }
}

/// Parses the `minimal` callback's ad-hoc output.
fn parse_adhoc_output(stdout: &str, stderr: &str) -> ProbeResult {
    for (idx, line) in stdout.lines().enumerate() {
        let Some(caps) = ADHOC_RE.captures(line) else { continue };
        let status = &caps[2];
        let rc: i32 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);

        if status.starts_with("UNREACHABLE") {
            let detail = json_blob(stdout, line)
                .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| "connection failed".to_string());
            return ProbeResult::unreachable(detail);
        }

        let ok = status == "SUCCESS" || status == "CHANGED";
        let mut result = ProbeResult {
            ok,
            unreachable: false,
            exit_code: if ok { rc } else if rc != 0 { rc } else { 1 },
            stdout: String::new(),
            stderr: stderr.to_string(),
            facts: serde_json::Map::new(),
        };

        if let Some(value) = json_blob(stdout, line) {
            if let Some(obj) = value.as_object() {
                if let Some(out) = obj.get("stdout").and_then(|v| v.as_str()) {
                    result.stdout = out.to_string();
                }
                if let Some(err) = obj.get("stderr").and_then(|v| v.as_str()) {
                    if !err.is_empty() {
                        result.stderr = err.to_string();
                    }
                }
                if let Some(rc) = obj.get("rc").and_then(serde_json::Value::as_i64) {
                    result.exit_code = rc as i32;
                    result.ok = result.ok && rc == 0;
                }
                result.facts = obj.clone();
            }
        } else {
            // `rc=` form: the module output follows the marker line.
            result.stdout = stdout
                .lines()
                .skip(idx + 1)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
        }
        return result;
    }

    // No marker line at all: the runner itself failed before connecting.
    ProbeResult::failure(-1, stderr.trim().to_string())
}

/// Extracts the JSON object following `=>` on the marker line, if present.
fn json_blob(stdout: &str, marker_line: &str) -> Option<serde_json::Value> {
    let offset = stdout.find(marker_line)?;
    let rest = &stdout[offset..];
    let brace = rest.find('{')?;
    let mut depth = 0usize;
    let bytes = rest.as_bytes();
    for (i, b) in bytes.iter().enumerate().skip(brace) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&rest[brace..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Inventory materialization
// ============================================================================

/// Renders the one-host inventory for an invocation.
///
/// Owner runs connect as the owner user. Super runs connect directly as the
/// super user when it has its own key; otherwise they connect as the owner
/// and escalate with `become` using the super password.
fn inventory_yaml(host: &HostSpec, credential: CredentialKind) -> Result<String> {
    use serde_yaml::{Mapping, Value};

    let mut vars = Mapping::new();
    vars.insert("ansible_host".into(), Value::from(host.host.clone()));
    vars.insert("ansible_port".into(), Value::from(host.port));

    let connect_with = |vars: &mut Mapping, user: &str, pass: &Option<String>, key: &Option<PathBuf>| {
        vars.insert("ansible_user".into(), Value::from(user));
        if let Some(pass) = pass {
            vars.insert("ansible_password".into(), Value::from(pass.clone()));
        }
        if let Some(key) = key {
            let expanded = shellexpand::tilde(&key.to_string_lossy()).into_owned();
            vars.insert("ansible_ssh_private_key_file".into(), Value::from(expanded));
        }
    };

    match credential {
        CredentialKind::Owner => {
            connect_with(&mut vars, &host.owner_user, &host.owner_pass, &host.owner_key);
        }
        CredentialKind::Super if host.super_key.is_some() => {
            connect_with(&mut vars, &host.super_user, &host.super_pass, &host.super_key);
        }
        CredentialKind::Super => {
            connect_with(&mut vars, &host.owner_user, &host.owner_pass, &host.owner_key);
            vars.insert("ansible_become".into(), Value::from(true));
            vars.insert("ansible_become_user".into(), Value::from(host.super_user.clone()));
            if let Some(pass) = &host.super_pass {
                vars.insert("ansible_become_password".into(), Value::from(pass.clone()));
            }
        }
    }

    let mut host_entry = Mapping::new();
    host_entry.insert(Value::from(host.name.clone()), Value::Mapping(vars));
    let mut hosts = Mapping::new();
    hosts.insert("hosts".into(), Value::Mapping(host_entry));
    let mut root = Mapping::new();
    root.insert("all".into(), Value::Mapping(hosts));

    Ok(serde_yaml::to_string(&Value::Mapping(root))?)
}

/// Writes a file readable by the owner only; inventories and vars files can
/// carry passwords.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn host() -> HostSpec {
        serde_yaml::from_str(
            r#"
name: h1
host: 10.0.0.1
owner_user: deploy
owner_pass: hunter2
super_user: root
super_pass: r00t
"#,
        )
        .unwrap()
    }

    #[test]
    fn owner_inventory_has_no_become() {
        let yaml = inventory_yaml(&host(), CredentialKind::Owner).unwrap();
        assert!(yaml.contains("ansible_user: deploy"));
        assert!(yaml.contains("ansible_password: hunter2"));
        assert!(yaml.contains("ansible_port: 22"));
        assert!(!yaml.contains("become"));
    }

    #[test]
    fn super_inventory_escalates_via_become() {
        let yaml = inventory_yaml(&host(), CredentialKind::Super).unwrap();
        assert!(yaml.contains("ansible_user: deploy"));
        assert!(yaml.contains("ansible_become: true"));
        assert!(yaml.contains("ansible_become_user: root"));
        assert!(yaml.contains("ansible_become_password: r00t"));
    }

    #[test]
    fn super_key_connects_directly() {
        let mut host = host();
        host.super_key = Some("/keys/root_id".into());
        let yaml = inventory_yaml(&host, CredentialKind::Super).unwrap();
        assert!(yaml.contains("ansible_user: root"));
        assert!(yaml.contains("ansible_ssh_private_key_file: /keys/root_id"));
        assert!(!yaml.contains("become"));
    }

    #[test]
    fn parses_adhoc_ping_success() {
        let stdout = "h1 | SUCCESS => {\n    \"changed\": false,\n    \"ping\": \"pong\"\n}\n";
        let result = parse_adhoc_output(stdout, "");
        assert!(result.ok);
        assert!(!result.unreachable);
        assert_eq!(result.facts["ping"], "pong");
    }

    #[test]
    fn parses_adhoc_shell_rc_form() {
        let stdout = "h1 | CHANGED | rc=0 >>\n/dev/sda1 10485760\n";
        let result = parse_adhoc_output(stdout, "");
        assert!(result.ok);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "/dev/sda1 10485760");
    }

    #[test]
    fn parses_adhoc_unreachable() {
        let stdout = "h1 | UNREACHABLE! => {\n    \"changed\": false,\n    \"msg\": \"Failed to connect to the host via ssh\",\n    \"unreachable\": true\n}\n";
        let result = parse_adhoc_output(stdout, "");
        assert!(!result.ok);
        assert!(result.unreachable);
        assert!(result.stderr.contains("Failed to connect"));
    }

    #[test]
    fn parses_adhoc_failure_rc() {
        let stdout = "h1 | FAILED | rc=2 >>\nno such file\n";
        let result = parse_adhoc_output(stdout, "");
        assert!(!result.ok);
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn runner_spawn_failure_has_no_marker() {
        let result = parse_adhoc_output("", "ERROR! the playbook could not be found");
        assert!(!result.ok);
        assert!(!result.unreachable);
        assert_eq!(result.exit_code, -1);
    }

    #[test]
    fn playbook_parser_tracks_lifecycle() {
        let mut parser = PlaybookParser::new("h1");
        assert_eq!(
            parser.feed("TASK [install openjdk] *******************"),
            Some(PlaybookEvent::TaskStart { name: "install openjdk".into() })
        );
        assert_eq!(
            parser.feed("changed: [h1]"),
            Some(PlaybookEvent::TaskChanged { name: "install openjdk".into() })
        );
        assert_eq!(
            parser.feed("fatal: [h1]: FAILED! => {\"msg\": \"boom\"}"),
            Some(PlaybookEvent::TaskFailed {
                name: "install openjdk".into(),
                detail: "{\"msg\": \"boom\"}".into()
            })
        );
        assert!(parser.saw_failed);

        parser.feed("h1                         : ok=3    changed=1    unreachable=0    failed=1    skipped=0    rescued=0    ignored=0");
        assert_eq!(parser.stats.ok, 3);
        assert_eq!(parser.stats.failed, 1);
    }

    #[test]
    fn playbook_parser_flags_unreachable() {
        let mut parser = PlaybookParser::new("h1");
        let event = parser.feed("fatal: [h1]: UNREACHABLE! => {\"msg\": \"ssh timeout\"}");
        assert!(matches!(event, Some(PlaybookEvent::Unreachable { .. })));
        assert!(parser.saw_unreachable);
    }

    #[test]
    fn stderr_tail_prefers_stderr_then_detail() {
        assert_eq!(tail("  real stderr  ", "detail"), "real stderr");
        assert_eq!(tail("", "detail"), "detail");
    }

    #[tokio::test]
    async fn request_emit_forwards_to_callback() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut req = PlaybookRequest::new(Arc::new(host()), "java.yml");
        req.on_event = Some(Arc::new(move |e| sink.lock().push(e)));
        req.emit(PlaybookEvent::TaskOk { name: "x".into() });
        assert_eq!(seen.lock().len(), 1);
    }
}
