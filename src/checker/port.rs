//! TCP port availability check.

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckLevel, CheckResult, Checker};

/// Verifies that none of the package's declared listen ports is already
/// bound on the target. A package that declares no ports passes trivially.
pub struct PortAvailabilityCheck;

#[async_trait]
impl Checker for PortAvailabilityCheck {
    fn name(&self) -> &'static str {
        "port_availability"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        pkg: &PackageSpec,
    ) -> CheckResult {
        let ports = pkg.declared_ports();
        if ports.is_empty() {
            return CheckResult::pass(self.name(), "no ports declared");
        }

        // ss is standard on modern targets; fall back to netstat for old ones.
        let probe = ProbeSpec::shell("ss -ltn 2>/dev/null || netstat -ltn");
        let result = match exec.probe(host, &probe).await {
            Err(e) => return CheckResult::probe_error(self.name(), &e),
            Ok(r) => r,
        };
        if !result.ok {
            return CheckResult::fail(
                self.name(),
                CheckLevel::Warning,
                format!("could not list listeners: {}", result.stderr.trim()),
            );
        }

        let bound: Vec<u16> = ports
            .iter()
            .copied()
            .filter(|p| port_is_bound(&result.stdout, *p))
            .collect();
        if bound.is_empty() {
            CheckResult::pass(self.name(), format!("ports {ports:?} are free"))
        } else {
            CheckResult::fail(
                self.name(),
                CheckLevel::Error,
                format!("ports already in use: {bound:?}"),
            )
        }
    }
}

/// Matches `*:2181` / `0.0.0.0:2181` / `[::]:2181` in listener output.
fn port_is_bound(listeners: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    listeners.lines().any(|line| {
        line.split_whitespace()
            .any(|col| col.ends_with(&suffix) && col.len() > suffix.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS_OUTPUT: &str = "\
State   Recv-Q  Send-Q  Local Address:Port  Peer Address:Port
LISTEN  0       128     0.0.0.0:22          0.0.0.0:*
LISTEN  0       50      [::]:2181           [::]:*
";

    #[test]
    fn detects_bound_and_free_ports() {
        assert!(port_is_bound(SS_OUTPUT, 22));
        assert!(port_is_bound(SS_OUTPUT, 2181));
        assert!(!port_is_bound(SS_OUTPUT, 2888));
        // ":2" must not match ":22".
        assert!(!port_is_bound(SS_OUTPUT, 2));
    }
}
