//! SSH reachability check.

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckLevel, CheckResult, Checker};

/// Pings the host over SSH with the owner credentials. An unreachable or
/// unauthenticated host fails at Error level and gates everything else.
pub struct ConnectivityCheck;

#[async_trait]
impl Checker for ConnectivityCheck {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        _pkg: &PackageSpec,
    ) -> CheckResult {
        let probe = ProbeSpec::new("ping");
        match exec.probe(host, &probe).await {
            Err(e) => CheckResult::probe_error(self.name(), &e),
            Ok(result) if result.unreachable => CheckResult::fail(
                self.name(),
                CheckLevel::Error,
                format!("unreachable: {}", result.stderr.trim()),
            ),
            Ok(result) if !result.ok => CheckResult::fail(
                self.name(),
                CheckLevel::Error,
                format!("ping failed: {}", result.stderr.trim()),
            ),
            Ok(_) => CheckResult::pass(self.name(), format!("{} is reachable", host.host)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{PlaybookRequest, ProbeResult, RunOutcome};

    struct FixedProbe(ProbeResult);

    #[async_trait]
    impl HostExecutor for FixedProbe {
        async fn probe(&self, _: &HostSpec, _: &ProbeSpec) -> crate::error::Result<ProbeResult> {
            Ok(self.0.clone())
        }
        async fn run_playbook(&self, _: PlaybookRequest) -> crate::error::Result<RunOutcome> {
            unimplemented!("not used by checks")
        }
    }

    fn host() -> HostSpec {
        serde_yaml::from_str("{name: h1, host: 10.0.0.1, owner_user: u, owner_pass: p}").unwrap()
    }

    fn pkg() -> PackageSpec {
        serde_yaml::from_str("{name: java, version: '11', install_path: /opt/java}").unwrap()
    }

    #[tokio::test]
    async fn reachable_host_passes() {
        let exec = FixedProbe(ProbeResult::success("pong"));
        let result = ConnectivityCheck.check(&exec, &host(), &pkg()).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn unreachable_host_is_gating() {
        let exec = FixedProbe(ProbeResult::unreachable("ssh: connect refused"));
        let result = ConnectivityCheck.check(&exec, &host(), &pkg()).await;
        assert!(result.is_gating());
        assert!(result.message.contains("unreachable"));
    }
}
