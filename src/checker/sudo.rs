//! Privilege escalation check.

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckLevel, CheckResult, Checker};

/// Verifies the super credentials can act as root. Installers run their
/// playbooks with these credentials, so a failure here gates the install.
pub struct SudoPrivilegeCheck;

#[async_trait]
impl Checker for SudoPrivilegeCheck {
    fn name(&self) -> &'static str {
        "sudo_privilege"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        _pkg: &PackageSpec,
    ) -> CheckResult {
        let probe = ProbeSpec::shell("id -u").as_super();
        match exec.probe(host, &probe).await {
            Err(e) => CheckResult::probe_error(self.name(), &e),
            Ok(result) if result.ok && result.stdout.trim() == "0" => {
                CheckResult::pass(self.name(), format!("{} can act as root", host.super_user))
            }
            Ok(result) => CheckResult::fail(
                self.name(),
                CheckLevel::Error,
                format!(
                    "privilege escalation failed for '{}': {}",
                    host.super_user,
                    result.stderr.trim()
                ),
            ),
        }
    }
}
