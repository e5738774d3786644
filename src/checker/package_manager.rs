//! Package manager detection.

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSource, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckLevel, CheckResult, Checker};

/// Detects apt-get, yum, or dnf on the target. A missing package manager is
/// a Warning, except when the package installs from the repository source,
/// which cannot work without one; then it escalates to Error.
pub struct PackageManagerCheck;

#[async_trait]
impl Checker for PackageManagerCheck {
    fn name(&self) -> &'static str {
        "package_manager"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        pkg: &PackageSpec,
    ) -> CheckResult {
        let probe = ProbeSpec::shell("command -v apt-get || command -v yum || command -v dnf");
        let result = match exec.probe(host, &probe).await {
            Err(e) => return CheckResult::probe_error(self.name(), &e),
            Ok(r) => r,
        };

        if result.ok && !result.stdout.trim().is_empty() {
            let manager = result
                .stdout
                .trim()
                .rsplit('/')
                .next()
                .unwrap_or("unknown")
                .to_string();
            let mut details = serde_json::Map::new();
            details.insert("manager".into(), manager.clone().into());
            return CheckResult::pass(self.name(), format!("found {manager}")).with_details(details);
        }

        let level = if pkg.source == PackageSource::Repository {
            CheckLevel::Error
        } else {
            CheckLevel::Warning
        };
        CheckResult::fail(self.name(), level, "no supported package manager found")
    }
}
