//! Available memory check.

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckLevel, CheckResult, Checker};

/// Reads `MemAvailable` from `/proc/meminfo`. Low memory is a Warning: it
/// surfaces but does not block the install.
pub struct MemoryCheck;

#[async_trait]
impl Checker for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        pkg: &PackageSpec,
    ) -> CheckResult {
        let probe = ProbeSpec::shell("grep -E '^MemAvailable:' /proc/meminfo");
        let result = match exec.probe(host, &probe).await {
            Err(e) => return CheckResult::probe_error(self.name(), &e),
            Ok(r) => r,
        };
        let Some(available_mb) = parse_meminfo_mb(&result.stdout) else {
            return CheckResult::fail(
                self.name(),
                CheckLevel::Warning,
                "could not read MemAvailable",
            );
        };

        let min = pkg.min_mem_mb();
        let mut details = serde_json::Map::new();
        details.insert("available_mb".into(), available_mb.into());
        details.insert("required_mb".into(), min.into());

        if available_mb < min {
            CheckResult::fail(
                self.name(),
                CheckLevel::Warning,
                format!("{available_mb} MiB available, want {min} MiB"),
            )
            .with_details(details)
        } else {
            CheckResult::pass(self.name(), format!("{available_mb} MiB available"))
                .with_details(details)
        }
    }
}

/// `MemAvailable:   16263688 kB` -> MiB.
fn parse_meminfo_mb(stdout: &str) -> Option<u64> {
    let kb: u64 = stdout.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}
