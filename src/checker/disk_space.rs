//! Free disk space check for the install location.

use std::path::Path;

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckLevel, CheckResult, Checker};

/// Runs `df` on the parent of `install_path` and requires the configured
/// minimum free space (`min_free_mb`, default 1 GiB).
pub struct DiskSpaceCheck;

#[async_trait]
impl Checker for DiskSpaceCheck {
    fn name(&self) -> &'static str {
        "disk_space"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        pkg: &PackageSpec,
    ) -> CheckResult {
        let parent = pkg
            .install_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("/"));
        let probe = ProbeSpec::shell(format!("df -Pm {} | tail -1", parent.display()));

        let result = match exec.probe(host, &probe).await {
            Err(e) => return CheckResult::probe_error(self.name(), &e),
            Ok(r) => r,
        };
        if !result.ok {
            return CheckResult::fail(
                self.name(),
                CheckLevel::Warning,
                format!("could not determine free space: {}", result.stderr.trim()),
            );
        }

        let Some(free_mb) = parse_df_available(&result.stdout) else {
            return CheckResult::fail(
                self.name(),
                CheckLevel::Warning,
                format!("unparseable df output: {}", result.stdout.trim()),
            );
        };

        let min = pkg.min_free_mb();
        let mut details = serde_json::Map::new();
        details.insert("free_mb".into(), free_mb.into());
        details.insert("required_mb".into(), min.into());

        if free_mb < min {
            CheckResult::fail(
                self.name(),
                CheckLevel::Error,
                format!("{free_mb} MiB free under {}, need {min} MiB", parent.display()),
            )
            .with_details(details)
        } else {
            CheckResult::pass(self.name(), format!("{free_mb} MiB free")).with_details(details)
        }
    }
}

/// Extracts the Available column (MiB) from a `df -Pm` data line.
fn parse_df_available(stdout: &str) -> Option<u64> {
    stdout.split_whitespace().nth(3)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_posix_df_line() {
        let line = "/dev/sda1 102400 51200 51200 50% /opt";
        assert_eq!(parse_df_available(line), Some(51200));
        assert_eq!(parse_df_available("garbage"), None);
    }
}
