//! System information gathering.

use async_trait::async_trait;

use crate::config::{HostSpec, PackageSpec};
use crate::executor::{HostExecutor, ProbeSpec};

use super::{CheckResult, Checker};

/// Gathers OS, kernel, CPU, and memory facts. Always passes; the value is
/// the attached detail map in the event stream.
pub struct SystemInfoCheck;

const FACT_FILTER: &str =
    "filter=ansible_distribution*,ansible_kernel,ansible_processor_vcpus,ansible_memtotal_mb";

#[async_trait]
impl Checker for SystemInfoCheck {
    fn name(&self) -> &'static str {
        "system_info"
    }

    async fn check(
        &self,
        exec: &dyn HostExecutor,
        host: &HostSpec,
        _pkg: &PackageSpec,
    ) -> CheckResult {
        let probe = ProbeSpec::new("setup").with_args(FACT_FILTER);
        match exec.probe(host, &probe).await {
            Err(e) => CheckResult::probe_error(self.name(), &e),
            Ok(result) => {
                let facts = result
                    .facts
                    .get("ansible_facts")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_else(|| result.facts.clone());
                let summary = describe(&facts);
                CheckResult::pass(self.name(), summary).with_details(facts)
            }
        }
    }
}

fn describe(facts: &serde_json::Map<String, serde_json::Value>) -> String {
    let get = |key: &str| facts.get(key).and_then(|v| v.as_str()).unwrap_or("?");
    format!(
        "{} {} (kernel {})",
        get("ansible_distribution"),
        get("ansible_distribution_version"),
        get("ansible_kernel"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_reads_known_facts() {
        let facts: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"ansible_distribution": "Ubuntu", "ansible_distribution_version": "22.04", "ansible_kernel": "5.15.0"}"#,
        )
        .unwrap();
        assert_eq!(describe(&facts), "Ubuntu 22.04 (kernel 5.15.0)");
        assert_eq!(describe(&serde_json::Map::new()), "? ? (kernel ?)");
    }
}
