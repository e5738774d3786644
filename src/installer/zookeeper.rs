//! Zookeeper installer.
//!
//! Supports the 3.6 / 3.7 / 3.8 lines from repository or url sources.
//! Post-configure renders `zoo.cfg` from the package config (`tickTime`,
//! `dataDir`, `clientPort`, plus `server.N` ensemble entries) and ships it
//! via the post playbook.

use async_trait::async_trait;

use crate::config::{LogLevel, PackageSource, PackageSpec};
use crate::error::{Error, Result};
use crate::executor::ProbeSpec;

use super::{Gate, InstallContext, Installer};

const SUPPORTED_LINES: &[&str] = &["3.6", "3.7", "3.8"];

pub struct ZookeeperInstaller;

#[async_trait]
impl Installer for ZookeeperInstaller {
    fn name(&self) -> &'static str {
        "zookeeper"
    }

    fn supports_version(&self, version: &str) -> bool {
        SUPPORTED_LINES
            .iter()
            .any(|line| version == *line || version.starts_with(&format!("{line}.")))
    }

    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<Gate> {
        match self.reported_version(ctx).await {
            Some(found) if found_matches(&found, &ctx.pkg.version) => Ok(Gate::Skip(format!(
                "zookeeper {} already installed",
                ctx.pkg.version
            ))),
            _ => Ok(Gate::Proceed),
        }
    }

    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.pkg.source == PackageSource::Local {
            return Err(Error::install_failed(
                &ctx.pkg.name,
                &ctx.host.name,
                "source 'local' is not supported for zookeeper",
            ));
        }
        ctx.emitter.progress(5);
        ctx.emitter.log(
            LogLevel::Info,
            format!("installing zookeeper {} from {}", ctx.pkg.version, ctx.pkg.source),
        );
        ctx.run_playbook("zookeeper.yml", ctx.base_vars()).await?;
        ctx.emitter.progress(90);
        Ok(())
    }

    async fn post_config(&self, ctx: &InstallContext<'_>) -> Result<()> {
        let mut vars = ctx.base_vars();
        vars.insert("zoo_cfg".into(), render_zoo_cfg(&ctx.pkg).into());
        ctx.emitter.log(LogLevel::Info, "writing zoo.cfg");
        ctx.run_playbook("zookeeper_post.yml", vars).await
    }

    async fn verify(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.check_mode {
            ctx.emitter.log(LogLevel::Info, "check mode: skipping verification");
            return Ok(());
        }
        match self.reported_version(ctx).await {
            Some(found) if found_matches(&found, &ctx.pkg.version) => Ok(()),
            found => Err(Error::install_failed(
                &ctx.pkg.name,
                &ctx.host.name,
                format!(
                    "verification failed: expected zookeeper {}, found {}",
                    ctx.pkg.version,
                    found.unwrap_or_else(|| "none".to_string())
                ),
            )),
        }
    }
}

impl ZookeeperInstaller {
    /// The version string the service binary reports, if it runs at all.
    async fn reported_version(&self, ctx: &InstallContext<'_>) -> Option<String> {
        let probe = ProbeSpec::shell(format!(
            "{}/bin/zkServer.sh version 2>&1",
            ctx.pkg.install_path.display()
        ));
        let result = ctx.exec.probe(&ctx.host, &probe).await.ok()?;
        if result.ok {
            Some(result.stdout)
        } else {
            None
        }
    }
}

fn found_matches(output: &str, declared: &str) -> bool {
    output.contains(declared)
}

/// Renders `zoo.cfg` from the package config, with the standard defaults:
/// tickTime 2000, dataDir under the install path, clientPort 2181.
fn render_zoo_cfg(pkg: &PackageSpec) -> String {
    let value_of = |key: &str| pkg.config.get(key).map(yaml_scalar);

    let mut lines = vec![
        format!("tickTime={}", value_of("tickTime").unwrap_or_else(|| "2000".into())),
        format!(
            "dataDir={}",
            value_of("dataDir")
                .unwrap_or_else(|| format!("{}/data", pkg.install_path.display()))
        ),
        format!(
            "clientPort={}",
            value_of("clientPort").unwrap_or_else(|| "2181".into())
        ),
    ];
    for (key, value) in &pkg.config {
        if key.starts_with("server.") {
            lines.push(format!("{key}={}", yaml_scalar(value)));
        }
    }
    lines.join("\n") + "\n"
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_defaults_when_config_is_empty() {
        let pkg: PackageSpec = serde_yaml::from_str(
            "{name: zookeeper, version: '3.8', install_path: /opt/zk, source: url, source_path: x}",
        )
        .unwrap();
        assert_eq!(
            render_zoo_cfg(&pkg),
            "tickTime=2000\ndataDir=/opt/zk/data\nclientPort=2181\n"
        );
    }

    #[test]
    fn renders_ensemble_entries_in_order() {
        let pkg: PackageSpec = serde_yaml::from_str(
            r#"
name: zookeeper
version: "3.8"
install_path: /opt/zk
config:
  tickTime: 3000
  dataDir: /var/lib/zookeeper
  clientPort: 2181
  "server.1": "zk1:2888:3888"
  "server.2": "zk2:2888:3888"
"#,
        )
        .unwrap();
        let cfg = render_zoo_cfg(&pkg);
        assert_eq!(
            cfg,
            "tickTime=3000\ndataDir=/var/lib/zookeeper\nclientPort=2181\nserver.1=zk1:2888:3888\nserver.2=zk2:2888:3888\n"
        );
    }

    #[test]
    fn version_line_matching() {
        assert!(found_matches("Apache ZooKeeper, version 3.8.3", "3.8"));
        assert!(!found_matches("Apache ZooKeeper, version 3.5.9", "3.8"));
    }
}
