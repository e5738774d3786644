//! Java installer.
//!
//! Supports majors 8, 11, and 17 from all three sources. Repository
//! installs use the target's package manager; url installs download a
//! tarball into `install_path`; local installs copy from a path that must
//! already exist on the target. Post-configure optionally exports
//! `JAVA_HOME` when the package config asks for it.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::executor::ProbeSpec;

use super::{Gate, InstallContext, Installer};

const SUPPORTED_MAJORS: &[u32] = &[8, 11, 17];

static JAVA_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"version "([^"]+)""#).expect("java version regex"));

pub struct JavaInstaller;

#[async_trait]
impl Installer for JavaInstaller {
    fn name(&self) -> &'static str {
        "java"
    }

    fn supports_version(&self, version: &str) -> bool {
        matches!(java_major(version), Some(m) if SUPPORTED_MAJORS.contains(&m))
    }

    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<Gate> {
        let declared = java_major(&ctx.pkg.version);
        let probe = ProbeSpec::shell(format!(
            "{}/bin/java -version 2>&1 || java -version 2>&1",
            ctx.pkg.install_path.display()
        ));
        match ctx.exec.probe(&ctx.host, &probe).await {
            Ok(result) if result.ok => {
                let found = parse_installed_major(&result.stdout);
                if found.is_some() && found == declared {
                    return Ok(Gate::Skip(format!(
                        "java {} already installed",
                        ctx.pkg.version
                    )));
                }
                Ok(Gate::Proceed)
            }
            // No java found, or the probe itself failed: install decides.
            _ => Ok(Gate::Proceed),
        }
    }

    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        ctx.emitter.progress(5);
        ctx.emitter.log(
            LogLevel::Info,
            format!("installing java {} from {}", ctx.pkg.version, ctx.pkg.source),
        );
        let mut vars = ctx.base_vars();
        if let Some(major) = java_major(&ctx.pkg.version) {
            vars.insert("java_major".into(), major.into());
        }
        ctx.run_playbook("java.yml", vars).await?;
        ctx.emitter.progress(90);
        Ok(())
    }

    async fn post_config(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if !ctx.pkg.set_java_home() {
            return Ok(());
        }
        let mut vars = ctx.base_vars();
        vars.insert(
            "java_home".into(),
            ctx.pkg.install_path.display().to_string().into(),
        );
        ctx.run_playbook("java_post.yml", vars).await
    }

    async fn verify(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.check_mode {
            ctx.emitter.log(LogLevel::Info, "check mode: skipping verification");
            return Ok(());
        }
        let probe = ProbeSpec::shell(format!(
            "{}/bin/java -version 2>&1 || java -version 2>&1",
            ctx.pkg.install_path.display()
        ));
        let result = ctx.exec.probe(&ctx.host, &probe).await?;
        let found = parse_installed_major(&result.stdout);
        if result.ok && found == java_major(&ctx.pkg.version) {
            Ok(())
        } else {
            Err(Error::install_failed(
                &ctx.pkg.name,
                &ctx.host.name,
                format!(
                    "verification failed: expected java {}, found {}",
                    ctx.pkg.version,
                    found.map_or_else(|| "none".to_string(), |m| m.to_string())
                ),
            ))
        }
    }
}

/// Normalizes a declared version to its major: "11" -> 11, "1.8" -> 8.
fn java_major(version: &str) -> Option<u32> {
    let mut parts = version.split('.');
    let first: u32 = parts.next()?.trim().parse().ok()?;
    if first == 1 {
        parts.next()?.trim().parse().ok()
    } else {
        Some(first)
    }
}

/// Extracts the major from `java -version` output, e.g.
/// `openjdk version "11.0.21"` or `java version "1.8.0_392"`.
fn parse_installed_major(output: &str) -> Option<u32> {
    let caps = JAVA_VERSION_RE.captures(output)?;
    java_major(caps[1].split('_').next()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_normalization() {
        assert_eq!(java_major("11"), Some(11));
        assert_eq!(java_major("17.0.2"), Some(17));
        assert_eq!(java_major("1.8"), Some(8));
        assert_eq!(java_major("not-a-version"), None);
    }

    #[test]
    fn parses_version_banners() {
        let modern = "openjdk version \"11.0.21\" 2023-10-17\nOpenJDK Runtime Environment";
        assert_eq!(parse_installed_major(modern), Some(11));

        let legacy = "java version \"1.8.0_392\"\nJava(TM) SE Runtime Environment";
        assert_eq!(parse_installed_major(legacy), Some(8));

        assert_eq!(parse_installed_major("bash: java: command not found"), None);
    }
}
