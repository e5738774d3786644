//! Python installer.
//!
//! Supports 2.7 and any 3.x. Repository installs use the target's package
//! manager; the url source is a from-source build (download, configure with
//! `install_path` as the prefix, make, make install), which the playbook
//! carries out. Verification runs the versioned interpreter from the
//! install prefix.

use async_trait::async_trait;

use crate::config::{LogLevel, PackageSource};
use crate::error::{Error, Result};
use crate::executor::ProbeSpec;

use super::{Gate, InstallContext, Installer};

pub struct PythonInstaller;

#[async_trait]
impl Installer for PythonInstaller {
    fn name(&self) -> &'static str {
        "python"
    }

    fn supports_version(&self, version: &str) -> bool {
        match split_version(version) {
            Some((2, minor)) => minor == Some(7),
            Some((3, _)) => true,
            _ => false,
        }
    }

    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<Gate> {
        let probe = ProbeSpec::shell(format!(
            "{} --version 2>&1",
            interpreter_path(ctx)
        ));
        match ctx.exec.probe(&ctx.host, &probe).await {
            Ok(result) if result.ok && reported_version_matches(&result.stdout, &ctx.pkg.version) => {
                Ok(Gate::Skip(format!(
                    "python {} already installed at {}",
                    ctx.pkg.version,
                    ctx.pkg.install_path.display()
                )))
            }
            _ => Ok(Gate::Proceed),
        }
    }

    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.pkg.source == PackageSource::Local {
            return Err(Error::install_failed(
                &ctx.pkg.name,
                &ctx.host.name,
                "source 'local' is not supported for python",
            ));
        }
        ctx.emitter.progress(5);
        ctx.emitter.log(
            LogLevel::Info,
            format!("installing python {} from {}", ctx.pkg.version, ctx.pkg.source),
        );
        let mut vars = ctx.base_vars();
        if let Some((major, minor)) = split_version(&ctx.pkg.version) {
            vars.insert("python_major".into(), major.into());
            if let Some(minor) = minor {
                vars.insert("python_minor".into(), minor.into());
            }
        }
        ctx.run_playbook("python.yml", vars).await?;
        ctx.emitter.progress(90);
        Ok(())
    }

    async fn verify(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.check_mode {
            ctx.emitter.log(LogLevel::Info, "check mode: skipping verification");
            return Ok(());
        }
        let probe = ProbeSpec::shell(format!("{} --version 2>&1", interpreter_path(ctx)));
        let result = ctx.exec.probe(&ctx.host, &probe).await?;
        if result.ok && reported_version_matches(&result.stdout, &ctx.pkg.version) {
            Ok(())
        } else {
            Err(Error::install_failed(
                &ctx.pkg.name,
                &ctx.host.name,
                format!(
                    "verification failed: expected python {}, got '{}'",
                    ctx.pkg.version,
                    result.stdout.trim()
                ),
            ))
        }
    }
}

/// `{install_path}/bin/python{major}.{minor}`, degrading to the bare major
/// when the declared version has no minor.
fn interpreter_path(ctx: &InstallContext<'_>) -> String {
    let prefix = ctx.pkg.install_path.display();
    match split_version(&ctx.pkg.version) {
        Some((major, Some(minor))) => format!("{prefix}/bin/python{major}.{minor}"),
        Some((major, None)) => format!("{prefix}/bin/python{major}"),
        None => format!("{prefix}/bin/python"),
    }
}

fn split_version(version: &str) -> Option<(u32, Option<u32>)> {
    let mut parts = version.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next().and_then(|m| m.trim().parse().ok());
    Some((major, minor))
}

/// `Python 3.9.18` matches a declared "3.9" or "3.9.18".
fn reported_version_matches(output: &str, declared: &str) -> bool {
    output
        .trim()
        .strip_prefix("Python ")
        .is_some_and(|v| v == declared || v.starts_with(&format!("{declared}.")))
}
