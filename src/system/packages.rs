//! System package installation through dpkg/apt

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::VpnResult;
use crate::exec::{run_checked, CommandRunner, CommandSpec};

/// Installs and probes system packages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Install every package in `names` that is not present yet
    async fn ensure_installed(&self, names: &[String]) -> VpnResult<()>;

    /// Whether a package is installed. Probe failures count as "no".
    async fn is_installed(&self, name: &str) -> bool;
}

/// Debian/Ubuntu installer
pub struct AptInstaller {
    runner: Arc<dyn CommandRunner>,
    probe_timeout: Duration,
    install_timeout: Duration,
}

impl AptInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, probe_timeout: Duration, install_timeout: Duration) -> Self {
        Self { runner, probe_timeout, install_timeout }
    }
}

#[async_trait]
impl PackageInstaller for AptInstaller {
    async fn ensure_installed(&self, names: &[String]) -> VpnResult<()> {
        let mut missing = Vec::new();
        for name in names {
            if !self.is_installed(name).await {
                missing.push(name.clone());
            }
        }

        if missing.is_empty() {
            debug!("Packages already installed: {}", names.join(", "));
            return Ok(());
        }

        info!("Installing packages: {}", missing.join(", "));

        let update = CommandSpec::new("apt-get")
            .arg("update")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .timeout(self.install_timeout);
        run_checked(self.runner.as_ref(), &update, "refresh package index").await?;

        let install = CommandSpec::new("apt-get")
            .args(["install", "-y"])
            .args(missing.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive")
            .timeout(self.install_timeout);
        run_checked(self.runner.as_ref(), &install, "install packages").await?;

        info!("Installed packages: {}", missing.join(", "));
        Ok(())
    }

    async fn is_installed(&self, name: &str) -> bool {
        let spec = CommandSpec::new("dpkg-query")
            .args(["-W", "-f=${Status}", name])
            .timeout(self.probe_timeout);
        match self.runner.run(&spec).await {
            Ok(out) => out.success() && out.stdout.contains("install ok installed"),
            Err(e) => {
                debug!("Package probe for {} failed: {}", name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VpnError;
    use crate::exec::CommandOutput;
    use std::sync::Mutex;

    /// Answers dpkg-query from a fixed package set and records installs
    struct ScriptedRunner {
        installed: Vec<&'static str>,
        calls: Mutex<Vec<CommandSpec>>,
        fail_install: bool,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> VpnResult<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            match spec.program.as_str() {
                "dpkg-query" => {
                    let pkg = spec.args.last().map(String::as_str).unwrap_or_default();
                    if self.installed.contains(&pkg) {
                        Ok(CommandOutput::ok("install ok installed"))
                    } else {
                        Ok(CommandOutput::failed(1, "no packages found"))
                    }
                }
                "apt-get" if self.fail_install && spec.args.first().map(String::as_str) == Some("install") => {
                    Ok(CommandOutput::failed(100, "E: Unable to locate package"))
                }
                _ => Ok(CommandOutput::ok("")),
            }
        }
    }

    fn installer(runner: Arc<ScriptedRunner>) -> AptInstaller {
        AptInstaller::new(runner, Duration::from_secs(5), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_only_missing_packages_are_installed() {
        let runner = Arc::new(ScriptedRunner {
            installed: vec!["wireguard-tools"],
            calls: Mutex::new(Vec::new()),
            fail_install: false,
        });
        let apt = installer(runner.clone());

        apt.ensure_installed(&["wireguard".to_string(), "wireguard-tools".to_string()]).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        let install = calls
            .iter()
            .find(|c| c.program == "apt-get" && c.args.first().map(String::as_str) == Some("install"))
            .unwrap();
        assert_eq!(install.args, vec!["install", "-y", "wireguard"]);
        assert!(install.env.contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
        assert_eq!(install.timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_nothing_to_install_skips_apt() {
        let runner = Arc::new(ScriptedRunner {
            installed: vec!["pptpd"],
            calls: Mutex::new(Vec::new()),
            fail_install: false,
        });
        let apt = installer(runner.clone());

        apt.ensure_installed(&["pptpd".to_string()]).await.unwrap();
        assert!(runner.calls.lock().unwrap().iter().all(|c| c.program != "apt-get"));
    }

    #[tokio::test]
    async fn test_install_failure_is_reported() {
        let runner = Arc::new(ScriptedRunner {
            installed: vec![],
            calls: Mutex::new(Vec::new()),
            fail_install: true,
        });
        let apt = installer(runner);

        let err = apt.ensure_installed(&["xl2tpd".to_string()]).await.unwrap_err();
        assert!(matches!(err, VpnError::ExternalFailure { code: Some(100), .. }));
    }
}
