//! Daemon supervision through systemd

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::VpnResult;
use crate::exec::{run_checked, CommandRunner, CommandSpec};

/// Starts, stops and probes system services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn enable(&self, service: &str) -> VpnResult<()>;
    async fn start(&self, service: &str) -> VpnResult<()>;
    async fn stop(&self, service: &str) -> VpnResult<()>;
    /// Stop and start again so the daemon rereads its configuration
    async fn restart(&self, service: &str) -> VpnResult<()>;
    async fn disable(&self, service: &str) -> VpnResult<()>;
    async fn is_active(&self, service: &str) -> bool;
}

/// `systemctl` backed supervisor
pub struct Systemd {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Systemd {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn systemctl(&self, verb: &str, service: &str) -> VpnResult<()> {
        let spec = CommandSpec::new("systemctl").args([verb, service]).timeout(self.timeout);
        run_checked(self.runner.as_ref(), &spec, &format!("{} {}", verb, service)).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceSupervisor for Systemd {
    async fn enable(&self, service: &str) -> VpnResult<()> {
        self.systemctl("enable", service).await
    }

    async fn start(&self, service: &str) -> VpnResult<()> {
        info!("Starting service {}", service);
        self.systemctl("start", service).await
    }

    async fn stop(&self, service: &str) -> VpnResult<()> {
        info!("Stopping service {}", service);
        self.systemctl("stop", service).await
    }

    async fn restart(&self, service: &str) -> VpnResult<()> {
        info!("Restarting service {}", service);
        self.systemctl("restart", service).await
    }

    async fn disable(&self, service: &str) -> VpnResult<()> {
        self.systemctl("disable", service).await
    }

    async fn is_active(&self, service: &str) -> bool {
        let spec = CommandSpec::new("systemctl")
            .args(["is-active", "--quiet", service])
            .timeout(self.timeout);
        match self.runner.run(&spec).await {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("is-active probe for {} failed: {}", service, e);
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

    struct InactiveRunner;

    #[async_trait]
    impl CommandRunner for InactiveRunner {
        async fn run(&self, spec: &CommandSpec) -> VpnResult<CommandOutput> {
            match spec.args.first().map(String::as_str) {
                Some("is-active") => Ok(CommandOutput::failed(3, "")),
                Some("start") => Ok(CommandOutput::failed(1, "Job for pptpd.service failed.")),
                _ => Ok(CommandOutput::ok("")),
            }
        }
    }

    #[tokio::test]
    async fn test_systemd_reports_failures() {
        let systemd = Systemd::new(Arc::new(InactiveRunner), Duration::from_secs(5));
        assert!(!systemd.is_active("pptpd").await);
        assert!(systemd.enable("pptpd").await.is_ok());

        match systemd.start("pptpd").await {
            Err(VpnError::ExternalFailure { step, cmd, .. }) => {
                assert_eq!(step, "start pptpd");
                assert_eq!(cmd, "systemctl start pptpd");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_systemd_restart() {
        let runner = Arc::new(crate::exec::testing::ScriptedRunner::new(|_| CommandOutput::ok("")));
        let systemd = Systemd::new(runner.clone(), Duration::from_secs(5));
        systemd.restart("xl2tpd").await.unwrap();
        assert_eq!(runner.command_lines(), vec!["systemctl restart xl2tpd".to_string()]);
    }
}
