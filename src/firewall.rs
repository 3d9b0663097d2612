//! Forwarding and masquerade rules for tunnel subnets

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::VpnResult;
use crate::exec::{run_checked, CommandRunner, CommandSpec};
use crate::validation;

/// One iptables rule, table plus chain and match arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn command(&self, action: &str) -> Vec<String> {
        let mut argv = vec!["-t".to_string(), self.table.to_string(), action.to_string(), self.chain.to_string()];
        argv.extend(self.spec.iter().cloned());
        argv
    }
}

/// Rules that let a tunnel interface (or `ppp+` pattern) reach the uplink.
/// Every rule matches on the subnet so protocols sharing `ppp+` never
/// remove each other's rules.
pub fn rules_for(interface: &str, subnet: &str, uplink: &str) -> Vec<Rule> {
    let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        Rule { table: "filter", chain: "FORWARD", spec: owned(&["-i", interface, "-s", subnet, "-j", "ACCEPT"]) },
        Rule { table: "filter", chain: "FORWARD", spec: owned(&["-o", interface, "-d", subnet, "-j", "ACCEPT"]) },
        Rule {
            table: "nat",
            chain: "POSTROUTING",
            spec: owned(&["-s", subnet, "-o", uplink, "-j", "MASQUERADE"]),
        },
    ]
}

/// Firewall/NAT binder
pub struct FirewallBinder {
    runner: Arc<dyn CommandRunner>,
    uplink: String,
    timeout: Duration,
}

impl FirewallBinder {
    pub fn new(runner: Arc<dyn CommandRunner>, uplink: &str, timeout: Duration) -> VpnResult<Self> {
        validation::validate_interface_name(uplink)?;
        Ok(Self { runner, uplink: uplink.to_string(), timeout })
    }

    /// Enable forwarding and add any missing rule. Safe to call repeatedly.
    pub async fn bind(&self, interface: &str, subnet: &str) -> VpnResult<()> {
        validation::validate_interface_name(interface.trim_end_matches('+'))?;
        let subnet = validation::validate_subnet(subnet)?.to_string();

        let sysctl = CommandSpec::new("sysctl").args(["-w", "net.ipv4.ip_forward=1"]).timeout(self.timeout);
        run_checked(self.runner.as_ref(), &sysctl, "enable IPv4 forwarding").await?;

        for rule in rules_for(interface, &subnet, &self.uplink) {
            let check = self.iptables(rule.command("-C"));
            if self.runner.run(&check).await?.success() {
                debug!("Rule present: {}", check);
                continue;
            }
            let append = self.iptables(rule.command("-A"));
            run_checked(self.runner.as_ref(), &append, "add firewall rule").await?;
        }

        info!("Bound {} ({}) to uplink {}", interface, subnet, self.uplink);
        Ok(())
    }

    /// Remove the rules. Failures are logged and ignored.
    pub async fn unbind(&self, interface: &str, subnet: &str) {
        let subnet = match validation::validate_subnet(subnet) {
            Ok(net) => net.to_string(),
            Err(e) => {
                warn!("Cannot unbind {}: {}", interface, e);
                return;
            }
        };

        for rule in rules_for(interface, &subnet, &self.uplink) {
            let delete = self.iptables(rule.command("-D"));
            match run_checked(self.runner.as_ref(), &delete, "remove firewall rule").await {
                Ok(_) => debug!("Removed: {}", delete),
                Err(e) => warn!("{}", e),
            }
        }

        info!("Unbound {} ({})", interface, subnet);
    }

    fn iptables(&self, argv: Vec<String>) -> CommandSpec {
        CommandSpec::new("iptables").args(argv).timeout(self.timeout)
    }
}
