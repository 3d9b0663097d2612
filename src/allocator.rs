//! Host address allocation inside a protocol subnet
//!
//! The network address is never handed out and the first host belongs to the
//! server side of the tunnel, so the first client gets `.2` in a /24.

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{VpnError, VpnResult};
use crate::validation;

/// What happens to addresses freed by deleted peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReusePolicy {
    /// Always hand out the lowest free address; freed addresses come back
    #[default]
    Lowest,
    /// Never go back below the highest address ever allocated
    Advance,
}

/// Server side address: first host of the subnet with the subnet prefix
pub fn server_address(subnet: &str) -> VpnResult<Ipv4Net> {
    let net = validation::validate_subnet(subnet)?;
    let first = u32::from(net.network()) + 1;
    Ipv4Net::new(Ipv4Addr::from(first), net.prefix_len())
        .map_err(|e| VpnError::InvalidParameter(format!("Invalid subnet {}: {}", subnet, e)))
}

/// First and last address of the dynamic client pool used by the PPP based
/// daemons: `.100` to `.200` in a /24, clamped to the subnet for smaller ones
pub fn client_pool(subnet: &str) -> VpnResult<(Ipv4Addr, Ipv4Addr)> {
    let net = validation::validate_subnet(subnet)?;
    let network = u32::from(net.network());
    // prefix is at most /30, so the subnet holds at least two hosts
    let last_host = u32::from(net.broadcast()) - 1;

    let start = match network.checked_add(100) {
        Some(start) if start <= last_host => start,
        _ => network + 2,
    };
    let end = start.saturating_add(100).min(last_host);
    Ok((Ipv4Addr::from(start), Ipv4Addr::from(end)))
}

/// Addresses already taken inside `subnet`, extracted from peers' allowed
/// address lists. Entries outside the subnet or not parseable are ignored.
pub fn used_addresses<'a, I>(subnet: &Ipv4Net, allowed_ips: I) -> HashSet<Ipv4Addr>
where
    I: IntoIterator<Item = &'a str>,
{
    allowed_ips
        .into_iter()
        .flat_map(|list| list.split(','))
        .filter_map(|entry| entry.trim().parse::<IpNet>().ok())
        .filter_map(|net| match net {
            IpNet::V4(v4) if net.prefix_len() == 32 && subnet.contains(&v4.addr()) => Some(v4.addr()),
            _ => None,
        })
        .collect()
}

/// Next free /32 in `subnet`
///
/// `cursor` is the highest address ever allocated; it only matters for
/// [`ReusePolicy::Advance`].
pub fn next_available_address(
    subnet: &str,
    used: &HashSet<Ipv4Addr>,
    policy: ReusePolicy,
    cursor: Option<Ipv4Addr>,
) -> VpnResult<Ipv4Net> {
    let net = validation::validate_subnet(subnet)?;
    let network = u32::from(net.network());
    let broadcast = u32::from(net.broadcast());

    let mut first = network + 2;
    if policy == ReusePolicy::Advance {
        if let Some(cursor) = cursor.filter(|c| net.contains(c)) {
            first = first.max(u32::from(cursor).saturating_add(1));
        }
    }

    (first..broadcast)
        .map(Ipv4Addr::from)
        .find(|addr| !used.contains(addr))
        .map(|addr| Ipv4Net::new(addr, 32).map_err(|e| VpnError::InvalidParameter(e.to_string())))
        .unwrap_or_else(|| Err(VpnError::Conflict(format!("No free addresses left in {}", net))))
}

/// Whether two allowed address lists share any address
pub fn overlaps(a: &[IpNet], b: &[IpNet]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.contains(&y.network()) || y.contains(&x.network())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(addrs: &[&str]) -> HashSet<Ipv4Addr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_first_allocation_skips_network_and_server() {
        let addr = next_available_address("10.8.0.0/24", &HashSet::new(), ReusePolicy::Lowest, None).unwrap();
        assert_eq!(addr.to_string(), "10.8.0.2/32");
        assert_eq!(server_address("10.8.0.0/24").unwrap().to_string(), "10.8.0.1/24");
    }

    #[test]
    fn test_n_occupied_gives_next() {
        let taken = used(&["10.8.0.2", "10.8.0.3", "10.8.0.4"]);
        let addr = next_available_address("10.8.0.0/24", &taken, ReusePolicy::Lowest, None).unwrap();
        assert_eq!(addr.to_string(), "10.8.0.5/32");
    }

    #[test]
    fn test_lowest_reuses_freed_address() {
        // .3 was deleted
        let taken = used(&["10.8.0.2", "10.8.0.4"]);
        let addr = next_available_address("10.8.0.0/24", &taken, ReusePolicy::Lowest, Some("10.8.0.4".parse().unwrap())).unwrap();
        assert_eq!(addr.to_string(), "10.8.0.3/32");
    }

    #[test]
    fn test_advance_skips_freed_address() {
        let taken = used(&["10.8.0.2", "10.8.0.4"]);
        let addr = next_available_address("10.8.0.0/24", &taken, ReusePolicy::Advance, Some("10.8.0.4".parse().unwrap())).unwrap();
        assert_eq!(addr.to_string(), "10.8.0.5/32");

        // A cursor from another subnet is ignored
        let addr = next_available_address("10.8.0.0/24", &taken, ReusePolicy::Advance, Some("192.168.1.9".parse().unwrap())).unwrap();
        assert_eq!(addr.to_string(), "10.8.0.3/32");
    }

    #[test]
    fn test_exhaustion_is_conflict() {
        // /30 has hosts .1 (server) and .2
        let taken = used(&["10.8.0.2"]);
        assert!(matches!(
            next_available_address("10.8.0.0/30", &taken, ReusePolicy::Lowest, None),
            Err(VpnError::Conflict(_))
        ));

        let cursor = Some("10.8.0.2".parse().unwrap());
        assert!(matches!(
            next_available_address("10.8.0.0/30", &HashSet::new(), ReusePolicy::Advance, cursor),
            Err(VpnError::Conflict(_))
        ));
    }

    #[test]
    fn test_used_addresses_extraction() {
        let subnet: Ipv4Net = "10.8.0.0/24".parse().unwrap();
        let lists = ["10.8.0.2/32", "10.8.0.3/32, fd00::3/128", "192.168.0.5/32", "10.8.0.0/25", "garbage"];
        let found = used_addresses(&subnet, lists.iter().copied());
        assert_eq!(found, used(&["10.8.0.2", "10.8.0.3"]));
    }

    #[test]
    fn test_overlaps() {
        let a = vec!["10.8.0.0/25".parse::<IpNet>().unwrap()];
        let b = vec!["10.8.0.7/32".parse::<IpNet>().unwrap()];
        let c = vec!["10.8.0.200/32".parse::<IpNet>().unwrap()];
        assert!(overlaps(&a, &b));
        assert!(overlaps(&b, &a));
        assert!(!overlaps(&a, &c));
    }

    #[test]
    fn test_client_pool() {
        let (start, end) = client_pool("10.10.0.0/24").unwrap();
        assert_eq!(start.to_string(), "10.10.0.100");
        assert_eq!(end.to_string(), "10.10.0.200");

        let (start, end) = client_pool("10.10.0.0/28").unwrap();
        assert_eq!(start.to_string(), "10.10.0.2");
        assert_eq!(end.to_string(), "10.10.0.14");
    }

    #[test]
    fn test_client_pool_at_top_of_address_space() {
        let (start, end) = client_pool("255.255.255.224/27").unwrap();
        assert_eq!(start.to_string(), "255.255.255.226");
        assert_eq!(end.to_string(), "255.255.255.254");

        let (start, end) = client_pool("255.255.255.0/24").unwrap();
        assert_eq!(start.to_string(), "255.255.255.100");
        assert_eq!(end.to_string(), "255.255.255.200");

        let (start, end) = client_pool("255.255.255.252/30").unwrap();
        assert_eq!(start, end);
        assert_eq!(start.to_string(), "255.255.255.254");
    }

    #[test]
    fn test_cursor_at_broadcast_is_exhaustion() {
        let cursor = Some("255.255.255.255".parse().unwrap());
        assert!(matches!(
            next_available_address("255.255.255.252/30", &HashSet::new(), ReusePolicy::Advance, cursor),
            Err(VpnError::Conflict(_))
        ));
    }
}
