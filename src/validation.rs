//! Input validation and sanitization
//!
//! Everything that ends up on an `ip`/`wg`/`iptables` command line or inside a
//! rendered configuration file passes through here first.

use crate::error::{VpnError, VpnResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::{IpNet, Ipv4Net};
use std::net::IpAddr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for peer and user display names
const MAX_NAME_LEN: usize = 64;

/// Maximum length for free-text values (descriptions, emails)
const MAX_TEXT_LEN: usize = 255;

/// Maximum length for error messages shown to users
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> VpnResult<()> {
    if name.is_empty() {
        return Err(VpnError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(VpnError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(VpnError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    // A leading dash would be read as an option
    if name.starts_with('-') {
        return Err(VpnError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate IP address
pub fn validate_ip_address(addr: &str) -> VpnResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| VpnError::InvalidParameter(
            format!("Invalid IP address: {}", addr)
        ))
}

/// Validate a CIDR block such as "10.8.0.2/32" or "fd00::/64"
pub fn validate_cidr(cidr: &str) -> VpnResult<IpNet> {
    cidr.trim().parse::<IpNet>()
        .map_err(|_| VpnError::InvalidParameter(
            format!("Invalid CIDR: {}", cidr)
        ))
}

/// Validate a comma separated allowed-address list
pub fn validate_allowed_ips(list: &str) -> VpnResult<Vec<IpNet>> {
    let nets = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(validate_cidr)
        .collect::<VpnResult<Vec<_>>>()?;

    if nets.is_empty() {
        return Err(VpnError::InvalidParameter(
            "Allowed IPs cannot be empty".to_string()
        ));
    }

    Ok(nets)
}

/// Validate a protocol subnet. Only IPv4 subnets with room for the server
/// and at least one peer are accepted.
pub fn validate_subnet(subnet: &str) -> VpnResult<Ipv4Net> {
    let net = subnet.trim().parse::<Ipv4Net>()
        .map_err(|_| VpnError::InvalidParameter(
            format!("Invalid IPv4 subnet: {}", subnet)
        ))?;

    if net.prefix_len() > 30 {
        return Err(VpnError::InvalidParameter(
            format!("Subnet {} is too small (max prefix /30)", subnet)
        ));
    }

    Ok(net.trunc())
}

/// Validate port number
pub fn validate_port(port: u16) -> VpnResult<()> {
    if port == 0 {
        return Err(VpnError::InvalidParameter(
            "Port cannot be 0".to_string()
        ));
    }
    Ok(())
}

/// Validate a display name (peer or user)
///
/// Names end up in configuration file comments, so control characters and
/// anything that could start a new section are refused.
pub fn validate_name(name: &str) -> VpnResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VpnError::InvalidParameter(
            "Name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(VpnError::InvalidParameter(
            format!("Name too long (max {} characters)", MAX_NAME_LEN)
        ));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(VpnError::InvalidParameter(
            "Name contains control characters".to_string()
        ));
    }

    if name.starts_with('[') {
        return Err(VpnError::InvalidParameter(
            "Name cannot start with '['".to_string()
        ));
    }

    Ok(())
}

/// Validate a username: alphanumeric plus `.`, `-`, `_`
pub fn validate_username(username: &str) -> VpnResult<()> {
    validate_name(username)?;
    for c in username.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(VpnError::InvalidParameter(
                format!("Invalid username character: {}", c)
            ));
        }
    }
    Ok(())
}

/// Loose email shape check: one '@', non-empty local and domain parts
pub fn validate_email(email: &str) -> VpnResult<()> {
    if email.len() > MAX_TEXT_LEN || email.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(VpnError::InvalidParameter(
            format!("Invalid email: {}", email)
        ));
    }

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => Ok(()),
        _ => Err(VpnError::InvalidParameter(
            format!("Invalid email: {}", email)
        )),
    }
}

/// Validate a WireGuard key: base64 of exactly 32 bytes
pub fn validate_wg_key(key: &str) -> VpnResult<[u8; 32]> {
    let bytes = BASE64.decode(key.trim())
        .map_err(|_| VpnError::InvalidParameter("Key is not valid base64".to_string()))?;

    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| VpnError::InvalidParameter(
            format!("Key must be 32 bytes, got {}", bytes.len())
        ))
}

/// Sanitize free-text configuration values to prevent injection
pub fn sanitize_config_value(value: &str) -> VpnResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(VpnError::InvalidParameter(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_TEXT_LEN {
        return Err(VpnError::InvalidParameter(
            format!("Configuration value too long (max {} characters)", MAX_TEXT_LEN)
        ));
    }

    Ok(value.trim().to_string())
}

/// Validate hostname or address used as the public server endpoint
pub fn validate_hostname(host: &str) -> VpnResult<()> {
    if host.is_empty() {
        return Err(VpnError::InvalidParameter(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > 253 {
        return Err(VpnError::InvalidParameter(
            "Hostname too long".to_string()
        ));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(VpnError::InvalidParameter(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(VpnError::InvalidParameter(
            "Invalid hostname format".to_string()
        ));
    }

    Ok(())
}

/// Sanitize error messages to prevent information disclosure
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
