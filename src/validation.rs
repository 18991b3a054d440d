//! Input validation and sanitization
//!
//! Values that end up on a packet-filter or daemon command line pass through
//! here first, so shell metacharacters and malformed addresses never reach
//! an external process.

use crate::error::{GateError, GateResult};
use std::net::Ipv4Addr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for error messages shown to users
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> GateResult<()> {
    if name.is_empty() {
        return Err(GateError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(GateError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(GateError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(GateError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate a dotted-quad IPv4 address
pub fn validate_ipv4(addr: &str) -> GateResult<Ipv4Addr> {
    addr.parse::<Ipv4Addr>()
        .map_err(|_| GateError::InvalidParameter(
            format!("Invalid IPv4 address: {}", addr)
        ))
}

/// Parse IPv4 CIDR notation (`10.8.0.0/24`) into address and prefix length
pub fn parse_cidr(cidr: &str) -> GateResult<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')
        .ok_or_else(|| GateError::InvalidParameter(format!("Invalid CIDR address: {}", cidr)))?;

    let addr = validate_ipv4(addr)?;
    let prefix = prefix.parse::<u8>()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| GateError::InvalidParameter(format!("Invalid CIDR prefix: {}", cidr)))?;

    Ok((addr, prefix))
}

/// Network address and dotted netmask of a CIDR block
pub fn expand_cidr(cidr: &str) -> GateResult<(Ipv4Addr, Ipv4Addr)> {
    let (addr, prefix) = parse_cidr(cidr)?;
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u32::from(addr) & mask;
    Ok((Ipv4Addr::from(network), Ipv4Addr::from(mask)))
}

/// Validate a firewall destination: a bare IPv4 address or a CIDR block
pub fn validate_destination(value: &str) -> GateResult<()> {
    if value.contains('/') {
        parse_cidr(value).map(|_| ())
    } else {
        validate_ipv4(value).map(|_| ())
    }
}

/// Validate a packet-filter port specification
///
/// Accepts a single port, a `low:high` range, or a comma-separated mix of
/// both (`22,80:443`). Each number must fit a port; the number of entries
/// and overlapping ranges are deliberately not checked.
pub fn validate_port_spec(spec: &str) -> GateResult<()> {
    if spec.is_empty() {
        return Err(GateError::InvalidParameter("Port specification cannot be empty".to_string()));
    }

    for item in spec.split(',') {
        let bounds: Vec<&str> = item.split(':').collect();
        if bounds.len() > 2 {
            return Err(GateError::InvalidParameter(format!("Invalid port range: {}", item)));
        }
        for bound in bounds {
            bound.parse::<u16>()
                .map_err(|_| GateError::InvalidParameter(format!("Invalid port: {:?}", bound)))?;
        }
    }

    Ok(())
}

/// Validate hostname used by clients to reach the server
pub fn validate_hostname(host: &str) -> GateResult<()> {
    if host.is_empty() {
        return Err(GateError::InvalidParameter(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > 253 {
        return Err(GateError::InvalidParameter(
            "Hostname too long".to_string()
        ));
    }

    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(GateError::InvalidParameter(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(GateError::InvalidParameter(
            "Invalid hostname format".to_string()
        ));
    }

    Ok(())
}

/// Trim command stderr before it lands in a log line or error message
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut end = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized.truncate(end);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        assert!(validate_interface_name("eth0").is_ok());
        assert!(validate_interface_name("tun0").is_ok());
        assert!(validate_interface_name("br-lan").is_ok());
        assert!(validate_interface_name("eth0.100").is_ok());

        assert!(validate_interface_name("eth0; rm -rf /").is_err());
        assert!(validate_interface_name("eth0 && echo pwned").is_err());
        assert!(validate_interface_name("verylonginterfacename").is_err());
        assert!(validate_interface_name("-eth0").is_err());
        assert!(validate_interface_name("").is_err());
    }

    #[test]
    fn test_cidr() {
        assert_eq!(parse_cidr("10.8.0.0/24").unwrap(), (Ipv4Addr::new(10, 8, 0, 0), 24));
        assert!(parse_cidr("10.8.0.0").is_err());
        assert!(parse_cidr("10.8.0.0/33").is_err());
        assert!(parse_cidr("10.8.0/24").is_err());

        let (network, mask) = expand_cidr("10.8.3.17/22").unwrap();
        assert_eq!(network, Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(mask, Ipv4Addr::new(255, 255, 252, 0));

        let (network, mask) = expand_cidr("0.0.0.0/0").unwrap();
        assert_eq!(network, Ipv4Addr::UNSPECIFIED);
        assert_eq!(mask, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_destination() {
        assert!(validate_destination("192.168.1.10").is_ok());
        assert!(validate_destination("192.168.0.0/16").is_ok());
        assert!(validate_destination("192.168.0.0/40").is_err());
        assert!(validate_destination("example.com").is_err());
        assert!(validate_destination("1.1.1.1 -j ACCEPT").is_err());
    }

    #[test]
    fn test_port_spec_is_permissive() {
        assert!(validate_port_spec("22").is_ok());
        assert!(validate_port_spec("80:443").is_ok());
        assert!(validate_port_spec("22,80:443").is_ok());
        // reversed and overlapping ranges are passed through to the engine
        assert!(validate_port_spec("443:80,80:90").is_ok());

        assert!(validate_port_spec("").is_err());
        assert!(validate_port_spec("70000").is_err());
        assert!(validate_port_spec("1:2:3").is_err());
        assert!(validate_port_spec("22,").is_err());
        assert!(validate_port_spec("ssh").is_err());
    }

    #[test]
    fn test_hostname() {
        assert!(validate_hostname("vpn.example.com").is_ok());
        assert!(validate_hostname("203.0.113.5").is_ok());
        assert!(validate_hostname("vpn.example.com.").is_err());
        assert!(validate_hostname("vpn example").is_err());
    }

    #[test]
    fn test_sanitize_error_message() {
        assert_eq!(sanitize_error_message("  Bad rule\n"), "Bad rule");
        let long = "x".repeat(600);
        assert!(sanitize_error_message(&long).ends_with("... (truncated)"));
    }
}
