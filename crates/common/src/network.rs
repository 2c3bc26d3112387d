// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Network utility functions

use std::net::IpAddr;

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Fail-safe: if we can't parse it, assume non-loopback
    false
}

/// Join host and port, bracketing bare IPv6 literals ("::1" -> "[::1]:22")
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split "host:port" (or "[v6]:port") into its parts
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        // IPv4 loopback
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.255.255.255"));

        // IPv6 loopback
        assert!(is_loopback_address("::1"));

        // Hostname
        assert!(is_loopback_address("localhost"));
        assert!(is_loopback_address("LocalHost"));

        // Non-loopback addresses
        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("192.168.1.1"));
        assert!(!is_loopback_address("db.example.com"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("example.com", 22), "example.com:22");
        assert_eq!(format_host_port("10.0.0.5", 2222), "10.0.0.5:2222");
        assert_eq!(format_host_port("::1", 22), "[::1]:22");
        assert_eq!(format_host_port("[::1]", 22), "[::1]:22");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("127.0.0.1:3443"), Some(("127.0.0.1", 3443)));
        assert_eq!(split_host_port("[::1]:3443"), Some(("::1", 3443)));
        assert_eq!(split_host_port("localhost"), None);
        assert_eq!(split_host_port("localhost:http"), None);
    }
}
