//! Parses the guest's serial console log to recover its DHCP-assigned
//! address — the only channel available to observe the guest before SSH is
//! reachable.

use regex::Regex;
use std::sync::LazyLock;

const SUBNET_PREFIX: &str = "192.168.127.";
const GATEWAY: &str = "192.168.127.1";
const BROADCAST: &str = "192.168.127.255";

static IFACE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"enp\d+s\d+:\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap());
static ADDR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"inet\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap());

/// Scan `log_text` from newest to oldest line and return the first guest
/// IPv4 address in the proxy subnet, excluding the gateway and broadcast
/// addresses. Returns empty if none is present. The newest-match policy
/// matters because the guest may reacquire a different address after a
/// reboot.
pub fn extract_guest_ip(log_text: &str) -> String {
    for line in log_text.lines().rev() {
        if let Some(ip) = find_match(line) {
            if is_valid_guest_ip(&ip) {
                return ip;
            }
        }
    }
    String::new()
}

fn find_match(line: &str) -> Option<String> {
    IFACE_PATTERN
        .captures(line)
        .or_else(|| ADDR_PATTERN.captures(line))
        .map(|c| c[1].to_string())
}

fn is_valid_guest_ip(ip: &str) -> bool {
    ip.starts_with(SUBNET_PREFIX) && ip != GATEWAY && ip != BROADCAST
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_empty_when_nothing_matches() {
        assert_eq!(extract_guest_ip("booting...\nno addresses here\n"), "");
    }

    #[test]
    fn matches_interface_prefix_pattern() {
        let log = "enp0s1: 192.168.127.42\n";
        assert_eq!(extract_guest_ip(log), "192.168.127.42");
    }

    #[test]
    fn matches_iproute2_inet_pattern() {
        let log = "    inet 192.168.127.17/24 brd 192.168.127.255 scope global enp0s1\n";
        assert_eq!(extract_guest_ip(log), "192.168.127.17");
    }

    #[test]
    fn excludes_gateway_and_broadcast() {
        let log = "inet 192.168.127.1/24\ninet 192.168.127.255/24\n";
        assert_eq!(extract_guest_ip(log), "");
    }

    #[test]
    fn most_recent_match_wins_across_reboot() {
        let log = "inet 192.168.127.2/24\nenp0s1: 192.168.127.7\n";
        assert_eq!(extract_guest_ip(log), "192.168.127.7");
    }

    #[test]
    fn ignores_addresses_outside_the_proxy_subnet() {
        let log = "inet 10.0.0.5/24\n";
        assert_eq!(extract_guest_ip(log), "");
    }
}
