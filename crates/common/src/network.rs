// Shadowlink - Network Helpers

use std::net::IpAddr;

use tokio::net::TcpListener;

/// True when `host` names the local machine (loopback IP or `localhost`).
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Join a host and port, bracketing IPv6 literals.
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Probe whether `port` can still be bound on the loopback interface.
///
/// The probe binds and immediately drops a listener, so the answer is
/// advisory; the caller still has to handle bind errors on the real
/// listener.
pub async fn local_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("localhost"));
        assert!(is_loopback_address("LOCALHOST"));
        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("192.168.1.10"));
        assert!(!is_loopback_address("example.com"));
    }

    #[test]
    fn host_port_formatting() {
        assert_eq!(format_host_port("example.com", 8388), "example.com:8388");
        assert_eq!(format_host_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(format_host_port("::1", 1095), "[::1]:1095");
    }

    #[tokio::test]
    async fn port_probe_reflects_bound_listeners() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!local_port_available(port).await);
        drop(listener);
        assert!(local_port_available(port).await);
    }
}
