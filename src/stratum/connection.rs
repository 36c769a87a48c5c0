//! Per-connection miner session state.

use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Wire dialect spoken by a miner, fixed at first detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Unknown,
    EthProxy,
    Stratum,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Unknown => "unknown",
            Protocol::EthProxy => "ethproxy",
            Protocol::Stratum => "stratum",
        }
    }
}

pub struct Connection {
    /// Unique session ID
    pub session_id: String,

    /// Peer address
    pub peer_addr: SocketAddr,

    /// Detected dialect
    pub protocol: Protocol,

    /// True after a successful login/authorize
    pub authorized: bool,

    /// Worker name from login/authorize
    pub worker_name: String,

    /// Share statistics
    pub shares_accepted: u64,
    pub shares_rejected: u64,

    /// One-shot close flag; no writes once set
    pub closed: bool,

    /// Writer-task handle; every frame to the miner goes through here
    pub outbound: Option<mpsc::UnboundedSender<String>>,
}

impl Connection {
    pub fn new(session_id: String, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
            protocol: Protocol::Unknown,
            authorized: false,
            worker_name: "unknown".to_string(),
            shares_accepted: 0,
            shares_rejected: 0,
            closed: false,
            outbound: None,
        }
    }

    /// Fix the dialect from the first dialect-exclusive method seen.
    pub fn detect_protocol(&mut self, method: &str) {
        if self.protocol != Protocol::Unknown {
            return;
        }

        self.protocol = match method {
            "eth_submitLogin" => Protocol::EthProxy,
            "mining.subscribe" | "mining.authorize" => Protocol::Stratum,
            _ => Protocol::Unknown,
        };

        if self.protocol != Protocol::Unknown {
            tracing::debug!(
                "detected protocol {} for session {}",
                self.protocol.as_str(),
                self.session_id
            );
        }
    }

    /// Record the outcome of one submit response.
    pub fn record_share(&mut self, accepted: bool) {
        if accepted {
            self.shares_accepted += 1;
        } else {
            self.shares_rejected += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    #[test]
    fn test_connection_creation() {
        let conn = Connection::new("test-session".to_string(), test_addr());

        assert_eq!(conn.protocol, Protocol::Unknown);
        assert!(!conn.authorized);
        assert!(!conn.closed);
        assert_eq!(conn.worker_name, "unknown");
        assert_eq!(conn.shares_accepted + conn.shares_rejected, 0);
    }

    #[test]
    fn test_protocol_detection() {
        let mut conn = Connection::new("a".to_string(), test_addr());
        conn.detect_protocol("eth_submitLogin");
        assert_eq!(conn.protocol, Protocol::EthProxy);

        let mut conn2 = Connection::new("b".to_string(), test_addr());
        conn2.detect_protocol("mining.subscribe");
        assert_eq!(conn2.protocol, Protocol::Stratum);

        let mut conn3 = Connection::new("c".to_string(), test_addr());
        conn3.detect_protocol("mining.authorize");
        assert_eq!(conn3.protocol, Protocol::Stratum);
    }

    #[test]
    fn test_protocol_fixed_once_detected() {
        let mut conn = Connection::new("test".to_string(), test_addr());
        conn.detect_protocol("eth_getWork");
        assert_eq!(conn.protocol, Protocol::Unknown);

        conn.detect_protocol("eth_submitLogin");
        assert_eq!(conn.protocol, Protocol::EthProxy);

        // A later cross-dialect method must not flip it.
        conn.detect_protocol("mining.subscribe");
        assert_eq!(conn.protocol, Protocol::EthProxy);
    }

    #[test]
    fn test_share_tracking() {
        let mut conn = Connection::new("test".to_string(), test_addr());

        conn.record_share(true);
        conn.record_share(true);
        conn.record_share(false);

        assert_eq!(conn.shares_accepted, 2);
        assert_eq!(conn.shares_rejected, 1);
    }
}
