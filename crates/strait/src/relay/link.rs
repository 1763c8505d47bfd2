use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value;
use strait_proto::RtpPacket;

use crate::config::BridgeConfig;
use crate::error::RelayError;

/// How long the listener blocks on `In` before looking at the stop flag.
pub const LISTEN_POLL: Duration = Duration::from_millis(50);
/// Large enough for any UDP payload.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// One datagram read from `In`.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Envelope(Value),
    Rtp(Bytes),
}

/// Tells JSON envelopes from RTP packets. Anything else yields `None`.
pub fn classify(datagram: &[u8]) -> Option<Datagram> {
    let first = datagram.iter().copied().find(|byte| !byte.is_ascii_whitespace())?;
    if first == b'{' {
        return match serde_json::from_slice::<Value>(datagram) {
            Ok(value @ Value::Object(_)) => Some(Datagram::Envelope(value)),
            _ => None,
        };
    }
    if RtpPacket::looks_like_rtp(datagram) {
        return Some(Datagram::Rtp(Bytes::copy_from_slice(datagram)));
    }
    None
}

/// The pair of sockets joining the two halves of a bridge.
///
/// `In` is bound locally and read by the listener thread; `Out` is connected
/// to the other half's `In`. Every datagram is one envelope or one RTP packet.
#[derive(Debug)]
pub struct BridgeLink {
    input: UdpSocket,
    output: UdpSocket,
}

impl BridgeLink {
    pub fn open(config: &BridgeConfig) -> Result<Self, RelayError> {
        let in_addr = config.in_addr()?;
        let out_addr = config.out_addr()?;
        let input = UdpSocket::bind(in_addr)?;
        let output = UdpSocket::bind(unspecified_for(&out_addr))?;
        output.connect(out_addr)?;
        Self::from_sockets(input, output)
    }

    /// Wraps already bound sockets. `output` must be connected.
    pub fn from_sockets(input: UdpSocket, output: UdpSocket) -> Result<Self, RelayError> {
        input.set_read_timeout(Some(LISTEN_POLL))?;
        output.peer_addr()?;
        Ok(Self { input, output })
    }

    pub fn in_addr(&self) -> io::Result<SocketAddr> {
        self.input.local_addr()
    }

    pub fn out_addr(&self) -> io::Result<SocketAddr> {
        self.output.peer_addr()
    }

    pub fn send_json(&self, value: &Value) -> Result<(), RelayError> {
        self.send_raw(value.to_string().as_bytes())
    }

    pub fn send_raw(&self, datagram: &[u8]) -> Result<(), RelayError> {
        match self.output.send(datagram) {
            Ok(_) => Ok(()),
            // Nobody listening on the other end yet; UDP has no delivery
            // guarantee anyway.
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!(target = "strait::relay", len = datagram.len(), "out socket refused datagram");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reads one datagram. `Ok(None)` means the poll interval elapsed.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.input.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            // ICMP unreachable from an earlier send surfaces on some platforms.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// Milliseconds since the Unix epoch; the handshake's session token.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// A handshake reply is valid when its clock reading is not older than our
/// request and not ahead of our own clock, both within `skew`.
pub fn token_is_ordered(sent: u64, remote: u64, now: u64, skew: Duration) -> bool {
    let skew = skew.as_millis() as u64;
    sent.saturating_sub(skew) <= remote && remote <= now.saturating_add(skew)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_json_and_rtp() {
        let envelope = json!({"type": "ping", "rpc": 3}).to_string();
        assert!(matches!(
            classify(envelope.as_bytes()),
            Some(Datagram::Envelope(value)) if value["rpc"] == 3
        ));

        let mut rtp = vec![0x80, 96, 0, 1, 0, 0, 0, 9, 0, 0, 0, 7];
        rtp.extend_from_slice(b"body");
        assert!(matches!(classify(&rtp), Some(Datagram::Rtp(packet)) if packet.len() == 16));

        assert!(classify(b"[1, 2]").is_none());
        assert!(classify(b"{not json").is_none());
        assert!(classify(&[0x00; 20]).is_none());
        assert!(classify(b"").is_none());
    }

    #[test]
    fn handshake_token_window() {
        let skew = Duration::from_secs(2);
        assert!(token_is_ordered(10_000, 10_500, 11_000, skew));
        assert!(token_is_ordered(10_000, 8_500, 11_000, skew));
        assert!(!token_is_ordered(10_000, 7_000, 11_000, skew));
        assert!(!token_is_ordered(10_000, 14_000, 11_000, skew));
        assert!(token_is_ordered(10_000, 13_000, 11_000, skew));
    }

    #[test]
    fn linked_sockets_exchange_datagrams() {
        let a_in = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b_in = UdpSocket::bind("127.0.0.1:0").unwrap();
        let a_out = UdpSocket::bind("127.0.0.1:0").unwrap();
        a_out.connect(b_in.local_addr().unwrap()).unwrap();
        let b_out = UdpSocket::bind("127.0.0.1:0").unwrap();
        b_out.connect(a_in.local_addr().unwrap()).unwrap();
        let a = BridgeLink::from_sockets(a_in, a_out).unwrap();
        let b = BridgeLink::from_sockets(b_in, b_out).unwrap();

        a.send_json(&json!({"type": "pong"})).unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut received = None;
        for _ in 0..40 {
            if let Some(len) = b.recv(&mut buf).unwrap() {
                received = Some(len);
                break;
            }
        }
        let len = received.expect("datagram");
        assert!(matches!(classify(&buf[..len]), Some(Datagram::Envelope(v)) if v["type"] == "pong"));
        assert_eq!(b.recv(&mut buf).unwrap(), None);
    }
}
