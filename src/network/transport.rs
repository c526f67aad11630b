//! Transport Session Boundary
//!
//! Connection-oriented datagram channel abstraction: peer handles, logical
//! streams, reliable or unreliable sends, and a bounded-wait event pump.
//! Real network transports live outside this crate; the in-tree
//! [`LoopbackNetwork`] delivers packets between in-process endpoints and is
//! what the demo binary and the test suite run on.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::network::packet::{DisconnectReason, NUM_STREAMS};

/// Opaque transport-level connection handle.
pub type PeerHandle = u64;

/// Per-peer link quality as reported by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: u32,
    /// Packet loss estimate, 0.0..=1.0.
    pub packet_loss: f32,
}

/// Event yielded by one transport service pass.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer connected (inbound on a host, outbound completion on a client).
    Connect {
        /// The new connection.
        peer: PeerHandle,
    },
    /// A peer went away. Inactivity timeouts arrive here with
    /// [`DisconnectReason::Timeout`].
    Disconnect {
        /// The closed connection.
        peer: PeerHandle,
        /// Why it closed.
        reason: DisconnectReason,
    },
    /// A packet arrived.
    Receive {
        /// Sending connection.
        peer: PeerHandle,
        /// Logical stream index.
        stream: u8,
        /// Packet bytes.
        data: Vec<u8>,
    },
}

/// Transport-level failures. Host creation and connect failures are fatal to
/// the attempt and propagate to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Another host already bound this address.
    #[error("address already bound: {0}")]
    AddressInUse(String),

    /// Nothing is listening at the target, or the host is full.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Operation referenced a handle with no live link.
    #[error("unknown peer handle {0}")]
    UnknownPeer(PeerHandle),

    /// Send used a stream index beyond the endpoint's stream count.
    #[error("stream {0} out of range")]
    InvalidStream(u8),
}

/// The transport session collaborator boundary.
pub trait Transport: Send {
    /// Open an outgoing connection. Yields the handle; the `Connect` event
    /// follows from `service`.
    fn connect(&mut self, address: &str, port: u16) -> Result<PeerHandle, TransportError>;

    /// Pump pending I/O, waiting at most `timeout` if nothing is queued.
    fn service(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError>;

    /// Send one packet on a logical stream.
    fn send(
        &mut self,
        peer: PeerHandle,
        stream: u8,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), TransportError>;

    /// Close a connection, delivering the reason to the remote side.
    fn disconnect(&mut self, peer: PeerHandle, reason: DisconnectReason);

    /// Link quality for a live connection.
    fn stats(&self, peer: PeerHandle) -> Option<PeerStats>;
}

struct Link {
    remote_endpoint: u64,
}

#[derive(Default)]
struct Endpoint {
    inbox: VecDeque<TransportEvent>,
    links: BTreeMap<PeerHandle, Link>,
    max_peers: usize,
    streams: u8,
    in_bandwidth: u32,
    out_bandwidth: u32,
    sent_window: u32,
    recv_window: u32,
}

#[derive(Default)]
struct Hub {
    endpoints: BTreeMap<u64, Endpoint>,
    listeners: BTreeMap<String, u64>,
    next_endpoint: u64,
    next_link: PeerHandle,
    drop_unreliable: bool,
}

impl Hub {
    fn deliver(&mut self, endpoint: u64, event: TransportEvent) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.inbox.push_back(event);
        }
    }
}

/// In-process transport hub. Endpoints created from the same network can
/// host, connect and exchange packets with perfect ordering; a switchable
/// drop-unreliable mode simulates loss on the unreliable path.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listening endpoint bound to `address:port`. Sends outside
    /// `0..streams` are rejected; nonzero bandwidth caps bound the unreliable
    /// bytes moved between service passes (reliable traffic is never shed).
    pub fn host(
        &self,
        address: &str,
        port: u16,
        max_peers: usize,
        streams: u8,
        in_bandwidth: u32,
        out_bandwidth: u32,
    ) -> Result<LoopbackTransport, TransportError> {
        let key = format!("{address}:{port}");
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if hub.listeners.contains_key(&key) {
            return Err(TransportError::AddressInUse(key));
        }
        let id = hub.next_endpoint;
        hub.next_endpoint += 1;
        hub.endpoints.insert(
            id,
            Endpoint {
                max_peers,
                streams,
                in_bandwidth,
                out_bandwidth,
                ..Endpoint::default()
            },
        );
        hub.listeners.insert(key, id);
        Ok(LoopbackTransport {
            hub: self.hub.clone(),
            endpoint: id,
        })
    }

    /// Create a non-listening endpoint for an outgoing connection.
    pub fn client(&self) -> LoopbackTransport {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        let id = hub.next_endpoint;
        hub.next_endpoint += 1;
        hub.endpoints.insert(
            id,
            Endpoint {
                streams: NUM_STREAMS,
                ..Endpoint::default()
            },
        );
        LoopbackTransport {
            hub: self.hub.clone(),
            endpoint: id,
        }
    }

    /// Drop all subsequent unreliable sends (loss simulation).
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.hub.lock().unwrap_or_else(|e| e.into_inner()).drop_unreliable = drop;
    }

    /// Sever a link as if the transport timed it out: both sides observe a
    /// `Disconnect` with [`DisconnectReason::Timeout`].
    pub fn fail_link(&self, peer: PeerHandle) {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        let holders: Vec<u64> = hub
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.links.contains_key(&peer))
            .map(|(id, _)| *id)
            .collect();
        for id in holders {
            if let Some(ep) = hub.endpoints.get_mut(&id) {
                ep.links.remove(&peer);
                ep.inbox.push_back(TransportEvent::Disconnect {
                    peer,
                    reason: DisconnectReason::Timeout,
                });
            }
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    hub: Arc<Mutex<Hub>>,
    endpoint: u64,
}

impl Transport for LoopbackTransport {
    fn connect(&mut self, address: &str, port: u16) -> Result<PeerHandle, TransportError> {
        let key = format!("{address}:{port}");
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        let listener = *hub
            .listeners
            .get(&key)
            .ok_or_else(|| TransportError::ConnectFailed(key.clone()))?;

        {
            let host = hub
                .endpoints
                .get(&listener)
                .ok_or_else(|| TransportError::ConnectFailed(key.clone()))?;
            if host.max_peers > 0 && host.links.len() >= host.max_peers {
                return Err(TransportError::ConnectFailed(format!("{key}: host full")));
            }
        }

        let link = hub.next_link;
        hub.next_link += 1;

        let remote = listener;
        let local = self.endpoint;
        if let Some(ep) = hub.endpoints.get_mut(&local) {
            ep.links.insert(link, Link { remote_endpoint: remote });
            ep.inbox.push_back(TransportEvent::Connect { peer: link });
        }
        if let Some(ep) = hub.endpoints.get_mut(&remote) {
            ep.links.insert(link, Link { remote_endpoint: local });
            ep.inbox.push_back(TransportEvent::Connect { peer: link });
        }
        Ok(link)
    }

    fn service(&mut self, timeout: Duration) -> Result<Vec<TransportEvent>, TransportError> {
        {
            let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ep) = hub.endpoints.get_mut(&self.endpoint) {
                // Bandwidth budgets run per service pass.
                ep.sent_window = 0;
                ep.recv_window = 0;
                if !ep.inbox.is_empty() {
                    return Ok(ep.inbox.drain(..).collect());
                }
            }
        }
        if !timeout.is_zero() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ep) = hub.endpoints.get_mut(&self.endpoint) {
                return Ok(ep.inbox.drain(..).collect());
            }
        }
        Ok(Vec::new())
    }

    fn send(
        &mut self,
        peer: PeerHandle,
        stream: u8,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if !reliable && hub.drop_unreliable {
            return Ok(());
        }
        let (remote, over_out) = {
            let ep = hub
                .endpoints
                .get_mut(&self.endpoint)
                .ok_or(TransportError::UnknownPeer(peer))?;
            if stream >= ep.streams {
                return Err(TransportError::InvalidStream(stream));
            }
            let remote = ep
                .links
                .get(&peer)
                .map(|l| l.remote_endpoint)
                .ok_or(TransportError::UnknownPeer(peer))?;
            ep.sent_window = ep.sent_window.saturating_add(data.len() as u32);
            let over = ep.out_bandwidth > 0 && ep.sent_window > ep.out_bandwidth;
            (remote, over)
        };
        if over_out && !reliable {
            return Ok(());
        }
        if let Some(ep) = hub.endpoints.get_mut(&remote) {
            ep.recv_window = ep.recv_window.saturating_add(data.len() as u32);
            if !reliable && ep.in_bandwidth > 0 && ep.recv_window > ep.in_bandwidth {
                return Ok(());
            }
        }
        hub.deliver(
            remote,
            TransportEvent::Receive {
                peer,
                stream,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerHandle, reason: DisconnectReason) {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        let remote = hub
            .endpoints
            .get_mut(&self.endpoint)
            .and_then(|ep| ep.links.remove(&peer).map(|l| l.remote_endpoint));
        if let Some(remote) = remote {
            if let Some(ep) = hub.endpoints.get_mut(&remote) {
                ep.links.remove(&peer);
                ep.inbox
                    .push_back(TransportEvent::Disconnect { peer, reason });
            }
        }
    }

    fn stats(&self, peer: PeerHandle) -> Option<PeerStats> {
        let hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        hub.endpoints
            .get(&self.endpoint)
            .and_then(|ep| ep.links.get(&peer))
            .map(|_| PeerStats::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::STREAM_META;

    #[test]
    fn connect_and_exchange() {
        let network = LoopbackNetwork::new();
        let mut host = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        let mut client = network.client();

        let link = client.connect("127.0.0.1", 7938).unwrap();

        let host_events = host.service(Duration::ZERO).unwrap();
        assert!(matches!(host_events[0], TransportEvent::Connect { .. }));

        client.send(link, STREAM_META, b"hello", true).unwrap();
        let host_events = host.service(Duration::ZERO).unwrap();
        match &host_events[0] {
            TransportEvent::Receive { data, stream, .. } => {
                assert_eq!(data.as_slice(), b"hello");
                assert_eq!(*stream, STREAM_META);
            }
            other => panic!("expected receive, got {other:?}"),
        }
    }

    #[test]
    fn connect_to_missing_host_fails() {
        let network = LoopbackNetwork::new();
        let mut client = network.client();
        assert!(matches!(
            client.connect("127.0.0.1", 1),
            Err(TransportError::ConnectFailed(_))
        ));
    }

    #[test]
    fn host_full_rejects_connect() {
        let network = LoopbackNetwork::new();
        let _host = network.host("127.0.0.1", 7938, 1, NUM_STREAMS, 0, 0).unwrap();
        let mut a = network.client();
        let mut b = network.client();
        a.connect("127.0.0.1", 7938).unwrap();
        assert!(b.connect("127.0.0.1", 7938).is_err());
    }

    #[test]
    fn double_bind_rejected() {
        let network = LoopbackNetwork::new();
        let _host = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        assert!(matches!(
            network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0),
            Err(TransportError::AddressInUse(_))
        ));
    }

    #[test]
    fn drop_unreliable_only_drops_unreliable() {
        let network = LoopbackNetwork::new();
        let mut host = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        let mut client = network.client();
        let link = client.connect("127.0.0.1", 7938).unwrap();
        host.service(Duration::ZERO).unwrap();

        network.set_drop_unreliable(true);
        client.send(link, STREAM_ENTITY_TEST, b"lost", false).unwrap();
        client.send(link, STREAM_ENTITY_TEST, b"kept", true).unwrap();

        let events = host.service(Duration::ZERO).unwrap();
        let payloads: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Receive { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![b"kept".to_vec()]);
    }

    const STREAM_ENTITY_TEST: u8 = 1;

    #[test]
    fn send_outside_the_stream_range_is_rejected() {
        let network = LoopbackNetwork::new();
        let mut host = network.host("127.0.0.1", 7938, 8, 2, 0, 0).unwrap();
        let mut client = network.client();
        let link = client.connect("127.0.0.1", 7938).unwrap();
        host.service(Duration::ZERO).unwrap();

        assert!(matches!(
            host.send(link, 2, b"nope", true),
            Err(TransportError::InvalidStream(2))
        ));
        assert!(host.send(link, 1, b"fine", true).is_ok());
    }

    #[test]
    fn bandwidth_caps_shed_unreliable_only() {
        let network = LoopbackNetwork::new();
        let mut host = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 4, 8).unwrap();
        let mut client = network.client();
        let link = client.connect("127.0.0.1", 7938).unwrap();
        host.service(Duration::ZERO).unwrap();
        client.service(Duration::ZERO).unwrap();

        // Outbound: 8 bytes fit the budget, the next unreliable packet is
        // shed, reliable traffic always goes through.
        host.send(link, STREAM_META, b"12345678", false).unwrap();
        host.send(link, STREAM_META, b"over", false).unwrap();
        host.send(link, STREAM_META, b"kept", true).unwrap();
        let payloads: Vec<_> = client
            .service(Duration::ZERO)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Receive { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![b"12345678".to_vec(), b"kept".to_vec()]);

        // Inbound: the host accepts at most 4 unreliable bytes per pass.
        client.send(link, STREAM_META, b"12345", false).unwrap();
        client.send(link, STREAM_META, b"12345", true).unwrap();
        let payloads: Vec<_> = host
            .service(Duration::ZERO)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Receive { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![b"12345".to_vec()]);
    }

    #[test]
    fn fail_link_reports_timeout_to_both_sides() {
        let network = LoopbackNetwork::new();
        let mut host = network.host("127.0.0.1", 7938, 8, NUM_STREAMS, 0, 0).unwrap();
        let mut client = network.client();
        let link = client.connect("127.0.0.1", 7938).unwrap();
        host.service(Duration::ZERO).unwrap();
        client.service(Duration::ZERO).unwrap();

        network.fail_link(link);

        let host_events = host.service(Duration::ZERO).unwrap();
        assert!(matches!(
            host_events[0],
            TransportEvent::Disconnect {
                reason: DisconnectReason::Timeout,
                ..
            }
        ));
        let client_events = client.service(Duration::ZERO).unwrap();
        assert!(matches!(
            client_events[0],
            TransportEvent::Disconnect {
                reason: DisconnectReason::Timeout,
                ..
            }
        ));
    }
}
