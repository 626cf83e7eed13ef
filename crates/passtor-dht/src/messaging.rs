//! UDP request/reply messaging between nodes
//!
//! Every request gets a fresh correlation ID and a oneshot channel registered
//! under it. The receive loop hands replies back through [`Messenger::deliver_reply`];
//! the channel is removed from the pending map when the reply is delivered or
//! when the waiting request gives up or is dropped.

use crate::{lock, random_below, Result};
use passtor_core::proto::{Envelope, Payload};
use passtor_core::{Hash, NodeAddr};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub struct Messenger {
    socket: UdpSocket,
    local: NodeAddr,
    /// Correlation ID counter, started at a random offset so that IDs of a
    /// restarted node do not collide with replies still in flight
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    timeout: Duration,
}

/// Removes a pending registration however `send_request` ends
struct PendingGuard<'a> {
    messenger: &'a Messenger,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.messenger.pending).remove(&self.id);
    }
}

impl Messenger {
    /// Bind the peer socket. The advertised address is the one actually bound.
    pub async fn bind(addr: SocketAddr, node_id: Hash, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local = NodeAddr::new(socket.local_addr()?, node_id);
        Ok(Self {
            socket,
            local,
            next_id: AtomicU64::new(random_below(u64::MAX / 2)),
            pending: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    pub fn local(&self) -> &NodeAddr {
        &self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get a unique correlation ID
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of requests currently waiting for a reply
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a request and wait for its reply.
    ///
    /// The same envelope (same ID) is resent after every timeout, at most
    /// `max_retries` times. Returns `None` once every attempt timed out.
    pub async fn send_request(
        &self,
        payload: Payload,
        dst: SocketAddr,
        max_retries: u32,
    ) -> Option<Envelope> {
        let id = self.next_id();
        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard { messenger: self, id };

        let mut envelope = Envelope::request(payload);
        envelope.id = id;
        envelope.sender = Some(self.local.to_proto());
        let kind = envelope.kind();
        let bytes = envelope.to_bytes();

        for attempt in 0..=max_retries {
            trace!(id, %dst, kind, attempt, "sending request");
            if let Err(e) = self.socket.send_to(&bytes, dst).await {
                warn!(id, %dst, error = %e, "failed to send request");
            }

            match tokio::time::timeout(self.timeout, &mut rx).await {
                Ok(Ok(reply)) => return Some(reply),
                Ok(Err(_)) => return None,
                Err(_) => debug!(id, %dst, kind, attempt, "request timed out"),
            }
        }

        debug!(id, %dst, kind, "giving up after {} attempts", max_retries + 1);
        None
    }

    /// Fire-and-forget reply to the request with correlation ID `id`
    pub async fn send_reply(&self, id: u64, payload: Payload, dst: SocketAddr) {
        let mut envelope = Envelope::reply(id, payload);
        envelope.sender = Some(self.local.to_proto());

        trace!(id, %dst, kind = envelope.kind(), "sending reply");
        if let Err(e) = self.socket.send_to(&envelope.to_bytes(), dst).await {
            warn!(id, %dst, error = %e, "failed to send reply");
        }
    }

    /// Hand a reply to the request waiting for it.
    ///
    /// Returns false if nobody is waiting anymore; the reply is dropped.
    pub fn deliver_reply(&self, reply: Envelope) -> bool {
        let id = reply.id;
        let waiter = lock(&self.pending).remove(&id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(id, "discarding reply without pending request");
                false
            }
        }
    }

    /// Receive one raw datagram
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
