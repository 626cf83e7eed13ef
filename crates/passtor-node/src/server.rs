//! The passtor node: a DHT node plus the client-facing request handler
//!
//! Clients talk to a node over TCP. Every connection carries exactly one
//! `ClientMessage` (at most `TCP_MAX_PACKET_SIZE` bytes) and receives exactly
//! one `ServerResponse`.

use passtor_core::proto::{ClientMessage, ClientRequest, ServerResponse};
use passtor_core::{bytes_to_hash, short_hex, Account, TCP_MAX_PACKET_SIZE};
use passtor_dht::{DhtConfig, DhtNode, StoreError};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Handle to a running passtor instance
#[derive(Clone)]
pub struct Passtor {
    node: DhtNode,
}

impl Passtor {
    /// Bind the peer socket of a new instance
    pub async fn new(name: &str, addr: SocketAddr, config: DhtConfig) -> passtor_dht::Result<Self> {
        let node = DhtNode::bind(name, addr, config).await?;
        Ok(Self { node })
    }

    pub fn node(&self) -> &DhtNode {
        &self.node
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.local().addr
    }

    /// Join the DHT through bootstrap peers; false if none answered
    pub async fn join(&self, peers: &[SocketAddr]) -> bool {
        self.node.join(peers).instrument(self.node.span().clone()).await
    }

    /// Start answering other passtors
    pub fn listen(&self) -> JoinHandle<()> {
        self.node.spawn_listener()
    }

    /// Serve one client request
    pub async fn handle_client_message(&self, message: ClientMessage) -> ServerResponse {
        match message.request {
            Some(ClientRequest::Push(network)) => match Account::from_network(network) {
                Ok(account) => self.push(account).await,
                Err(e) => ServerResponse::error(format!("invalid account: {e}")),
            },
            Some(ClientRequest::Pull(id)) => match bytes_to_hash(&id) {
                Ok(id) => self.pull(&id).await,
                Err(e) => ServerResponse::error(format!("invalid account id: {e}")),
            },
            None => ServerResponse::error("empty request"),
        }
    }

    async fn push(&self, account: Account) -> ServerResponse {
        let id = account.id;
        let replication = self.node.config().replication;

        if !self.node.fits_in_datagram(&account) {
            info!(account = %short_hex(&id), "push refused, record too large");
            return ServerResponse::error("account too large");
        }

        match self.node.store_account(account.clone(), replication) {
            Ok(()) => {}
            // Pushing the same record again re-replicates it
            Err(StoreError::AlreadyStored) if self.node.store().holds(&account) => {}
            Err(e) => {
                info!(account = %short_hex(&id), error = %e, "push refused");
                return ServerResponse::error(e.to_string());
            }
        }

        let allocations = self.node.allocate(&id, replication, &account).await;
        if allocations.len() < replication as usize {
            warn!(
                account = %short_hex(&id),
                allocated = allocations.len(),
                replication,
                "push under-replicated"
            );
            return ServerResponse::warning(format!(
                "stored on {} of {} replicas",
                allocations.len(),
                replication
            ));
        }

        info!(account = %short_hex(&id), version = account.version, "push replicated");
        ServerResponse::ok(None)
    }

    async fn pull(&self, id: &passtor_core::Hash) -> ServerResponse {
        match self.node.fetch(id).await {
            Some(account) => {
                debug!(account = %short_hex(id), version = account.version, "pull served");
                ServerResponse::ok(Some(account.to_network()))
            }
            None => ServerResponse::error("account not found"),
        }
    }

    /// Accept client connections until the task is dropped
    pub async fn listen_to_clients(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening for clients");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let passtor = self.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = passtor.handle_connection(stream).await {
                                warn!(%peer, error = %e, "client connection failed");
                            }
                        }
                        .instrument(self.node.span().clone()),
                    );
                }
                Err(e) => error!(error = %e, "failed to accept client"),
            }
        }
    }

    /// Spawn the client listener on an already bound socket
    pub fn spawn_client_listener(&self, listener: TcpListener) -> JoinHandle<()> {
        let passtor = self.clone();
        tokio::spawn(
            passtor
                .listen_to_clients(listener)
                .instrument(self.node.span().clone()),
        )
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut buf = vec![0u8; TCP_MAX_PACKET_SIZE];
        let n = stream.read(&mut buf).await?;

        let response = match ClientMessage::from_bytes(&buf[..n]) {
            Ok(message) => self.handle_client_message(message).await,
            Err(e) => {
                debug!(error = %e, "malformed client message");
                ServerResponse::error(format!("malformed request: {e}"))
            }
        };

        stream.write_all(&response.to_bytes()).await?;
        stream.shutdown().await
    }
}
