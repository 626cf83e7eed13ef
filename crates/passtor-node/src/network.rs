//! Client side of the TCP client protocol

use anyhow::{anyhow, Result};
use passtor_core::proto::{ClientMessage, ServerResponse};
use passtor_core::{Account, Hash, TCP_MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// How long a client waits for a node to answer
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Send one request to a node and wait for its response
pub async fn send_request(node: SocketAddr, message: &ClientMessage) -> Result<ServerResponse> {
    let bytes = message.to_bytes();
    if bytes.len() > TCP_MAX_PACKET_SIZE {
        return Err(anyhow!(
            "request too large: {} bytes (max {})",
            bytes.len(),
            TCP_MAX_PACKET_SIZE
        ));
    }

    let exchange = async {
        let mut stream = TcpStream::connect(node).await?;
        stream.write_all(&bytes).await?;

        let mut response = Vec::new();
        stream
            .take(TCP_MAX_PACKET_SIZE as u64)
            .read_to_end(&mut response)
            .await?;
        Ok::<_, std::io::Error>(response)
    };

    let response = tokio::time::timeout(CLIENT_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow!("timeout waiting for {}", node))?
        .map_err(|e| anyhow!("connection to {} failed: {}", node, e))?;

    ServerResponse::from_bytes(&response).map_err(|e| anyhow!("failed to decode response: {}", e))
}

/// Push an account to a node
pub async fn push(node: SocketAddr, account: &Account) -> Result<ServerResponse> {
    tracing::debug!("Pushing account to {}", node);
    send_request(node, &ClientMessage::push(account.to_network())).await
}

/// Pull an account from a node. The account is `None` when the response
/// carries no data.
pub async fn pull(node: SocketAddr, id: &Hash) -> Result<(ServerResponse, Option<Account>)> {
    tracing::debug!("Pulling account from {}", node);
    let mut response = send_request(node, &ClientMessage::pull(id)).await?;
    let account = match response.data.take() {
        Some(data) => Some(Account::from_network(data)?),
        None => None,
    };
    Ok((response, account))
}
