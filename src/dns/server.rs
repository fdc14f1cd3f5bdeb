//! DNS listeners: a single UDP socket and a framed TCP accept loop.
//! Datagrams that fail to parse are dropped silently; TCP connections
//! carry one request/reply exchange behind a 2-byte big-endian length
//! prefix with a 10 second idle budget. EDNS is not supported, so UDP
//! replies are capped at the classic 512-byte budget.

use hickory_proto::op::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::handler::DnsHandler;
use crate::error::Result;
use crate::store::KeyStore;

/// Reply budget for UDP without EDNS
const MAX_UDP_PAYLOAD: usize = 512;

/// Idle budget for a TCP exchange
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Header-and-question-only reply sent when the real answer would not fit
/// the datagram; the client retries over TCP.
fn oversize_reply(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(hickory_proto::op::MessageType::Response);
    response.set_authoritative(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// Serve DNS over a bound UDP socket
pub async fn serve_udp<S: KeyStore + 'static>(
    handler: Arc<DnsHandler<S>>,
    socket: UdpSocket,
) -> Result<()> {
    let socket = Arc::new(socket);
    tracing::info!("DNS/UDP listening on {}", socket.local_addr()?);

    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!("UDP receive failed: {}", err);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let packet = buf[..len].to_vec();
        let handler = handler.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let request = match Message::from_vec(&packet) {
                Ok(request) => request,
                Err(err) => {
                    tracing::trace!("dropping unparseable datagram from {}: {}", peer, err);
                    return;
                }
            };

            let response = handler.handle(&request).await;
            let bytes = match response.to_vec() {
                Ok(bytes) if bytes.len() <= MAX_UDP_PAYLOAD => bytes,
                Ok(oversized) => {
                    tracing::debug!(
                        "reply to {} is {} bytes, sending empty authoritative reply",
                        peer,
                        oversized.len()
                    );
                    match oversize_reply(&request).to_vec() {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            tracing::warn!("failed to serialize fallback reply: {}", err);
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to serialize reply for {}: {}", peer, err);
                    return;
                }
            };
            if let Err(err) = socket.send_to(&bytes, peer).await {
                tracing::debug!("failed to send reply to {}: {}", peer, err);
            }
        });
    }
}

/// Serve DNS over TCP
pub async fn serve_tcp<S: KeyStore + 'static>(
    handler: Arc<DnsHandler<S>>,
    listener: TcpListener,
) -> Result<()> {
    tracing::info!("DNS/TCP listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("TCP accept failed: {}", err);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let exchange = tokio::time::timeout(TCP_IDLE_TIMEOUT, handle_tcp(handler, stream));
            match exchange.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::trace!("TCP exchange with {} failed: {}", peer, err),
                Err(_) => tracing::trace!("TCP exchange with {} timed out", peer),
            }
        });
    }
}

/// One length-prefixed request and its reply, then close
async fn handle_tcp<S: KeyStore>(handler: Arc<DnsHandler<S>>, mut stream: TcpStream) -> Result<()> {
    let mut length = [0u8; 2];
    stream.read_exact(&mut length).await?;
    let length = u16::from_be_bytes(length) as usize;

    let mut packet = vec![0u8; length];
    stream.read_exact(&mut packet).await?;

    let request = Message::from_vec(&packet)?;
    let response = handler.handle(&request).await;
    let bytes = response.to_vec()?;

    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}
