//! TCP accept loop and per-connection request handling.

use keyspace_kv::{Coordinator, PeerClient};
use keyspace_proto::{read_frame, write_frame};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Run the accept loop until `shutdown` fires.
///
/// Each accepted connection gets its own task that serves requests
/// strictly in order: read frame, dispatch, write frame, repeat until
/// the peer hangs up or a framing error closes the connection.
/// In-flight handlers finish on their own after shutdown.
pub async fn serve<C: PeerClient>(
    listener: TcpListener,
    coordinator: Arc<Coordinator<C>>,
    shutdown: CancellationToken,
) {
    let local = listener.local_addr().ok();
    tracing::info!(addr = ?local, "server: accepting connections");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(addr = ?local, "server: shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, coordinator).await;
                            tracing::debug!(%peer, "connection closed");
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection<C: PeerClient>(stream: TcpStream, coordinator: Arc<Coordinator<C>>) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            // Clean EOF between frames: the peer is done.
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "closing connection on framing error");
                break;
            }
        };

        let response = coordinator.handle_frame(payload).await;
        if let Err(e) = write_frame(&mut writer, &response).await {
            tracing::debug!(error = %e, "closing connection on write error");
            break;
        }
    }
}
