/// One WebSocket connection: handshake, connect, message pump
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use replication::{ClientSocket, ConnectRequest, Downstream, ReplicationError, Server, SocketEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const ROOM_PATH: &str = "/room/";

/// Room id and connect parameters from `/room/<roomID>?clientID=..&baseCookie=..&ts=..`
pub fn parse_connect_uri(uri: &Uri) -> replication::Result<(String, ConnectRequest)> {
    let room_id = uri
        .path()
        .strip_prefix(ROOM_PATH)
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .ok_or_else(|| ReplicationError::Protocol(format!("invalid path {}", uri.path())))?;
    let request = ConnectRequest::from_query(uri.query().unwrap_or(""))?;
    Ok((room_id.to_string(), request))
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, server: Server) {
    let mut uri = None;
    let capture_uri = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        uri = Some(req.uri().clone());
        Ok(resp)
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, capture_uri).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (socket, mut rx) = ClientSocket::new();
    let connection = socket.id();

    // Task to write queued messages to the client
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SocketEvent::Message(message) => {
                    let text = match message.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Text(text)).await {
                        debug!("Failed to send message: {}", e);
                        break;
                    }
                }
                SocketEvent::Close => {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
    });

    let connected = match uri.as_ref() {
        Some(uri) => parse_connect_uri(uri),
        None => Err(ReplicationError::Protocol("missing request uri".to_string())),
    };
    let (room_id, request) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Rejecting connection from {}: {}", addr, e);
            reject(socket, send_task, e).await;
            return;
        }
    };

    let client_id = request.client_id.clone();
    if let Err(e) = server.connect(&room_id, request, socket.clone()).await {
        error!("Failed to connect {} to room {}: {}", client_id, room_id, e);
        reject(socket, send_task, e).await;
        return;
    }

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!("Error receiving from {}: {}", client_id, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                // Only fails once another connection has taken over this client
                if let Err(e) = server
                    .handle_text(&room_id, &client_id, connection, &text)
                    .await
                {
                    debug!("Stopping reads for {}: {}", client_id, e);
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    server.disconnect(&room_id, &client_id, connection).await;
    send_task.abort();
    info!("Connection closed: {} ({} in room {})", addr, client_id, room_id);
}

/// Report a connect-time failure to the client, then close.
async fn reject(socket: ClientSocket, send_task: tokio::task::JoinHandle<()>, err: ReplicationError) {
    socket.send(Downstream::Error(err.to_string()));
    socket.close();
    let _ = send_task.await;
}
