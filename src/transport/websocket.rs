//! WebSocket transport
//!
//! Accepts TCP connections, negotiates the NT4 subprotocol, and shuttles
//! frames between each socket and the shared `Server`:
//! - text frames are control batches, binary frames are value frames
//! - a dedicated send task drains the connection's outbound channel
//! - whichever side finishes first triggers a single cleanup, which
//!   releases the connection's topics before any further message is handled

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::engine::{SharedServer, lock};
use crate::utils::error::Result;

/// Preferred subprotocol.
pub const SUBPROTOCOL_V41: &str = "v4.1.networktables.first.wpi.edu";
/// Fallback subprotocol.
pub const SUBPROTOCOL_V40: &str = "networktables.first.wpi.edu";

/// Client name used when the request path carries none.
const ANONYMOUS: &str = "anonymous";

/// Picks the subprotocol to answer with from a `Sec-WebSocket-Protocol`
/// header value, or `None` if the peer offers no NT4 protocol.
pub fn negotiate_subprotocol(offered: &str) -> Option<&'static str> {
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
    [SUBPROTOCOL_V41, SUBPROTOCOL_V40]
        .into_iter()
        .find(|p| offered.contains(p))
}

/// Client name from a `/nt/<name>` request path.
pub fn client_name_from_path(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "nt")
        .unwrap_or(ANONYMOUS)
        .to_string()
}

#[derive(Debug, Clone, PartialEq)]
struct Handshake {
    name: String,
    protocol: &'static str,
}

fn negotiate(
    request: &Request,
    mut response: Response,
    accepted: &mut Option<Handshake>,
) -> std::result::Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some(protocol) = negotiate_subprotocol(offered) else {
        let mut rejection = ErrorResponse::new(Some(format!(
            "expected subprotocol {SUBPROTOCOL_V41} or {SUBPROTOCOL_V40}"
        )));
        *rejection.status_mut() = StatusCode::BAD_REQUEST;
        return Err(rejection);
    };

    response
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
    *accepted = Some(Handshake {
        name: client_name_from_path(request.uri().path()),
        protocol,
    });
    Ok(response)
}

pub async fn start_websocket_server(addr: String, server: SharedServer) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("NT4 server listening on ws://{addr}");
    serve(listener, server).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, server: SharedServer) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let server = server.clone();
                spawn(handle_connection(stream, peer, server));
            }
            Err(e) => {
                error!("Failed to accept connection: {e}");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, server: SharedServer) {
    let mut accepted = None;
    let ws_stream = match accept_hdr_async(stream, |req: &Request, resp: Response| {
        negotiate(req, resp, &mut accepted)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };
    let Some(handshake) = accepted else {
        return;
    };
    debug!(%peer, protocol = handshake.protocol, "Subprotocol negotiated");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn_id = lock(&server).register_connection(&handshake.name, &peer.to_string(), tx);

    let cleanup_called = Arc::new(AtomicBool::new(false));

    let do_cleanup = {
        let server = server.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                lock(&server).remove_connection(conn_id);
            }
        }
    };

    let send_task = {
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(conn = conn_id, "Failed to send message: {e}");
                    break;
                }
            }

            do_cleanup();
            debug!(conn = conn_id, "Send loop closed");
        })
    };

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                lock(&server).handle_text(conn_id, text.as_str());
            }
            Ok(WsMessage::Binary(bytes)) => {
                lock(&server).handle_binary(conn_id, &bytes);
            }
            Ok(WsMessage::Close(_)) => break,
            // ping/pong are answered by tungstenite
            Ok(_) => {}
            Err(e) => {
                warn!(conn = conn_id, "Receive error: {e}");
                break;
            }
        }
    }

    do_cleanup();
    send_task.abort();
}
