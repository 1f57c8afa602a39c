//! Bidirectional WebSocket frame proxy.
//!
//! Relays frames between the external client connection and the
//! in-container terminal service, preserving frame kinds. The two
//! directions run concurrently; the first direction to fail or reach EOF
//! ends the copy and its error (if any) is the one reported. Callers are
//! responsible for closing both connections afterwards.

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// The container-side connection type produced by the terminal dial.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Copy frames between the client and the terminal service until either
/// side closes or errors.
///
/// `on_client_frame` runs for every frame received from the client; the
/// session handler uses it to feed the idle registry.
pub async fn copy<F>(
    client: WebSocket,
    upstream: UpstreamSocket,
    mut on_client_frame: F,
) -> anyhow::Result<()>
where
    F: FnMut() + Send,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            let msg = msg?;
            on_client_frame();
            let forward = match msg {
                ClientMessage::Text(text) => UpstreamMessage::Text(text.to_string().into()),
                ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
                ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
                ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
                ClientMessage::Close(_) => UpstreamMessage::Close(None),
            };
            upstream_tx.send(forward).await?;
        }
        debug!("client connection reached EOF");
        Ok::<(), anyhow::Error>(())
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                UpstreamMessage::Text(text) => ClientMessage::Text(text.to_string().into()),
                UpstreamMessage::Binary(data) => ClientMessage::Binary(data),
                UpstreamMessage::Ping(data) => ClientMessage::Ping(data),
                UpstreamMessage::Pong(data) => ClientMessage::Pong(data),
                UpstreamMessage::Close(_) => ClientMessage::Close(None),
                UpstreamMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await?;
        }
        debug!("terminal connection reached EOF");
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_upstream => result?,
        result = upstream_to_client => result?,
    }

    Ok(())
}
