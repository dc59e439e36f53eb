//! Display relay
//!
//! A spawned task copies tunnel frames to the client while the caller's task
//! writes client frames into the tunnel. Whichever side ends first closes
//! the tunnel, which releases the other.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::BridgeError;
use crate::display::{DisplayError, Tunnel};

/// Relay an established display tunnel to one WebSocket client
pub async fn serve_display<S>(
    ws: WebSocketStream<S>,
    tunnel: Arc<Tunnel>,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_tx, mut ws_rx) = ws.split();
    info!(
        "Display relay started (connection {})",
        tunnel.connection_id().unwrap_or_default()
    );

    let mut read_task = tokio::spawn(tunnel_to_client(tunnel.clone(), ws_tx));
    let mut read_done = false;

    let result = loop {
        tokio::select! {
            ended = &mut read_task => {
                read_done = true;
                match ended {
                    Ok(Ok(())) => debug!("Display daemon side ended"),
                    Ok(Err(e)) => debug!("Tunnel → client relay ended: {}", e),
                    Err(e) => warn!("Tunnel → client relay task failed: {}", e),
                }
                break Ok(());
            }
            msg = ws_rx.next() => {
                let written = match msg {
                    None | Some(Ok(Message::Close(_))) => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(Message::Text(text))) => tunnel.write(text.as_bytes()).await,
                    Some(Ok(Message::Binary(data))) => tunnel.write(&data).await,
                    Some(Ok(_)) => Ok(()),
                };
                if let Err(e) = written {
                    break Err(e.into());
                }
            }
        }
    };

    tunnel.close().await;
    if !read_done {
        if let Err(e) = read_task.await {
            warn!("Tunnel → client relay task failed: {}", e);
        }
    }
    info!("Display relay ended");
    result
}

async fn tunnel_to_client<S>(
    tunnel: Arc<Tunnel>,
    mut ws_tx: SplitSink<WebSocketStream<S>, Message>,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let result = loop {
        let frame = match tunnel.read().await {
            Ok(frame) => frame,
            Err(DisplayError::ClosedTunnel) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        // filtered announcement
        if frame.is_empty() {
            continue;
        }

        let message = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        };
        if let Err(e) = ws_tx.send(message).await {
            break Err(e.into());
        }
    };

    // Unblocks the caller's receive loop if the daemon went away first
    tunnel.close().await;
    if let Err(e) = ws_tx.close().await {
        debug!("WebSocket close: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::tunnel::tests::Daemon;
    use crate::display::DisplayConfig;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_display_relay() {
        let daemon_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let daemon_addr = daemon_listener.local_addr().unwrap().to_string();
        let daemon = tokio::spawn(async move {
            let mut d = Daemon::accept(&daemon_listener).await;
            d.complete_handshake(&["hostname"], "$relay").await;
            d.send("5.audio,1.1,31.audio/L16;rate=22050,channels=2;")
                .await;
            d.send("4.sync,3.100;").await;
            d.recv().await
        });

        let tunnel = Tunnel::connect(
            &daemon_addr,
            DisplayConfig::new("vnc").parameter("hostname", "desk"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        tunnel.handshake().await.unwrap();
        let tunnel = Arc::new(tunnel);

        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let server = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let (stream, _) = ws_listener.accept().await.unwrap();
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                serve_display(ws, tunnel).await
            })
        };

        let stream = TcpStream::connect(ws_addr).await.unwrap();
        let (mut client, _) =
            tokio_tungstenite::client_async(format!("ws://{}/", ws_addr), stream)
                .await
                .unwrap();

        // The audio announcement never reaches the client
        let first = client.next().await.unwrap().unwrap();
        assert_eq!(first.to_text().unwrap(), "4.sync,3.100;");

        client
            .send(Message::Text("3.nop;".to_string().into()))
            .await
            .unwrap();
        let relayed = daemon.await.unwrap();
        assert_eq!(relayed.opcode, "nop");

        // The daemon hung up after `nop`, so the relay may already be gone
        let _ = client.close(None).await;
        server.await.unwrap().unwrap();
        assert!(tunnel.is_closed());
    }
}
