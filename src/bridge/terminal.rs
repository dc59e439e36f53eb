//! Terminal relay
//!
//! Client → shell messages are applied on the caller's task as they arrive;
//! shell → client output is delivered by the pump through [`WsSink`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use super::BridgeError;
use crate::session::{
    MessageSink, SessionError, TermSize, TerminalCapable, TerminalMessage, TerminalSession,
};

/// Pump sink writing JSON text messages to the client
struct WsSink<S> {
    tx: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn close(&self) {
        if let Err(e) = self.tx.lock().await.close().await {
            debug!("WebSocket close: {}", e);
        }
    }
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: TerminalMessage) -> Result<(), SessionError> {
        let json =
            serde_json::to_string(&message).map_err(|e| SessionError::Sink(e.to_string()))?;
        self.tx
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SessionError::Sink(e.to_string()))
    }
}

/// Run an interactive shell for one WebSocket client
///
/// Without an explicit `size` the shell opens at the session's default
/// geometry. Returns when the client disconnects or the remote shell ends;
/// the pump is stopped and the shell closed either way.
pub async fn serve_terminal<S>(
    ws: WebSocketStream<S>,
    terminal: &dyn TerminalCapable,
    size: Option<TermSize>,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let size = size.unwrap_or_else(|| terminal.default_size());
    let (ws_tx, mut ws_rx) = ws.split();
    let sink = Arc::new(WsSink {
        tx: tokio::sync::Mutex::new(ws_tx),
    });

    let pump = terminal.start_terminal(size, sink.clone()).await?;
    info!("Terminal relay started ({}x{})", size.cols, size.rows);

    let result = relay_client_messages(&pump, &mut ws_rx).await;

    pump.stop().await;
    sink.close().await;
    info!("Terminal relay ended");
    result
}

async fn relay_client_messages<St>(pump: &TerminalSession, ws_rx: &mut St) -> Result<(), BridgeError>
where
    St: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = pump.finished() => {
                debug!("Remote shell output ended");
                return Ok(());
            }
            msg = ws_rx.next() => msg,
        };

        let message: TerminalMessage = match msg {
            None | Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text)?,
            Some(Ok(Message::Binary(data))) => serde_json::from_slice(&data)?,
            Some(Ok(_)) => continue, // ping/pong handled by tungstenite
        };
        pump.handle_message(message).await?;
    }
}
