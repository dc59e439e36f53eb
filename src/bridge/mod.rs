//! WebSocket bridge
//!
//! Relays between a browser client's WebSocket and a backend session:
//! - `serve_terminal`: JSON `TerminalMessage` envelopes in both directions
//! - `serve_display`: raw display-protocol frames as text messages

mod display;
mod terminal;

use thiserror::Error;

use crate::display::DisplayError;
use crate::session::SessionError;

pub use display::serve_display;
pub use terminal::serve_terminal;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid client message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Display(#[from] DisplayError),
}
