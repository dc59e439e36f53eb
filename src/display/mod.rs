//! Display-protocol module
//!
//! Gateway side of a remote-desktop display daemon: the instruction codec,
//! the handshake-then-relay tunnel, and the `rdp`/`vnc` session backends.

mod error;
pub mod instruction;
mod session;
pub mod tunnel;

pub use error::{DisplayError, InstructionError};
pub use instruction::{read_frame, Instruction};
pub use session::{DirectDialer, DisplayConnector, DisplaySession};
pub use tunnel::{DisplayConfig, HandshakeState, Tunnel};
