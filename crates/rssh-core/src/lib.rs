//! rssh-core: protocol library for the rssh channel proxy.
//!
//! Provides the binary payload codec used inside channel-open and channel
//! request messages, the terminal mode table, typed payloads, and the error
//! type shared with the server engine. Pure and synchronous: no I/O.

pub mod codec;
pub mod error;
pub mod payload;
pub mod terminal;

mod prop_tests;

// Re-export commonly used items at crate root.
pub use error::{RsshError, RsshResult};
pub use payload::{ChannelOpen, ForwardTarget, PtyParameters, SessionRequest, WindowChange};
pub use terminal::{TerminalMode, TerminalModes};
