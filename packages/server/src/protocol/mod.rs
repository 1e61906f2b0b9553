//! The wire protocol: request framing (spec §4.D) and reply encoding
//! (spec §6).

pub mod parser;
pub mod reply;

pub use parser::{Parser, ProtocolError};
pub use reply::{encode_multibulk_request, Reply};
