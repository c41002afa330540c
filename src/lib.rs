//! XMPP protocol engine for an IRC-to-IM gateway.
//!
//! A [`Session`] is a sans-IO client state machine: bytes from the server go
//! in, bytes for the server, [`SessionAction`]s and [`GatewayEvent`]s come
//! out. [`start_session`] runs one on a tokio task and adds the socket work
//! (DNS, TLS, keep-alive and SOCKS5 bytestreams).

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod jid;
pub mod session;
pub mod stanza;
pub mod transfer;
pub mod xmltree;

pub use config::{SessionConfig, TlsPolicy};
pub use error::{SessionError, SessionResult, TransferError, TransferResult};
pub use events::{GatewayEvent, TransferEvent};
pub use jid::Jid;
pub use session::driver::{start_session, EventStream, SessionHandle};
pub use session::{Session, SessionAction, SessionState};
pub use transfer::TransferId;
