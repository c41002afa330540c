//! File transfers: stream initiation and SOCKS5 bytestreams.
//!
//! The [`TransferEngine`] holds the per-session transfer table. Negotiation
//! runs on the session's stanza stream (see `negotiate`); socket work is
//! requested through [`TransferAction`]s and reported back as
//! [`TransferUpdate`]s, so the engine itself never touches a socket.

pub mod io;
mod negotiate;
pub mod socks5;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::ProxySetting;
use crate::stanza::StanzaError;

/// Session-scoped transfer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TransferId(pub u32);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// One streamhost a bytestream may run through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub jid: String,
    pub host: String,
    pub port: u16,
    /// Third-party proxy rather than the peer itself
    pub relay: bool,
}

/// Negotiation phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sender: asking the peer which features it supports
    CheckingPeer,
    /// Sender: offer sent, waiting for the peer's choice
    AwaitingAccept,
    /// Sender: waiting for the local streamhost to listen
    Listening,
    /// Sender: streamhosts sent, waiting for `streamhost-used`
    AwaitingStreamhostUsed,
    /// Sender: connecting to the proxy the peer picked, then activating it
    Activating,
    /// Receiver: offer reported, waiting for the user
    Offered,
    /// Receiver: accepted, waiting for the streamhost list
    AwaitingStreamhosts,
    /// Receiver: walking the candidates
    Connecting,
    /// Data is flowing
    Transferring,
}

/// Bytes moved against the advertised size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            transferred: 0,
            total,
        }
    }

    /// Record the running count; returns true once the total is reached.
    pub fn record(&mut self, transferred: u64) -> bool {
        self.transferred = transferred;
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub role: Role,
    /// Stream id shared by both sides
    pub sid: String,
    pub peer: String,
    pub initiator: String,
    pub target: String,
    pub file_name: String,
    pub phase: Phase,
    pub candidates: Vec<Candidate>,
    pub progress: Progress,
    /// Id of the peer's SI offer we still owe an answer to
    pub offer_iq_id: Option<String>,
    /// Id of the peer's bytestream request we still owe an answer to
    pub bytestream_iq_id: Option<String>,
    /// Id of our own request whose reply moves this transfer on
    pub awaiting: Option<String>,
}

impl Transfer {
    /// SOCKS5 destination address for this stream.
    pub fn digest(&self) -> String {
        socks5::pseudo_address(&self.sid, &self.initiator, &self.target)
    }
}

/// Socket work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAction {
    /// Receiver: connect through `candidates` in order and write `size`
    /// bytes to the accepted sink
    Receive {
        id: TransferId,
        candidates: Vec<Candidate>,
        digest: String,
        size: u64,
    },
    /// Sender: open the local streamhost and report its address
    Listen { id: TransferId, digest: String },
    /// Sender: the peer connected to our listener, start sending
    SendDirect { id: TransferId },
    /// Sender: connect to the proxy the peer picked
    ConnectProxy {
        id: TransferId,
        candidate: Candidate,
        digest: String,
    },
    /// Sender: the proxy is activated, start sending
    StartSending { id: TransferId },
    /// Drop every socket, timer and task held for the transfer
    Release { id: TransferId },
}

/// Socket outcome reported back by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    Listening { id: TransferId, host: String, port: u16 },
    /// Handshake done through `candidate`, an index into the streamhosts
    /// still in play for the transfer
    Connected { id: TransferId, candidate: usize },
    Progress { id: TransferId, transferred: u64 },
    Completed { id: TransferId, transferred: u64 },
    Failed { id: TransferId, reason: String },
}

impl TransferUpdate {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Listening { id, .. }
            | Self::Connected { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. } => *id,
        }
    }
}

/// Why the peer ended a negotiation, from its error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTermination {
    NoSpace,
    ReceiverCanceled,
    SenderCanceled,
    ConnectionBlocked,
    Unknown(String),
}

impl PeerTermination {
    /// Classify an error reply sent by a peer acting as `peer_role`.
    pub fn from_error(error: &StanzaError, peer_role: Role) -> Self {
        match error.condition.as_str() {
            "resource-constraint" => Self::NoSpace,
            "forbidden" | "not-acceptable" => match peer_role {
                Role::Receiver => Self::ReceiverCanceled,
                Role::Sender => Self::SenderCanceled,
            },
            "not-allowed"
            | "item-not-found"
            | "service-unavailable"
            | "remote-server-not-found"
            | "policy-violation" => Self::ConnectionBlocked,
            _ => Self::Unknown(error.to_string()),
        }
    }
}

impl fmt::Display for PeerTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace => f.write_str("not enough space on the receiving side"),
            Self::ReceiverCanceled => f.write_str("receiver canceled the transfer"),
            Self::SenderCanceled => f.write_str("sender canceled the transfer"),
            Self::ConnectionBlocked => f.write_str("connection blocked"),
            Self::Unknown(detail) => write!(f, "unknown error code ({})", detail),
        }
    }
}

/// Per-session transfer table plus the streamhost configuration.
#[derive(Debug, Default)]
pub struct TransferEngine {
    transfers: BTreeMap<TransferId, Transfer>,
    next_id: u32,
    settings: Vec<ProxySetting>,
    /// Proxies found through service discovery
    discovered: Vec<Candidate>,
}

impl TransferEngine {
    pub fn new(settings: Vec<ProxySetting>) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn allocate_id(&mut self) -> TransferId {
        self.next_id += 1;
        TransferId(self.next_id)
    }

    pub fn insert(&mut self, transfer: Transfer) {
        self.transfers.insert(transfer.id, transfer);
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    pub fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        self.transfers.remove(&id)
    }

    pub fn ids(&self) -> Vec<TransferId> {
        self.transfers.keys().copied().collect()
    }

    /// Receiving transfer with stream id `sid` initiated by `initiator`.
    pub fn find_incoming(&self, sid: &str, initiator: &str) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| t.role == Role::Receiver && t.sid == sid && t.initiator == initiator)
            .map(|t| t.id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn local_enabled(&self) -> bool {
        self.settings.contains(&ProxySetting::Local)
    }

    pub fn auto_enabled(&self) -> bool {
        self.settings.contains(&ProxySetting::Auto)
    }

    pub fn add_discovered(&mut self, candidate: Candidate) {
        if !self.discovered.iter().any(|c| c.jid == candidate.jid) {
            self.discovered.push(candidate);
        }
    }

    pub fn discovered(&self) -> &[Candidate] {
        &self.discovered
    }

    /// Streamhosts to offer, in configured order. `local` is our own
    /// listener when one is up.
    pub fn sender_candidates(&self, local: Option<Candidate>) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for setting in &self.settings {
            match setting {
                ProxySetting::Local => candidates.extend(local.clone()),
                ProxySetting::Fixed { jid, host, port } => candidates.push(Candidate {
                    jid: jid.clone(),
                    host: host.clone(),
                    port: *port,
                    relay: true,
                }),
                ProxySetting::Auto => candidates.extend(self.discovered.iter().cloned()),
            }
        }
        candidates
    }
}
