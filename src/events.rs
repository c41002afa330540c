//! Notifications from a session to its collaborator.

use serde::Serialize;

use crate::jid::Jid;
use crate::transfer::TransferId;
use crate::xmltree::Element;

/// Something the roster/chat layer above the protocol engine should know.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Progress line for the user
    Log(String),
    /// The session is gone. `retryable` is false for conflicts and
    /// authorization failures.
    FatalError { message: String, retryable: bool },
    /// Authenticated and bound; `jid` is the full address in use
    Ready { jid: Jid },
    /// A stanza this engine does not interpret itself
    Stanza(Element),
    Transfer(TransferEvent),
}

/// File transfer lifecycle. Every transfer ends with exactly one
/// `Finished` or `Canceled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A peer wants to send us a file; answer with accept or cancel
    Offered {
        id: TransferId,
        from: String,
        name: String,
        size: u64,
    },
    Started {
        id: TransferId,
    },
    Progress {
        id: TransferId,
        transferred: u64,
        total: u64,
    },
    Finished {
        id: TransferId,
        transferred: u64,
    },
    Canceled {
        id: TransferId,
        reason: String,
    },
}

impl TransferEvent {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Offered { id, .. }
            | Self::Started { id }
            | Self::Progress { id, .. }
            | Self::Finished { id, .. }
            | Self::Canceled { id, .. } => *id,
        }
    }

    /// `Finished` or `Canceled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Canceled { .. })
    }
}
