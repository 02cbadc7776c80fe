//! Event types flowing from peers through the dispatcher to listeners.

use serde::{Deserialize, Serialize};

// ─── PeerRef ──────────────────────────────────────────────────────────────────

/// Identity of a peer that emits block and disconnect events.
///
/// Only equality and hashing are meaningful; the dispatcher never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRef(String);

impl PeerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ─── ValidationCode ───────────────────────────────────────────────────────────

/// Outcome of transaction validation as reported by a committing peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    Valid,
    NilEnvelope,
    BadPayload,
    BadProposalTxid,
    DuplicateTxid,
    EndorsementPolicyFailure,
    MvccReadConflict,
    PhantomReadConflict,
    InvalidOtherReason,
    /// Any code not listed above, by its numeric value.
    Other(i32),
}

impl ValidationCode {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "VALID"),
            Self::NilEnvelope => write!(f, "NIL_ENVELOPE"),
            Self::BadPayload => write!(f, "BAD_PAYLOAD"),
            Self::BadProposalTxid => write!(f, "BAD_PROPOSAL_TXID"),
            Self::DuplicateTxid => write!(f, "DUPLICATE_TXID"),
            Self::EndorsementPolicyFailure => write!(f, "ENDORSEMENT_POLICY_FAILURE"),
            Self::MvccReadConflict => write!(f, "MVCC_READ_CONFLICT"),
            Self::PhantomReadConflict => write!(f, "PHANTOM_READ_CONFLICT"),
            Self::InvalidOtherReason => write!(f, "INVALID_OTHER_REASON"),
            Self::Other(code) => write!(f, "OTHER({code})"),
        }
    }
}

// ─── TransactionEvent ─────────────────────────────────────────────────────────

/// The outcome of one transaction inside a block, as seen by one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: String,
    /// Peer that reported this outcome.
    pub peer: PeerRef,
    pub validation_code: ValidationCode,
    /// Number of the containing block (kept for reporting only).
    pub block_number: u64,
}

impl TransactionEvent {
    pub fn is_valid(&self) -> bool {
        self.validation_code.is_valid()
    }
}

// ─── BlockEvent ───────────────────────────────────────────────────────────────

/// A numbered block observed from a peer, with its transaction outcomes in
/// block order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub block_number: u64,
    pub peer: PeerRef,
    #[serde(default)]
    pub transactions: Vec<TransactionEvent>,
}

impl BlockEvent {
    /// An empty block from `peer`.
    pub fn new(block_number: u64, peer: PeerRef) -> Self {
        Self {
            block_number,
            peer,
            transactions: vec![],
        }
    }

    /// Append a transaction outcome reported by this block's own peer.
    pub fn with_transaction(
        mut self,
        transaction_id: impl Into<String>,
        validation_code: ValidationCode,
    ) -> Self {
        let peer = self.peer.clone();
        self.transactions.push(TransactionEvent {
            transaction_id: transaction_id.into(),
            peer,
            validation_code,
            block_number: self.block_number,
        });
        self
    }

    /// Append a transaction outcome tagged with a different reporting peer.
    pub fn with_peer_transaction(
        mut self,
        transaction_id: impl Into<String>,
        peer: PeerRef,
        validation_code: ValidationCode,
    ) -> Self {
        self.transactions.push(TransactionEvent {
            transaction_id: transaction_id.into(),
            peer,
            validation_code,
            block_number: self.block_number,
        });
        self
    }
}

// ─── PeerDisconnectEvent ──────────────────────────────────────────────────────

/// Emitted once each time the connection to a peer's event service drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDisconnectEvent {
    pub peer: PeerRef,
}

impl PeerDisconnectEvent {
    pub fn new(peer: PeerRef) -> Self {
        Self { peer }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactions_inherit_block_number_and_peer() {
        let block = BlockEvent::new(7, PeerRef::new("peer1"))
            .with_transaction("tx1", ValidationCode::Valid)
            .with_transaction("tx2", ValidationCode::MvccReadConflict);

        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions.iter().all(|tx| tx.block_number == 7));
        assert!(block.transactions.iter().all(|tx| tx.peer.name() == "peer1"));
        assert!(block.transactions[0].is_valid());
        assert!(!block.transactions[1].is_valid());
    }

    #[test]
    fn block_event_json_shape() {
        let block = BlockEvent::new(3, "peer0".into()).with_transaction("abc", ValidationCode::Valid);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["block_number"], 3);
        assert_eq!(json["peer"], "peer0");
        assert_eq!(json["transactions"][0]["validation_code"], "VALID");

        let parsed: BlockEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn validation_code_display() {
        assert_eq!(ValidationCode::EndorsementPolicyFailure.to_string(), "ENDORSEMENT_POLICY_FAILURE");
        assert_eq!(ValidationCode::Other(254).to_string(), "OTHER(254)");
    }
}
