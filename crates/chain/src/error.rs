/// Outcome of a rejected `eth_sendRawTransaction`, classified from the node's message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("nonce too low: {0}")]
    NonceTooLow(String),
    #[error("replacement transaction underpriced: {0}")]
    ReplacementUnderpriced(String),
    /// The node already holds this exact transaction.
    #[error("already known: {0}")]
    AlreadyKnown(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl BroadcastError {
    /// Maps a node error message onto the cases the submitter reacts to.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("insufficient funds") {
            Self::InsufficientFunds(message)
        } else if lower.contains("nonce too low") {
            Self::NonceTooLow(message)
        } else if lower.contains("replacement") && lower.contains("underpriced") {
            Self::ReplacementUnderpriced(message)
        } else if lower.contains("already known") || lower.contains("known transaction") {
            Self::AlreadyKnown(message)
        } else {
            Self::Rpc(message)
        }
    }

    /// The signed payload can never land and its nonce slot must be rebuilt.
    pub const fn invalidates_transaction(&self) -> bool {
        matches!(self, Self::NonceTooLow(_) | Self::ReplacementUnderpriced(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_node_messages() {
        assert!(matches!(
            BroadcastError::classify("insufficient funds for gas * price + value"),
            BroadcastError::InsufficientFunds(_)
        ));
        assert!(matches!(
            BroadcastError::classify("Nonce too low: next nonce 5, tx nonce 3"),
            BroadcastError::NonceTooLow(_)
        ));
        assert!(matches!(
            BroadcastError::classify("replacement transaction underpriced"),
            BroadcastError::ReplacementUnderpriced(_)
        ));
        assert!(matches!(
            BroadcastError::classify("already known"),
            BroadcastError::AlreadyKnown(_)
        ));
        assert!(matches!(
            BroadcastError::classify("execution reverted"),
            BroadcastError::Rpc(_)
        ));
    }

    #[test]
    fn only_nonce_conflicts_invalidate() {
        assert!(BroadcastError::NonceTooLow(String::new()).invalidates_transaction());
        assert!(BroadcastError::ReplacementUnderpriced(String::new()).invalidates_transaction());
        assert!(!BroadcastError::InsufficientFunds(String::new()).invalidates_transaction());
        assert!(!BroadcastError::Rpc(String::new()).invalidates_transaction());
    }
}
