use thiserror::Error;

use crate::channel::ObjectHandle;
use crate::classify::AtomPhase;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Broken caller or internal invariants.
///
/// These are never retried: once one is reported the wrapper stack can no longer vouch for
/// the ordering of the stream it forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("end_inserted_methods without a matching begin_inserted_methods")]
    UnbalancedEndInsertedMethods,

    #[error("cancel_inserted_methods while no inserted-methods scope is open")]
    CancelWithoutInsertedMethods,

    #[error("classifier reported {0:?} for a method header")]
    IllegalHeaderPhase(AtomPhase),

    #[error("semaphore state stack would become empty")]
    SemaphoreStackUnderflow,

    #[error("semaphore state restore did not converge after {iterations} iterations")]
    RestoreDidNotConverge { iterations: u32 },
}

/// Unified error type for channel and wrapper operations.
///
/// Leaf and scheduler failures carry a human-readable `String` so test doubles and real
/// backends can both surface their own diagnostics without a shared error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid subchannel {0}")]
    InvalidSubchannel(u32),

    #[error("unknown object handle {0:?}")]
    UnknownObject(ObjectHandle),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by the leaf channel.
    #[error("channel error: {0}")]
    Leaf(String),

    /// The leaf channel is in a robust-channel error state and needs recovery.
    #[error("robust channel error: {0}")]
    RobustChannel(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl ChannelError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}
