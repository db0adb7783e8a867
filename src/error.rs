// IOCORE ERROR TAXONOMY
// A BAD MOVE IS NOT AN ERROR. REGRET IS MEASURED AND HANDLED IN engine.rs.
// ERRORS HERE ABORT THE CURRENT EPOCH'S MOVE; THE LOOP CONTINUES NEXT EPOCH.

use thiserror::Error;

use crate::pool::PoolKind;

#[derive(Debug, Error)]
pub enum Error {
    // REQUESTED MORE CPUS THAN THE POOL HOLDS. RAISED BEFORE ANY MUTATION.
    #[error("insufficient capacity: requested {requested} cpus from {pool} pool, {available} available")]
    InsufficientCapacity {
        pool: PoolKind,
        requested: usize,
        available: usize,
    },

    // COUNTER READ, ATTRIBUTE WRITE, WORKER CREATE/DESTROY OR AFFINITY CALL FAILED
    #[error("host interface: {0}")]
    Host(String),

    // A CPU IN BOTH POOLS, A DEVICE WITHOUT A WORKER, A CHANGE-SET THAT DOES NOT
    // MATCH THE CURRENT ASSIGNMENT. SHOULD NEVER HAPPEN.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn host(msg: impl Into<String>) -> Self {
        Error::Host(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Host(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
