use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("{0} is not a power of two")]
    InvalidCapacity(usize),
    #[error("timed out after {0:?} waiting for an entry")]
    Timeout(Duration),
}
