use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Runtime Error - {0}")]
    Runtime(String),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("No free slot in the pool")]
    NoFreeSlot,

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task Error - {0}")]
    Task(String),
}
