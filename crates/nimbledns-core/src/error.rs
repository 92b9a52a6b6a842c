use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found in cache")]
    CacheNotFound,

    #[error("cache entry expired")]
    CacheExpired,

    #[error("cache capacity reached")]
    CapacityFull,

    #[error("failed to pack message: {0}")]
    WirePack(String),

    #[error("timed out waiting for in-flight query")]
    Timeout,

    #[error("handler chain produced no response")]
    NoResponse,

    #[error("config error: {0}")]
    Config(String),

    #[error("dns protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
