use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("service.method {0} format not correct")]
    BadServiceMethod(String),

    #[error("service.method {0} service not found")]
    ServiceNotFound(String),

    #[error("service.method {0} method not found")]
    MethodNotFound(String),

    #[error("service {0} already registered")]
    AlreadyRegistered(String),

    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    #[error("dial pattern {0} format not correct")]
    BadDialPattern(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("connect timeout expected within {0:?}")]
    ConnectTimeout(Duration),

    #[error("call timeout expected within {0:?}")]
    CallTimeout(Duration),

    #[error("handle timeout expected within {0:?}")]
    HandleTimeout(Duration),

    #[error("connection has already been closed or shut down")]
    Closed,

    #[error("connection shut down: {0}")]
    Shutdown(String),

    /// Error string carried back in a response header.
    #[error("{0}")]
    ServerError(String),

    #[error("no available servers")]
    NoServers,

    #[error("registry error: {0}")]
    Registry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
