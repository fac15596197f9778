use std::result::Result as StdResult;

use crate::gateway::BackendError;
use crate::protocol::ProtocolError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
