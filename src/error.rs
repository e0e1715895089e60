use thiserror::Error;

/// Everything that can go wrong on the send path. Collapsed into a
/// `SendResult` at the request boundary; never propagated past it.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Permission(String),

    #[error("storage failure: {0}")]
    Store(String),

    #[error("broker send failed after retries: {0}")]
    BrokerTransient(String),

    #[error("broker rejected the send: {0}")]
    BrokerPermanent(String),

    #[error("sequence counter unavailable: {0}")]
    SequenceUnavailable(String),

    #[error("backpressure: send queue is full")]
    Backpressure,
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::Validation(_) => "validation",
            SendError::Permission(_) => "permission",
            SendError::Store(_) => "store",
            SendError::BrokerTransient(_) => "broker_transient",
            SendError::BrokerPermanent(_) => "broker_permanent",
            SendError::SequenceUnavailable(_) => "sequence_unavailable",
            SendError::Backpressure => "backpressure",
        }
    }
}

impl From<rusqlite::Error> for SendError {
    fn from(e: rusqlite::Error) -> Self {
        SendError::Store(e.to_string())
    }
}
