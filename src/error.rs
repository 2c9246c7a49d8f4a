// Error types that end the relay loop. Every failure the relay can hit is a
// variant here, so nothing is swallowed silently; `main` reports them via
// anyhow.
use thiserror::Error;

use crate::cellular::CellularError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("broker refused the connection with result code {0}")]
    ConnectionRefused(u8),

    #[error("broker connection lost: {0}")]
    BrokerLost(String),

    #[error("MQTT event stream closed before shutdown")]
    EventStreamClosed,

    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error(transparent)]
    Cellular(#[from] CellularError),

    #[error("failed to write relay output: {0}")]
    Output(#[from] std::io::Error),
}
