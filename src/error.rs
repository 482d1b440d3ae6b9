use crate::{config::ConfigError, decode::Malformed, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    #[error("Malformed instrument response: {0}")]
    MalformedResponse(#[from] Malformed),
    #[error("Instrument still reported pending errors after {attempts} error queries")]
    ErrorDrainExhausted { attempts: usize },
    #[error("Transport failed while sending `{command}`")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
    #[error("Acquisition was started before the instrument was set up")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the transport is still usable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}
