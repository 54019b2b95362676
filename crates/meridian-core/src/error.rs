/// Errors from registering, reweighting and removing fair-queue flows.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowError {
    #[error("flow already registered: {0}")]
    DuplicateFlow(String),

    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    #[error("invalid weight {0}: weights must be finite and non-negative")]
    InvalidWeight(f64),
}

/// A rejected push. The message is handed back so the caller can choose
/// between dropping it, applying backpressure or retrying later.
#[derive(Debug, thiserror::Error)]
pub enum PushError<M> {
    #[error("sub-queue is full")]
    Full(M),

    #[error("unknown flow")]
    UnknownFlow(M),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized { message: M, size: usize, limit: usize },
}

impl<M> PushError<M> {
    /// Recover the rejected message.
    pub fn into_inner(self) -> M {
        match self {
            PushError::Full(message)
            | PushError::UnknownFlow(message)
            | PushError::Oversized { message, .. } => message,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }

    /// Map the carried message, keeping the rejection reason.
    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> PushError<N> {
        match self {
            PushError::Full(message) => PushError::Full(f(message)),
            PushError::UnknownFlow(message) => PushError::UnknownFlow(f(message)),
            PushError::Oversized {
                message,
                size,
                limit,
            } => PushError::Oversized {
                message: f(message),
                size,
                limit,
            },
        }
    }
}

/// Errors from the link service loop and its command channel.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to spawn service loop: {0}")]
    Spawn(String),

    #[error("link command channel full")]
    ChannelFull,

    #[error("link command channel disconnected")]
    ChannelDisconnected,

    #[error("service loop panicked")]
    Panicked,

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Wire encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
pub type LinkResult<T> = std::result::Result<T, LinkError>;
