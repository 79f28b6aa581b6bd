use chanvault_engine::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum LocalChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt channel index: {0}")]
    Index(#[from] serde_json::Error),

    #[error("attachment `{name}` is {size} bytes, limit is {limit}")]
    TooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("no attachment at position {0}")]
    NoAttachment(u64),
}

impl From<LocalChannelError> for TransportError {
    fn from(e: LocalChannelError) -> Self {
        match e {
            // A busy or briefly unavailable disk may recover.
            LocalChannelError::Io(ref io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                TransportError::Transient(e.to_string())
            }
            other => TransportError::Fatal(other.to_string()),
        }
    }
}
