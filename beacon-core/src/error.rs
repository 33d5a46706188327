use thiserror::Error;

/// Errors surfaced by the registry client.
///
/// Transport failures on the heartbeat and lookup paths are usually swallowed
/// and logged by the caller; configuration errors are returned at construction.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::transport("connection refused").to_string(),
            "Transport error: connection refused"
        );
        assert_eq!(
            Error::Configuration("Invalid registry URL".to_string()).to_string(),
            "Configuration error: Invalid registry URL"
        );
    }
}
