use thiserror::Error;

#[derive(Error, Debug)]
pub enum FailcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Endpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {message}")]
    Pipeline { message: String },

    #[error("System error: {message}")]
    System { message: String },
}

impl FailcamError {
    pub fn pipeline<S: Into<String>>(message: S) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

/// Errors from camera chain mutations. These are boundary rejections, not
/// runtime failures: callers surface them and the chain stays untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Endpoint id '{id}' already exists")]
    DuplicateId { id: String },

    #[error("Unknown endpoint id '{id}'")]
    UnknownEndpoint { id: String },

    #[error("Endpoint '{id}' failed the liveness check at {host}:{port}")]
    EndpointUnreachable { id: String, host: String, port: u16 },

    #[error("Invalid endpoint: {reason}")]
    InvalidEndpoint { reason: String },
}

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Failed to open sink at {path}: {details}")]
    SinkOpen { path: String, details: String },

    #[error("Failed to write frame to sink: {details}")]
    SinkWrite { details: String },

    #[error("No codec available (tried {preferred} and {fallback})")]
    NoCodec { preferred: String, fallback: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read endpoint store {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write endpoint store {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed endpoint store {path}: {details}")]
    Malformed { path: String, details: String },
}

pub type Result<T> = std::result::Result<T, FailcamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors_format() {
        assert_eq!(
            FailcamError::pipeline("no frames").to_string(),
            "Pipeline error: no frames"
        );
        assert_eq!(
            FailcamError::system("already started").to_string(),
            "System error: already started"
        );
    }
}
