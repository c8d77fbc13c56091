use thiserror::Error;

#[derive(Debug, Error)]
pub enum Wav2LetterError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {message}")]
    Runtime {
        context: &'static str,
        message: String,
    },
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
    #[error("label {label:?} contains {character:?}, which is not in the alphabet")]
    Encoding { character: char, label: String },
    #[error("{operation} is not implemented")]
    Unsupported { operation: &'static str },
    #[error("shape mismatch: {message}")]
    ShapeMismatch { message: String },
}

pub type Result<T> = std::result::Result<T, Wav2LetterError>;

impl Wav2LetterError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn runtime(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Runtime {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
