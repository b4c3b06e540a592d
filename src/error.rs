use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
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
    #[error("tensor error while {context}: {message}")]
    Tensor {
        context: &'static str,
        message: String,
    },
    #[error("configuration error ({context}): {message}")]
    Configuration {
        context: &'static str,
        message: String,
    },
    #[error("shape mismatch in layer {layer} ({kind}): expected {expected}, got {actual}")]
    ShapeMismatch {
        layer: usize,
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("numeric instability in {context}: {message}")]
    NumericInstability {
        context: &'static str,
        message: String,
    },
    #[error("training failed at iteration {iteration}: {source}")]
    Training {
        iteration: usize,
        #[source]
        source: Box<SequencerError>,
    },
    #[error("sequence `{id}`: {source}")]
    Sequence {
        id: String,
        #[source]
        source: Box<SequencerError>,
    },
}

impl SequencerError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn tensor(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Tensor {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn configuration(context: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            context,
            message: message.into(),
        }
    }

    pub(crate) fn shape(layer: usize, kind: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            layer,
            kind,
            expected,
            actual,
        }
    }

    pub(crate) fn numeric(context: &'static str, message: impl Into<String>) -> Self {
        Self::NumericInstability {
            context,
            message: message.into(),
        }
    }

    pub(crate) fn in_iteration(self, iteration: usize) -> Self {
        Self::Training {
            iteration,
            source: Box::new(self),
        }
    }

    pub(crate) fn in_sequence(self, id: &str) -> Self {
        Self::Sequence {
            id: id.to_string(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, SequencerError>;
