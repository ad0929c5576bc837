use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while estimating or applying a bleedthrough correction.
///
/// Every failure is raised at the point of detection. Nothing is retried, and no partially built
/// model or dataset is ever handed back.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller supplied missing, insufficient or inconsistent inputs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A control tube disagrees with the instrument settings of the experiment.
    #[error("validation error: channel {channel} in tube {}: {reason}", tube.display())]
    Validation {
        channel: String,
        tube: PathBuf,
        reason: String,
    },

    /// A sample file could not be parsed. The source is the reader's own error.
    #[error("error reading {}: {source}", path.display())]
    DataFormat {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A fit was degenerate or the spillover matrix could not be inverted.
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to parse TOML: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to write TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical(message.into())
    }

    pub(crate) fn validation(
        channel: &str,
        tube: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            channel: channel.to_owned(),
            tube: tube.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a reader's error for the file at `path`
    pub fn data_format(
        path: impl Into<PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::DataFormat {
            path: path.into(),
            source: source.into(),
        }
    }
}
