use std::path::PathBuf;

use thiserror::Error;

use crate::volume_loader::VolumeLoaderError;

pub type Result<T, E = ViewerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("DICOM directory {0} does not exist")]
    SourceNotFound(PathBuf),

    #[error("DICOM directory {0} contains no decodable slices")]
    EmptySeries(PathBuf),

    #[error("volume has no points to render")]
    EmptyVolume,

    #[error("failed to decode series: {0}")]
    Decode(String),

    #[error("volume pipeline is not initialized, call start_render first")]
    NotInitialized,

    #[error("rendering resource failure: {0}")]
    FatalResource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ViewerError {
    /// Stable tag reported to remote callers next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::SourceNotFound(_) => "source_not_found",
            Self::EmptySeries(_) | Self::EmptyVolume => "empty_series",
            Self::Decode(_) => "decode",
            Self::NotInitialized => "not_initialized",
            Self::FatalResource(_) => "fatal_resource",
            Self::Io(_) => "io",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalResource(_))
    }

    pub(crate) fn from_loader(path: PathBuf, err: VolumeLoaderError) -> Self {
        match err {
            VolumeLoaderError::NoValidImages => Self::EmptySeries(path),
            VolumeLoaderError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Self::SourceNotFound(path)
            }
            VolumeLoaderError::Io(err) => Self::Io(err),
            other => Self::Decode(other.to_string()),
        }
    }
}
