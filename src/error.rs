use std::path::PathBuf;

use crate::models::ClassId;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure categories. Every variant of [`Error`] belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Validation,
    DataConsistency,
    Subprocess,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read image size of {path}: {source}")]
    ImageProbe {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("no class selected")]
    NoClassSelected,

    #[error("no image is open")]
    NoActiveImage,

    #[error("a box is already being drawn")]
    AlreadyDrawing,

    #[error("{path}:{line}: class id {id} is not in the class table")]
    UnknownClassId { path: PathBuf, line: usize, id: ClassId },

    #[error("box references class id {0}, which is no longer in the class table")]
    MissingClass(ClassId),

    #[error("{path}:{line}: {message}")]
    LabelParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("settings line {line}: {message}")]
    Settings { line: usize, message: String },

    #[error("failed to launch trainer `{program}`: {source}")]
    TrainerLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::ImageProbe { .. } | Error::Yaml { .. } => ErrorKind::Io,
            Error::Validation(_)
            | Error::NoClassSelected
            | Error::NoActiveImage
            | Error::AlreadyDrawing
            | Error::Settings { .. } => ErrorKind::Validation,
            Error::UnknownClassId { .. } | Error::MissingClass(_) | Error::LabelParse { .. } => {
                ErrorKind::DataConsistency
            }
            Error::TrainerLaunch { .. } => ErrorKind::Subprocess,
        }
    }
}
