// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{coding::DecodeError, DocId};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// A database file could not be opened
    Opening(String),

    /// A format invariant does not hold on disk
    Corrupt(String),

    /// The version file is understood but from an incompatible format revision
    Version(String),

    /// Another process (or handle) holds the database write lock
    Locked(String),

    /// A database already exists at the target path
    Create(String),

    /// The document does not exist
    DocNotFound(DocId),

    /// The caller passed an unusable argument (e.g. an over-long key)
    InvalidArgument(String),

    /// The operation is not valid for this handle
    InvalidOperation(&'static str),

    /// The database was built without the table this operation needs
    FeatureUnavailable(&'static str),

    /// A variable-length integer overflowed its type
    Range(&'static str),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress,

    /// The database handle behind a cursor has been dropped
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QuartzError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::VarintOverflow(what) => Self::Range(what),
            value => Self::Decode(value),
        }
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
