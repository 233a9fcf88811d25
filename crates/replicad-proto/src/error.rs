//! Error types for object access and wire encoding.

use crate::dset::Key;
use crate::object::FieldKind;
use crate::Oid;
use thiserror::Error;

/// Failure to resolve, subscribe to, or mutate a distributed object.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObjectAccessError {
    /// No object is registered under the oid.
    #[error("no such object: {0}")]
    NoSuchObject(Oid),

    /// The object's access controller refused the request.
    #[error("access denied: {0}")]
    AccessDenied(Oid),

    /// Oid outside the range clients may address.
    #[error("invalid oid: {0}")]
    InvalidOid(Oid),

    #[error("class {class} has no field {field}")]
    NoSuchField { class: String, field: String },

    #[error("field {field} holds {expected:?}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },

    #[error("index {index} out of bounds for {field} (len {len})")]
    IndexOutOfBounds {
        field: String,
        index: usize,
        len: usize,
    },

    #[error("entry {key} already present in {field}")]
    EntryAlreadyPresent { field: String, key: Key },

    #[error("entry {key} not found in {field}")]
    EntryNotFound { field: String, key: Key },

    /// The object could not be created.
    #[error("instantiation failed: {0}")]
    Instantiation(String),
}

impl ObjectAccessError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSuchObject(_) => "no_such_object",
            Self::AccessDenied(_) => "access_denied",
            Self::InvalidOid(_) => "invalid_oid",
            Self::NoSuchField { .. } => "no_such_field",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::IndexOutOfBounds { .. } => "index_out_of_bounds",
            Self::EntryAlreadyPresent { .. } => "entry_already_present",
            Self::EntryNotFound { .. } => "entry_not_found",
            Self::Instantiation(_) => "instantiation",
        }
    }

    /// Translation key sent to clients in a failure response.
    ///
    /// Subscription failures carry the oid after a tab so clients can
    /// match the failure to their pending request.
    pub fn client_message(&self) -> String {
        match self {
            Self::NoSuchObject(oid) => format!("m.no_such_object\t{oid}"),
            Self::AccessDenied(oid) => format!("m.access_denied\t{oid}"),
            Self::InvalidOid(oid) => format!("m.invalid_oid\t{oid}"),
            _ => crate::E_INTERNAL_ERROR.to_string(),
        }
    }
}

/// Wire encoding and framing errors.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl ProtoError {
    /// Get a static error code string for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
        }
    }
}
