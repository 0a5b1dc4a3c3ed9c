use thiserror::Error;

/// All errors surfaced by this crate.
///
/// Backend implementations report their failures as [`anyhow::Error`]; the
/// crate wraps them in [`Error::Backend`] so callers can tell storage
/// problems apart from session lifecycle failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The persistence backend failed to load, save, or delete.
    /// Session state is unchanged.
    #[error("session storage backend failure")]
    Backend(#[source] anyhow::Error),

    /// A session was presented whose rotation grace window has passed.
    /// The session has been deleted; the cookie is left untouched so a newer
    /// rotation may still overwrite it on a later request.
    #[error("session expired")]
    Expired,

    /// A shadow session pointed at a successor that could not be found.
    #[error("reference session not found")]
    ReferenceMissing,

    /// The system random source failed while generating an identifier.
    /// No session was created.
    #[error("could not generate session identifier")]
    Generation(#[source] rand::Error),

    /// A stored session payload could not be decoded.
    #[error("malformed session record")]
    Decode(#[from] DecodeError),
}

/// Errors produced while decoding a stored session payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload carries a version this build does not understand.
    #[error("unsupported session payload version {0}")]
    Version(u8),

    /// The payload ended before all fields were read.
    #[error("truncated session payload")]
    Truncated,

    /// A field was present but could not be interpreted.
    #[error("malformed session payload field {field}: {reason}")]
    Field {
        /// Which field failed to decode.
        field: &'static str,
        /// Why it failed.
        reason: String,
    },
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
