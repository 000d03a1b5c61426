// Error types for the host/script bridge

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Every failure the bridge can report to host code.
///
/// Protocol failures raised while the interpreter is dispatching into the
/// bridge are converted into Lua runtime errors (see the `From` impl below),
/// so scripts can catch them with `pcall`. Failures of a protected call
/// surface back to the host as [`BridgeError::Runtime`]; when the failure was
/// raised by the bridge, [`BridgeError::cause`] recovers the original error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to initialize interpreter: {0}")]
    Initialization(String),

    #[error("failed to load chunk: {0}")]
    Load(String),

    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Option<String>,
        /// The error a host callback raised, if the failure started there
        #[source]
        cause: Option<Arc<dyn StdError + Send + Sync>>,
    },

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("no member '{member}' on {type_name}")]
    NoSuchMember { type_name: String, member: String },

    #[error("field '{member}' of {type_name} is read-only")]
    ReadOnly { type_name: String, member: String },

    #[error("insufficient arguments for '{method}': expected {expected}, got {supplied}")]
    ArityMismatch {
        method: String,
        expected: usize,
        supplied: usize,
    },

    #[error("stale foreign handle #{0}")]
    StaleHandle(u64),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("{0}")]
    Host(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl BridgeError {
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn no_such_member(type_name: impl Into<String>, member: impl Into<String>) -> Self {
        BridgeError::NoSuchMember {
            type_name: type_name.into(),
            member: member.into(),
        }
    }

    pub(crate) fn runtime(message: impl Into<String>, traceback: Option<String>) -> Self {
        BridgeError::Runtime {
            message: message.into(),
            traceback,
            cause: None,
        }
    }

    /// The bridge error a script failure was raised with.
    ///
    /// For a `Runtime` error that started as a protocol failure or a host
    /// function error, this is that original error, so callers can match on
    /// e.g. `ArityMismatch` or `StaleHandle`.
    pub fn cause(&self) -> Option<&BridgeError> {
        match self {
            BridgeError::Runtime { cause: Some(cause), .. } => cause.downcast_ref::<BridgeError>(),
            _ => None,
        }
    }

    /// Prefix a conversion error with the argument it came from.
    pub fn in_argument(self, method: &str, position: usize) -> Self {
        match self {
            BridgeError::TypeMismatch { expected, found } => BridgeError::TypeMismatch {
                expected: format!("{expected} for argument #{position} of '{method}'"),
                found,
            },
            other => other,
        }
    }

    /// Turn an error coming out of the interpreter into a typed bridge error.
    ///
    /// Errors raised by the bridge itself inside a callback are unwrapped back
    /// to the original variant; everything else becomes `Runtime`.
    pub(crate) fn from_lua_failure(err: mlua::Error) -> Self {
        let traceback = match &err {
            mlua::Error::CallbackError { traceback, .. } => Some(traceback.clone()),
            _ => None,
        };
        let root = root_cause(&err);
        if let mlua::Error::ExternalError(inner) = root {
            if let Some(BridgeError::StaleHandle(id)) = inner.downcast_ref::<BridgeError>() {
                tracing::warn!(id, "script touched a released foreign handle");
            }
            return BridgeError::Runtime {
                message: inner.to_string(),
                traceback,
                cause: Some(Arc::clone(inner)),
            };
        }
        match root {
            mlua::Error::RuntimeError(message) => BridgeError::runtime(message.clone(), traceback),
            mlua::Error::SyntaxError { message, .. } => BridgeError::Load(message.clone()),
            mlua::Error::MemoryError(message) => BridgeError::runtime(format!("memory error: {message}"), traceback),
            other => BridgeError::runtime(other.to_string(), traceback),
        }
    }
}

fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::WithContext { cause, .. } => root_cause(cause),
        mlua::Error::BadArgument { cause, .. } => root_cause(cause),
        other => other,
    }
}

impl From<BridgeError> for mlua::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}
