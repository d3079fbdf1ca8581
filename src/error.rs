//! Error taxonomy for the server-manager layer.
//!
//! DESIGN
//! ======
//! Not-found lookups return `Option` and never reach this type. `SmError`
//! covers failures a caller can act on: unknown proxy types, missing active
//! session, transport and codec faults, and remote operations that the
//! server reported as failed. Remote failures are logged once at the call
//! site and converted to sentinel returns there.

use std::fmt::Display;

/// Trait for errors that carry a stable machine-readable code.
pub trait ErrorCode: Display {
    /// Machine-readable error code, e.g. `"E_NO_ACTIVE_SESSION"`.
    fn error_code(&self) -> &'static str;

    /// Whether the caller may retry the operation.
    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SmError {
    #[error("no proxy type registered for class `{0}`")]
    UnknownProxyType(String),
    #[error("no proxy definition for ({group}, {name})")]
    DefinitionNotFound { group: String, name: String },
    #[error("no active session found")]
    NoActiveSession,
    #[error("object is not attached to a live session")]
    NoSession,
    #[error("remote call `{0}` issued while another remote call is in flight")]
    ReentrantRemoteCall(String),
    #[error("server error: {0}")]
    Remote(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("unexpected reply to `{0}`")]
    UnexpectedReply(String),
    #[error("codec error: {0}")]
    Codec(#[from] frames::CodecError),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed xml: {0}")]
    MalformedXml(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported state version {0}")]
    UnsupportedStateVersion(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("plugin load failed: {0}")]
    PluginLoad(String),
    #[error("connection attempt aborted")]
    ConnectionAborted,
}

impl ErrorCode for SmError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownProxyType(_) => "E_UNKNOWN_PROXY_TYPE",
            Self::DefinitionNotFound { .. } => "E_DEFINITION_NOT_FOUND",
            Self::NoActiveSession => "E_NO_ACTIVE_SESSION",
            Self::NoSession => "E_NO_SESSION",
            Self::ReentrantRemoteCall(_) => "E_REENTRANT_CALL",
            Self::Remote(_) => "E_REMOTE",
            Self::TransportClosed => "E_TRANSPORT_CLOSED",
            Self::UnexpectedReply(_) => "E_UNEXPECTED_REPLY",
            Self::Codec(_) => "E_CODEC",
            Self::Xml(_) | Self::MalformedXml(_) => "E_XML",
            Self::Io(_) => "E_IO",
            Self::UnsupportedStateVersion(_) => "E_STATE_VERSION",
            Self::Config(_) => "E_CONFIG",
            Self::PluginLoad(_) => "E_PLUGIN_LOAD",
            Self::ConnectionAborted => "E_ABORTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::ReentrantRemoteCall(_) | Self::Io(_))
    }
}

pub type SmResult<T> = Result<T, SmError>;
