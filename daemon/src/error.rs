use std::path::PathBuf;

use thiserror::Error;

use crate::hook::HookKind;

/// Errors raised by the notification core.
///
/// `Rpc` and `Protocol` are protocol failures: the far side refused a request or
/// sent a reply we cannot act on. Everything else is an unexpected local failure.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("{rpc}: {}", message.as_deref().unwrap_or("no error message in reply"))]
    Rpc {
        rpc: &'static str,
        message: Option<String>,
    },

    #[error("{rpc}: {detail}")]
    Protocol { rpc: &'static str, detail: String },

    #[error("failed to run RPC transport '{program}': {source}")]
    Transport {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{rpc}: malformed reply: {source}")]
    MalformedReply {
        rpc: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to run {kind} command: {source}")]
    Hook {
        kind: HookKind,
        #[source]
        source: std::io::Error,
    },

    #[error("token file {}: {source}", path.display())]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command line '{0}'")]
    InvalidCommand(String),
}

impl NotifyError {
    /// True for failures reported by, or caused by, the notification service itself.
    pub fn is_protocol(&self) -> bool {
        matches!(self, NotifyError::Rpc { .. } | NotifyError::Protocol { .. })
    }
}
