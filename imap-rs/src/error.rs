use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImapError {
    /// Malformed wire data. Recoverable: the current command is aborted
    /// with a tagged BAD and the connection stays open.
    #[error("protocol syntax error: {0}")]
    ProtocolSyntax(String),

    /// A tagged NO/BAD completion from a remote server. The attached
    /// request text has credentials redacted.
    #[error("command failed ({status}): {request}")]
    CommandFailed { status: String, request: String },

    /// Rejected by the command throttle or an account-lock timeout.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The session was torn down concurrently; stop processing silently.
    #[error("session closed")]
    SessionClosed,

    /// Impossible item ordering reported by the store. Fatal for the
    /// session: sequence-number mappings can no longer be trusted.
    #[error("message renumbering inconsistency: {0}")]
    RenumberingInconsistency(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("mailbox store error: {0}")]
    Store(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ImapError {
    /// Fatal errors close the connection; everything else is answered on
    /// the open connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ImapError::RenumberingInconsistency(_) | ImapError::Transport(_)
        )
    }

    pub fn syntax<S: Into<String>>(msg: S) -> Self {
        ImapError::ProtocolSyntax(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ImapError>;
