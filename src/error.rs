use std::path::PathBuf;

// ------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------
//
// Collector-level problems never show up here: they are logged
// and replaced by the sentinel document inside the executor.
// What remains are the failures a caller has to act on.
//

/// Errors produced while building or editing a [`crate::document::Document`].
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Input is not valid JSON (or not valid UTF-8), or the stored
    /// document is not a JSON object when one is required.
    #[error("format error: {0}")]
    Format(String),

    /// A mutation was attempted after the body started streaming.
    #[error("state error: cannot alter collected data after read")]
    State,
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::Format(e.to_string())
    }
}

/// Errors produced by the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection, timeout or protocol failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered outside the 200-399 range.
    #[error("non-2xx/3xx status {status}")]
    Status { status: u16, body: Vec<u8> },
}

/// Errors that end a collection cycle.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// `core.id` produced no document at all.
    #[error("core.id produced no data")]
    NoIdentity,

    /// The registration round-trip did not yield a regid.
    #[error("registration failed: {0}")]
    Registration(String),

    /// Local setup is inconsistent with what the server told us.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The regid file could not be written.
    #[error("could not write {}: {source}", path.display())]
    StateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl RunError {
    /// Whether the process must stop instead of waiting for the next cycle.
    ///
    /// A regid file that cannot be written, or a core.id that ignores the
    /// regid we just stored, would desynchronize local and remote identity
    /// on every later cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Configuration(_) | RunError::StateFile { .. })
    }
}
