/// Maximum number of characters of a response body kept in error messages.
pub const BODY_PREVIEW_CHARS: usize = 200;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// Attempt budget consumed while the target kept answering with a retryable status.
    #[error("retryable HTTP {status} for {url} after {attempts} attempts. Body preview: {body_preview}")]
    RetriesExhausted {
        /// Status code of the last attempt.
        status: u16,
        /// Final request URL.
        url: String,
        /// Number of attempts made.
        attempts: u32,
        /// Body of the last response, at most [`BODY_PREVIEW_CHARS`] characters.
        body_preview: String,
    },
    /// The request could not be constructed (bad header, unparsable URL, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Response decoding or schema validation error.
    #[error("decode error: {0}")]
    Decode(String),
    /// Invalid or unparsable configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Filesystem error while loading configuration.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QaError {
    /// Status code carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::RetriesExhausted { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Whether this is a network-layer failure (timeout, refused connection,
    /// protocol error while sending or reading the body).
    pub fn is_network(&self) -> bool {
        match self {
            Self::Transport(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            _ => false,
        }
    }
}

/// Cuts `text` down to at most `max_chars` characters on a char boundary.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}
