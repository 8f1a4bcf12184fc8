use thiserror::Error;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur when working with this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// An argument or contract precondition was violated (alignment, buffer size, range).
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// `frame_for` was asked for an offset outside the table's addressable range.
    #[error("offset out of range")]
    OutOfRange,

    /// `subset` was asked for a range starting before the table's `start_at`.
    #[error("range starts before the frame table's start offset")]
    BeforeStart,

    /// `subset` was asked for a range starting at or past the end of the table.
    #[error("range starts beyond the frame table's end")]
    BeyondEnd,

    /// A read would have crossed a frame boundary in compressed coordinates.
    #[error("requested range crosses a frame boundary")]
    CrossesFrame,

    /// The caller supplied a buffer smaller than the frame demands.
    #[error("buffer too small for frame (need {needed}, got {got})")]
    ShortBuffer { needed: usize, got: usize },

    /// A backend capability was requested that the concrete backend does not implement.
    #[error("backend does not support the {0} capability")]
    Unsupported(&'static str),

    /// The zstd codec failed to compress or decompress a frame.
    #[error("codec error: {0}")]
    Codec(#[source] std::io::Error),

    /// A transient network/transport failure. Retryable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Multipart initiate failed.
    #[error("initiate multipart upload failed: status {status}, body: {body}")]
    InitiateFailed { status: u16, body: String },

    /// Multipart complete failed.
    #[error("complete multipart upload failed: status {status}, body: {body}")]
    CompleteFailed { status: u16, body: String },

    /// A 5xx response survived every retry attempt.
    #[error("server error after retries: status {status}, body: {body}")]
    ServerError { status: u16, body: String },

    /// A 4xx response; never retried.
    #[error("client error: status {status}, body: {body}")]
    ClientError { status: u16, body: String },

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An underlying filesystem I/O failure not otherwise classified.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An invariant that should be impossible to violate was violated anyway.
    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Whether this error is transient and worth retrying under a [`crate::retry::RetryPolicy`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ServerError { .. })
    }
}
