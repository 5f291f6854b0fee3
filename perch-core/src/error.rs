use thiserror::Error;

/// All errors produced by perch-core.
///
/// Protocol-order violations (`ReservationPending`, `NoReservation`,
/// `RequestPending`, `NoRequest`) are programming errors: they abort the
/// offending operation without touching buffer state. Resource exhaustion is
/// *not* an error — a full ring reports itself through short or zero return
/// counts.
#[derive(Debug, Error)]
pub enum PerchError {
    #[error("a period reservation is already in progress")]
    ReservationPending,

    #[error("no period reservation in progress")]
    NoReservation,

    #[error("a period request is already in progress")]
    RequestPending,

    #[error("no period request in progress")]
    NoRequest,

    #[error("channel payload is {got} bytes, expected {expected}")]
    ChannelSizeMismatch { expected: usize, got: usize },

    #[error("writer thread is already running")]
    AlreadyRunning,

    #[error("writer thread is not running")]
    NotRunning,

    #[error("writer thread panicked")]
    WriterThreadPanicked,

    #[error("writer thread exited before completing the request")]
    WriterThreadGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PerchError>;
