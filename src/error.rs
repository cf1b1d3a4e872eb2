use thiserror::Error;

/// Errors surfaced by the bus API and its building blocks.
///
/// Transport-internal faults (malformed datagrams, failed sends) are absorbed
/// into metrics and `Loss` events rather than propagated per-packet; the
/// variants here exist so the fallible entry points can fail fast on caller
/// errors and so internal plumbing has typed reasons to count.
#[derive(Debug, Error)]
pub enum BusError {
    /// A topic or filter pattern that violates the segmenter rules.
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    /// The cipher was initialized with an empty key.
    #[error("invalid cipher key")]
    InvalidKey,

    /// Ciphertext with a length that is not a multiple of the block size, or
    /// with a padding byte outside 1..=8.
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// A datagram that could not be decoded. Never surfaced to callers;
    /// counted in [`BusMetrics`](crate::metrics::BusMetrics).
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A datagram send that failed at the socket layer. Absorbed on the
    /// publish path (the retransmit ring recovers the packet) and counted.
    #[error("send failed: {0}")]
    SendFailed(std::io::Error),

    /// Topic plus payload (plus padding, when encrypting) does not fit the
    /// configured maximum packet size.
    #[error("payload of {0} bytes does not fit the configured packet size")]
    PayloadTooLarge(usize),

    /// A configuration value rejected by [`BusConfig::validate`](crate::config::BusConfig::validate).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation attempted after `close()`.
    #[error("bus is closed")]
    Closed,

    /// Socket setup failure during `open()`.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BusResult<T> = Result<T, BusError>;
