//! The engine error taxonomy.
//!
//! Every fallible API in the crate returns `Result<_, Error>`. A few variants
//! are warning-severity (`ClockSamplingFreq`, `UnknownOption`): the operation
//! was still applied best-effort and the caller may choose to ignore them.

/// Errors reported by the machine, clock, options store and state codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The machine is currently running; retry once it is idle.
    #[error("the machine is currently running")]
    Busy,

    /// The host clock cannot be queried, or the requested sampling interval
    /// is finer than the host timer resolution. Warning severity: the clock
    /// is still configured best-effort.
    #[error("the requested sampling frequency exceeds the host clock capability")]
    ClockSamplingFreq,

    /// An internal cpu invariant was violated.
    #[error("the cpu is in an invalid state")]
    Cpu,

    /// No memory controller is attached.
    #[error("the memory controller is invalid or not attached")]
    MemoryController,

    /// No i/o controller is attached.
    #[error("the i/o controller is invalid or not attached")]
    IoController,

    /// A bad argument was passed to a method.
    #[error("invalid argument")]
    InvalidArgument,

    /// Malformed JSON (options or snapshot).
    #[error("malformed json: {0}")]
    JsonParse(String),

    /// Well-formed JSON carrying an invalid configuration value.
    #[error("invalid json configuration: {0}")]
    JsonConfig(String),

    /// Unknown or unavailable binary-to-text encoder.
    #[error("unknown encoder: {0}")]
    Encoder(String),

    /// Unknown or unavailable compressor.
    #[error("unknown compressor: {0}")]
    Compressor(String),

    /// A snapshot uuid does not match the attached component.
    #[error("the snapshot uuid does not match this machine")]
    IncompatibleUuid,

    /// A snapshot rom image does not match the attached memory controller.
    #[error("the snapshot rom does not match this machine")]
    IncompatibleRom,

    /// A snapshot ram payload does not fit the derived ram ranges.
    #[error("the snapshot ram does not match this machine")]
    IncompatibleRam,

    /// An unrecognised `<scheme>://` prefix in a snapshot or option value.
    #[error("unknown uri scheme: {0}")]
    UriScheme(String),

    /// A background run/save/load task failed or was unavailable.
    #[error("an asynchronous operation failed to complete")]
    Async,

    /// The requested feature is not built into this crate.
    #[error("not implemented")]
    NotImplemented,

    /// One or more unknown option keys were encountered. Warning severity:
    /// the recognised options were applied.
    #[error("unknown option: {0}")]
    UnknownOption(String),
}
