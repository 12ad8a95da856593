use crate::dtype::DType;

/// All errors that can occur within okapi.
///
/// This enum captures every failure mode the engine distinguishes:
/// construction-time validation errors (shape/dtype mismatches, unsupported
/// slice patterns), recoverable usage errors (sequence longer than the
/// configured unroll), the end-of-epoch control-flow signal, and fatal
/// resource errors from the device layer. Using a single error type across
/// the workspace simplifies propagation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two matrices (e.g., hstacking 4x3 with 5x2).
    #[error("shape mismatch: expected {expected_rows}x{expected_cols}, got {got_rows}x{got_cols}")]
    ShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    /// DType mismatch between matrices in an operation or a host transfer.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Matrix multiplication inner-dimension mismatch.
    #[error("gemm shape mismatch: [{m}x{k1}] * [{k2}x{n}] — inner dims must match")]
    GemmShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Storage is column-major; only whole, contiguous column ranges can be
    /// viewed. Row slicing and strided column slicing must fail fast.
    #[error("unsupported slice: {0} (only contiguous column ranges are supported)")]
    UnsupportedSlice(String),

    /// A recurrent weight matrix must be square.
    #[error("recurrent weight must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    /// Recoverable usage error: the presented sequence exceeds the unroll
    /// length fixed at construction. The caller should skip or reshape the
    /// batch, not crash.
    #[error("sequence of length {len} exceeds the maximum unroll length {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// Control-flow signal: a data source exhausted its epoch. Callers must
    /// explicitly reset/reshuffle; this is not a failure.
    #[error("end of epoch")]
    EndOfEpoch,

    /// Fatal resource error (device allocation failure, dead device). Not
    /// retried; ownership of any retry policy belongs to the caller.
    #[error("resource error: {0}")]
    Resource(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a fatal resource error.
    pub fn resource(s: impl Into<String>) -> Self {
        Error::Resource(s.into())
    }
}

/// Convenience Result type used throughout okapi.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
