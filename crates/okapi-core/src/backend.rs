use crate::dtype::DType;
use crate::error::Result;
use crate::matrix::HostData;
use std::fmt;

// Backend — Abstraction over the device/stream/kernel layer
//
// The Backend trait is the seam between the dataflow engine and the concrete
// accelerator. Each backend (reference CPU, CUDA, ...) implements it,
// providing its own device, stream, event, and storage types plus the fixed
// set of kernel operations the engine needs.
//
// WHY A TRAIT AND NOT AN ENUM?
//
// A trait means new backends are separate crates that don't touch okapi-core,
// each backend gets its own associated types (a CUDA stream is nothing like a
// worker-thread queue), and the compiler monomorphizes the hot paths. The
// tradeoff is that Matrix, Context, and Connector become generic over
// B: Backend.
//
// THE STREAM MODEL
//
// Unlike a functional tensor library, every compute op here takes a stream
// handle and an explicit output region, and is QUEUED, not executed. The only
// ordering guarantees are: (a) ops on one stream run in enqueue order, and
// (b) `wait_event` inserts a cross-stream edge. Host transfers are the only
// synchronous calls.

/// Identifies a compute device (e.g., "cpu", "cuda:0").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;

    /// Device ordinal (0 for the CPU backend).
    fn ordinal(&self) -> usize;
}

/// A storage buffer holding matrix data on a specific device.
///
/// Storage is shared-mutable by design: queued kernels write into regions of
/// it, and correctness comes from the stream-ordering discipline, exactly as
/// on a real accelerator. Clones are cheap handle copies to the same
/// allocation.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The element type of this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in the allocation.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transpose flag for gemm, mirroring the BLAS convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trans {
    N,
    T,
}

/// A borrowed, contiguous region of a storage buffer.
///
/// Every matrix (owner or column view) is one contiguous column-major range,
/// so `(storage, offset, len)` fully describes an operand.
pub struct View<'a, S> {
    pub storage: &'a S,
    pub offset: usize,
    pub len: usize,
}

impl<'a, S> View<'a, S> {
    pub fn new(storage: &'a S, offset: usize, len: usize) -> Self {
        View {
            storage,
            offset,
            len,
        }
    }
}

/// Host callback type queued behind a stream's pending work.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// Host callback receiving data copied off the device.
pub type TransferCallback = Box<dyn FnOnce(HostData) + Send + 'static>;

// Backend trait — the complete device contract

/// The main Backend trait. Implementing this for a marker struct makes it a
/// complete execution backend for okapi.
///
/// All compute ops are stream-ordered: they return as soon as the work is
/// queued. A failed device surfaces `Error::Resource` from the enqueue call.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// One asynchronous command stream.
    type Stream: Send + Sync + 'static;
    /// A marker recording a point in a stream's queue.
    type Event: Clone + Send + Sync + 'static;
    /// Device memory.
    type Storage: BackendStorage;

    //  Streams & events

    /// Create a new command stream on `device`. Streams are independent:
    /// no implied ordering between them without an event edge.
    fn new_stream(device: &Self::Device) -> Result<Self::Stream>;

    /// Record an event capturing all work enqueued on `stream` so far.
    fn record_event(stream: &Self::Stream) -> Result<Self::Event>;

    /// Make all subsequent work on `stream` wait until `event` has fired.
    fn wait_event(stream: &Self::Stream, event: &Self::Event) -> Result<()>;

    /// Run `f` on the host once all work enqueued on `stream` so far has
    /// completed. Must not block other streams; a panic inside `f` must be
    /// contained by the backend.
    fn add_callback(stream: &Self::Stream, f: HostCallback) -> Result<()>;

    /// Block the host until everything enqueued on `stream` has completed.
    fn synchronize(stream: &Self::Stream) -> Result<()>;

    //  Allocation & transfer

    /// Allocate `nelems` elements of `dtype` (contents undefined).
    fn alloc(nelems: usize, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate and synchronously copy host data to the device.
    fn from_host(data: &HostData, device: &Self::Device) -> Result<Self::Storage>;

    /// Synchronously copy a region back to the host. The caller is
    /// responsible for having synchronized any stream still writing it.
    fn to_host(src: View<Self::Storage>, dtype: DType) -> Result<HostData>;

    /// Queue a host-to-device copy on `stream`.
    fn htod_async(stream: &Self::Stream, dst: View<Self::Storage>, data: HostData) -> Result<()>;

    /// Queue a device-to-host copy on `stream`; `done` runs on the host with
    /// the copied data once the transfer (and everything before it) is done.
    fn dtoh_async(
        stream: &Self::Stream,
        src: View<Self::Storage>,
        dtype: DType,
        done: TransferCallback,
    ) -> Result<()>;

    /// Queue a device-to-device copy of equally sized f32 regions.
    fn copy(stream: &Self::Stream, src: View<Self::Storage>, dst: View<Self::Storage>)
        -> Result<()>;

    //  Elementwise kernels (f32)

    /// dst[i] = val
    fn fill(stream: &Self::Stream, dst: View<Self::Storage>, val: f32) -> Result<()>;

    /// dst[i] = alpha * src[i] (src may alias dst)
    fn scale(
        stream: &Self::Stream,
        alpha: f32,
        src: View<Self::Storage>,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    /// y[i] += alpha * x[i]
    fn axpy(
        stream: &Self::Stream,
        alpha: f32,
        x: View<Self::Storage>,
        y: View<Self::Storage>,
    ) -> Result<()>;

    /// dst[i] = a[i] * b[i]
    fn hprod2(
        stream: &Self::Stream,
        a: View<Self::Storage>,
        b: View<Self::Storage>,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    /// dst[i] = a[i] * b[i] * c[i]
    fn hprod3(
        stream: &Self::Stream,
        a: View<Self::Storage>,
        b: View<Self::Storage>,
        c: View<Self::Storage>,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    /// dst[i] += a[i] * b[i] * c[i]
    fn add_hprod3(
        stream: &Self::Stream,
        a: View<Self::Storage>,
        b: View<Self::Storage>,
        c: View<Self::Storage>,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    /// dst[i] = a[i] * b[i] + alpha * dst[i]
    fn add_hprod(
        stream: &Self::Stream,
        a: View<Self::Storage>,
        b: View<Self::Storage>,
        alpha: f32,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    /// dst[i] = a[i] * b[i] + c[i] * d[i]
    fn sum_hprod4(
        stream: &Self::Stream,
        a: View<Self::Storage>,
        b: View<Self::Storage>,
        c: View<Self::Storage>,
        d: View<Self::Storage>,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    /// dst[i] = tanh(src[i]); if der is given, der[i] = 1 - tanh(src[i])^2.
    /// src may alias dst.
    fn tanh(
        stream: &Self::Stream,
        src: View<Self::Storage>,
        dst: View<Self::Storage>,
        der: Option<View<Self::Storage>>,
    ) -> Result<()>;

    /// dst[i] = sigmoid(src[i]); if der is given, der[i] = s * (1 - s).
    /// src may alias dst.
    fn sigmoid(
        stream: &Self::Stream,
        src: View<Self::Storage>,
        dst: View<Self::Storage>,
        der: Option<View<Self::Storage>>,
    ) -> Result<()>;

    /// Fused gate nonlinearity: tanh on [0, split), sigmoid on [split, len),
    /// with optional derivative capture. src may alias dst. Column-major
    /// storage makes "the first quarter of the columns" a contiguous prefix,
    /// which is why a flat split index suffices.
    fn tanh_sigm(
        stream: &Self::Stream,
        src: View<Self::Storage>,
        dst: View<Self::Storage>,
        der: Option<View<Self::Storage>>,
        split: usize,
    ) -> Result<()>;

    /// Broadcast a column over a matrix: dst[:, j] *= mask[:] for all j.
    /// `dst.len` must be a multiple of `mask.len` (= nrows).
    fn hprod_col(
        stream: &Self::Stream,
        mask: View<Self::Storage>,
        dst: View<Self::Storage>,
    ) -> Result<()>;

    //  Gemm

    /// c = alpha * op(a) * op(b) + beta * c, column-major.
    ///
    /// `m`, `n`, `k` are the dimensions after applying the transpose flags;
    /// `lda`/`ldb`/`ldc` are the leading (row) dimensions of the stored
    /// operands.
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        stream: &Self::Stream,
        trans_a: Trans,
        trans_b: Trans,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: View<Self::Storage>,
        lda: usize,
        b: View<Self::Storage>,
        ldb: usize,
        beta: f32,
        c: View<Self::Storage>,
        ldc: usize,
    ) -> Result<()>;
}
