use crate::backend::{Backend, BackendDevice, HostCallback};
use crate::error::Result;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Context — One asynchronous command stream plus deferred host callbacks
//
// Every block owns at least one Context (recurrent blocks own one per cell so
// independent time steps of stacked layers can overlap). All matrix ops take
// a Context and are queued on its stream; ops across different Contexts have
// no implied order unless `wait` inserts one.
//
// Contexts are cheap to clone (Arc handle) and are the identity unit for
// Connector consumer accounting, hence the process-unique id.

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

struct ContextInner<B: Backend> {
    device: B::Device,
    stream: B::Stream,
    id: u64,
}

/// An execution context: one device command stream and a host-callback hook.
pub struct Context<B: Backend> {
    inner: Arc<ContextInner<B>>,
}

impl<B: Backend> Clone for Context<B> {
    fn clone(&self) -> Self {
        Context {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Context<B> {
    /// Create a context with a fresh stream on `device`.
    pub fn new(device: &B::Device) -> Result<Self> {
        let stream = B::new_stream(device)?;
        Ok(Context {
            inner: Arc::new(ContextInner {
                device: device.clone(),
                stream,
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            }),
        })
    }

    /// The device this context's stream runs on.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The underlying stream handle (for Matrix ops and backends).
    pub fn stream(&self) -> &B::Stream {
        &self.inner.stream
    }

    /// Process-unique id; used by Connectors to key consumer registrations.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Insert a dependency: all work enqueued on `self` after this call is
    /// ordered after every operation enqueued on `other` up to this call
    /// point. Work enqueued on `other` later is NOT waited on.
    pub fn wait(&self, other: &Context<B>) -> Result<()> {
        if self.inner.id == other.inner.id {
            return Ok(()); // a stream is always ordered against itself
        }
        let event = B::record_event(&other.inner.stream)?;
        B::wait_event(&self.inner.stream, &event)
    }

    /// Make this context's stream wait on a previously recorded event.
    pub fn wait_event(&self, event: &B::Event) -> Result<()> {
        B::wait_event(&self.inner.stream, event)
    }

    /// Record an event capturing everything enqueued on this context so far.
    pub fn record_event(&self) -> Result<B::Event> {
        B::record_event(&self.inner.stream)
    }

    /// Run `f` on the host once all work enqueued so far has completed.
    /// Does not block this or any other context; backend implementations
    /// contain panics inside `f` so a failing observer cannot corrupt the
    /// engine's bookkeeping.
    pub fn add_callback(&self, f: HostCallback) -> Result<()> {
        B::add_callback(&self.inner.stream, f)
    }

    /// Block the host until everything enqueued on this context completes.
    pub fn synchronize(&self) -> Result<()> {
        B::synchronize(&self.inner.stream)
    }
}

impl<B: Backend> fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Context(id={}, device={})",
            self.inner.id,
            self.inner.device.name()
        )
    }
}
