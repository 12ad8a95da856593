use okapi_core::error::{Error, Result};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

// CpuStream — a FIFO worker thread standing in for a device command stream
//
// Each stream is one dedicated thread draining a channel of closures in
// enqueue order. That gives the exact ordering model of an accelerator
// stream: total order within one stream, no order across streams unless an
// event edge is inserted. Events are condvar-signalled flags; `wait_event`
// enqueues a task that parks the worker until the event fires.

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A point in a stream's queue. Cloneable, shareable across streams.
#[derive(Clone)]
pub struct CpuEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CpuEvent {
    pub fn new() -> Self {
        CpuEvent {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn signal(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut fired = flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*fired {
            fired = cvar.wait(fired).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for CpuEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// One asynchronous command stream: a worker thread plus its task queue.
///
/// Dropping the stream closes the queue; the worker drains what is already
/// enqueued and exits.
pub struct CpuStream {
    // mpsc::Sender is Send but not Sync; the mutex makes the stream
    // shareable the way a device stream handle is.
    tx: Mutex<mpsc::Sender<Task>>,
}

impl CpuStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        thread::spawn(move || {
            while let Ok(task) = rx.recv() {
                task();
            }
        });
        CpuStream {
            tx: Mutex::new(tx),
        }
    }

    /// Enqueue a task behind everything already queued. A closed queue means
    /// the worker died — the stream's device is gone, which is fatal.
    pub fn submit(&self, task: Task) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.send(task)
            .map_err(|_| Error::resource("stream worker terminated"))
    }

    /// Record an event that fires once everything enqueued so far has run.
    pub fn record(&self) -> Result<CpuEvent> {
        let event = CpuEvent::new();
        let ev = event.clone();
        self.submit(Box::new(move || ev.signal()))?;
        Ok(event)
    }

    /// Order all later tasks on this stream after `event`.
    pub fn wait(&self, event: &CpuEvent) -> Result<()> {
        let ev = event.clone();
        self.submit(Box::new(move || ev.wait()))
    }

    /// Block the host until the queue has drained.
    pub fn synchronize(&self) -> Result<()> {
        let event = self.record()?;
        event.wait();
        Ok(())
    }
}

impl Default for CpuStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_in_enqueue_order() -> Result<()> {
        let stream = CpuStream::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            stream.submit(Box::new(move || log.lock().unwrap().push(i)))?;
        }
        stream.synchronize()?;
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn event_orders_across_streams() -> Result<()> {
        let a = CpuStream::new();
        let b = CpuStream::new();
        let value = Arc::new(Mutex::new(0));

        let v = value.clone();
        a.submit(Box::new(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            *v.lock().unwrap() = 42;
        }))?;
        let ev = a.record()?;

        b.wait(&ev)?;
        let v = value.clone();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        b.submit(Box::new(move || *s.lock().unwrap() = *v.lock().unwrap()))?;
        b.synchronize()?;

        assert_eq!(*seen.lock().unwrap(), 42);
        Ok(())
    }
}
