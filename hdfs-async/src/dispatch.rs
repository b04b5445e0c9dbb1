//! Background execution of blocking native calls.
//!
//! A [`Dispatcher`] runs every task body on tokio's blocking pool. The
//! result comes back either by awaiting the returned [`Task`] or through a
//! callback registered with [`Task::on_complete`]. Callbacks are not run
//! on worker threads: they are queued and executed by whichever thread
//! drains the queue with [`Dispatcher::poll_completions`] or
//! [`Dispatcher::run_until_idle`], so they never race each other.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use log::{debug, warn};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::{JoinError, JoinHandle};

use crate::config::DispatchConfig;
use crate::error::{Error, ErrorOutcome, Outcome, Result};

type Completion = Box<dyn FnOnce() + Send>;

enum RuntimeSlot {
    Owned(Runtime),
    Borrowed(Handle),
}

impl RuntimeSlot {
    fn handle(&self) -> &Handle {
        match self {
            RuntimeSlot::Owned(rt) => rt.handle(),
            RuntimeSlot::Borrowed(handle) => handle,
        }
    }
}

struct Inner {
    runtime: RuntimeSlot,
    queue: CompletionQueue,
    completions: Mutex<UnboundedReceiver<Completion>>,
    in_flight: Arc<AtomicUsize>,
}

/// Cloneable entry point for running blocking work off the caller's thread.
///
/// A dispatcher built with [`Dispatcher::new`] owns its runtime; the
/// runtime shuts down (waiting for running bodies) when the last clone is
/// dropped, which must happen outside of an async context.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.max_blocking_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()
            .map_err(Error::Runtime)?;
        Ok(Self::with_slot(RuntimeSlot::Owned(runtime)))
    }

    /// Dispatch onto an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self::with_slot(RuntimeSlot::Borrowed(handle))
    }

    /// Dispatch onto the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Runtime(std::io::Error::other(e.to_string())))?;
        Ok(Self::from_handle(handle))
    }

    fn with_slot(runtime: RuntimeSlot) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                runtime,
                queue: CompletionQueue {
                    tx,
                    pending: Arc::new(AtomicUsize::new(0)),
                },
                completions: Mutex::new(rx),
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        self.inner.runtime.handle()
    }

    /// Queue `work` on the blocking pool. The body runs exactly once and
    /// always produces an outcome; a panic becomes an `EIO` outcome.
    pub fn run<T, F>(&self, op: &'static str, work: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let guard = InFlight::enter(&self.inner.in_flight);
        debug!("dispatch {op}");
        let join = self.handle().spawn_blocking(move || {
            let _guard = guard;
            let outcome = work();
            if let Err(e) = &outcome {
                debug!("{op} failed: {e}");
            }
            outcome
        });
        Task {
            op,
            state: TaskState::Running(join),
            handle: self.handle().clone(),
            queue: self.inner.queue.clone(),
        }
    }

    /// A task that is already complete; nothing is queued.
    pub fn ready<T>(&self, op: &'static str, outcome: Outcome<T>) -> Task<T> {
        Task {
            op,
            state: TaskState::Ready(Some(outcome)),
            handle: self.handle().clone(),
            queue: self.inner.queue.clone(),
        }
    }

    /// Run `work` on the blocking pool without observing its result.
    pub(crate) fn detach<F>(&self, op: &'static str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = InFlight::enter(&self.inner.in_flight);
        debug!("dispatch detached {op}");
        drop(self.handle().spawn_blocking(move || {
            let _guard = guard;
            work();
        }));
    }

    /// Task bodies queued or running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Registered callbacks that have not run yet.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.queue.pending.load(Ordering::SeqCst)
    }

    /// Run every callback whose task has already finished, without
    /// blocking. Returns the number of callbacks run.
    pub fn poll_completions(&self) -> usize {
        let mut rx = self
            .inner
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ran = 0;
        loop {
            match rx.try_recv() {
                Ok(callback) => {
                    self.deliver(callback);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Block until every registered callback has run, running them on
    /// this thread. Must not be called from inside an async context.
    pub fn run_until_idle(&self) -> usize {
        let mut rx = self
            .inner
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ran = 0;
        while self.pending_callbacks() > 0 {
            match rx.blocking_recv() {
                Some(callback) => {
                    self.deliver(callback);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    fn deliver(&self, callback: Completion) {
        // Settled before the call, so a panicking callback cannot leave
        // `run_until_idle` waiting for a delivery that already happened.
        self.inner.queue.pending.fetch_sub(1, Ordering::SeqCst);
        callback();
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct CompletionQueue {
    tx: UnboundedSender<Completion>,
    pending: Arc<AtomicUsize>,
}

impl CompletionQueue {
    fn push(&self, callback: Completion) {
        if self.tx.send(callback).is_err() {
            warn!("completion queue is gone, dropping callback");
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

enum TaskState<T> {
    Running(JoinHandle<Outcome<T>>),
    Ready(Option<Outcome<T>>),
}

/// One deferred blocking operation.
///
/// Await it for the outcome, block on it with [`Task::wait`], or hand the
/// outcome to a callback with [`Task::on_complete`]. Dropping a task does
/// not cancel the body.
pub struct Task<T> {
    op: &'static str,
    state: TaskState<T>,
    handle: Handle,
    queue: CompletionQueue,
}

// The outcome is only moved out, never pinned.
impl<T> Unpin for Task<T> {}

impl<T> Task<T> {
    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            TaskState::Running(join) => join.is_finished(),
            TaskState::Ready(_) => true,
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Block the current (non-async) thread until the task completes.
    pub fn wait(self) -> Outcome<T> {
        futures::executor::block_on(self)
    }

    /// Deliver the outcome to `callback` through the dispatcher's
    /// completion queue. The callback runs exactly once.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let queue = self.queue.clone();
        queue.pending.fetch_add(1, Ordering::SeqCst);
        let handle = self.handle.clone();
        handle.spawn(async move {
            let outcome = self.await;
            queue.push(Box::new(move || callback(outcome)));
        });
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let op = this.op;
        match &mut this.state {
            TaskState::Running(join) => Pin::new(join)
                .poll(cx)
                .map(|res| res.unwrap_or_else(|e| Err(join_failure(op, e)))),
            TaskState::Ready(outcome) => Poll::Ready(outcome.take().unwrap_or_else(|| {
                Err(ErrorOutcome::new(
                    libc::EINVAL,
                    format!("{op} polled after completion"),
                ))
            })),
        }
    }
}

fn join_failure(op: &str, e: JoinError) -> ErrorOutcome {
    if e.is_panic() {
        ErrorOutcome::new(libc::EIO, format!("{op} panicked on the worker thread"))
    } else {
        ErrorOutcome::new(libc::ECANCELED, format!("{op} was cancelled: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&DispatchConfig::default()).unwrap()
    }

    #[test]
    fn body_runs_off_the_calling_thread() {
        let d = dispatcher();
        let caller = thread::current().id();
        let worker = d.run("thread_id", move || Ok(thread::current().id())).wait().unwrap();
        assert_ne!(caller, worker);
    }

    #[test]
    fn submission_does_not_wait_for_the_body() {
        let d = dispatcher();
        let (tx, rx) = mpsc::channel::<()>();
        let start = Instant::now();
        let task = d.run("slow", move || {
            rx.recv().ok();
            Ok(7)
        });
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!task.is_finished());
        tx.send(()).unwrap();
        assert_eq!(task.wait().unwrap(), 7);
    }

    #[test]
    fn panic_becomes_error_outcome() {
        let d = dispatcher();
        let err = d
            .run::<(), _>("explode", || panic!("native fault"))
            .wait()
            .unwrap_err();
        assert_eq!(err.code, libc::EIO);
        assert!(err.message.contains("explode"));
    }

    #[test]
    fn callbacks_run_on_draining_thread() {
        let d = dispatcher();
        let results = Arc::new(Mutex::new(Vec::new()));
        let me = thread::current().id();
        for i in 0..8 {
            let results = results.clone();
            d.run("count", move || {
                if i % 2 == 0 {
                    Ok(i)
                } else {
                    Err(ErrorOutcome::new(libc::EIO, "odd"))
                }
            })
            .on_complete(move |outcome| {
                assert_eq!(thread::current().id(), me);
                results.lock().unwrap().push(outcome.is_ok());
            });
        }
        assert_eq!(d.run_until_idle(), 8);
        assert_eq!(d.pending_callbacks(), 0);
        let results = results.lock().unwrap();
        assert_eq!(results.iter().filter(|ok| **ok).count(), 4);
    }

    #[test]
    fn panicking_callback_does_not_wedge_the_queue() {
        let d = dispatcher();
        d.run("first", || Ok(1)).on_complete(|_| panic!("callback fault"));
        let drained =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| d.run_until_idle()));
        assert!(drained.is_err());
        assert_eq!(d.pending_callbacks(), 0);

        let (tx, rx) = mpsc::channel();
        d.run("second", || Ok(2)).on_complete(move |outcome| {
            tx.send(outcome).unwrap();
        });
        assert_eq!(d.run_until_idle(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(2));
    }

    #[test]
    fn ready_task_delivers_without_dispatch() {
        let d = dispatcher();
        let task = d.ready("noop", Ok(()));
        assert!(task.is_finished());
        assert_eq!(d.in_flight(), 0);
        assert!(task.wait().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn borrowed_runtime_can_be_awaited() {
        let d = Dispatcher::current().unwrap();
        let v = d.run("add", || Ok(40 + 2)).await.unwrap();
        assert_eq!(v, 42);
        assert_eq!(d.poll_completions(), 0);
    }
}
