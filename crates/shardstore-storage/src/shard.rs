//! Shard runtime
//!
//! A fixed set of worker shards, one OS thread each. Every worker runs a
//! current-thread tokio executor with a `LocalSet` and drains a FIFO
//! channel of messages:
//!
//! ```text
//!   caller ──submit──▶ [queue 0] ──▶ shard 0 (state S, local tasks)
//!          ──submit──▶ [queue 1] ──▶ shard 1 (state S, local tasks)
//!          ...
//! ```
//!
//! Each worker owns one value of the shard-local state `S`. Only code
//! running on that worker touches it, so the state needs neither `Send`
//! nor locks. Callers reach it by message (`run_on`, `run_queued`, `post`)
//! or, when already running on the shard, inline.

use futures::future::LocalBoxFuture;
use shardstore_common::{Error, Result, ShardId, StoreConfig, shard_for};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

type ExecFn<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;
type SpawnFn = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send + 'static>;

/// A unit of work delivered to a shard
enum Message<S: 'static> {
    /// Run against the shard state, in queue order
    Exec(ExecFn<S>),
    /// Spawn a task onto the shard's local executor
    Spawn(SpawnFn),
}

/// Installed in a worker thread while its loop runs
struct WorkerContext {
    runtime_id: u64,
    shard: ShardId,
    state: Rc<dyn Any>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Shard the current thread belongs to, if it is a shard worker
#[must_use]
pub fn current_shard() -> Option<ShardId> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(|c| c.shard))
}

/// A set of shard workers sharing one kind of shard-local state
pub struct ShardRuntime<S: 'static> {
    id: u64,
    senders: Vec<mpsc::UnboundedSender<Message<S>>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<S: Default + 'static> ShardRuntime<S> {
    /// Start one worker per configured shard
    pub fn start(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let mut senders = Vec::with_capacity(config.shards);
        let mut workers = Vec::with_capacity(config.shards);

        for index in 0..config.shards {
            let shard = ShardId::new(index);
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || run_worker::<S>(id, shard, rx))?;
            senders.push(tx);
            workers.push(handle);
        }

        info!(runtime = id, shards = config.shards, "shard runtime started");

        Ok(Self {
            id,
            senders,
            workers,
        })
    }
}

impl<S: 'static> ShardRuntime<S> {
    /// Number of shards
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Home shard of an id
    #[must_use]
    pub fn shard_for(&self, id: &[u8]) -> ShardId {
        shard_for(id, self.shard_count())
    }

    /// Shard of this runtime the calling thread is running on
    #[must_use]
    pub fn local_shard(&self) -> Option<ShardId> {
        CONTEXT.with(|ctx| {
            ctx.borrow()
                .as_ref()
                .filter(|c| c.runtime_id == self.id)
                .map(|c| c.shard)
        })
    }

    /// Run `f` against the state of `shard`
    ///
    /// Executes inline when the caller is already on `shard`, otherwise
    /// enqueues a message. Must not be called from inside another state
    /// closure on the same shard.
    pub fn run_on<T, F>(&self, shard: ShardId, f: F) -> Pending<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.local_shard() == Some(shard) {
            return Pending::ready(self.with_local(f));
        }
        self.run_queued(shard, f)
    }

    /// Run `f` against the state of `shard` behind everything already queued
    ///
    /// Never runs inline, so the result also tells the caller that every
    /// message submitted to `shard` before this one has been processed.
    pub fn run_queued<T, F>(&self, shard: ShardId, f: F) -> Pending<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(
            shard,
            Message::Exec(Box::new(move |state: &mut S| {
                let _ = tx.send(f(state));
            })),
        );
        Pending::waiting(shard, rx)
    }

    /// Enqueue `f` for `shard` without waiting for it
    pub fn post<F>(&self, shard: ShardId, f: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send(shard, Message::Exec(Box::new(f)));
    }

    /// Run the future produced by `f` as a task on `shard`
    ///
    /// The closure is sent to the shard and the future it returns is
    /// polled there, so it may hold non-`Send` values and call back into
    /// the runtime inline.
    pub fn submit_to<T, F, Fut>(&self, shard: ShardId, f: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = move || -> LocalBoxFuture<'static, ()> {
            Box::pin(async move {
                let _ = tx.send(f().await);
            })
        };

        if self.local_shard() == Some(shard) {
            tokio::task::spawn_local(task());
        } else {
            self.send(shard, Message::Spawn(Box::new(task)));
        }
        Pending::waiting(shard, rx)
    }

    fn send(&self, shard: ShardId, message: Message<S>) {
        let Some(sender) = self.senders.get(shard.index()) else {
            panic!(
                "message routed to unknown shard {shard} (runtime has {})",
                self.shard_count()
            );
        };
        trace!(shard = %shard, "submit");
        if sender.send(message).is_err() {
            debug!(shard = %shard, "shard worker stopped, message dropped");
        }
    }

    fn with_local<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let state = CONTEXT.with(|ctx| {
            ctx.borrow()
                .as_ref()
                .filter(|c| c.runtime_id == self.id)
                .map(|c| Rc::clone(&c.state))
        });
        let Some(state) = state else {
            panic!("inline execution requested off-shard");
        };
        let Ok(state) = state.downcast::<RefCell<S>>() else {
            panic!("shard state type mismatch");
        };
        let mut guard = state.borrow_mut();
        f(&mut *guard)
    }
}

impl<S: 'static> fmt::Debug for ShardRuntime<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRuntime")
            .field("id", &self.id)
            .field("shards", &self.shard_count())
            .finish()
    }
}

impl<S: 'static> Drop for ShardRuntime<S> {
    fn drop(&mut self) {
        // Closing the queues ends every worker loop once it drains.
        self.senders.clear();

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // Dropped from inside one of our own workers: it exits by itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(runtime = self.id, "shard worker panicked");
            }
        }
        info!(runtime = self.id, "shard runtime stopped");
    }
}

fn run_worker<S: Default + 'static>(
    runtime_id: u64,
    shard: ShardId,
    mut rx: mpsc::UnboundedReceiver<Message<S>>,
) {
    let executor = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(executor) => executor,
        Err(e) => {
            error!(shard = %shard, "failed to build shard executor: {}", e);
            return;
        }
    };

    let state = Rc::new(RefCell::new(S::default()));
    let shared: Rc<dyn Any> = state.clone();
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(WorkerContext {
            runtime_id,
            shard,
            state: shared,
        });
    });
    debug!(runtime = runtime_id, shard = %shard, "shard worker started");

    let local = tokio::task::LocalSet::new();
    local.block_on(&executor, async {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Exec(f) => f(&mut *state.borrow_mut()),
                Message::Spawn(f) => {
                    tokio::task::spawn_local(f());
                }
            }
        }
    });

    drop(local);
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
    debug!(runtime = runtime_id, shard = %shard, "shard worker stopped");
}

/// Result of work submitted to a shard
///
/// Completes with the closure's output, or with
/// [`Error::ShardUnavailable`] if the target worker stopped before
/// running it. Work is submitted when the `Pending` is created, not when
/// it is first polled.
#[must_use = "dropping a Pending does not cancel the submitted work"]
pub struct Pending<T> {
    inner: PendingInner<T>,
}

enum PendingInner<T> {
    Ready(Option<T>),
    Waiting(ShardId, oneshot::Receiver<T>),
}

impl<T> Pending<T> {
    fn ready(value: T) -> Self {
        Self {
            inner: PendingInner::Ready(Some(value)),
        }
    }

    fn waiting(shard: ShardId, rx: oneshot::Receiver<T>) -> Self {
        Self {
            inner: PendingInner::Waiting(shard, rx),
        }
    }

    /// Whether the work already ran inline
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, PendingInner::Ready(Some(_)))
    }
}

// The value is only ever moved out, never pinned.
impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(Ok(value)),
                None => panic!("Pending polled after completion"),
            },
            PendingInner::Waiting(shard, rx) => {
                let shard = *shard;
                Pin::new(rx)
                    .poll(cx)
                    .map(|r| r.map_err(|_| Error::ShardUnavailable(shard.index())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn runtime(shards: usize) -> ShardRuntime<Vec<u32>> {
        ShardRuntime::start(&StoreConfig::with_shards(shards)).unwrap()
    }

    #[test]
    fn test_start_rejects_zero_shards() {
        assert!(ShardRuntime::<Vec<u32>>::start(&StoreConfig::with_shards(0)).is_err());
    }

    #[test]
    fn test_shard_for_matches_placement() {
        let rt = runtime(3);
        assert_eq!(rt.shard_count(), 3);
        assert_eq!(rt.shard_for(b"coll"), shard_for(b"coll", 3));
        assert_eq!(rt.local_shard(), None);
        assert_eq!(current_shard(), None);
    }

    #[tokio::test]
    async fn test_run_on_executes_on_target_shard() {
        let rt = runtime(4);
        for index in 0..4 {
            let shard = ShardId::new(index);
            let seen = rt.run_on(shard, |_| current_shard()).await.unwrap();
            assert_eq!(seen, Some(shard));
        }
    }

    #[tokio::test]
    async fn test_fifo_per_shard() {
        let rt = runtime(2);
        let shard = ShardId::new(1);
        for i in 0..100 {
            rt.post(shard, move |log: &mut Vec<u32>| log.push(i));
        }
        let log = rt.run_on(shard, |log| log.clone()).await.unwrap();
        assert_eq!(log, (0..100).collect::<Vec<_>>());

        // The other shard has its own state.
        let other = rt.run_on(ShardId::new(0), |log| log.len()).await.unwrap();
        assert_eq!(other, 0);
    }

    #[tokio::test]
    async fn test_inline_on_home_shard() {
        let rt = Arc::new(runtime(2));
        let shard = ShardId::new(0);
        let inner = Arc::clone(&rt);
        let (inline, queued_inline) = rt
            .submit_to(shard, move || async move {
                let here = inner.run_on(shard, |log| log.push(7));
                let inline = here.is_ready();
                here.await.unwrap();
                let queued = inner.run_queued(shard, |log| log.len());
                let queued_inline = queued.is_ready();
                assert_eq!(queued.await.unwrap(), 1);
                (inline, queued_inline)
            })
            .await
            .unwrap();
        assert!(inline);
        assert!(!queued_inline);
    }

    #[tokio::test]
    async fn test_cross_shard_from_shard() {
        let rt = Arc::new(runtime(2));
        let inner = Arc::clone(&rt);
        let value = rt
            .submit_to(ShardId::new(0), move || async move {
                let remote = inner.run_on(ShardId::new(1), |log| {
                    log.push(42);
                    log.len()
                });
                assert!(!remote.is_ready());
                remote.await.unwrap()
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    #[should_panic(expected = "unknown shard")]
    fn test_unknown_shard_panics() {
        let rt = runtime(2);
        rt.post(ShardId::new(9), |_| {});
    }

    #[tokio::test]
    async fn test_pending_after_shutdown() {
        let rt = runtime(1);
        let shard = ShardId::new(0);
        // Park the worker until the runtime handle is gone.
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        rt.post(shard, move |_| {
            let _ = release_rx.recv();
        });
        let pending = rt.run_queued(shard, |log| log.len());
        let dropper = std::thread::spawn(move || drop(rt));
        release_tx.send(()).unwrap();
        dropper.join().unwrap();
        // The queued message ran before the worker observed the closed queue.
        assert_eq!(pending.await.unwrap(), 0);
    }
}
