//! Distributed ref-id counter allocator
//!
//! Hands out disjoint `[base, base + count)` ranges by atomically adding to a
//! single cluster-wide counter. All counter operations issued by this process
//! (readiness polling, allocations, `set_counter`) run on one worker task, so a
//! process never races itself against the store.
//!
//! Bootstrap: a brand-new counter cell cannot be compare-and-set from zero, so
//! joining bumps it with an increment first. The worker then polls until some
//! member has raised the counter to at least the initial ref id; allocations
//! requested before that point are held back and served once it is ready.

use std::{collections::VecDeque, future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ClusterConfig,
    context::MeshContext,
    coordination::CoordinationClient,
    error::{MeshError, MeshResult},
    metrics::MeshMetrics,
    retry::{FixedBackoff, RetryPolicy},
};

/// A granted range of ref ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefAllocation {
    pub base: i64,
    pub count: u32,
}

impl RefAllocation {
    /// Exclusive upper bound. The store refuses to advance the counter past
    /// `i64::MAX`, so only hand-built ranges can saturate here.
    pub fn end(&self) -> i64 {
        self.base.saturating_add(i64::from(self.count))
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.base && id < self.end()
    }

    pub fn overlaps(&self, other: &RefAllocation) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

pub trait RefAllocationsListener: Send + Sync {
    /// The counter reached the initial ref id; allocations may be served.
    fn counter_ready(&self);

    fn refs_allocated(&self, base: i64, count: u32);
}

#[derive(Default)]
struct ListenerState {
    ready: bool,
    listeners: Vec<Arc<dyn RefAllocationsListener>>,
}

/// Observer registry with a retained "counter ready" state.
#[derive(Default)]
struct ListenerSupport {
    state: Mutex<ListenerState>,
}

impl ListenerSupport {
    fn add(&self, listener: Arc<dyn RefAllocationsListener>) {
        let ready = {
            let mut state = self.state.lock();
            state.listeners.push(listener.clone());
            state.ready
        };
        if ready {
            listener.counter_ready();
        }
    }

    fn remove(&self, listener: &Arc<dyn RefAllocationsListener>) {
        self.state
            .lock()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn snapshot(&self) -> Vec<Arc<dyn RefAllocationsListener>> {
        self.state.lock().listeners.clone()
    }

    fn fire_counter_ready(&self) {
        let listeners = {
            let mut state = self.state.lock();
            if state.ready {
                return;
            }
            state.ready = true;
            state.listeners.clone()
        };
        for listener in listeners {
            listener.counter_ready();
        }
    }

    fn fire_refs_allocated(&self, base: i64, count: u32) {
        for listener in self.snapshot() {
            listener.refs_allocated(base, count);
        }
    }
}

enum AllocatorJob {
    Allocate(u32),
    SetCounter {
        initial: i64,
        reply: oneshot::Sender<MeshResult<bool>>,
    },
}

struct AllocatorInner {
    client: Arc<dyn CoordinationClient>,
    path: String,
    initial_ref_id: i64,
    retry: RetryPolicy,
    config: ClusterConfig,
    listeners: ListenerSupport,
    ready_tx: watch::Sender<bool>,
}

pub struct RefAllocator {
    inner: Arc<AllocatorInner>,
    jobs: Mutex<Option<mpsc::UnboundedSender<AllocatorJob>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RefAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefAllocator")
            .field("path", &self.inner.path)
            .field("ready", &*self.inner.ready_tx.borrow())
            .finish()
    }
}

impl RefAllocator {
    pub fn new(ctx: &MeshContext, config: &ClusterConfig, client: Arc<dyn CoordinationClient>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(AllocatorInner {
                client,
                path: config.ref_counter_path(),
                initial_ref_id: config.initial_ref_id,
                retry: RetryPolicy::from_config(&config.retry),
                config: config.clone(),
                listeners: ListenerSupport::default(),
                ready_tx,
            }),
            jobs: Mutex::new(None),
            cancel: ctx.shutdown_token(),
        }
    }

    /// Bump the counter past its unwritten state and start the worker that
    /// waits for readiness. Failure here is fatal to joining.
    pub async fn bootstrap(&self, ctx: &MeshContext) -> MeshResult<()> {
        if self.jobs.lock().is_some() {
            return Ok(());
        }

        let inner = &self.inner;
        let outcome = inner
            .retry
            .run("ref counter bootstrap", || {
                inner.client.counter_increment(&inner.path)
            })
            .await
            .map_err(|e| MeshError::CounterBootstrap(e.to_string()))?;
        if !outcome.succeeded {
            return Err(MeshError::CounterBootstrap(
                "error initializing ref counter".to_string(),
            ));
        }
        debug!("Ref counter bumped to {}", outcome.post_value);

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut jobs = self.jobs.lock();
            if jobs.is_some() {
                return Ok(());
            }
            *jobs = Some(tx);
        }
        let worker = Worker {
            inner: self.inner.clone(),
            cancel: self.cancel.clone(),
        };
        ctx.spawn("ref_allocator", worker.run(rx));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    /// Retained readiness state.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    pub async fn wait_counter_ready(&self) -> MeshResult<()> {
        let mut rx = self.subscribe_ready();
        tokio::select! {
            res = rx.wait_for(|ready| *ready) => res.map(|_| ()).map_err(|_| MeshError::ShuttingDown),
            _ = self.cancel.cancelled() => Err(MeshError::ShuttingDown),
        }
    }

    /// Register a listener. If the counter is already ready the listener is
    /// told so before this returns.
    pub fn add_listener(&self, listener: Arc<dyn RefAllocationsListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RefAllocationsListener>) {
        self.inner.listeners.remove(listener);
    }

    fn submit(&self, job: AllocatorJob) -> MeshResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MeshError::ShuttingDown);
        }
        let jobs = self.jobs.lock();
        let tx = jobs.as_ref().ok_or(MeshError::NotJoined)?;
        tx.send(job).map_err(|_| MeshError::ShuttingDown)
    }

    /// Queue an allocation of `count` ids. The outcome is reported through
    /// `refs_allocated`; a permanent failure is logged and reported nowhere.
    pub fn allocate_refs(&self, count: u32) -> MeshResult<()> {
        if count == 0 {
            return Err(MeshError::Config("ref allocation count must be positive".to_string()));
        }
        self.submit(AllocatorJob::Allocate(count))
    }

    /// Raise the counter to at least `max(initial, initial_ref_id)`. Returns
    /// `true` if this call performed the raise, `false` if the counter was
    /// already there.
    pub async fn set_counter(&self, initial: i64) -> MeshResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.submit(AllocatorJob::SetCounter { initial, reply })?;
        rx.await.map_err(|_| MeshError::ShuttingDown)?
    }

    /// Abandon queued requests and stop the worker.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.jobs.lock().take();
    }
}

struct Worker {
    inner: Arc<AllocatorInner>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<AllocatorJob>) {
        info!("Waiting for id counter to be set...");
        let mut ready = false;
        let mut held_back: VecDeque<u32> = VecDeque::new();
        let mut poll = FixedBackoff::unbounded(self.inner.config.retry.counter_poll());

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break;
                }

                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    match job {
                        AllocatorJob::Allocate(count) if ready => {
                            if self.cancellable(self.allocate(count)).await.is_none() {
                                break;
                            }
                        }
                        AllocatorJob::Allocate(count) => {
                            debug!("Counter not ready, holding back allocation of {} ids", count);
                            held_back.push_back(count);
                        }
                        AllocatorJob::SetCounter { initial, reply } => {
                            match self.cancellable(self.set_counter(initial)).await {
                                Some(result) => {
                                    let _ = reply.send(result);
                                }
                                None => break,
                            }
                        }
                    }
                }

                is_ready = self.poll_ready(&mut poll), if !ready => {
                    if is_ready {
                        ready = true;
                        let _ = self.inner.ready_tx.send(true);
                        self.inner.listeners.fire_counter_ready();
                        while let Some(count) = held_back.pop_front() {
                            if self.cancellable(self.allocate(count)).await.is_none() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if !held_back.is_empty() {
            warn!("Abandoning {} queued ref allocations", held_back.len());
        }
        info!("Ref allocator worker stopped");
    }

    async fn cancellable<T>(&self, op: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            value = op => Some(value),
        }
    }

    /// One readiness check; sleeps the poll interval when the counter is not
    /// there yet.
    async fn poll_ready(&self, poll: &mut FixedBackoff) -> bool {
        let inner = &self.inner;
        match inner.client.counter_get(&inner.path).await {
            Ok(av) if av.succeeded && av.post_value >= inner.initial_ref_id => {
                info!("Id counter set: {}", av.post_value);
                return true;
            }
            Ok(av) if !av.succeeded => info!("Failed to read counter"),
            Ok(_) => {}
            Err(e) => info!("Failed to read counter: {}", e),
        }
        poll.next_attempt().await;
        false
    }

    async fn allocate(&self, count: u32) {
        let inner = &self.inner;
        info!("Allocating {} IDs", count);
        let result = inner
            .retry
            .run("ref allocation", || {
                inner.client.counter_add(&inner.path, count as i64)
            })
            .await;
        match result {
            Ok(av) if av.succeeded => {
                MeshMetrics::record_refs_allocated(count);
                inner.listeners.fire_refs_allocated(av.pre_value, count);
            }
            Ok(_) => {
                MeshMetrics::record_allocation_failure();
                error!("Allocating ref IDs has failed!");
            }
            Err(e) => {
                MeshMetrics::record_allocation_failure();
                error!("Allocating ref IDs has failed! {}", e);
            }
        }
    }

    async fn set_counter(&self, initial: i64) -> MeshResult<bool> {
        let inner = &self.inner;
        let target = initial.max(inner.initial_ref_id);
        info!("Setting ref counter to {}", target);

        let retry = &inner.config.retry;
        let mut backoff = FixedBackoff::bounded(retry.cas_interval(), retry.cas_max_attempts);
        let mut expected = 0;
        loop {
            let av = inner
                .retry
                .run("ref counter compare-and-set", || {
                    inner
                        .client
                        .counter_compare_and_set(&inner.path, expected, target)
                })
                .await?;
            if av.succeeded {
                info!("Set id counter to {}", target);
                return Ok(true);
            }
            if av.post_value >= target {
                info!("Id counter set by someone else to {}", av.post_value);
                return Ok(false);
            }
            expected = av.pre_value;
            if !backoff.next_attempt().await {
                return Err(MeshError::CounterTimeout {
                    target,
                    attempts: backoff.attempts(),
                });
            }
        }
    }
}
