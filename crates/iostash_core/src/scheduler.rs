//! Background scheduler: one worker thread owning all disk activity.
//!
//! A [`Scheduler`] owns a single background thread that services any number
//! of registered caches: per iteration it asks the governor for an
//! allowance, drains memory tiers to disk, commits the journal when a rate
//! window closes, and serves queued asynchronous reads in the time left
//! before the next cache update is due. The thread sleeps for the minimum
//! of all computed waits and wakes early whenever new work is submitted.
//!
//! Commands arrive as a tagged enum over a bounded channel and each drained
//! batch is processed in three passes:
//!
//! 1. Unregisters - and if the matching register is in the same batch and
//!    has not landed yet, the unregister is re-submitted for the next cycle
//!    rather than dropping a cache that was never added.
//! 2. Registers (which run the cache's recovery load), rate and demand-band
//!    updates, and read requests, in order.
//! 3. Cancels, so a cancel always finds its target read already enqueued.

use crate::cache::Cache;
use crate::config::{DemandBands, WriteRate};
use crate::error::{CoreResult, ReadStatus};
use crate::governor::{Governor, Grant, WindowEnd};
use crate::types::ContentKey;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Depth of the command channel; submitters block when it is full.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Completion slot shared between a [`MaterializeHandle`] and the worker.
struct ReadSlot {
    read_id: u32,
    cancelled: AtomicBool,
    state: Mutex<SlotState>,
    done: Condvar,
}

#[derive(Default)]
struct SlotState {
    status: Option<ReadStatus>,
    data: Option<Vec<u8>>,
}

impl ReadSlot {
    fn new(read_id: u32) -> Self {
        Self {
            read_id,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SlotState::default()),
            done: Condvar::new(),
        }
    }

    fn complete(&self, status: ReadStatus, data: Option<Vec<u8>>) {
        let mut state = self.state.lock();
        state.status = Some(status);
        state.data = data;
        drop(state);
        self.done.notify_all();
    }
}

/// Future-like handle for an asynchronous materialize.
///
/// The read completes on the scheduler's worker thread; `wait` blocks the
/// caller until it does. Cancellation is best-effort: a read already in
/// flight still completes with its real status.
pub struct MaterializeHandle {
    slot: Arc<ReadSlot>,
}

impl MaterializeHandle {
    /// Blocks until the read completes and returns its status.
    pub fn wait(&self) -> ReadStatus {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(status) = state.status {
                return status;
            }
            self.slot.done.wait(&mut state);
        }
    }

    /// The status, if the read has completed.
    #[must_use]
    pub fn try_status(&self) -> Option<ReadStatus> {
        self.slot.state.lock().status
    }

    /// Takes the materialized bytes after an `Ok` completion.
    #[must_use]
    pub fn take_data(&self) -> Option<Vec<u8>> {
        self.slot.state.lock().data.take()
    }

    /// Identity of this read, used to target a cancel.
    #[must_use]
    pub fn read_id(&self) -> u32 {
        self.slot.read_id
    }
}

/// A queued asynchronous read.
struct ReadRequest {
    cache: Arc<Cache>,
    key: ContentKey,
    offset: u32,
    slot: Arc<ReadSlot>,
}

/// Cross-thread command set.
enum Command {
    Register(Arc<Cache>),
    Unregister(Arc<Cache>),
    SetRate(WriteRate),
    SetDemandBands(DemandBands),
    BeginRead(ReadRequest),
    CancelRead(u32),
    Shutdown,
}

/// Explicit scheduler object with caller-managed lifetime.
///
/// Clones share the same worker; the thread shuts down when the last clone
/// drops. Caches are injected via [`Scheduler::register`] rather than
/// reached through global state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    read_ids: AtomicU32,
}

impl Scheduler {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn new() -> CoreResult<Self> {
        let (tx, rx) = bounded(COMMAND_QUEUE_DEPTH);

        let worker = std::thread::Builder::new()
            .name("iostash-cache-io".into())
            .spawn(move || Worker::new(rx).run())?;

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                tx,
                worker: Mutex::new(Some(worker)),
                read_ids: AtomicU32::new(0),
            }),
        })
    }

    /// Hands a cache to the worker. Its recovery load runs there.
    pub fn register(&self, cache: Arc<Cache>) {
        let _ = self.inner.tx.send(Command::Register(cache));
    }

    /// Removes a cache from the worker's rotation.
    pub fn unregister(&self, cache: &Arc<Cache>) {
        let _ = self.inner.tx.send(Command::Unregister(Arc::clone(cache)));
    }

    /// Reconfigures the governor's write rate.
    pub fn set_write_rate(&self, rate: WriteRate) {
        let _ = self.inner.tx.send(Command::SetRate(rate));
    }

    /// Reconfigures the governor's demand bands.
    pub fn set_demand_bands(&self, bands: DemandBands) {
        let _ = self.inner.tx.send(Command::SetDemandBands(bands));
    }

    /// Enqueues an asynchronous read of `key` from `cache`.
    pub fn begin_read(&self, cache: Arc<Cache>, key: ContentKey, offset: u32) -> MaterializeHandle {
        let read_id = self.inner.read_ids.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let slot = Arc::new(ReadSlot::new(read_id));
        let handle = MaterializeHandle {
            slot: Arc::clone(&slot),
        };

        let request = ReadRequest {
            cache,
            key,
            offset,
            slot,
        };
        if self.inner.tx.send(Command::BeginRead(request)).is_err() {
            // Worker is gone; fail the read rather than hang the caller.
            handle.slot.complete(ReadStatus::Cancelled, None);
        }

        handle
    }

    /// Requests cancellation of a pending read. Best-effort; see
    /// [`MaterializeHandle`].
    pub fn cancel(&self, handle: &MaterializeHandle) {
        let _ = self.inner.tx.send(Command::CancelRead(handle.read_id()));
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Worker-thread state.
struct Worker {
    rx: Receiver<Command>,
    governor: Governor,
    caches: Vec<Arc<Cache>>,
    reads: VecDeque<ReadRequest>,
    carry: Vec<Command>,
    stopping: bool,
}

impl Worker {
    fn new(rx: Receiver<Command>) -> Self {
        Self {
            rx,
            governor: Governor::new(),
            caches: Vec::new(),
            reads: VecDeque::new(),
            carry: Vec::new(),
            stopping: false,
        }
    }

    fn run(mut self) {
        debug!("cache io worker up");

        loop {
            let mut batch = std::mem::take(&mut self.carry);
            batch.extend(self.rx.try_iter());
            self.process(batch);

            if self.stopping {
                break;
            }

            match self.update() {
                Some(wait) => match self.rx.recv_timeout(wait) {
                    Ok(command) => self.carry.push(command),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                // Nothing registered: park until work arrives.
                None => match self.rx.recv() {
                    Ok(command) => self.carry.push(command),
                    Err(_) => break,
                },
            }
        }

        // Fail whatever reads are still queued or in the channel.
        for request in self.reads.drain(..) {
            request.slot.complete(ReadStatus::Cancelled, None);
        }
        for command in self.rx.try_iter() {
            if let Command::BeginRead(request) = command {
                request.slot.complete(ReadStatus::Cancelled, None);
            }
        }

        debug!("cache io worker down");
    }

    /// Applies one drained batch in the three-pass order.
    fn process(&mut self, batch: Vec<Command>) {
        if batch.is_empty() {
            return;
        }

        // Pass 1: unregisters.
        for command in &batch {
            let Command::Unregister(target) = command else {
                continue;
            };

            if let Some(at) = self.caches.iter().position(|c| Arc::ptr_eq(c, target)) {
                self.caches.swap_remove(at);
            } else {
                // The matching register may be in this very batch and not
                // landed yet; retry the unregister next cycle instead of
                // dropping a cache that was never added.
                let registered_here = batch
                    .iter()
                    .any(|c| matches!(c, Command::Register(cache) if Arc::ptr_eq(cache, target)));
                if registered_here {
                    self.carry.push(Command::Unregister(Arc::clone(target)));
                }
            }
        }

        // Pass 2: everything except unregisters and cancels, in order.
        let mut cancels = Vec::new();
        for command in batch {
            match command {
                Command::Register(cache) => {
                    cache.load();
                    self.caches.push(cache);
                }
                Command::Unregister(_) => {}
                Command::SetRate(rate) => self.governor.set_rate(rate),
                Command::SetDemandBands(bands) => self.governor.set_demand_bands(bands),
                Command::BeginRead(request) => self.reads.push_back(request),
                Command::CancelRead(read_id) => cancels.push(read_id),
                Command::Shutdown => self.stopping = true,
            }
        }

        // Pass 3: cancels, now that their targets are enqueued.
        for read_id in cancels {
            if let Some(request) = self.reads.iter().find(|r| r.slot.read_id == read_id) {
                request.slot.cancelled.store(true, Ordering::Relaxed);
            }
        }
    }

    /// One governed service iteration over all caches, then reads within
    /// the remaining slice. Returns how long to sleep, or `None` to park.
    fn update(&mut self) -> Option<Duration> {
        let mut slice = Duration::MAX;
        for i in 0..self.caches.len() {
            let cache = Arc::clone(&self.caches[i]);
            slice = slice.min(self.update_cache(&cache));
        }

        if self.reads.is_empty() {
            return if self.caches.is_empty() {
                None
            } else {
                Some(slice)
            };
        }

        // A slice of time to serve reads until a cache needs another tick.
        // Always serve at least one so progress is made.
        let start = Instant::now();
        let deadline = start.checked_add(slice);
        while let Some(request) = self.reads.pop_front() {
            let mut data = Vec::new();
            let status = if request.slot.cancelled.load(Ordering::Relaxed) {
                ReadStatus::Cancelled
            } else {
                request
                    .cache
                    .materialize(request.key, &mut data, request.offset)
            };

            let payload = (status == ReadStatus::Ok).then_some(data);
            request.slot.complete(status, payload);

            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }

        if self.caches.is_empty() {
            return None;
        }
        match deadline {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None => Some(slice),
        }
    }

    /// Governed flush cycle for one cache; returns its wait.
    fn update_cache(&mut self, cache: &Cache) -> Duration {
        let demand = cache.demand();
        match self.governor.begin_allowance(demand) {
            Grant::Wait(wait) => wait,
            Grant::Allowance(allowance) => {
                let used = cache.write_mem_to_disk(allowance);
                match self.governor.end_allowance(allowance.saturating_sub(used)) {
                    WindowEnd::Open(wait) => wait,
                    WindowEnd::Closed(wait) => {
                        // Window closed: commit the journal and reopen the
                        // next window on demand.
                        cache.flush();
                        wait
                    }
                }
            }
        }
    }
}
