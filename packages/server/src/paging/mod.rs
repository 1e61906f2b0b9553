//! Value paging / swap-to-disk (spec §4.J).
//!
//! Only `String` values are ever swapped (spec §3's value-object invariant:
//! "only String values may be swapped"). A resident string still lives as
//! `DataValue::String` in the keyspace; once its payload is written out it
//! becomes `DataValue::Swapped(ValueKind::String)`. The transient
//! Swapping/Loading states the spec assigns to the value object itself are
//! tracked here instead, in [`PagingManager::in_flight`], keyed by
//! `(db, key)` — `ember-core`'s value has no notion of an in-flight job.
//!
//! Workers are plain OS threads (spec §5: "Worker threads exist only for
//! the paging subsystem; they never touch the keyspace directly"), moving
//! jobs between three mutex-guarded queues exactly as described (spec
//! §4.J "Job protocol"). The engine thread is a plain synchronous loop
//! (SPEC_FULL.md §1), so the self-pipe becomes periodic polling of
//! `processed` rather than a wakeup signal; [`Shared::notify`] still fires
//! on every completion so a future async consumer of this manager has
//! something to await without changing the worker side.

mod swapfile;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use ember_core::{DataValue, StringValue, ValueKind};
use tokio::sync::{oneshot, Notify};

pub use swapfile::{PageSlot, SwapFile};

/// One pending paging job.
struct Job {
    id: u64,
    db: usize,
    key: Bytes,
    kind: JobKind,
    canceled: bool,
    result: Option<JobResult>,
}

#[derive(Clone)]
enum JobKind {
    /// Compute how many pages the value would need, without allocating.
    PrepareSwap { payload: Bytes },
    /// Allocate pages and write the payload.
    DoSwap { payload: Bytes },
    /// Read the payload back and free its pages.
    Load { slot: PageSlot },
}

enum JobResult {
    PageCount(usize),
    Swapped(PageSlot),
    Loaded(Bytes),
}

/// The three job queues (spec §4.J "Job protocol"), behind one mutex as
/// the spec describes, shared between the engine thread and the worker
/// pool.
#[derive(Default)]
struct JobQueues {
    newjobs: VecDeque<Job>,
    processing: VecDeque<Job>,
    processed: VecDeque<Job>,
}

struct Shared {
    queues: Mutex<JobQueues>,
    swap_file: Mutex<SwapFile>,
    notify: Notify,
    next_job_id: AtomicU64,
    shutdown: std::sync::atomic::AtomicBool,
}

/// Outcome of checking whether a command's keys are ready to run (spec
/// §4.J "Client parking").
pub enum PreloadOutcome {
    /// None of the requested keys are paged out or in flight.
    Ready,
    /// At least one key is `Swapped` or `Loading`; the caller should park
    /// the client and retry the command once every receiver resolves.
    Parked(Vec<oneshot::Receiver<()>>),
}

/// Owned by the engine thread. Tracks in-flight jobs, parked clients, and
/// drives the worker pool.
pub struct PagingManager {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
    in_flight: HashMap<(usize, Bytes), FlightState>,
    parked: HashMap<(usize, Bytes), Vec<oneshot::Sender<()>>>,
    last_access: HashMap<(usize, Bytes), i64>,
    counts: JobCounts,
}

/// Completed-job tallies, surfaced through `INFO`'s `# Stats` section
/// (SPEC_FULL.md §2 "Metrics surface").
#[derive(Debug, Clone, Copy, Default)]
pub struct JobCounts {
    pub swap_outs: u64,
    pub loads: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlightState {
    Swapping,
    Loading,
}

impl PagingManager {
    /// Opens (or creates) the swap file at `path` with `page_size` bytes
    /// per page and `pages` total pages, and starts `threads` workers
    /// (spec §4.J, `vm-page-size`/`vm-pages`/`vm-max-threads`).
    pub fn start(path: &std::path::Path, page_size: usize, pages: usize, threads: usize) -> std::io::Result<Self> {
        let swap_file = SwapFile::open(path, page_size, pages)?;
        let shared = Arc::new(Shared {
            queues: Mutex::new(JobQueues::default()),
            swap_file: Mutex::new(swap_file),
            notify: Notify::new(),
            next_job_id: AtomicU64::new(1),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });
        let workers = (0..threads.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Ok(Self {
            shared,
            workers,
            in_flight: HashMap::new(),
            parked: HashMap::new(),
            last_access: HashMap::new(),
            counts: JobCounts::default(),
        })
    }

    /// Completed swap-out/load job tallies since startup.
    #[must_use]
    pub fn counts(&self) -> JobCounts {
        self.counts
    }

    /// Records that `key` in `db` was just touched, for swap-out scoring.
    pub fn touch(&mut self, db: usize, key: &Bytes, now: i64) {
        self.last_access.insert((db, key.clone()), now);
    }

    /// The last time `touch` was called for `key` in `db`, for building a
    /// [`swap_out_candidate`] sample.
    #[must_use]
    pub fn last_access(&self, db: usize, key: &[u8]) -> Option<i64> {
        self.last_access.get(&(db, Bytes::copy_from_slice(key))).copied()
    }

    /// The preload gate (spec §4.J "Client parking"): for each of a
    /// command's declared keys, checks whether the keyspace holds it
    /// `Swapped`, or whether it's already `Loading` here; if either, the
    /// caller is registered to be woken once every such key is back in
    /// `Memory`.
    ///
    /// Starting the `Load` job itself is the caller's responsibility (the
    /// engine owns `swap_locations` and looks up the key's `PageSlot`
    /// before calling [`PagingManager::begin_load`]); this only decides
    /// whether the client must wait and registers it to be woken.
    pub fn preload_gate(&mut self, db: usize, keys: &[Bytes], keyspace: &ember_core::Keyspace) -> PreloadOutcome {
        let mut receivers = Vec::new();
        for key in keys {
            let is_swapped = keyspace.db(db).ok().and_then(|d| d.peek(key)).is_some_and(DataValue::is_swapped);
            let is_loading = self.in_flight.get(&(db, key.clone())).copied() == Some(FlightState::Loading);
            if !is_swapped && !is_loading {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            self.parked.entry((db, key.clone())).or_default().push(tx);
            receivers.push(rx);
        }
        if receivers.is_empty() {
            PreloadOutcome::Ready
        } else {
            PreloadOutcome::Parked(receivers)
        }
    }

    /// Whether `key` in `db` currently has an in-flight swap/load job.
    #[must_use]
    pub fn is_in_flight(&self, db: usize, key: &[u8]) -> bool {
        self.in_flight.contains_key(&(db, key.to_vec().into()))
    }

    /// Submits a `PrepareSwap` job for a resident string value picked by
    /// [`swap_out_candidate`]. The value stays `DataValue::String` in the
    /// keyspace until `DoSwap` commits (spec: "DoSwap atomically
    /// transitions the key from Swapping to Swapped and releases the
    /// in-memory payload").
    pub fn begin_swap_out(&mut self, db: usize, key: Bytes, payload: Bytes) {
        let id = self.shared.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = Job { id, db, key: key.clone(), kind: JobKind::PrepareSwap { payload }, canceled: false, result: None };
        self.shared.queues.lock().expect("queues mutex poisoned").newjobs.push_back(job);
        self.in_flight.insert((db, key), FlightState::Swapping);
    }

    /// Submits a `Load` job for a swapped-out key at `slot`, unless one is
    /// already in flight.
    pub fn begin_load(&mut self, db: usize, key: Bytes, slot: PageSlot) {
        if self.in_flight.contains_key(&(db, key.clone())) {
            return;
        }
        let id = self.shared.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = Job { id, db, key: key.clone(), kind: JobKind::Load { slot }, canceled: false, result: None };
        self.shared.queues.lock().expect("queues mutex poisoned").newjobs.push_back(job);
        self.in_flight.insert((db, key), FlightState::Loading);
    }

    /// Drains the `processed` queue, committing each finished job into
    /// `keyspace`, returning the `(db, key)` pairs whose parked clients
    /// should now be woken and retried.
    pub fn drain_processed(
        &mut self,
        keyspace: &mut ember_core::Keyspace,
        swap_locations: &mut HashMap<(usize, Bytes), PageSlot>,
    ) -> Vec<(usize, Bytes)> {
        let finished: Vec<Job> = {
            let mut queues = self.shared.queues.lock().expect("queues mutex poisoned");
            std::mem::take(&mut queues.processed).into_iter().collect()
        };
        let mut ready = Vec::new();
        for job in finished {
            if job.canceled {
                self.in_flight.remove(&(job.db, job.key.clone()));
                continue;
            }
            match job.result {
                Some(JobResult::PageCount(_)) => {
                    // PrepareSwap finished: rebrand as DoSwap and re-queue
                    // (spec: "PrepareSwap is rebranded as DoSwap and
                    // re-queued").
                    let JobKind::PrepareSwap { payload } = job.kind else {
                        unreachable!("PageCount result only comes from PrepareSwap")
                    };
                    let id = self.shared.next_job_id.fetch_add(1, Ordering::Relaxed);
                    let resubmitted =
                        Job { id, db: job.db, key: job.key.clone(), kind: JobKind::DoSwap { payload }, canceled: false, result: None };
                    self.shared.queues.lock().expect("queues mutex poisoned").newjobs.push_back(resubmitted);
                }
                Some(JobResult::Swapped(slot)) => {
                    if let Ok(d) = keyspace.db_mut(job.db) {
                        d.replace_value_keep_ttl(&job.key, DataValue::Swapped(ValueKind::String));
                    }
                    swap_locations.insert((job.db, job.key.clone()), slot);
                    self.in_flight.remove(&(job.db, job.key.clone()));
                    self.counts.swap_outs += 1;
                    metrics::counter!("ember_paging_jobs_completed_total", "kind" => "swap_out").increment(1);
                }
                Some(JobResult::Loaded(bytes)) => {
                    if let Ok(d) = keyspace.db_mut(job.db) {
                        d.replace_value_keep_ttl(&job.key, DataValue::String(StringValue::new(bytes)));
                    }
                    swap_locations.remove(&(job.db, job.key.clone()));
                    self.in_flight.remove(&(job.db, job.key.clone()));
                    self.counts.loads += 1;
                    metrics::counter!("ember_paging_jobs_completed_total", "kind" => "load").increment(1);
                    ready.push((job.db, job.key.clone()));
                }
                None => {}
            }
        }
        for (db, key) in &ready {
            if let Some(waiters) = self.parked.remove(&(*db, key.clone())) {
                for tx in waiters {
                    let _ = tx.send(());
                }
            }
        }
        ready
    }

    /// Cancels any in-flight job for `key` in `db` (spec §4.J
    /// "Cancellation"), called before a `DEL`/overwrite of a key that is
    /// `Swapping` or `Loading`. Searches `newjobs` first (cheap removal),
    /// then spins briefly on `processing` the way the protocol describes,
    /// then marks a `processed`-but-not-yet-committed job canceled so
    /// [`PagingManager::drain_processed`] ignores it.
    pub fn cancel(&mut self, db: usize, key: &[u8]) {
        let key = Bytes::copy_from_slice(key);
        if self.in_flight.remove(&(db, key.clone())).is_none() {
            return;
        }
        const MAX_SPINS: u32 = 1_000_000;
        for _ in 0..MAX_SPINS {
            let mut queues = self.shared.queues.lock().expect("queues mutex poisoned");
            if let Some(pos) = queues.newjobs.iter().position(|j| j.db == db && j.key == key) {
                queues.newjobs.remove(pos);
                return;
            }
            if let Some(job) = queues.processed.iter_mut().find(|j| j.db == db && j.key == key) {
                job.canceled = true;
                return;
            }
            drop(queues);
            thread::yield_now();
        }
    }
}

impl Drop for PagingManager {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.notify.notify_waiters();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let (job_id, kind) = {
            let mut queues = shared.queues.lock().expect("queues mutex poisoned");
            let Some(job) = queues.newjobs.pop_front() else {
                drop(queues);
                thread::sleep(std::time::Duration::from_millis(5));
                continue;
            };
            let kind = job.kind.clone();
            let id = job.id;
            // Stays in `processing` for the whole execution, so a
            // concurrent `PagingManager::cancel` call can observe it there
            // and wait rather than missing it entirely (spec §4.J
            // "Cancellation").
            queues.processing.push_back(job);
            (id, kind)
        };
        let result = execute(&shared, &kind);
        let mut queues = shared.queues.lock().expect("queues mutex poisoned");
        if let Some(pos) = queues.processing.iter().position(|j| j.id == job_id) {
            let mut job = queues.processing.remove(pos).expect("found by position");
            job.result = Some(result);
            queues.processed.push_back(job);
        }
        drop(queues);
        shared.notify.notify_one();
    }
}

fn execute(shared: &Shared, kind: &JobKind) -> JobResult {
    match kind {
        JobKind::PrepareSwap { payload } => {
            let swap_file = shared.swap_file.lock().expect("swap file mutex poisoned");
            JobResult::PageCount(swap_file.pages_needed(payload.len()))
        }
        JobKind::DoSwap { payload } => {
            let mut swap_file = shared.swap_file.lock().expect("swap file mutex poisoned");
            let slot = swap_file.write(payload).expect("swap file write failed");
            JobResult::Swapped(slot)
        }
        JobKind::Load { slot } => {
            let mut swap_file = shared.swap_file.lock().expect("swap file mutex poisoned");
            let bytes = swap_file.read(*slot).expect("swap file read failed");
            swap_file.free(*slot);
            JobResult::Loaded(bytes)
        }
    }
}

/// Swap-out scoring (spec §4.J "Swap-out decision"): `idle_age ×
/// log(1 + estimated_bytes)`, maximized over `sample`. Only in-`Memory`
/// string values with no outstanding job are eligible — callers are
/// expected to have already filtered `sample` down to those.
#[must_use]
pub fn swap_out_candidate(sample: &[(Bytes, i64, usize)], now: i64) -> Option<Bytes> {
    sample
        .iter()
        .map(|(key, last_access, estimated_bytes)| {
            let idle_age = (now - last_access).max(0) as f64;
            let score = idle_age * (1.0 + *estimated_bytes as f64).ln();
            (key, score)
        })
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_out_candidate_prefers_idle_and_large() {
        let sample = vec![
            (Bytes::from_static(b"hot"), 100, 10),
            (Bytes::from_static(b"cold_big"), 0, 100_000),
            (Bytes::from_static(b"cold_small"), 0, 1),
        ];
        // hot has nonzero idle_age * small size; cold entries have idle_age 0
        // so their score is 0 regardless of size — hot wins.
        assert_eq!(swap_out_candidate(&sample, 100), Some(Bytes::from_static(b"hot")));
    }

    #[test]
    fn swap_out_candidate_empty_sample_is_none() {
        assert_eq!(swap_out_candidate(&[], 0), None);
    }

    #[test]
    fn start_and_drop_cleanly_joins_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = PagingManager::start(&dir.path().join("swap.dat"), 4096, 64, 2).unwrap();
        drop(mgr);
    }
}
