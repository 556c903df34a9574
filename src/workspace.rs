//! Workspace discovery coordination: enumerate matching files, drive
//! per-file discovery with a small self-throttling worker pool and react to
//! file events.
//!
//! Workers interleave with the host's own work, so the coordinator tracks
//! how much wall-clock time discovery has consumed and pauses workers when
//! that share exceeds the configured fraction. This trades discovery
//! latency for responsiveness; it is a fairness mechanism, not a
//! correctness requirement.

use std::{
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use ignore::{WalkBuilder, overrides::OverrideBuilder};

use crate::{
    FilePath,
    config::EngineConfig,
    debounce::Debouncer,
    discover::DiscoveryEngine,
    error::EngineError,
    sink::{SharedSink, emit_changes},
    tree::{PendingMap, TestTree},
};

/// Longest single pause a throttled worker will take before rechecking.
const MAX_THROTTLE_PAUSE: Duration = Duration::from_secs(1);

/// File events the host's watcher and editor feed into discovery.
#[derive(Debug, Clone)]
pub enum FileEvent {
    Created(FilePath),
    Changed {
        path: FilePath,
        /// Live-edit changes coalesce through the debouncer; on-disk watch
        /// events reparse immediately.
        live_edit: bool,
    },
    Deleted(FilePath),
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DiscoveryState {
    tree: TestTree,
    engine: DiscoveryEngine,
}

struct Throttle {
    started: Instant,
    busy: Duration,
}

struct Shared {
    state: Mutex<DiscoveryState>,
    sink: SharedSink,
    throttle: Mutex<Throttle>,
    throttle_fraction: f64,
    in_flight: AtomicUsize,
}

impl Shared {
    /// One discovery pass over a file on disk, forwarding changes to the sink.
    fn process_file(&self, path: &str) -> Result<(), EngineError> {
        let source = std::fs::read_to_string(path)?;
        let mut state = lock(&self.state);
        let DiscoveryState { tree, engine } = &mut *state;
        let changes = engine.discover_source(tree, path, &source);
        if !changes.is_empty() {
            let mut sink = lock(&self.sink);
            emit_changes(tree, &changes, &mut *sink);
        }
        Ok(())
    }

    /// How long a worker should pause so discovery stays under its share of
    /// elapsed wall-clock time.
    fn throttle_pause(&self) -> Duration {
        let throttle = lock(&self.throttle);
        let elapsed = throttle.started.elapsed().as_secs_f64();
        let busy = throttle.busy.as_secs_f64();
        if busy <= elapsed * self.throttle_fraction {
            return Duration::ZERO;
        }
        let pause = busy / self.throttle_fraction - elapsed;
        Duration::from_secs_f64(pause).min(MAX_THROTTLE_PAUSE)
    }

    fn record_busy(&self, spent: Duration) {
        lock(&self.throttle).busy += spent;
    }
}

fn worker(shared: &Shared, queue: &Receiver<FilePath>) {
    for path in queue {
        let started = Instant::now();
        if let Err(error) = shared.process_file(&path) {
            log::warn!("could not read {path}: {error}");
        }
        shared.record_busy(started.elapsed());
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        let pause = shared.throttle_pause();
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
}

fn enqueue(shared: &Shared, queue: &Sender<FilePath>, path: FilePath) {
    shared.in_flight.fetch_add(1, Ordering::SeqCst);
    if queue.send(path).is_err() {
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Enumerate workspace files matching the include/exclude globs.
fn enumerate_files(
    root: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<FilePath>, EngineError> {
    let mut overrides = OverrideBuilder::new(root);
    for pattern in include {
        overrides.add(pattern)?;
    }
    for pattern in exclude {
        overrides.add(&format!("!{pattern}"))?;
    }
    let overrides = overrides.build()?;

    let mut files = Vec::new();
    for entry in WalkBuilder::new(root)
        .overrides(overrides)
        .standard_filters(false)
        .build()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                log::warn!("skipping unreadable entry: {error}");
                continue;
            }
        };
        if entry.file_type().is_some_and(|kind| kind.is_file()) {
            files.push(entry.path().to_string_lossy().to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Live discovery over one workspace root.
///
/// Owns the test tree, the worker pool and the debouncer; dropping the
/// handle stops all of them.
pub struct DiscoveryHandle {
    shared: Arc<Shared>,
    queue: Option<Sender<FilePath>>,
    debouncer: Option<Debouncer>,
    debounce_window: Duration,
    workers: Vec<JoinHandle<()>>,
    debounce_pump: Option<JoinHandle<()>>,
}

/// Enumerate `root` and start discovering tests in matching files.
///
/// The initial backlog drains through `worker_count` workers; afterwards
/// the handle reacts to [`FileEvent`]s until disposed.
pub fn start_discovery(
    root: &Path,
    config: &EngineConfig,
    sink: SharedSink,
) -> Result<DiscoveryHandle, EngineError> {
    for warning in config.validate() {
        log::warn!("{warning}");
    }
    let backlog = enumerate_files(root, &config.include, &config.exclude)?;
    log::debug!("discovery starting over {} files", backlog.len());

    let shared = Arc::new(Shared {
        state: Mutex::new(DiscoveryState {
            tree: TestTree::new(),
            engine: DiscoveryEngine::new(),
        }),
        sink,
        throttle: Mutex::new(Throttle {
            started: Instant::now(),
            busy: Duration::ZERO,
        }),
        throttle_fraction: config.effective_throttle_fraction(),
        in_flight: AtomicUsize::new(0),
    });

    let (queue_tx, queue_rx) = unbounded::<FilePath>();
    let workers = (0..config.effective_worker_count())
        .map(|_| {
            let shared = Arc::clone(&shared);
            let queue = queue_rx.clone();
            thread::spawn(move || worker(&shared, &queue))
        })
        .collect();

    for path in backlog {
        enqueue(&shared, &queue_tx, path);
    }

    // Debounced keys feed back into the same worker queue.
    let (due_tx, due_rx) = unbounded::<String>();
    let debouncer = Debouncer::new(due_tx);
    let debounce_pump = {
        let shared = Arc::clone(&shared);
        let queue = queue_tx.clone();
        thread::spawn(move || {
            for path in due_rx {
                enqueue(&shared, &queue, path);
            }
        })
    };

    Ok(DiscoveryHandle {
        shared,
        queue: Some(queue_tx),
        debouncer: Some(debouncer),
        debounce_window: Duration::from_millis(config.debounce_ms),
        workers,
        debounce_pump: Some(debounce_pump),
    })
}

impl DiscoveryHandle {
    /// Feed one file event into discovery.
    pub fn handle_event(&self, event: FileEvent) {
        match event {
            FileEvent::Created(path)
            | FileEvent::Changed {
                path,
                live_edit: false,
            } => {
                if let Some(queue) = &self.queue {
                    enqueue(&self.shared, queue, path);
                }
            }
            FileEvent::Changed {
                path,
                live_edit: true,
            } => {
                if let Some(debouncer) = &self.debouncer {
                    debouncer.schedule(path, self.debounce_window);
                }
            }
            FileEvent::Deleted(path) => {
                let mut state = lock(&self.shared.state);
                let DiscoveryState { tree, engine } = &mut *state;
                let changes = engine.evict_file(tree, &path);
                if !changes.is_empty() {
                    let mut sink = lock(&self.shared.sink);
                    emit_changes(tree, &changes, &mut *sink);
                }
            }
        }
    }

    /// Read access to the current tree.
    pub fn with_tree<R>(&self, reader: impl FnOnce(&TestTree) -> R) -> R {
        reader(&lock(&self.shared.state).tree)
    }

    /// Snapshot the pending map for a run request.
    #[must_use]
    pub fn snapshot_pending(&self) -> PendingMap {
        lock(&self.shared.state).tree.snapshot_pending()
    }

    /// Block until no queued or running discovery work remains, or the
    /// timeout elapses. Returns whether the queue went idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.in_flight.load(Ordering::SeqCst) != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Stop workers and timers. Queued files that have not been processed
    /// yet are dropped.
    pub fn dispose(&mut self) {
        self.debouncer.take();
        if let Some(pump) = self.debounce_pump.take() {
            let _ = pump.join();
        }
        self.queue.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
