//! Run-output correlation: translate a test process's streamed JSON events
//! into per-test outcome updates on the sink.
//!
//! The wire protocol is one `[eventName, payload]` JSON tuple per line;
//! anything that does not parse as that shape passes through as plain
//! output. Failure locations are resolved through source maps on a separate
//! resolver thread so a slow map load never stalls stream consumption.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, never, select, unbounded};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    FailureMessage, FullyQualifiedName, RunOutcome, TestLocation,
    error::EngineError,
    sink::SharedSink,
    source_map::{LocationResolver, SourceMapLoader},
    tree::PendingMap,
};

/// Substring of a full title that marks a setup/teardown failure reported
/// by the runner. Hooks have no test identity of their own, so their
/// failures are attributed to an adjacent test.
pub const HOOK_FAILURE_MARKER: &str = "hook for";

// --- Process and cancellation plumbing ---

/// The spawned test process as the correlator sees it: line streams and an
/// exit signal. Spawning, argument selection and killing live with the host.
pub trait ProcessHandle: Send {
    fn stdout(&self) -> Receiver<String>;
    fn stderr(&self) -> Receiver<String>;
    fn exit(&self) -> Receiver<i32>;
    fn kill(&self);
}

/// Cancellation signal observed by a run.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    signal: Receiver<()>,
}

impl CancellationToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that disconnects when the source cancels; for `select!`.
    #[must_use]
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }

    /// A token that can never fire.
    #[must_use]
    pub fn none() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            signal: never(),
        }
    }
}

/// Owning side of a [`CancellationToken`].
pub struct CancellationSource {
    cancelled: Arc<AtomicBool>,
    signal: Mutex<Option<Sender<()>>>,
}

impl CancellationSource {
    #[must_use]
    pub fn new() -> (Self, CancellationToken) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(0);
        (
            Self {
                cancelled: Arc::clone(&cancelled),
                signal: Mutex::new(Some(tx)),
            },
            CancellationToken {
                cancelled,
                signal: rx,
            },
        )
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the signal channel and wakes
        // every select that listens on it.
        if let Ok(mut signal) = self.signal.lock() {
            signal.take();
        }
    }
}

/// A [`ProcessHandle`] fed through channels, for hosts that own the child
/// process themselves and for tests.
pub struct ScriptedProcess {
    stdout: Receiver<String>,
    stderr: Receiver<String>,
    exit: Receiver<i32>,
    killed: Arc<AtomicBool>,
}

/// Sender half of a [`ScriptedProcess`].
pub struct ProcessInput {
    pub stdout: Sender<String>,
    pub stderr: Sender<String>,
    pub exit: Sender<i32>,
}

impl ScriptedProcess {
    #[must_use]
    pub fn new() -> (ProcessInput, Self) {
        let (stdout_tx, stdout_rx) = unbounded();
        let (stderr_tx, stderr_rx) = unbounded();
        let (exit_tx, exit_rx) = bounded(1);
        (
            ProcessInput {
                stdout: stdout_tx,
                stderr: stderr_tx,
                exit: exit_tx,
            },
            Self {
                stdout: stdout_rx,
                stderr: stderr_rx,
                exit: exit_rx,
                killed: Arc::new(AtomicBool::new(false)),
            },
        )
    }

    #[must_use]
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl ProcessHandle for ScriptedProcess {
    fn stdout(&self) -> Receiver<String> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Receiver<String> {
        self.stderr.clone()
    }

    fn exit(&self) -> Receiver<i32> {
        self.exit.clone()
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

// --- Wire protocol ---

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TitlePayload {
    #[serde(rename = "fullTitle")]
    full_title: String,
}

#[derive(Debug, Deserialize)]
struct PassPayload {
    #[serde(rename = "fullTitle")]
    full_title: String,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FailPayload {
    #[serde(rename = "fullTitle")]
    full_title: String,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    actual: Option<String>,
    #[serde(default, rename = "expectedJSON")]
    expected_json: Option<Value>,
    #[serde(default, rename = "actualJSON")]
    actual_json: Option<Value>,
    #[serde(default)]
    duration: Option<f64>,
}

/// Split a line into `(event, payload)` if it is a well-formed two-element
/// JSON tuple; anything else is plain output.
fn parse_event(line: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let tuple = value.as_array()?;
    if tuple.len() != 2 {
        return None;
    }
    let name = tuple[0].as_str()?;
    Some((name.to_string(), tuple[1].clone()))
}

/// Runners report "undefined" for missing diff payloads; both sides being
/// that literal means there is no real diff to show.
const UNDEFINED_SENTINEL: &str = "undefined";

// --- Resolver pipeline ---

enum ResolveJob {
    Stack {
        id: u64,
        case: FullyQualifiedName,
        text: String,
        stack: String,
        fallback: TestLocation,
        duration_ms: Option<u64>,
    },
    Output {
        id: u64,
        text: String,
        case: Option<FullyQualifiedName>,
    },
}

enum Emission {
    Failed {
        case: FullyQualifiedName,
        message: FailureMessage,
        duration_ms: Option<u64>,
    },
    Output {
        text: String,
        location: Option<TestLocation>,
        case: Option<FullyQualifiedName>,
    },
}

fn emit(sink: &SharedSink, emission: Emission) {
    let mut sink = sink
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match emission {
        Emission::Failed {
            case,
            message,
            duration_ms,
        } => sink.set_outcome(
            &case,
            RunOutcome::Failed {
                message,
                duration_ms,
            },
        ),
        Emission::Output {
            text,
            location,
            case,
        } => sink.append_output(&text, location.as_ref(), case.as_ref()),
    }
}

fn spawn_resolver(
    loader: Arc<dyn SourceMapLoader>,
    jobs: Receiver<ResolveJob>,
    resolved: Sender<(u64, Emission)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut resolver = LocationResolver::new(loader);
        for job in jobs {
            let (id, emission) = match job {
                ResolveJob::Stack {
                    id,
                    case,
                    text,
                    stack,
                    fallback,
                    duration_ms,
                } => {
                    let location = resolver
                        .resolve_first_reference(&stack)
                        .unwrap_or(fallback);
                    (
                        id,
                        Emission::Failed {
                            case,
                            message: FailureMessage {
                                text,
                                expected: None,
                                actual: None,
                                location: Some(location),
                            },
                            duration_ms,
                        },
                    )
                }
                ResolveJob::Output { id, text, case } => {
                    let location = resolver.resolve_first_reference(&text);
                    (
                        id,
                        Emission::Output {
                            text,
                            location,
                            case,
                        },
                    )
                }
            };
            if resolved.send((id, emission)).is_err() {
                return;
            }
        }
    })
}

// --- Correlator ---

struct Correlator<'a> {
    pending: PendingMap,
    sink: &'a SharedSink,
    never_started: HashSet<FullyQualifiedName>,
    current: Option<FullyQualifiedName>,
    jobs: Option<Sender<ResolveJob>>,
    /// Fallback emissions for in-flight resolutions, keyed by job id so a
    /// timed-out run can still flush them in dispatch order.
    outstanding: BTreeMap<u64, Emission>,
    next_job: u64,
    ended: bool,
}

impl Correlator<'_> {
    fn with_sink(&self, f: impl FnOnce(&mut dyn crate::sink::TestSink)) {
        let mut sink = self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut *sink);
    }

    fn handle_line(&mut self, line: &str) {
        let Some((event, payload)) = parse_event(line) else {
            self.forward_output(line.to_string());
            return;
        };
        match event.as_str() {
            "start" => {
                if let Ok(start) = serde_json::from_value::<StartPayload>(payload) {
                    log::debug!("run started, {:?} tests expected", start.total);
                }
            }
            "testStart" => {
                if let Ok(started) = serde_json::from_value::<TitlePayload>(payload) {
                    let title = FullyQualifiedName::from(started.full_title.as_str());
                    self.never_started.remove(&title);
                    if self.pending.contains_key(&title) {
                        self.with_sink(|sink| sink.set_outcome(&title, RunOutcome::Running));
                    }
                    self.current = Some(title);
                }
            }
            "pass" => {
                if let Ok(pass) = serde_json::from_value::<PassPayload>(payload) {
                    let title = FullyQualifiedName::from(pass.full_title.as_str());
                    self.never_started.remove(&title);
                    // Late or duplicate events find nothing to remove.
                    if self.pending.remove(&title).is_some() {
                        let duration_ms = pass.duration.map(|duration| duration as u64);
                        self.with_sink(|sink| {
                            sink.set_outcome(&title, RunOutcome::Passed { duration_ms });
                        });
                    }
                }
            }
            "fail" => {
                if let Ok(fail) = serde_json::from_value::<FailPayload>(payload) {
                    self.handle_fail(fail);
                }
            }
            "end" => self.ended = true,
            other => log::debug!("ignoring unknown runner event {other:?}"),
        }
    }

    /// Find the case a fail event belongs to. Hook failures carry a title
    /// that matches no test; they are charged to the currently attributable
    /// test or, failing that, to an arbitrary remaining pending one.
    fn attribute_failure(&self, title: &FullyQualifiedName) -> Option<FullyQualifiedName> {
        if self.pending.contains_key(title) {
            return Some(title.clone());
        }
        if title.as_str().contains(HOOK_FAILURE_MARKER) {
            if let Some(current) = &self.current
                && self.pending.contains_key(current)
            {
                return Some(current.clone());
            }
            return self.pending.keys().next().cloned();
        }
        None
    }

    fn handle_fail(&mut self, fail: FailPayload) {
        let title = FullyQualifiedName::from(fail.full_title.as_str());
        let Some(target) = self.attribute_failure(&title) else {
            log::debug!("fail event for unknown title {title}, ignoring");
            return;
        };
        let Some(case) = self.pending.remove(&target) else {
            return;
        };
        self.never_started.remove(&target);
        let duration_ms = fail.duration.map(|duration| duration as u64);

        let expected = fail
            .expected
            .or_else(|| fail.expected_json.map(|value| value.to_string()));
        let actual = fail
            .actual
            .or_else(|| fail.actual_json.map(|value| value.to_string()));
        let has_diff = match (&expected, &actual) {
            (Some(expected), Some(actual)) => {
                !(expected == UNDEFINED_SENTINEL && actual == UNDEFINED_SENTINEL)
            }
            _ => false,
        };

        if has_diff {
            let message = FailureMessage {
                text: fail.err.unwrap_or_else(|| "assertion failed".to_string()),
                expected,
                actual,
                location: Some(case.location.clone()),
            };
            self.with_sink(|sink| {
                sink.set_outcome(
                    &target,
                    RunOutcome::Failed {
                        message,
                        duration_ms,
                    },
                );
            });
            return;
        }

        // Plain stack-trace failure: the precise location comes out of the
        // source map asynchronously, the declaration is the fallback.
        let text = fail
            .stack
            .clone()
            .or(fail.err)
            .unwrap_or_else(|| "test failed".to_string());
        let stack = fail.stack.unwrap_or_else(|| text.clone());
        let id = self.next_job;
        self.next_job += 1;
        self.outstanding.insert(
            id,
            Emission::Failed {
                case: target.clone(),
                message: FailureMessage {
                    text: text.clone(),
                    expected: None,
                    actual: None,
                    location: Some(case.location.clone()),
                },
                duration_ms,
            },
        );
        let job = ResolveJob::Stack {
            id,
            case: target,
            text,
            stack,
            fallback: case.location,
            duration_ms,
        };
        if !self.send_job(job) {
            // Resolver is gone; the fallback will be flushed at settle time.
            log::warn!("location resolver unavailable, using declaration locations");
        }
    }

    fn send_job(&self, job: ResolveJob) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        }
    }

    /// Forward an unstructured line, attributed to the current test and
    /// annotated with a source location when one can be resolved from it.
    fn forward_output(&mut self, text: String) {
        let id = self.next_job;
        self.next_job += 1;
        self.outstanding.insert(
            id,
            Emission::Output {
                text: text.clone(),
                location: None,
                case: self.current.clone(),
            },
        );
        let job = ResolveJob::Output {
            id,
            text,
            case: self.current.clone(),
        };
        if !self.send_job(job)
            && let Some(emission) = self.outstanding.remove(&id)
        {
            emit(self.sink, emission);
        }
    }

    fn resolved(&mut self, id: u64, emission: Emission) {
        if self.outstanding.remove(&id).is_some() {
            emit(self.sink, emission);
        }
    }

    /// Wait for in-flight resolutions, flushing declaration-location
    /// fallbacks for anything that does not settle before the deadline.
    fn settle(
        &mut self,
        resolved: &Receiver<(u64, Emission)>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        while !self.outstanding.is_empty() {
            if cancel.is_cancelled() {
                self.outstanding.clear();
                return;
            }
            match resolved.recv_deadline(deadline) {
                Ok((id, emission)) => self.resolved(id, emission),
                Err(_) => break,
            }
        }
        for (_, emission) in std::mem::take(&mut self.outstanding) {
            emit(self.sink, emission);
        }
    }
}

/// Drain a test process's output, translating events into sink updates.
///
/// Resolves when the stream ends or the run is cancelled. A stream that
/// ends without an `end` event reports an error through the output channel
/// and leaves untouched tests without an asserted outcome; a legitimate
/// `end` marks every remaining pending test skipped, since the runner's own
/// filtering decided not to execute it.
pub fn correlate(
    pending: PendingMap,
    process: &dyn ProcessHandle,
    loader: Arc<dyn SourceMapLoader>,
    cancel: &CancellationToken,
    sink: &SharedSink,
    resolve_timeout: Duration,
) -> Result<(), EngineError> {
    let (jobs_tx, jobs_rx) = unbounded();
    let (resolved_tx, resolved_rx) = unbounded();
    // The resolver exits on its own once the jobs channel disconnects.
    let _resolver = spawn_resolver(loader, jobs_rx, resolved_tx);

    let mut correlator = Correlator {
        never_started: pending.keys().cloned().collect(),
        pending,
        sink,
        current: None,
        jobs: Some(jobs_tx),
        outstanding: BTreeMap::new(),
        next_job: 0,
        ended: false,
    };

    let stdout = process.stdout();
    let mut stderr = process.stderr();
    let mut resolved = resolved_rx.clone();
    let mut cancel_signal = cancel.signal().clone();
    let mut interrupted = false;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        select! {
            recv(stdout) -> line => match line {
                Ok(line) => correlator.handle_line(&line),
                Err(_) => {
                    interrupted = !correlator.ended;
                    break;
                }
            },
            recv(stderr) -> line => match line {
                Ok(line) => correlator.forward_output(line),
                Err(_) => stderr = never(),
            },
            recv(resolved) -> message => match message {
                Ok((id, emission)) => correlator.resolved(id, emission),
                Err(_) => resolved = never(),
            },
            recv(cancel_signal) -> _ => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                // Source dropped without cancelling; stop listening.
                cancel_signal = never();
            }
        }
        if correlator.ended {
            break;
        }
    }

    // Stop feeding the resolver, then let in-flight work settle.
    correlator.jobs.take();
    correlator.settle(&resolved_rx, Instant::now() + resolve_timeout, cancel);
    if cancel.is_cancelled() {
        return Ok(());
    }

    if interrupted {
        let code = process.exit().try_recv().ok();
        let text = match code {
            Some(code) => format!("test runner exited unexpectedly with code {code}"),
            None => "test runner output ended before the run completed".to_string(),
        };
        log::error!("{text}");
        correlator.with_sink(|sink| {
            sink.append_output(&text, None, None);
            sink.end();
        });
        return Ok(());
    }

    // Whatever the runner chose not to execute stays skipped, not failed.
    if !correlator.never_started.is_empty() {
        log::debug!("{} tests never started", correlator.never_started.len());
    }
    let leftover: Vec<FullyQualifiedName> = correlator.pending.keys().cloned().collect();
    correlator.with_sink(|sink| {
        for title in &leftover {
            sink.set_outcome(title, RunOutcome::Skipped);
        }
        sink.end();
    });
    Ok(())
}

// --- Run queue ---

/// A queued request: the pending-case snapshot taken at request time plus
/// the process whose output will be correlated.
pub struct RunRequest {
    pub pending: PendingMap,
    pub process: Box<dyn ProcessHandle>,
    pub cancel: CancellationToken,
}

/// Serializes run requests behind a single executor so only one run is ever
/// attached to live process output at a time.
pub struct RunQueue {
    requests: Option<Sender<RunRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl RunQueue {
    #[must_use]
    pub fn new(
        loader: Arc<dyn SourceMapLoader>,
        sink: SharedSink,
        resolve_timeout: Duration,
    ) -> Self {
        let (requests, rx) = unbounded::<RunRequest>();
        let worker = thread::spawn(move || {
            for request in rx {
                {
                    let mut sink = sink
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    for title in request.pending.keys() {
                        sink.set_outcome(title, RunOutcome::Queued);
                    }
                }
                if let Err(error) = correlate(
                    request.pending,
                    request.process.as_ref(),
                    Arc::clone(&loader),
                    &request.cancel,
                    &sink,
                    resolve_timeout,
                ) {
                    log::error!("run failed: {error}");
                }
            }
        });
        Self {
            requests: Some(requests),
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, request: RunRequest) -> Result<(), EngineError> {
        self.requests
            .as_ref()
            .ok_or(EngineError::RunQueueClosed)?
            .send(request)
            .map_err(|_| EngineError::RunQueueClosed)
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
