//! Timer-reset debouncing for live-edit change events.
//!
//! Re-scheduling a key pushes its deadline out; once a key's deadline
//! elapses without another reschedule it is delivered on the due channel.

use std::{
    collections::HashMap,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

enum Command {
    Schedule { key: String, delay: Duration },
    CancelAll,
}

pub struct Debouncer {
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Debouncer {
    /// Keys whose window elapsed are sent on `due`.
    #[must_use]
    pub fn new(due: Sender<String>) -> Self {
        let (commands, rx) = unbounded();
        let worker = thread::spawn(move || run(&rx, &due));
        Self {
            commands: Some(commands),
            worker: Some(worker),
        }
    }

    /// (Re)schedule `key`, resetting any pending deadline for it.
    pub fn schedule(&self, key: impl Into<String>, delay: Duration) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Schedule {
                key: key.into(),
                delay,
            });
        }
    }

    /// Drop every pending deadline without firing it.
    pub fn cancel_all(&self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::CancelAll);
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        // Closing the command channel stops the worker.
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(commands: &Receiver<Command>, due: &Sender<String>) {
    let mut deadlines: HashMap<String, Instant> = HashMap::new();
    loop {
        let next = deadlines.values().min().copied();
        let received = match next {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                commands.recv_timeout(timeout)
            }
            None => commands
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Command::Schedule { key, delay }) => {
                deadlines.insert(key, Instant::now() + delay);
            }
            Ok(Command::CancelAll) => deadlines.clear(),
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let fired: Vec<String> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in fired {
                    deadlines.remove(&key);
                    if due.send(key).is_err() {
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
