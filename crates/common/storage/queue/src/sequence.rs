// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-threaded task sequences.
//!
//! ## Architecture
//!
//! Every queue owns its mutable state on one dedicated thread. Callers post
//! closures through a crossbeam channel; the thread runs them one at a time
//! against the state, so no lock guards the queue's files.
//!
//! ```text
//! ┌──────────────┐     crossbeam      ┌──────────────────┐
//! │ SequenceHandle│ ──── channel ────► │ SequenceRunner   │ ── &mut S ──► task
//! │  (any thread) │                    │  (owns S)        │
//! └──────────────┘                    └──────────────────┘
//! ```
//!
//! Delayed tasks (timers) wait in a deadline heap on the runner thread. On
//! stop, queued and delayed tasks are dropped without running; whatever they
//! own is released on the runner thread before `on_stop` receives the state.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt, io,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

/// Work item run against the sequence state.
pub(crate) type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Command<S> {
    Run(Task<S>),
    RunAt(Instant, Task<S>),
    Stop,
}

/// Posts tasks to a sequence. Cheap to clone.
pub(crate) struct SequenceHandle<S> {
    tx: Sender<Command<S>>,
}

impl<S> Clone for SequenceHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> fmt::Debug for SequenceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl<S> SequenceHandle<S> {
    /// Queues `task`. Returns `false` (and drops the task) once the
    /// sequence has stopped.
    pub(crate) fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(Command::Run(Box::new(task))).is_ok()
    }

    /// Runs `task` no earlier than `delay` from now.
    pub(crate) fn post_delayed(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut S) + Send + 'static,
    ) -> bool {
        let deadline = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        self.tx.send(Command::RunAt(deadline, Box::new(task))).is_ok()
    }

    /// Asks the runner to stop after the task it is running.
    pub(crate) fn stop(&self) -> bool { self.tx.send(Command::Stop).is_ok() }
}

/// Receiving side of a sequence; owns nothing until spawned.
pub(crate) struct SequenceRunner<S> {
    rx: Receiver<Command<S>>,
}

/// Creates a sequence. Tasks posted before [`SequenceRunner::spawn`] wait
/// in the channel.
pub(crate) fn sequence<S: Send + 'static>() -> (SequenceHandle<S>, SequenceRunner<S>) {
    let (tx, rx) = channel::unbounded();
    (SequenceHandle { tx }, SequenceRunner { rx })
}

impl<S: Send + 'static> SequenceRunner<S> {
    /// Starts the runner thread with `state`; `on_stop` receives the state
    /// back once the sequence stops.
    pub(crate) fn spawn(
        self,
        name: impl Into<String>,
        state: S,
        on_stop: impl FnOnce(S) + Send + 'static,
    ) -> io::Result<JoinHandle<()>> {
        let name = name.into();
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(&name, state, on_stop))
    }

    fn run(self, name: &str, mut state: S, on_stop: impl FnOnce(S)) {
        debug!(sequence = name, "Sequence starting");

        let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
        let mut delayed: HashMap<u64, Task<S>> = HashMap::new();
        let mut next_timer = 0u64;

        loop {
            let now = Instant::now();
            while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                deadlines.pop();
                if let Some(task) = delayed.remove(&id) {
                    task(&mut state);
                }
            }

            let command = match deadlines.peek() {
                Some(Reverse((deadline, _))) => self
                    .rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self
                    .rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(Command::Run(task)) => task(&mut state),
                Ok(Command::RunAt(deadline, task)) => {
                    deadlines.push(Reverse((deadline, next_timer)));
                    delayed.insert(next_timer, task);
                    next_timer += 1;
                }
                Ok(Command::Stop) => {
                    debug!(sequence = name, "Sequence received stop");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(sequence = name, "Sequence channel disconnected");
                    break;
                }
            }
        }

        let dropped = delayed.len() + self.rx.len();
        drop(delayed);
        while self.rx.try_recv().is_ok() {}
        on_stop(state);

        info!(sequence = name, dropped, "Sequence stopped");
    }
}
