// Copyright 2026 the vakt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The fixed worker pool.
//!
//! Workers execute complete request handlers, including the blocking wait
//! on the engine reply condvar, so the reactor never does. The queue is
//! bounded;
//! when it is full the reactor falls back to running the handler inline,
//! which degrades latency but never drops a request. A panicking handler
//! fails only its own request; the thread survives.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};
use mio::Waker;
use tracing::{debug, error, warn};

use crate::conn::Conn;
use crate::services::Services;
use crate::ws::WsConn;

/// A unit of work for the pool.
#[derive(Debug)]
pub enum Task {
    /// A staged HTTP request on a dispatched connection.
    Http(Arc<Conn>),
    /// One complete WebSocket text message.
    Ws {
        /// The hub connection the reply frame goes back to.
        conn: Arc<WsConn>,
        /// The reassembled message payload.
        text: String,
    },
}

/// Context shared by all workers.
#[derive(Debug)]
pub struct WorkerCtx {
    /// The service bundle.
    pub services: Arc<Services>,
    /// Tokens of connections whose response is ready to drain.
    pub done_tx: Sender<usize>,
    /// Wakes the reactor out of its poll when a completion is queued.
    pub waker: Arc<Waker>,
}

impl WorkerCtx {
    /// Flags `token`'s connection as ready for the reactor and wakes it.
    pub fn notify_reactor(&self, token: usize) {
        if self.done_tx.send(token).is_ok() {
            if let Err(e) = self.waker.wake() {
                warn!(err = %e, "reactor waker failed");
            }
        }
    }
}

/// Fixed-size pool over a bounded FIFO queue.
#[derive(Debug)]
pub struct WorkerPool {
    tx: Sender<Task>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads draining a queue of `queue_cap` tasks.
    pub fn new(workers: usize, queue_cap: usize, ctx: Arc<WorkerCtx>) -> Self {
        let (tx, rx) = bounded::<Task>(queue_cap);
        let mut handles = Vec::with_capacity(workers);

        for i in 0..workers {
            let rx = rx.clone();
            let ctx = Arc::clone(&ctx);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        run_task(&ctx, task);
                    }
                    debug!(worker = i, "worker exiting");
                })
                .expect("spawning worker thread");
            handles.push(handle);
        }

        Self { tx, handles }
    }

    /// Non-blocking submit. A full queue hands the task back so the caller
    /// can run it inline.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
        }
    }

    /// Tasks currently queued (observability).
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Waits up to `deadline` for the queue to drain, then closes it and
    /// joins every worker.
    pub fn shutdown(self, deadline: Duration) {
        let until = Instant::now() + deadline;
        while !self.tx.is_empty() && Instant::now() < until {
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Executes one task with panic containment.
pub fn run_task(ctx: &WorkerCtx, task: Task) {
    ctx.services.stats.worker_busy();
    match task {
        Task::Http(conn) => {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                crate::router::handle_dispatched(ctx, &conn)
            }));
            if let Err(panic) = outcome {
                error!(panic = %panic_text(&panic), "handler panicked; request fails with 500");
                crate::router::fail_dispatched(ctx, &conn);
            }
        }
        Task::Ws { conn, text } => {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                crate::ws::handle_message(ctx, &conn, &text)
            }));
            if let Err(panic) = outcome {
                error!(panic = %panic_text(&panic), "ws handler panicked; message dropped");
            }
        }
    }
    ctx.services.stats.worker_idle();
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_owned())
}
