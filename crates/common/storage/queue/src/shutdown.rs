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

//! Snapshot-on-terminate.
//!
//! The host owns a [`SnapshotRegistry`] and registers the queues that should
//! survive a restart. [`ShutdownHook::install`] waits for Ctrl-C, SIGTERM or
//! an explicit trigger on a tokio task and then snapshots every registered
//! queue from the blocking pool. Signal delivery only wakes the task; queue
//! locks are taken the ordinary way.
//!
//! Tasks that push into registered queues hold a [`ProducerGuard`]. Once
//! shutdown starts the hook waits for every guard to be dropped before it
//! snapshots, so no push can land after its queue was saved.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{Queue, Result, error::InternalSnafu};

/// Queues to snapshot into `dir` when the process terminates.
#[derive(Debug)]
pub struct SnapshotRegistry {
    dir:    PathBuf,
    queues: Mutex<Vec<Arc<Queue>>>,
}

impl SnapshotRegistry {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir:    dir.into(),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn register(&self, queue: Arc<Queue>) {
        info!(queue = queue.name(), dir = ?self.dir, "Queue registered for snapshot on exit");
        self.queues.lock().push(queue);
    }

    pub fn len(&self) -> usize { self.queues.lock().len() }

    pub fn is_empty(&self) -> bool { self.queues.lock().is_empty() }

    /// Snapshots every registered queue.
    ///
    /// Each queue is attempted even if an earlier one fails; the first
    /// failure is returned. On success returns the number of snapshots
    /// written.
    pub fn on_terminate(&self) -> Result<usize> {
        let queues = self.queues.lock().clone();

        let mut saved = 0usize;
        let mut first_error = None;
        for queue in &queues {
            match queue.save_snapshot(&self.dir) {
                Ok(_) => saved += 1,
                Err(e) => {
                    error!(queue = queue.name(), error = %e, "Failed to snapshot queue on exit");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(saved, total = queues.len(), dir = ?self.dir, "Termination snapshots done");
        first_error.map_or(Ok(saved), Err)
    }
}

/// Keeps the hook from snapshotting while alive.
///
/// Hold one for as long as a task may still push, and stop pushing once
/// [`ShutdownHook::token`] is cancelled.
#[derive(Debug)]
pub struct ProducerGuard {
    _done: Option<mpsc::Sender<()>>,
}

/// Runs [`SnapshotRegistry::on_terminate`] once the process is asked to stop
/// and every [`ProducerGuard`] is gone.
pub struct ShutdownHook {
    token:     CancellationToken,
    producers: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    handle:    JoinHandle<Result<usize>>,
}

impl ShutdownHook {
    /// Spawns the waiting task. Must be called within a tokio runtime.
    pub fn install(registry: Arc<SnapshotRegistry>) -> Self {
        let token = CancellationToken::new();
        let waiter = token.clone();
        // Nothing is ever sent; `recv` returns `None` once every sender,
        // ours and the guards' clones, is dropped.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let producers = Arc::new(Mutex::new(Some(done_tx)));
        let slot = Arc::clone(&producers);

        let handle = tokio::spawn(async move {
            termination_signal(&waiter).await;
            waiter.cancel();

            slot.lock().take();
            info!("Waiting for producers to stop");
            let _ = done_rx.recv().await;

            tokio::task::spawn_blocking(move || registry.on_terminate())
                .await
                .map_err(|e| {
                    InternalSnafu {
                        message: format!("snapshot task failed: {e}"),
                    }
                    .build()
                })?
        });

        Self {
            token,
            producers,
            handle,
        }
    }

    /// Registers a task that pushes into registered queues.
    ///
    /// A guard taken after shutdown started does not delay the snapshots.
    pub fn producer(&self) -> ProducerGuard {
        let done = if self.token.is_cancelled() {
            None
        } else {
            self.producers.lock().clone()
        };
        ProducerGuard { _done: done }
    }

    /// Starts the shutdown sequence without a signal.
    pub fn trigger(&self) { self.token.cancel(); }

    /// Cancelled once shutdown starts, whether by signal or [`Self::trigger`].
    /// Cancelling a clone triggers the hook.
    pub fn token(&self) -> CancellationToken { self.token.clone() }

    /// Waits for the termination snapshots and returns how many were written.
    pub async fn wait(self) -> Result<usize> {
        self.handle.await.map_err(|e| {
            InternalSnafu {
                message: format!("shutdown hook task failed: {e}"),
            }
            .build()
        })?
    }
}

async fn termination_signal(token: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
        () = token.cancelled() => { info!("Shutdown triggered"); },
    }
}
