// Copyright 2026 Daniel Pelikan
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

//! Accept and connect workers.
//!
//! Each worker runs one socket operation on its own task and reports the
//! result to the manager queue. Cancelling a worker drops its socket, which
//! aborts the pending call; a cancelled worker reports nothing.

use bluer::Address;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::platform::Platform;
use crate::events::{WorkerEvent, WorkerId};

fn socket_type(secure: bool) -> &'static str {
    if secure {
        "Secure"
    } else {
        "Insecure"
    }
}

/// Handle to a running accept or connect worker.
pub(crate) struct WorkerHandle {
    id: WorkerId,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Signal the worker to close its socket and exit quietly.
    pub(crate) fn cancel(mut self) {
        debug!("Cancelling worker {}", self.id);
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// The worker task has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// One-shot outgoing connection attempt.
pub(crate) struct ConnectWorker;

impl ConnectWorker {
    pub(crate) fn spawn(
        id: WorkerId,
        platform: Arc<dyn Platform>,
        address: Address,
        secure: bool,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> WorkerHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            info!(
                "BEGIN connect {} to {} (Socket Type: {})",
                id,
                address,
                socket_type(secure)
            );

            let event = tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("Connect {} cancelled", id);
                    return;
                }
                result = platform.connect(address, secure) => match result {
                    Ok(stream) => WorkerEvent::Connected { worker: id, stream, address },
                    Err(error) => {
                        error!("Connect to {} failed: {}", address, error);
                        WorkerEvent::ConnectFailed { worker: id, error }
                    }
                },
            };

            if event_tx.send(event).await.is_err() {
                debug!("Manager gone, dropping connect result");
            }
        });

        WorkerHandle {
            id,
            cancel: Some(cancel_tx),
            task,
        }
    }
}

/// Accept loop on a listening socket.
pub(crate) struct AcceptWorker;

impl AcceptWorker {
    pub(crate) fn spawn(
        id: WorkerId,
        platform: Arc<dyn Platform>,
        secure: bool,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> WorkerHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let kind = socket_type(secure);

            let mut listener = tokio::select! {
                _ = &mut cancel_rx => return,
                result = platform.listen(secure) => match result {
                    Ok(listener) => listener,
                    Err(error) => {
                        error!("Socket Type: {} listen() failed: {}", kind, error);
                        let _ = event_tx.send(WorkerEvent::AcceptFailed { worker: id, error }).await;
                        return;
                    }
                },
            };

            info!("BEGIN accept {} (Socket Type: {})", id, kind);

            loop {
                let event = tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Accept {} cancelled", id);
                        break;
                    }
                    result = listener.accept() => match result {
                        Ok((stream, address)) => {
                            info!("Connection from: {}", address);
                            WorkerEvent::Accepted { worker: id, stream, address }
                        }
                        Err(error) => {
                            warn!("Socket Type: {} accept() failed: {}", kind, error);
                            let _ = event_tx.send(WorkerEvent::AcceptFailed { worker: id, error }).await;
                            break;
                        }
                    },
                };

                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            info!("END accept {} (Socket Type: {})", id, kind);
        });

        WorkerHandle {
            id,
            cancel: Some(cancel_tx),
            task,
        }
    }
}
