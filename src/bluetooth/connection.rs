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

//! I/O worker for an established connection.

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::platform::SerialStream;
use crate::error::SerialError;
use crate::events::{WorkerEvent, WorkerId};

type WriteReply = oneshot::Sender<Result<(), SerialError>>;

/// A queued write.
///
/// Dropped unanswered, for example when the writer is aborted mid-write or
/// the queue is discarded, it answers `WriteFailed`.
struct PendingWrite {
    data: Vec<u8>,
    reply: Option<WriteReply>,
}

impl PendingWrite {
    fn answer(mut self, result: Result<(), SerialError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(SerialError::WriteFailed(
                "connection closed before the write completed".to_string(),
            )));
        }
    }
}

/// Reader and writer tasks for one connected socket.
///
/// The reader forwards every chunk to the manager queue in read order and
/// reports connection loss once. Writes are queued to the writer task so the
/// manager never waits on the transport.
pub(crate) struct IoWorker {
    id: WorkerId,
    cancel: Option<oneshot::Sender<()>>,
    write_tx: mpsc::UnboundedSender<PendingWrite>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl IoWorker {
    pub(crate) fn spawn(
        id: WorkerId,
        stream: SerialStream,
        chunk_size: usize,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        info!("BEGIN io worker {}", id);

        let (reader_half, writer_half) = tokio::io::split(stream);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            id,
            reader_half,
            chunk_size.max(1),
            cancel_rx,
            event_tx,
        ));
        let writer = tokio::spawn(write_loop(id, writer_half, write_rx));

        Self {
            id,
            cancel: Some(cancel_tx),
            write_tx,
            reader,
            writer,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Queue `data` for writing. The outcome is sent on `reply`.
    pub(crate) fn write(&self, data: Vec<u8>, reply: WriteReply) {
        let request = PendingWrite {
            data,
            reply: Some(reply),
        };
        if let Err(mpsc::error::SendError(request)) = self.write_tx.send(request) {
            request.answer(Err(SerialError::NotConnected));
        }
    }

    /// Stop both tasks and wait for them to release the socket.
    ///
    /// Writes still queued or in progress fail with `WriteFailed`.
    pub(crate) async fn shutdown(mut self) {
        debug!("Stopping io worker {}", self.id);
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        // A write may be stuck in the transport.
        self.writer.abort();

        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

async fn read_loop(
    id: WorkerId,
    mut reader: ReadHalf<SerialStream>,
    chunk_size: usize,
    mut cancel_rx: oneshot::Receiver<()>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    let mut buf = vec![0u8; chunk_size];

    loop {
        let read = tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Reader {} cancelled", id);
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        let event = match read {
            Ok(0) => {
                info!("Connection {} closed by remote", id);
                WorkerEvent::ConnectionLost {
                    worker: id,
                    error: io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"),
                }
            }
            Ok(n) => {
                debug!("Received {} bytes on {}", n, id);
                WorkerEvent::Data {
                    worker: id,
                    bytes: buf[..n].to_vec(),
                }
            }
            Err(error) => {
                error!("Read error on {}: {}", id, error);
                WorkerEvent::ConnectionLost { worker: id, error }
            }
        };
        let lost = matches!(event, WorkerEvent::ConnectionLost { .. });

        tokio::select! {
            _ = &mut cancel_rx => return,
            sent = event_tx.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        if lost {
            return;
        }
    }
}

async fn write_loop(
    id: WorkerId,
    mut writer: WriteHalf<SerialStream>,
    mut write_rx: mpsc::UnboundedReceiver<PendingWrite>,
) {
    while let Some(request) = write_rx.recv().await {
        let result = async {
            writer.write_all(&request.data).await?;
            writer.flush().await
        }
        .await;

        let result = result.map_err(|e| {
            error!("Exception during write on {}: {}", id, e);
            SerialError::WriteFailed(e.to_string())
        });
        request.answer(result);
    }
    debug!("Writer {} finished", id);
}
