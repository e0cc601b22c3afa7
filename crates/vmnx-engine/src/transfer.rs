//! Upload/download transfer handlers (§4.E).
//!
//! A `Download` drains bytes arriving as `TransferData` info messages into a
//! sink; an `Upload` reads a source and emits `TransferData` messages,
//! paced by the shared `RateLimiter` with an adaptive bandwidth estimate.
//! Both raise the same event set: `Completed`, `Failed`, `Ended`,
//! `DataReceived`.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vmnx_core::{InfoUdpPayload, Message, MessageId};

use crate::rate_limiter::RateLimiter;

const EVENT_CHANNEL_CAPACITY: usize = 64;

const INITIAL_UPLOAD_BPS: f64 = 512.0;
const MIN_CHUNK_LEN: usize = 1;
const MAX_CHUNK_LEN: f64 = 1024.0 * 1024.0 * 1024.0; // 1 GiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Completed,
    Failed,
    Ended,
    DataReceived,
}

/// Final outcome delivered through a transfer's completion future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
}

/// Write-only destination for a `Download`. Blanket-implemented for
/// anything that already gives us seek+write (a file, an in-memory cursor).
pub trait TransferSink: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
}

impl<T: Write + Seek + Send> TransferSink for T {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }
}

/// Read-only source for an `Upload`. Blanket-implemented for anything
/// readable.
pub trait TransferSource: Send {
    fn read_chunk(&mut self, max_len: usize) -> std::io::Result<Vec<u8>>;
}

impl<T: Read + Send> TransferSource for T {
    fn read_chunk(&mut self, max_len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// A download in progress: feeds incoming `TransferData` bytes into a sink.
pub struct Download {
    id: MessageId,
    total_size: u64,
    bytes_received: AtomicU64,
    running: AtomicBool,
    sink: Mutex<Option<Box<dyn TransferSink>>>,
    events: broadcast::Sender<TransferEvent>,
    completion: Mutex<Option<oneshot::Sender<TransferOutcome>>>,
}

impl Download {
    pub fn new(
        id: MessageId,
        total_size: u64,
        sink: Box<dyn TransferSink>,
    ) -> (Arc<Self>, broadcast::Receiver<TransferEvent>, oneshot::Receiver<TransferOutcome>) {
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let download = Arc::new(Self {
            id,
            total_size,
            bytes_received: AtomicU64::new(0),
            running: AtomicBool::new(true),
            sink: Mutex::new(Some(sink)),
            events: events_tx,
            completion: Mutex::new(Some(done_tx)),
        });
        (download, events_rx, done_rx)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handle one arrived chunk (§4.E Download steps 1-4).
    pub fn receive_async(&self, data: &[u8], offset: u64) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let write_result = {
            let mut guard = self.sink.lock().unwrap();
            match guard.as_mut() {
                Some(sink) => sink.write_at(offset, data),
                None => return,
            }
        };

        if let Err(err) = write_result {
            tracing::warn!(download_id = %self.id, %err, "download sink write failed");
            self.finish(TransferOutcome::Failed, TransferEvent::Failed);
            return;
        }

        let received = self.bytes_received.fetch_add(data.len() as u64, Ordering::SeqCst)
            + data.len() as u64;

        if received >= self.total_size {
            self.finish(TransferOutcome::Completed, TransferEvent::Completed);
        } else {
            let _ = self.events.send(TransferEvent::DataReceived);
        }
    }

    fn finish(&self, outcome: TransferOutcome, event: TransferEvent) {
        self.running.store(false, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
        if let Some(tx) = self.completion.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
        let _ = self.events.send(event);
        let _ = self.events.send(TransferEvent::Ended);
    }
}

/// An upload in progress: reads a source and emits paced `TransferData`
/// info messages addressed to `id`.
pub struct Upload {
    id: MessageId,
    source: Mutex<Option<Box<dyn TransferSource>>>,
    events: broadcast::Sender<TransferEvent>,
    cancel: CancellationToken,
}

impl Upload {
    pub fn new(
        id: MessageId,
        source: Box<dyn TransferSource>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, broadcast::Receiver<TransferEvent>) {
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let upload = Arc::new(Self {
            id,
            source: Mutex::new(Some(source)),
            events: events_tx,
            cancel,
        });
        (upload, events_rx)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Spawn the background pacing loop (§4.E "Start").
    pub fn start(self: Arc<Self>, limiter: Arc<RateLimiter>, outbound: mpsc::UnboundedSender<Message>) {
        tokio::spawn(async move {
            self.run(limiter, outbound).await;
        });
    }

    async fn run(self: Arc<Self>, limiter: Arc<RateLimiter>, outbound: mpsc::UnboundedSender<Message>) {
        let mut upload_bps = INITIAL_UPLOAD_BPS;
        let mut offset: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                self.finish(TransferEvent::Failed);
                return;
            }

            let chunk_len = (upload_bps.ceil() as usize).clamp(MIN_CHUNK_LEN, MAX_CHUNK_LEN as usize);

            let read_start = tokio::time::Instant::now();
            let chunk = {
                let mut guard = self.source.lock().unwrap();
                match guard.as_mut() {
                    Some(source) => source.read_chunk(chunk_len),
                    None => return,
                }
            };
            let read_seconds = read_start.elapsed().as_secs_f64().max(f64::EPSILON);

            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(upload_id = %self.id, %err, "upload source read failed");
                    self.finish(TransferEvent::Failed);
                    return;
                }
            };

            if chunk.is_empty() {
                self.source.lock().unwrap().take();
                self.finish(TransferEvent::Completed);
                return;
            }

            let wait_start = tokio::time::Instant::now();
            limiter.acquire(chunk.len() as f64).await;
            let upload_seconds = wait_start.elapsed().as_secs_f64().max(f64::EPSILON);

            let msg = Message::new_info_udp(InfoUdpPayload::TransferData {
                stream_id: self.id,
                offset,
                bytes: chunk.clone(),
            });
            if outbound.send(msg).is_err() {
                self.finish(TransferEvent::Failed);
                return;
            }
            let _ = self.events.send(TransferEvent::DataReceived);
            offset += chunk.len() as u64;

            let read_bps = chunk.len() as f64 / read_seconds;
            upload_bps = if read_bps > upload_bps && upload_seconds < 1.0 {
                upload_bps * (1.0 + 100.0 / upload_bps.sqrt())
            } else {
                upload_bps * (1.0 / upload_seconds)
            }
            .clamp(MIN_CHUNK_LEN as f64, MAX_CHUNK_LEN);
        }
    }

    fn finish(&self, event: TransferEvent) {
        self.source.lock().unwrap().take();
        let _ = self.events.send(event);
        let _ = self.events.send(TransferEvent::Ended);
    }
}

/// A transfer registered with the engine, either direction.
#[derive(Clone)]
pub enum TransferHandle {
    Upload(Arc<Upload>),
    Download(Arc<Download>),
}

impl TransferHandle {
    pub fn id(&self) -> MessageId {
        match self {
            TransferHandle::Upload(u) => u.id(),
            TransferHandle::Download(d) => d.id(),
        }
    }
}

/// Concurrent table of in-flight transfers, keyed by handler id (§3).
/// Entries are removed automatically once they signal `Ended`.
pub struct TransferTable {
    entries: DashMap<MessageId, TransferHandle>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(
        self: &Arc<Self>,
        handle: TransferHandle,
        mut events: broadcast::Receiver<TransferEvent>,
    ) {
        let id = handle.id();
        self.entries.insert(id, handle);
        let table = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event == TransferEvent::Ended {
                    table.entries.remove(&id);
                    break;
                }
            }
        });
    }

    pub fn get(&self, id: MessageId) -> Option<TransferHandle> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// Number of transfers currently in flight, for the status endpoint.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}
