//! File transfer queue: one supervised worker per file-channel socket.
//!
//! Enqueue calls record items; a single worker task drains them in id order
//! and performs one whole-buffer write per file. The queue never owns its
//! socket: it borrows the current live handle through a [`SocketProvider`]
//! on every attempt, so the channel can be closed or replaced underneath it
//! and the next attempt simply picks up the new handle (or fails cleanly).
//!
//! Canceling an item that is mid-write closes the socket through the
//! provider; that is the only portable way to abort a large in-flight write,
//! and it is why the owning side must re-establish the file channel after a
//! cancel (see the client's reconnect path).

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::message::FileMessage;

/// Returns the current live transport handle for the queue's channel, or
/// `None` once the channel is gone. Implementations hold a `Weak` reference
/// so the queue never keeps a closed socket alive.
pub type SocketProvider = Arc<dyn Fn() -> Option<Arc<Conn>> + Send + Sync>;

/// Pacing sleep after a completed attempt.
const SEND_PACING: Duration = Duration::from_millis(20);
/// Backoff after a failed message build (unreadable path).
const BUILD_FAILURE_BACKOFF: Duration = Duration::from_millis(100);
/// Backoff while the channel has no live socket.
const NO_SOCKET_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Sending,
    Done,
    Failed,
    Canceled,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransferState::Queued => "queued",
            TransferState::Sending => "sending",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
            TransferState::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

#[derive(Clone)]
enum Source {
    Path(PathBuf),
    Bytes { name: String, data: Vec<u8> },
    Message(Arc<FileMessage>),
}

impl Source {
    fn label(&self) -> String {
        match self {
            Source::Path(path) => path.display().to_string(),
            Source::Bytes { name, .. } => name.clone(),
            Source::Message(message) => message.name.clone(),
        }
    }
}

struct Item {
    id: u64,
    source: Source,
    state: TransferState,
    retries: u32,
    last_error: String,
    message: Option<Arc<FileMessage>>,
}

/// Consistent copy of one item's user-visible fields.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub id: u64,
    pub label: String,
    pub state: TransferState,
    pub retries: u32,
    pub last_error: String,
    pub message_cached: bool,
}

struct QueueState {
    next_id: u64,
    items: Vec<Item>,
}

struct QueueInner {
    provider: SocketProvider,
    state: Mutex<QueueState>,
    wake: Notify,
    abort_send: Notify,
    running: AtomicBool,
    paused: AtomicBool,
}

pub struct FileTransferQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileTransferQueue {
    /// Creates the queue and spawns its worker task. Must be called from
    /// within a tokio runtime.
    pub fn new(provider: SocketProvider) -> Self {
        let inner = Arc::new(QueueInner {
            provider,
            state: Mutex::new(QueueState {
                next_id: 1,
                items: Vec::new(),
            }),
            wake: Notify::new(),
            abort_send: Notify::new(),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
        });
        let worker = tokio::spawn(worker_loop(Arc::clone(&inner)));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a file by path. Returns the new id, or 0 if the path does
    /// not name a regular file.
    pub fn enqueue_path(&self, path: PathBuf) -> u64 {
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            _ => {
                warn!(path = %path.display(), "refusing to enqueue: not a regular file");
                return 0;
            }
        }
        self.push(Source::Path(path))
    }

    /// Enqueues in-memory bytes under a file name. Returns 0 for an empty
    /// payload.
    pub fn enqueue_bytes(&self, name: impl Into<String>, data: Vec<u8>) -> u64 {
        if data.is_empty() {
            warn!("refusing to enqueue: empty byte payload");
            return 0;
        }
        self.push(Source::Bytes {
            name: name.into(),
            data,
        })
    }

    /// Enqueues a prebuilt file message (broker fan-out, history replay).
    pub fn enqueue_message(&self, message: Arc<FileMessage>) -> u64 {
        self.push(Source::Message(message))
    }

    fn push(&self, source: Source) -> u64 {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.items.push(Item {
                id,
                source,
                state: TransferState::Queued,
                retries: 0,
                last_error: String::new(),
                message: None,
            });
            id
        };
        self.inner.wake.notify_one();
        id
    }

    /// Drops an item from the queue. A `Sending` item cannot be removed.
    pub fn remove(&self, id: u64) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.items.iter().position(|item| item.id == id) {
            Some(index) if state.items[index].state != TransferState::Sending => {
                state.items.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Re-queues a failed item: state back to `Queued`, retry counter
    /// bumped, cached message cleared so it is rebuilt from its source.
    pub fn retry(&self, id: u64) -> bool {
        let retried = {
            let mut state = self.inner.state.lock().unwrap();
            match state.items.iter_mut().find(|item| item.id == id) {
                Some(item) if item.state == TransferState::Failed => {
                    item.state = TransferState::Queued;
                    item.retries += 1;
                    item.last_error.clear();
                    item.message = None;
                    true
                }
                _ => false,
            }
        };
        if retried {
            self.inner.wake.notify_one();
        }
        retried
    }

    /// Cancels one item. If it was mid-send, the socket is closed to abort
    /// the in-flight write; the channel owner must reconnect afterwards.
    pub fn cancel(&self, id: u64) -> bool {
        let canceled_sending = {
            let mut state = self.inner.state.lock().unwrap();
            match state.items.iter_mut().find(|item| item.id == id) {
                Some(item)
                    if matches!(
                        item.state,
                        TransferState::Queued | TransferState::Sending | TransferState::Failed
                    ) =>
                {
                    let was_sending = item.state == TransferState::Sending;
                    item.state = TransferState::Canceled;
                    item.last_error = "canceled by user".into();
                    Some(was_sending)
                }
                _ => None,
            }
        };
        match canceled_sending {
            Some(true) => {
                if let Some(conn) = (self.inner.provider)() {
                    conn.close();
                }
                self.inner.wake.notify_one();
                true
            }
            Some(false) => {
                self.inner.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Cancels every non-terminal item and closes the socket once.
    pub fn cancel_all(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            for item in &mut state.items {
                if matches!(
                    item.state,
                    TransferState::Queued | TransferState::Sending | TransferState::Failed
                ) {
                    item.state = TransferState::Canceled;
                    item.last_error = "canceled by user".into();
                }
            }
        }
        if let Some(conn) = (self.inner.provider)() {
            conn.close();
        }
        self.inner.wake.notify_one();
    }

    /// Stops the worker from picking new items; the in-flight item runs to
    /// completion or error.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Copies every item's user-visible fields under one lock acquisition,
    /// so `state` and `last_error` are never torn.
    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        let state = self.inner.state.lock().unwrap();
        state
            .items
            .iter()
            .map(|item| TransferSnapshot {
                id: item.id,
                label: item.source.label(),
                state: item.state,
                retries: item.retries,
                last_error: item.last_error.clone(),
                message_cached: item.message.is_some(),
            })
            .collect()
    }

    /// Signals shutdown and joins the worker. Idempotent.
    pub async fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.abort_send.notify_waiters();
            self.inner.wake.notify_one();
        }
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for FileTransferQueue {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.abort_send.notify_waiters();
        self.inner.wake.notify_one();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// One item claimed for sending: its id plus what is needed to build the
/// frame outside the lock.
struct Claimed {
    id: u64,
    source: Source,
    cached: Option<Arc<FileMessage>>,
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let wake = inner.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        let claimed = if inner.paused.load(Ordering::SeqCst) {
            None
        } else {
            claim_next(&inner)
        };

        match claimed {
            Some(claimed) => {
                let pacing = process(&inner, claimed).await;
                tokio::time::sleep(pacing).await;
            }
            None => wake.await,
        }
    }
    debug!("file transfer worker stopped");
}

/// Marks the first queued item `Sending` and returns what the attempt needs.
fn claim_next(inner: &QueueInner) -> Option<Claimed> {
    let mut state = inner.state.lock().unwrap();
    let item = state
        .items
        .iter_mut()
        .find(|item| item.state == TransferState::Queued)?;
    item.state = TransferState::Sending;
    item.last_error.clear();
    Some(Claimed {
        id: item.id,
        source: item.source.clone(),
        cached: item.message.clone(),
    })
}

async fn process(inner: &Arc<QueueInner>, claimed: Claimed) -> Duration {
    let Claimed { id, source, cached } = claimed;

    let message = match cached {
        Some(message) => message,
        None => match build_message(&source).await {
            Ok(message) => {
                let mut state = inner.state.lock().unwrap();
                if let Some(item) = state.items.iter_mut().find(|item| item.id == id) {
                    item.message = Some(Arc::clone(&message));
                }
                message
            }
            Err(err) => {
                let mut state = inner.state.lock().unwrap();
                if let Some(item) = state.items.iter_mut().find(|item| item.id == id)
                    && item.state != TransferState::Canceled
                {
                    item.state = TransferState::Failed;
                    item.last_error = format!("failed to build file message: {err}");
                    warn!(id, error = %err, "file message build failed");
                }
                return BUILD_FAILURE_BACKOFF;
            }
        },
    };

    // Canceled while the message was being built: leave it canceled.
    {
        let state = inner.state.lock().unwrap();
        match state.items.iter().find(|item| item.id == id) {
            Some(item) if item.state == TransferState::Canceled => return SEND_PACING,
            Some(_) => {}
            None => return SEND_PACING,
        }
    }

    let frame = message.encode();

    let Some(conn) = (inner.provider)().filter(|conn| conn.is_open()) else {
        let mut state = inner.state.lock().unwrap();
        if let Some(item) = state.items.iter_mut().find(|item| item.id == id)
            && item.state != TransferState::Canceled
        {
            item.state = TransferState::Failed;
            item.last_error = "socket not connected".into();
            item.retries += 1;
        }
        return NO_SOCKET_BACKOFF;
    };

    let send_result = {
        let aborted = inner.abort_send.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();
        if !inner.running.load(Ordering::SeqCst) {
            Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "operation aborted",
            ))
        } else {
            tokio::select! {
                res = conn.send(&frame) => res,
                _ = &mut aborted => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "operation aborted",
                )),
            }
        }
    };

    let mut state = inner.state.lock().unwrap();
    let Some(item) = state.items.iter_mut().find(|item| item.id == id) else {
        return SEND_PACING;
    };
    if item.state == TransferState::Canceled {
        // The user canceled mid-write and the socket close surfaced as a
        // send error; the cancellation wins.
        if item.last_error.is_empty() {
            item.last_error = "canceled by user".into();
        }
    } else if let Err(err) = send_result {
        item.state = TransferState::Failed;
        item.last_error = err.to_string();
        item.retries += 1;
        warn!(id, error = %err, "file send failed");
    } else {
        item.state = TransferState::Done;
        item.last_error.clear();
    }
    SEND_PACING
}

async fn build_message(source: &Source) -> io::Result<Arc<FileMessage>> {
    match source {
        Source::Path(path) => FileMessage::from_path(path).await.map(Arc::new),
        Source::Bytes { name, data } => Ok(Arc::new(FileMessage {
            name: name.clone(),
            data: data.clone(),
        })),
        Source::Message(message) => Ok(Arc::clone(message)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    use crate::message::{HEADER_LEN, Message};

    use super::*;

    fn dead_provider() -> SocketProvider {
        Arc::new(|| None)
    }

    async fn connected_provider() -> (SocketProvider, Arc<Conn>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (accepted, _) = listener.accept().await.expect("accept");
        let remote = connect.await.expect("join").expect("connect");
        let (conn, _reader) = Conn::new(1, accepted).expect("conn");
        let weak = Arc::downgrade(&conn);
        let provider: SocketProvider = Arc::new(move || weak.upgrade());
        (provider, conn, remote)
    }

    async fn wait_for_state(
        queue: &FileTransferQueue,
        id: u64,
        state: TransferState,
    ) -> TransferSnapshot {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(snapshot) = queue.snapshot().into_iter().find(|s| s.id == id)
                    && snapshot.state == state
                {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("item {id} never reached {state:?}"))
    }

    async fn read_file_frame(remote: &mut TcpStream) -> FileMessage {
        let mut header = [0u8; HEADER_LEN];
        remote.read_exact(&mut header).await.expect("read header");
        let kind = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let len = u64::from_be_bytes(header[4..12].try_into().unwrap());
        let mut payload = vec![0u8; len as usize];
        remote.read_exact(&mut payload).await.expect("read payload");
        match Message::decode(kind, &payload).expect("decode") {
            Message::File(file) => file,
            other => panic!("expected file frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_from_one() {
        let queue = FileTransferQueue::new(dead_provider());
        queue.pause();
        let a = queue.enqueue_bytes("a", vec![1]);
        let b = queue.enqueue_bytes("b", vec![2]);
        let c = queue.enqueue_message(Arc::new(FileMessage {
            name: "c".into(),
            data: vec![3],
        }));
        assert_eq!((a, b, c), (1, 2, 3));
        queue.stop().await;
    }

    #[tokio::test]
    async fn invalid_enqueues_return_the_zero_sentinel() {
        let queue = FileTransferQueue::new(dead_provider());
        queue.pause();
        assert_eq!(queue.enqueue_bytes("empty", Vec::new()), 0);
        assert_eq!(
            queue.enqueue_path(PathBuf::from("/definitely/not/a/real/file")),
            0
        );
        assert!(queue.snapshot().is_empty());
        queue.stop().await;
    }

    #[tokio::test]
    async fn missing_socket_fails_the_item_and_retry_requeues_it() {
        let queue = FileTransferQueue::new(dead_provider());
        queue.pause();

        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), b"payload").expect("write temp");
        let id = queue.enqueue_path(file.path().to_path_buf());
        assert!(id > 0);

        queue.resume();
        let failed = wait_for_state(&queue, id, TransferState::Failed).await;
        assert_eq!(failed.last_error, "socket not connected");
        assert_eq!(failed.retries, 1);
        assert!(failed.message_cached);

        queue.pause();
        assert!(queue.retry(id));
        let requeued = queue
            .snapshot()
            .into_iter()
            .find(|s| s.id == id)
            .expect("item present");
        assert_eq!(requeued.state, TransferState::Queued);
        assert_eq!(requeued.retries, 2);
        assert!(requeued.last_error.is_empty());
        assert!(!requeued.message_cached);

        queue.stop().await;
    }

    #[tokio::test]
    async fn items_send_in_id_order_and_reach_done() {
        let (provider, _conn, mut remote) = connected_provider().await;
        let queue = FileTransferQueue::new(provider);
        queue.pause();
        let first = queue.enqueue_bytes("first.bin", vec![1; 32]);
        let second = queue.enqueue_bytes("second.bin", vec![2; 32]);
        queue.resume();

        let got_first = read_file_frame(&mut remote).await;
        let got_second = read_file_frame(&mut remote).await;
        assert_eq!(got_first.name, "first.bin");
        assert_eq!(got_second.name, "second.bin");

        wait_for_state(&queue, first, TransferState::Done).await;
        wait_for_state(&queue, second, TransferState::Done).await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn at_most_one_item_is_sending() {
        let (provider, _conn, mut remote) = connected_provider().await;
        let queue = FileTransferQueue::new(provider);
        for i in 0..8 {
            queue.enqueue_bytes(format!("f{i}"), vec![0; 1024]);
        }

        let observer = tokio::spawn(async move {
            let mut drained = Vec::new();
            for _ in 0..8 {
                drained.push(read_file_frame(&mut remote).await);
            }
            drained
        });

        for _ in 0..50 {
            let sending = queue
                .snapshot()
                .iter()
                .filter(|s| s.state == TransferState::Sending)
                .count();
            assert!(sending <= 1, "snapshot saw {sending} items sending");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let drained = timeout(Duration::from_secs(5), observer)
            .await
            .expect("drained")
            .expect("join");
        assert_eq!(drained.len(), 8);
        queue.stop().await;
    }

    #[tokio::test]
    async fn canceling_a_queued_item_keeps_it_canceled() {
        let queue = FileTransferQueue::new(dead_provider());
        queue.pause();
        let id = queue.enqueue_bytes("doomed", vec![1, 2, 3]);
        assert!(queue.cancel(id));
        queue.resume();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = queue
            .snapshot()
            .into_iter()
            .find(|s| s.id == id)
            .expect("item present");
        assert_eq!(snapshot.state, TransferState::Canceled);
        assert_eq!(snapshot.last_error, "canceled by user");

        // Canceled items are terminal for retry.
        assert!(!queue.retry(id));
        queue.stop().await;
    }

    #[tokio::test]
    async fn done_items_cannot_be_canceled_or_retried() {
        let (provider, _conn, mut remote) = connected_provider().await;
        let queue = FileTransferQueue::new(provider);
        let id = queue.enqueue_bytes("ok.bin", vec![7; 16]);
        read_file_frame(&mut remote).await;
        wait_for_state(&queue, id, TransferState::Done).await;

        assert!(!queue.cancel(id));
        assert!(!queue.retry(id));
        assert_eq!(
            queue.snapshot()[0].state,
            TransferState::Done,
            "done is terminal"
        );
        queue.stop().await;
    }

    #[tokio::test]
    async fn remove_drops_everything_but_a_sending_item() {
        let queue = FileTransferQueue::new(dead_provider());
        queue.pause();
        let id = queue.enqueue_bytes("x", vec![1]);
        assert!(queue.remove(id));
        assert!(queue.snapshot().is_empty());
        assert!(!queue.remove(id));
        queue.stop().await;
    }
}
