//! Broker: dual acceptors, client registries, broadcast fan-out, bounded
//! history, and per-file-socket transfer queues.
//!
//! Each accepted socket gets a [`Conn`] handle, a registry slot for its
//! channel kind, and a framed receive task. Text frames are re-formatted
//! and broadcast to every other text client; file frames fan out through
//! each peer's transfer queue so a slow bulk transfer never blocks the
//! receive loop. A `SendHistory` request replays the bounded log to the
//! requesting client, pairing its text and file channels by
//! `(remote ip, file-channel remote port)`.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::framed::FramedConnection;
use crate::ftq::{FileTransferQueue, SocketProvider};
use crate::history::{DEFAULT_MAX_HISTORY, HistoryEntry, HistoryLog};
use crate::message::{DEFAULT_MAX_FRAME_BYTES, FileMessage, Message, MessageKind};

pub const BEGIN_HISTORY_MARKER: &str = "--- Begin Message History ---";
pub const END_HISTORY_MARKER: &str = "--- End Message History ---";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_ip: IpAddr,
    pub text_port: u16,
    pub file_port: u16,
    pub max_history: usize,
    pub max_frame_bytes: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            text_port: 5555,
            file_port: 5556,
            max_history: DEFAULT_MAX_HISTORY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Text,
    File,
}

impl ChannelKind {
    fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::File => "file",
        }
    }
}

pub struct Broker {
    text_listener: TcpListener,
    file_listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    /// Binds both channel listeners. A failure here is unrecoverable and
    /// should exit the process with a non-zero code.
    pub async fn bind(config: &BrokerConfig) -> Result<Self> {
        let text_listener = TcpListener::bind((config.bind_ip, config.text_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind text channel on {}:{}",
                    config.bind_ip, config.text_port
                )
            })?;
        let file_listener = TcpListener::bind((config.bind_ip, config.file_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind file channel on {}:{}",
                    config.bind_ip, config.file_port
                )
            })?;
        Ok(Self {
            text_listener,
            file_listener,
            state: Arc::new(BrokerState::new(config)),
        })
    }

    pub fn local_text_addr(&self) -> io::Result<SocketAddr> {
        self.text_listener.local_addr()
    }

    pub fn local_file_addr(&self) -> io::Result<SocketAddr> {
        self.file_listener.local_addr()
    }

    /// Serves until `shutdown` resolves, then tears everything down in
    /// order: acceptors first, then transfer queues, then client sockets.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker {
            text_listener,
            file_listener,
            state,
        } = self;
        state.status_up.store(true, Ordering::SeqCst);
        let text_addr = text_listener.local_addr()?;
        let file_addr = file_listener.local_addr()?;
        info!(text = %text_addr, file = %file_addr, "broker listening");

        let text_framed = Arc::new(build_text_framed(&state));
        let file_framed = Arc::new(build_file_framed(&state));

        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
                accept = text_listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        accept_client(&state, &text_framed, ChannelKind::Text, stream, peer).await;
                    }
                    Err(err) => warn!(error = ?err, "failed to accept text connection"),
                },
                accept = file_listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        accept_client(&state, &file_framed, ChannelKind::File, stream, peer).await;
                    }
                    Err(err) => warn!(error = ?err, "failed to accept file connection"),
                },
            }
        }

        // Dropping the listeners closes both acceptors before any client
        // teardown, so no new connection can race the shutdown.
        drop(text_listener);
        drop(file_listener);
        state.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct BrokerState {
    max_frame_bytes: u64,
    history: HistoryLog,
    text_clients: tokio::sync::Mutex<Vec<Arc<Conn>>>,
    file_clients: tokio::sync::Mutex<Vec<Arc<Conn>>>,
    file_queues: std::sync::Mutex<HashMap<u64, Arc<FileTransferQueue>>>,
    next_conn_id: AtomicU64,
    status_up: AtomicBool,
}

impl BrokerState {
    fn new(config: &BrokerConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            history: HistoryLog::new(config.max_history),
            text_clients: tokio::sync::Mutex::new(Vec::new()),
            file_clients: tokio::sync::Mutex::new(Vec::new()),
            file_queues: std::sync::Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            status_up: AtomicBool::new(false),
        }
    }

    fn registry(&self, kind: ChannelKind) -> &tokio::sync::Mutex<Vec<Arc<Conn>>> {
        match kind {
            ChannelKind::Text => &self.text_clients,
            ChannelKind::File => &self.file_clients,
        }
    }

    /// Looks up or lazily creates the transfer queue bound to a file
    /// socket. The queue holds only a weak reference, so dropping the
    /// socket elsewhere remains the authoritative teardown signal.
    fn queue_for(&self, conn: &Arc<Conn>) -> Arc<FileTransferQueue> {
        let mut queues = self.file_queues.lock().unwrap();
        Arc::clone(queues.entry(conn.id()).or_insert_with(|| {
            let weak = Arc::downgrade(conn);
            let provider: SocketProvider =
                Arc::new(move || weak.upgrade().filter(|conn| conn.is_open()));
            Arc::new(FileTransferQueue::new(provider))
        }))
    }

    async fn drop_queue(&self, conn: &Arc<Conn>) {
        let queue = self.file_queues.lock().unwrap().remove(&conn.id());
        if let Some(queue) = queue {
            queue.stop().await;
        }
    }

    async fn remove_client(&self, kind: ChannelKind, conn: &Arc<Conn>) {
        {
            let mut clients = self.registry(kind).lock().await;
            clients.retain(|c| c.id() != conn.id());
        }
        if kind == ChannelKind::File {
            self.drop_queue(conn).await;
        }
        debug!(kind = kind.as_str(), peer = %conn.peer(), "client removed");
    }

    /// Copies the registry under its lock, pruning closed sockets (and for
    /// file sockets, stopping their queues) so sends happen lock-free.
    async fn live_clients(&self, kind: ChannelKind) -> Vec<Arc<Conn>> {
        let (live, dead) = {
            let mut clients = self.registry(kind).lock().await;
            let dead: Vec<_> = clients
                .iter()
                .filter(|conn| !conn.is_open())
                .cloned()
                .collect();
            clients.retain(|conn| conn.is_open());
            (clients.clone(), dead)
        };
        if kind == ChannelKind::File {
            for conn in dead {
                self.drop_queue(&conn).await;
            }
        }
        live
    }

    async fn handle_text(&self, sender: Arc<Conn>, text: String) {
        let line = format!("[TEXT] From {}: {}", sender.peer(), text);
        self.history.append_text(line.clone()).await;
        self.broadcast_text(Some(sender.id()), &line).await;
    }

    async fn handle_file(&self, sender: Arc<Conn>, file: FileMessage) {
        let file = Arc::new(file);
        let line = format!("[FILE] From {}: {}", sender.peer(), file);
        self.history
            .append_file_broadcast(line.clone(), Arc::clone(&file))
            .await;

        // Bulk bytes go through each peer's queue, never inline on the
        // receive task; the sender's own file channel is excluded.
        let peers = self.live_clients(ChannelKind::File).await;
        for conn in peers {
            if conn.id() == sender.id() {
                continue;
            }
            let _ = self.queue_for(&conn).enqueue_message(Arc::clone(&file));
        }

        // Every text client hears about the file, the sender's text peer
        // included (the sender identity here is its file socket).
        self.broadcast_text(None, &line).await;
    }

    async fn handle_history_request(&self, requester: Arc<Conn>, file_port: u16) {
        let requester_ip = requester.peer().ip();
        info!(%requester_ip, file_port, "history replay requested");

        let file_conn = {
            let clients = self.file_clients.lock().await;
            clients
                .iter()
                .find(|conn| {
                    conn.is_open()
                        && conn.peer().ip() == requester_ip
                        && conn.peer().port() == file_port
                })
                .cloned()
        };
        let queue = match &file_conn {
            Some(conn) => Some(self.queue_for(conn)),
            None => {
                warn!(%requester_ip, file_port, "no matching file channel for history replay");
                None
            }
        };

        let begin = Message::Text(BEGIN_HISTORY_MARKER.to_owned()).encode();
        if let Err(err) = requester.send(&begin).await {
            warn!(peer = %requester.peer(), error = %err, "failed to start history replay");
            return;
        }

        // The log stays locked for the whole replay so a concurrent
        // broadcast cannot interleave with the replayed sequence.
        {
            let entries = self.history.lock().await;
            for entry in entries.iter() {
                match entry {
                    HistoryEntry::Text(line) => {
                        let frame = Message::Text(line.clone()).encode();
                        if let Err(err) = requester.send(&frame).await {
                            warn!(peer = %requester.peer(), error = %err, "history replay aborted");
                            return;
                        }
                    }
                    HistoryEntry::File(file) => match &queue {
                        Some(queue) => {
                            let _ = queue.enqueue_message(Arc::clone(file));
                        }
                        None => {
                            debug!("skipping file history entry: no matching file channel");
                        }
                    },
                }
            }
        }

        let end = Message::Text(END_HISTORY_MARKER.to_owned()).encode();
        if let Err(err) = requester.send(&end).await {
            warn!(peer = %requester.peer(), error = %err, "failed to finish history replay");
        }
    }

    async fn broadcast_text(&self, exclude: Option<u64>, line: &str) {
        let frame = Message::Text(line.to_owned()).encode();
        let recipients = self.live_clients(ChannelKind::Text).await;
        for conn in recipients {
            if Some(conn.id()) == exclude {
                continue;
            }
            if let Err(err) = conn.send(&frame).await {
                if !matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected
                ) {
                    warn!(peer = %conn.peer(), error = %err, "failed to deliver text broadcast");
                }
                conn.close();
            }
        }
    }

    async fn shutdown(&self) {
        if !self.status_up.swap(false, Ordering::SeqCst) {
            return;
        }
        // Transfer queues first: each stop joins its worker, so no queue
        // can touch a socket we are about to close.
        let queues: Vec<_> = {
            let mut map = self.file_queues.lock().unwrap();
            map.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            queue.stop().await;
        }
        for kind in [ChannelKind::Text, ChannelKind::File] {
            let conns: Vec<_> = {
                let mut clients = self.registry(kind).lock().await;
                clients.drain(..).collect()
            };
            for conn in conns {
                conn.close();
            }
        }
        info!("broker stopped");
    }
}

async fn accept_client(
    state: &Arc<BrokerState>,
    framed: &Arc<FramedConnection>,
    kind: ChannelKind,
    stream: TcpStream,
    peer: SocketAddr,
) {
    // The accept counter is the socket's stable identity; it can never
    // collide, so registry insertion needs no duplicate scan.
    let id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let (conn, reader) = match Conn::new(id, stream) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%peer, error = ?err, "failed to set up accepted connection");
            return;
        }
    };

    state.registry(kind).lock().await.push(Arc::clone(&conn));
    if kind == ChannelKind::File {
        state.queue_for(&conn);
    }
    info!(kind = kind.as_str(), %peer, id, "client connected");

    let state = Arc::clone(state);
    let framed = Arc::clone(framed);
    tokio::spawn(async move {
        match framed.run(Arc::clone(&conn), reader).await {
            Ok(()) => debug!(%peer, "client closed the connection"),
            Err(err) if err.is_expected() => debug!(%peer, "connection canceled"),
            Err(err) => warn!(%peer, error = %err, "connection closed with error"),
        }
        conn.close();
        state.remove_client(kind, &conn).await;
    });
}

fn build_text_framed(state: &Arc<BrokerState>) -> FramedConnection {
    let mut framed = FramedConnection::new(state.max_frame_bytes);
    {
        let state = Arc::clone(state);
        framed.register_handler(MessageKind::Text, move |sender, message| {
            let state = Arc::clone(&state);
            async move {
                if let Message::Text(text) = message {
                    state.handle_text(sender, text).await;
                }
            }
        });
    }
    {
        let state = Arc::clone(state);
        framed.register_handler(MessageKind::SendHistory, move |sender, message| {
            let state = Arc::clone(&state);
            async move {
                if let Message::SendHistory { file_port } = message {
                    state.handle_history_request(sender, file_port).await;
                }
            }
        });
    }
    framed
}

fn build_file_framed(state: &Arc<BrokerState>) -> FramedConnection {
    let mut framed = FramedConnection::new(state.max_frame_bytes);
    let state = Arc::clone(state);
    framed.register_handler(MessageKind::File, move |sender, message| {
        let state = Arc::clone(&state);
        async move {
            if let Message::File(file) = message {
                state.handle_file(sender, file).await;
            }
        }
    });
    framed
}
