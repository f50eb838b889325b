//! Client side: the channel pair manager and the interactive loop.
//!
//! A client holds two independent connections to the broker, text and file,
//! each with its own framed receive task, plus one file transfer queue
//! bound to the file socket. The queue reaches its socket through a weak
//! slot that the reconnect path swaps out, so a bulk-cancel (which kills
//! the socket to abort an in-flight write) is followed by a transparent
//! re-establish and the queue just keeps going.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::select;
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;
use crate::conn::Conn;
use crate::console::{ConsoleCommand, HELP_TEXT};
use crate::framed::FramedConnection;
use crate::ftq::{FileTransferQueue, SocketProvider, TransferSnapshot, TransferState};
use crate::message::{Message, MessageKind};

/// Both channels of one logical client plus the send API the console uses.
pub struct ChannelPair {
    text: Arc<Conn>,
    file_slot: Arc<RwLock<Weak<Conn>>>,
    file_current: Mutex<Arc<Conn>>,
    file_framed: Arc<FramedConnection>,
    file_endpoint: SocketAddr,
    queue: FileTransferQueue,
    next_conn_id: AtomicU64,
}

impl ChannelPair {
    /// Connects both channels and binds the transfer queue to the file
    /// socket through a weak, swappable slot.
    pub async fn connect(args: &ClientArgs) -> Result<Self> {
        let text_endpoint = SocketAddr::new(args.server_ip, args.text_port);
        let file_endpoint = SocketAddr::new(args.server_ip, args.file_port);

        let text_stream = TcpStream::connect(text_endpoint)
            .await
            .with_context(|| format!("failed to connect text channel to {text_endpoint}"))?;
        let (text, text_reader) =
            Conn::new(1, text_stream).context("failed to set up text channel")?;
        info!(peer = %text.peer(), "text channel connected");
        let text_framed = Arc::new(build_text_framed(args.max_frame_bytes));
        spawn_receive("text", text_framed, Arc::clone(&text), text_reader);

        let file_stream = TcpStream::connect(file_endpoint)
            .await
            .with_context(|| format!("failed to connect file channel to {file_endpoint}"))?;
        let (file, file_reader) =
            Conn::new(2, file_stream).context("failed to set up file channel")?;
        info!(peer = %file.peer(), local = %file.local(), "file channel connected");
        let file_framed = Arc::new(build_file_framed(args.max_frame_bytes, args.save_dir.clone()));
        spawn_receive(
            "file",
            Arc::clone(&file_framed),
            Arc::clone(&file),
            file_reader,
        );

        let file_slot = Arc::new(RwLock::new(Arc::downgrade(&file)));
        let provider: SocketProvider = {
            let slot = Arc::clone(&file_slot);
            Arc::new(move || {
                slot.read()
                    .unwrap()
                    .upgrade()
                    .filter(|conn| conn.is_open())
            })
        };
        let queue = FileTransferQueue::new(provider);

        Ok(Self {
            text,
            file_slot,
            file_current: Mutex::new(file),
            file_framed,
            file_endpoint,
            queue,
            next_conn_id: AtomicU64::new(3),
        })
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.text
            .send(&Message::Text(text.to_owned()).encode())
            .await
            .context("text channel send failed")
    }

    /// Enqueues a file for transfer; returns the new id, 0 on a bad path.
    pub fn send_file(&self, path: PathBuf) -> u64 {
        self.queue.enqueue_path(path)
    }

    /// Asks the broker to replay history. The request carries the file
    /// channel's local port (the broker's view of that channel's remote
    /// port), which is how the broker pairs our two channels.
    pub async fn send_history_request(&self) -> Result<()> {
        let file_port = self.file_current.lock().unwrap().local().port();
        self.text
            .send(&Message::SendHistory { file_port }.encode())
            .await
            .context("history request send failed")
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.queue.cancel(id)
    }

    pub fn retry(&self, id: u64) -> bool {
        self.queue.retry(id)
    }

    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        self.queue.snapshot()
    }

    /// Cancels every pending transfer and replaces the file channel.
    ///
    /// Canceling aborts an in-flight write by killing the socket, so a
    /// fresh connection is the only safe way to keep sending. The queue is
    /// paused for the swap and resumed only once the new channel is up.
    pub async fn cancel_all_and_reconnect_file_channel(&self) -> Result<()> {
        self.queue.pause();
        self.queue.cancel_all();
        self.file_current.lock().unwrap().close();

        let stream = TcpStream::connect(self.file_endpoint)
            .await
            .with_context(|| {
                format!(
                    "failed to reconnect file channel to {}",
                    self.file_endpoint
                )
            })?;
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (conn, reader) = Conn::new(id, stream).context("failed to set up file channel")?;
        *self.file_slot.write().unwrap() = Arc::downgrade(&conn);
        *self.file_current.lock().unwrap() = Arc::clone(&conn);
        spawn_receive(
            "file",
            Arc::clone(&self.file_framed),
            Arc::clone(&conn),
            reader,
        );
        info!(peer = %conn.peer(), local = %conn.local(), "file channel reconnected");

        self.queue.resume();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.queue.stop().await;
        self.text.close();
        self.file_current.lock().unwrap().close();
    }
}

/// Interactive client entry point: connect, then multiplex stdin against
/// ctrl-c until the operator quits.
pub async fn run(args: ClientArgs) -> Result<()> {
    let pair = ChannelPair::connect(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let line = input.trim_end();
                if line.is_empty() {
                    continue;
                }
                match ConsoleCommand::parse(line) {
                    Ok(ConsoleCommand::Quit) => {
                        write_stdout("*** leaving chat").await?;
                        break;
                    }
                    Ok(command) => {
                        if let Err(err) = execute(&pair, command).await {
                            write_stderr(&format!("!!! {err:#}")).await?;
                        }
                    }
                    Err(err) => write_stderr(&format!("!!! {err}")).await?,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    pair.shutdown().await;
    Ok(())
}

async fn execute(pair: &ChannelPair, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Text(text) => pair.send_text(&text).await?,
        ConsoleCommand::File(path) => {
            let id = pair.send_file(path.clone());
            if id == 0 {
                write_stderr("!!! failed to enqueue file").await?;
            } else {
                write_stdout(&format!("*** enqueued file id={id} path={}", path.display()))
                    .await?;
            }
        }
        ConsoleCommand::Queue => {
            let snapshot = pair.snapshot();
            if snapshot.is_empty() {
                write_stdout("(queue empty)").await?;
            } else {
                for item in snapshot {
                    write_stdout(&format!(
                        "id: {} file: {} state: {} retries: {} err: {}",
                        item.id, item.label, item.state, item.retries, item.last_error
                    ))
                    .await?;
                }
            }
        }
        ConsoleCommand::History => {
            let done: Vec<_> = pair
                .snapshot()
                .into_iter()
                .filter(|item| item.state == TransferState::Done)
                .collect();
            if done.is_empty() {
                write_stdout("(no history yet)").await?;
            } else {
                for item in done {
                    write_stdout(&format!(
                        "id: {} file: {} retries: {}",
                        item.id, item.label, item.retries
                    ))
                    .await?;
                }
            }
        }
        ConsoleCommand::Pause => {
            pair.pause();
            write_stdout("*** queue paused").await?;
        }
        ConsoleCommand::Resume => {
            pair.resume();
            write_stdout("*** queue resumed").await?;
        }
        ConsoleCommand::Cancel(id) => {
            if pair.cancel(id) {
                write_stdout(&format!("*** requested cancel for id {id}")).await?;
            } else {
                write_stderr(&format!("!!! no cancellable item with id {id}")).await?;
            }
        }
        ConsoleCommand::CancelAll => {
            pair.cancel_all_and_reconnect_file_channel().await?;
            write_stdout("*** queue canceled; file channel reconnected").await?;
        }
        ConsoleCommand::Retry(id) => {
            if pair.retry(id) {
                write_stdout(&format!("*** requested retry for id {id}")).await?;
            } else {
                write_stderr(&format!("!!! no failed item with id {id}")).await?;
            }
        }
        ConsoleCommand::SendHistory => pair.send_history_request().await?,
        ConsoleCommand::Help => write_stdout(HELP_TEXT).await?,
        // Quit never reaches here; the loop handles it.
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn build_text_framed(max_frame_bytes: u64) -> FramedConnection {
    let mut framed = FramedConnection::new(max_frame_bytes);
    framed.register_handler(MessageKind::Text, |_conn, message| async move {
        if let Message::Text(text) = message
            && let Err(error) = write_stdout(&text).await
        {
            warn!(?error, "failed to print incoming text");
        }
    });
    framed
}

fn build_file_framed(max_frame_bytes: u64, save_dir: PathBuf) -> FramedConnection {
    let mut framed = FramedConnection::new(max_frame_bytes);
    framed.register_handler(MessageKind::File, move |_conn, message| {
        let save_dir = save_dir.clone();
        async move {
            if let Message::File(file) = message {
                // Disk writes run off the receive task so a large save
                // never stalls the next frame.
                tokio::spawn(async move {
                    match file.save_under(&save_dir).await {
                        Ok(path) => {
                            let notice = format!("*** received {file} -> {}", path.display());
                            if let Err(error) = write_stdout(&notice).await {
                                warn!(?error, "failed to print file notice");
                            }
                        }
                        Err(error) => warn!(?error, file = %file, "failed to save received file"),
                    }
                });
            }
        }
    });
    framed
}

fn spawn_receive(
    label: &'static str,
    framed: Arc<FramedConnection>,
    conn: Arc<Conn>,
    reader: OwnedReadHalf,
) {
    tokio::spawn(async move {
        match framed.run(Arc::clone(&conn), reader).await {
            Ok(()) => {
                debug!(label, "channel closed by server");
                let _ = write_stdout(&format!("*** {label} channel closed by server")).await;
            }
            Err(err) if err.is_expected() => debug!(label, "channel canceled"),
            Err(err) => warn!(label, error = %err, "channel closed with error"),
        }
        conn.close();
    });
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
