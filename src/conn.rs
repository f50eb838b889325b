//! Shared transport handle for one TCP channel.
//!
//! A [`Conn`] owns the write half of a socket plus its identity. The read
//! half is handed to exactly one framed receive task; everything else
//! (broadcaster, file transfer queue, replies) writes through [`Conn::send`].
//! Closing the handle is the authoritative lifecycle signal: it aborts an
//! in-flight whole-buffer write and wakes the receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};

pub struct Conn {
    id: u64,
    peer: SocketAddr,
    local: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    closed: Notify,
}

impl Conn {
    /// Splits `stream` into a shared handle and the read half for the
    /// receive task. `id` is the accept/connect counter that serves as the
    /// socket's stable identity.
    pub fn new(id: u64, stream: TcpStream) -> io::Result<(Arc<Self>, OwnedReadHalf)> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Self {
            id,
            peer,
            local,
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            closed: Notify::new(),
        });
        Ok((conn, reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Delivers one serialized envelope as a single whole-buffer write.
    ///
    /// Concurrent senders serialize on the internal writer lock, so frames
    /// never interleave on the wire. If the handle is closed mid-write the
    /// write is abandoned, the write half is shut down, and the caller sees
    /// `ConnectionAborted`.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let aborted = self.closed.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket not connected",
            ));
        }
        let result = tokio::select! {
            res = async {
                writer.write_all(frame).await?;
                writer.flush().await
            } => res,
            _ = &mut aborted => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "operation aborted",
            )),
        };
        if matches!(&result, Err(err) if err.kind() == io::ErrorKind::ConnectionAborted) {
            // The frame may be partially on the wire; the stream is unusable
            // for framing, so push the FIN out now.
            let _ = writer.shutdown().await;
        }
        result
    }

    /// Marks the handle closed and wakes any in-flight send and the receive
    /// loop. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.notify_waiters();
        }
    }

    /// Resolves once the handle has been closed locally.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (accepted, _) = listener.accept().await.expect("accept");
        let connected = connect.await.expect("join").expect("connect");
        (accepted, connected)
    }

    #[tokio::test]
    async fn send_delivers_whole_frames() {
        let (local, remote) = socket_pair().await;
        let (conn, _reader) = Conn::new(1, local).expect("conn");

        conn.send(b"abc").await.expect("send");
        conn.send(b"def").await.expect("send");

        let mut buf = [0u8; 6];
        let mut remote = remote;
        remote.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test]
    async fn close_aborts_a_blocked_send() {
        let (local, _remote) = socket_pair().await;
        let (conn, _reader) = Conn::new(1, local).expect("conn");

        // Nobody reads `_remote`, so a large write fills the kernel buffers
        // and parks inside `send`.
        let big = vec![0u8; 64 * 1024 * 1024];
        let sender = Arc::clone(&conn);
        let task = tokio::spawn(async move { sender.send(&big).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close();

        let result = timeout(Duration::from_secs(2), task)
            .await
            .expect("send unblocks after close")
            .expect("join");
        let err = result.expect_err("aborted write reports an error");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn send_after_close_fails_fast() {
        let (local, _remote) = socket_pair().await;
        let (conn, _reader) = Conn::new(1, local).expect("conn");
        conn.close();
        let err = conn.send(b"x").await.expect_err("closed conn rejects send");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
