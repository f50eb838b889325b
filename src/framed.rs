//! Framed receive loop: header → body → dispatch, per connection.
//!
//! A [`FramedConnection`] holds a kind-indexed table of async handlers and
//! drives the receive state machine over one socket's read half. Handlers
//! run on the receive task, so the next header read is armed only after the
//! previous dispatch returns; long work (saving files to disk) must be
//! spawned off by the handler itself.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::warn;

use crate::conn::Conn;
use crate::message::{HEADER_LEN, Message, MessageKind};

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Box<dyn Fn(Arc<Conn>, Message) -> HandlerFuture + Send + Sync>;

/// Terminal outcome of a receive loop.
///
/// `Aborted` is the expected result of a local close (shutdown, cancel); a
/// clean peer EOF at a header boundary ends the loop with `Ok(())`. Anything
/// else is a real transport or framing failure.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("operation aborted")]
    Aborted,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RecvError {
    /// True for terminal conditions that are part of normal lifecycle and
    /// should not be surfaced as errors.
    pub fn is_expected(&self) -> bool {
        matches!(self, RecvError::Aborted)
    }
}

pub struct FramedConnection {
    handlers: HashMap<u32, Handler>,
    max_frame_bytes: u64,
}

impl FramedConnection {
    pub fn new(max_frame_bytes: u64) -> Self {
        Self {
            handlers: HashMap::new(),
            max_frame_bytes,
        }
    }

    /// Installs the callback invoked for every decoded message of `kind`.
    pub fn register_handler<F, Fut>(&mut self, kind: MessageKind, handler: F)
    where
        F: Fn(Arc<Conn>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            kind.as_wire(),
            Box::new(move |conn, message| Box::pin(handler(conn, message))),
        );
    }

    /// Drives the receive state machine until the connection terminates.
    ///
    /// Precondition: `reader` is the only reader of the socket behind
    /// `conn`. Returns `Ok(())` on a clean peer EOF; decode failures drop
    /// the frame and continue.
    pub async fn run(&self, conn: Arc<Conn>, mut reader: OwnedReadHalf) -> Result<(), RecvError> {
        loop {
            let mut header = [0u8; HEADER_LEN];

            // Probe one byte first so a peer closing between frames is a
            // clean EOF rather than a short-header transport error.
            tokio::select! {
                read = reader.read(&mut header[..1]) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
                _ = conn.closed() => return Err(RecvError::Aborted),
            }
            tokio::select! {
                read = reader.read_exact(&mut header[1..]) => { read?; }
                _ = conn.closed() => return Err(RecvError::Aborted),
            }

            let kind = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let payload_len = u64::from_be_bytes([
                header[4], header[5], header[6], header[7], header[8], header[9], header[10],
                header[11],
            ]);
            if payload_len > self.max_frame_bytes {
                return Err(RecvError::FrameTooLarge {
                    len: payload_len,
                    max: self.max_frame_bytes,
                });
            }

            let mut payload = vec![0u8; payload_len as usize];
            if payload_len > 0 {
                tokio::select! {
                    read = reader.read_exact(&mut payload) => { read?; }
                    _ = conn.closed() => return Err(RecvError::Aborted),
                }
            }

            match Message::decode(kind, &payload) {
                Ok(message) => match self.handlers.get(&kind) {
                    Some(handler) => handler(Arc::clone(&conn), message).await,
                    None => warn!(kind, peer = %conn.peer(), "no handler registered for message kind"),
                },
                Err(err) => {
                    warn!(%err, kind, peer = %conn.peer(), "dropping undecodable frame");
                }
            }
        }
    }
}
