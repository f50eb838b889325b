//! Dual-channel chat relay: a central broker and an interactive client.
//!
//! Every client keeps two independent TCP connections to the broker, one
//! for low-latency text and one for bulk file payloads, so a large upload
//! never head-of-line blocks chat traffic. Each module focuses on one
//! responsibility:
//!
//! - [`cli`] parses the command-line interface for broker and client modes.
//! - [`message`] defines the length-prefixed, type-tagged wire envelope and
//!   the typed messages carried in it.
//! - [`conn`] is the shared per-socket transport handle; closing it is the
//!   authoritative lifecycle signal for everything attached to the socket.
//! - [`framed`] drives the per-connection receive state machine and routes
//!   decoded messages through a kind-indexed handler table.
//! - [`ftq`] is the per-file-socket transfer queue: a supervised worker
//!   with retry, pause/resume, and cancellation of in-flight writes.
//! - [`history`] keeps the broker's bounded log of recent broadcasts.
//! - [`broker`] accepts both channel kinds, broadcasts to peers, and
//!   replays history on request.
//! - [`client`] manages a channel pair, saves incoming files, and runs the
//!   operator console.
//! - [`console`] parses the operator's slash commands.
//!
//! Unit and integration tests exercise the crate directly; see `tests/`
//! for the end-to-end broker and transfer-queue scenarios.

pub mod broker;
pub mod cli;
pub mod client;
pub mod conn;
pub mod console;
pub mod framed;
pub mod ftq;
pub mod history;
pub mod message;
