//! In-process broker tests with raw TCP peers: broadcast isolation, file
//! fan-out, history bounding, and replay pair-matching.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chat_relay::broker::{BEGIN_HISTORY_MARKER, Broker, BrokerConfig, END_HISTORY_MARKER};
use chat_relay::message::{FileMessage, HEADER_LEN, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Time for the broker to register a freshly accepted connection (or to
/// finish processing frames already written) before the next assertion.
const SETTLE: Duration = Duration::from_millis(200);

struct TestBroker {
    text_addr: SocketAddr,
    file_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestBroker {
    async fn start(max_history: usize) -> Result<Self> {
        let config = BrokerConfig {
            bind_ip: "127.0.0.1".parse()?,
            text_port: 0,
            file_port: 0,
            max_history,
            ..Default::default()
        };
        let broker = Broker::bind(&config).await?;
        let text_addr = broker.local_text_addr()?;
        let file_addr = broker.local_file_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = broker.run_until(shutdown).await;
        });

        Ok(Self {
            text_addr,
            file_addr,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.server.await;
    }
}

async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    Ok(stream)
}

async fn send_message(stream: &mut TcpStream, message: &Message) -> Result<()> {
    stream.write_all(&message.encode()).await?;
    Ok(())
}

async fn read_message(stream: &mut TcpStream) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    timeout(READ_TIMEOUT, stream.read_exact(&mut header))
        .await
        .context("timed out waiting for frame header")??;
    let kind = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let len = u64::from_be_bytes(header[4..12].try_into().unwrap());
    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        timeout(READ_TIMEOUT, stream.read_exact(&mut payload))
            .await
            .context("timed out waiting for frame payload")??;
    }
    Ok(Message::decode(kind, &payload)?)
}

async fn expect_text(stream: &mut TcpStream) -> Result<String> {
    match read_message(stream).await? {
        Message::Text(text) => Ok(text),
        other => bail!("expected a text frame, got {other:?}"),
    }
}

/// Asserts that nothing arrives on `stream` within a short window.
async fn expect_silence(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    match timeout(Duration::from_millis(300), stream.read(&mut byte)).await {
        Err(_) => {} // nothing arrived
        Ok(Ok(0)) => panic!("connection closed unexpectedly"),
        Ok(Ok(_)) => panic!("unexpected data on a channel that should be quiet"),
        Ok(Err(err)) => panic!("read error while expecting silence: {err}"),
    }
}

#[tokio::test]
async fn text_broadcast_reaches_other_clients_but_not_the_sender() -> Result<()> {
    let broker = TestBroker::start(100).await?;

    let mut alice = connect(broker.text_addr).await?;
    let mut bob = connect(broker.text_addr).await?;
    tokio::time::sleep(SETTLE).await;

    send_message(&mut alice, &Message::Text("hello".into())).await?;

    let heard = expect_text(&mut bob).await?;
    assert_eq!(heard, format!("[TEXT] From {}: hello", alice.local_addr()?));

    // The sender's own text channel stays quiet.
    expect_silence(&mut alice).await;

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn file_fanout_reaches_file_peers_and_notifies_every_text_client() -> Result<()> {
    let broker = TestBroker::start(100).await?;

    let mut alice_file = connect(broker.file_addr).await?;
    let mut bob_file = connect(broker.file_addr).await?;
    let mut carol_text = connect(broker.text_addr).await?;
    tokio::time::sleep(SETTLE).await;

    let file = FileMessage {
        name: "pic.bin".into(),
        data: vec![0x5A; 64 * 1024],
    };
    send_message(&mut alice_file, &Message::File(file.clone())).await?;

    // Bob's file channel receives the file bytes unchanged.
    match read_message(&mut bob_file).await? {
        Message::File(received) => assert_eq!(received, file),
        other => bail!("expected file frame, got {other:?}"),
    }

    // Carol never touched a file channel but still sees the notification.
    let notice = expect_text(&mut carol_text).await?;
    assert_eq!(
        notice,
        format!(
            "[FILE] From {}: FileMessage: pic.bin (65536 bytes)",
            alice_file.local_addr()?
        )
    );

    // The sender's file channel receives nothing back.
    expect_silence(&mut alice_file).await;

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn history_is_bounded_and_replayed_in_order() -> Result<()> {
    let broker = TestBroker::start(5).await?;

    let mut seeder = connect(broker.text_addr).await?;
    tokio::time::sleep(SETTLE).await;
    for i in 0..8 {
        send_message(&mut seeder, &Message::Text(format!("msg {i}"))).await?;
    }
    tokio::time::sleep(SETTLE).await;

    // A late joiner with both channels asks for the replay.
    let mut late_text = connect(broker.text_addr).await?;
    let late_file = connect(broker.file_addr).await?;
    tokio::time::sleep(SETTLE).await;

    let file_port = late_file.local_addr()?.port();
    send_message(&mut late_text, &Message::SendHistory { file_port }).await?;

    assert_eq!(expect_text(&mut late_text).await?, BEGIN_HISTORY_MARKER);
    let seeder_addr = seeder.local_addr()?;
    for i in 3..8 {
        assert_eq!(
            expect_text(&mut late_text).await?,
            format!("[TEXT] From {seeder_addr}: msg {i}")
        );
    }
    assert_eq!(expect_text(&mut late_text).await?, END_HISTORY_MARKER);

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn history_replay_streams_files_to_the_paired_file_channel() -> Result<()> {
    let broker = TestBroker::start(100).await?;

    let mut sender_file = connect(broker.file_addr).await?;
    tokio::time::sleep(SETTLE).await;
    let file = FileMessage {
        name: "old.bin".into(),
        data: vec![7; 4096],
    };
    send_message(&mut sender_file, &Message::File(file.clone())).await?;
    tokio::time::sleep(SETTLE).await;

    // Requester joins after the broadcast with both channels; a bystander
    // file client joins too and must not see the replay.
    let mut requester_text = connect(broker.text_addr).await?;
    let mut requester_file = connect(broker.file_addr).await?;
    let mut bystander_file = connect(broker.file_addr).await?;
    tokio::time::sleep(SETTLE).await;

    let file_port = requester_file.local_addr()?.port();
    send_message(&mut requester_text, &Message::SendHistory { file_port }).await?;

    assert_eq!(expect_text(&mut requester_text).await?, BEGIN_HISTORY_MARKER);
    let notice = expect_text(&mut requester_text).await?;
    assert!(
        notice.starts_with("[FILE] From"),
        "unexpected history line: {notice}"
    );
    assert_eq!(expect_text(&mut requester_text).await?, END_HISTORY_MARKER);

    // The file payload arrives on the requester's file channel only.
    match read_message(&mut requester_file).await? {
        Message::File(received) => assert_eq!(received, file),
        other => bail!("expected file frame, got {other:?}"),
    }
    expect_silence(&mut bystander_file).await;

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() -> Result<()> {
    let broker = TestBroker::start(100).await?;

    let mut mangler = connect(broker.text_addr).await?;
    let mut speaker = connect(broker.text_addr).await?;
    let mut listener = connect(broker.text_addr).await?;
    tokio::time::sleep(SETTLE).await;

    // Header declares five payload bytes; only two ever arrive.
    let mut short = Vec::new();
    short.extend_from_slice(&0u32.to_be_bytes());
    short.extend_from_slice(&5u64.to_be_bytes());
    short.extend_from_slice(b"hi");
    mangler.write_all(&short).await?;
    mangler.shutdown().await?;
    drop(mangler);
    tokio::time::sleep(SETTLE).await;

    // Other connections are unaffected.
    send_message(&mut speaker, &Message::Text("still here".into())).await?;
    let heard = expect_text(&mut listener).await?;
    assert_eq!(
        heard,
        format!("[TEXT] From {}: still here", speaker.local_addr()?)
    );

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn broker_shutdown_closes_client_connections() -> Result<()> {
    let broker = TestBroker::start(100).await?;

    let mut client = connect(broker.text_addr).await?;
    tokio::time::sleep(SETTLE).await;

    broker.stop().await;

    let mut byte = [0u8; 1];
    let read = timeout(READ_TIMEOUT, client.read(&mut byte))
        .await
        .context("timed out waiting for the broker to close the socket")?;
    assert!(matches!(read, Ok(0) | Err(_)), "socket should be closed");
    Ok(())
}
