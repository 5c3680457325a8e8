//! Tokio TCP relay.
//!
//! One task seals ticks at the configured rate and broadcasts the
//! encoded bundle to every connected client; one task per client reads
//! its submissions into the shared session. All simulation-relevant
//! state lives in [`MatchSession`]; the network layer only moves frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use vox_core::world::PlayerId;

use crate::codec::{encode_frame, FrameDecoder, WireMessage};
use crate::session::MatchSession;
use crate::{ServerConfig, ServerError};

/// Broadcast capacity in sealed bundles. A client falling further behind
/// than this is dropped by the channel and will disconnect.
const BROADCAST_CAPACITY: usize = 256;

/// Run the relay until the match completes or the listener fails.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "listening");

    let session = Arc::new(Mutex::new(MatchSession::new(config.clone())));
    let (bundle_tx, _) = broadcast::channel::<Vec<u8>>(BROADCAST_CAPACITY);

    let mut ticker = tokio::spawn(tick_loop(
        Arc::clone(&session),
        bundle_tx.clone(),
        config.tick_rate,
    ));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "client connected");
                tokio::spawn(serve_client(
                    stream,
                    Arc::clone(&session),
                    bundle_tx.clone(),
                ));
            }
            // The tick loop returns once the match completes.
            _ = &mut ticker => break,
        }
    }

    Ok(())
}

/// Seal one bundle per tick period and broadcast it.
async fn tick_loop(
    session: Arc<Mutex<MatchSession>>,
    bundle_tx: broadcast::Sender<Vec<u8>>,
    tick_rate: u32,
) {
    let period = Duration::from_millis(u64::from(1000 / tick_rate.max(1)));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let (bundle, completed) = {
            let mut session = session.lock().await;
            let bundle = session.seal_tick();
            (bundle, session.is_completed())
        };
        match encode_frame(&WireMessage::Bundle(bundle)) {
            Ok(frame) => {
                // Send errors only mean nobody is connected yet.
                let _ = bundle_tx.send(frame);
            }
            Err(error) => {
                tracing::error!(%error, "failed to encode bundle");
            }
        }
        if completed {
            tracing::info!("match completed, tick loop stopping");
            return;
        }
    }
}

/// Handle one client connection: join handshake, then submissions in,
/// bundles out.
async fn serve_client(
    stream: TcpStream,
    session: Arc<Mutex<MatchSession>>,
    bundle_tx: broadcast::Sender<Vec<u8>>,
) {
    let peer = stream.peer_addr().ok();
    if let Err(error) = client_io(stream, session, bundle_tx).await {
        tracing::debug!(?peer, %error, "client connection closed");
    }
}

async fn client_io(
    stream: TcpStream,
    session: Arc<Mutex<MatchSession>>,
    bundle_tx: broadcast::Sender<Vec<u8>>,
) -> Result<(), ServerError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();

    // Handshake: the first message must be a join.
    let player = match read_message(&mut reader, &mut decoder).await? {
        Some(WireMessage::Join { name }) => session.lock().await.join(name)?,
        Some(_) | None => {
            return Err(ServerError::Codec("expected join handshake".into()));
        }
    };
    writer
        .write_all(&encode_frame(&WireMessage::Welcome { player })?)
        .await?;

    // Forward sealed bundles until the client lags out or leaves.
    let mut bundles = bundle_tx.subscribe();
    let forward = tokio::spawn(async move {
        while let Ok(frame) = bundles.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = read_submissions(&mut reader, &mut decoder, &session, player).await;
    session.lock().await.leave(player);
    forward.abort();
    result
}

/// Pump the read half into the session until EOF or an explicit leave.
async fn read_submissions(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    session: &Arc<Mutex<MatchSession>>,
    player: PlayerId,
) -> Result<(), ServerError> {
    loop {
        let Some(message) = read_message(reader, decoder).await? else {
            return Ok(());
        };
        match message {
            WireMessage::Submit {
                player: claimed,
                command,
            } => {
                if claimed != player {
                    tracing::warn!(player, claimed, "submission for foreign slot dropped");
                    continue;
                }
                session.lock().await.queue_command(player, command)?;
            }
            WireMessage::Leave { .. } => return Ok(()),
            other => {
                tracing::warn!(player, ?other, "unexpected message dropped");
            }
        }
    }
}

/// Read until one complete message is available. `None` means EOF.
async fn read_message(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> Result<Option<WireMessage>, ServerError> {
    loop {
        if let Some(message) = decoder.next_message()? {
            return Ok(Some(message));
        }
        let mut buf = [0u8; 4096];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.push(&buf[..n]);
    }
}
