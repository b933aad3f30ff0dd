pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{info, warn};
use webrtc::media::Sample;

pub use config::Config;
pub use controller::CallController;
pub use error::{CallError, Result};
pub use events::{CallEvent, EndReason};
pub use media::{LocalMediaStream, LocalTrack, MediaAcquisition, MediaDevices, StaticSampleDevices, TrackKind};
pub use peer::{PeerFactory, PeerRegistry, RtcPeerFactory};
pub use session::{CallSnapshot, CallState};
pub use signaling::{BearerToken, MemoryRelay, SignalingAdapter, SignalingTransport};

use peer::types::{ChatId, ParticipantId};

/// Сколько ждать соединения в локальном звонке
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Длительность одного кадра тишины (Opus, 20 мс)
const FRAME: Duration = Duration::from_millis(20);

/// Build a client for `user` on `relay`: devices, connections, signaling, controller
fn client(config: &Config, relay: &Arc<MemoryRelay>, user: &ParticipantId) -> Result<Arc<CallController>> {
    let token = BearerToken::unsigned_for(user);
    let (transport, inbound) = relay.connect(&token)?;
    let devices = Arc::new(StaticSampleDevices::new(&config.media));
    let media = Arc::new(MediaAcquisition::new(devices));
    let (registry, peer_events) = PeerRegistry::new(config, Arc::new(RtcPeerFactory::new()?), media);
    let signaling = SignalingAdapter::new(Arc::new(transport), token);
    let controller = Arc::new(CallController::new(config, Arc::new(registry), peer_events, signaling));

    let runner = Arc::clone(&controller);
    tokio::spawn(async move { runner.run(inbound).await });
    Ok(controller)
}

async fn wait_connected(events: &mut broadcast::Receiver<CallEvent>) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(CallEvent::PeerConnected { participant }) => {
                    info!("Connected to {}", participant);
                    return true;
                }
                Ok(CallEvent::CallEnded { .. }) | Err(broadcast::error::RecvError::Closed) => return false,
                _ => {}
            }
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, wait).await.unwrap_or(false)
}

/// Локальный звонок между двумя клиентами через in-process relay
pub async fn run() -> Result<()> {
    let config = Config::from_env()?;
    logger::init(&config.logging);

    let relay = MemoryRelay::new();
    let chat = ChatId::new("loopback");
    let (alice, bob) = (ParticipantId::new("1"), ParticipantId::new("2"));
    relay.add_member(&chat, &alice);
    relay.add_member(&chat, &bob);

    let caller = client(&config, &relay, &alice)?;
    let callee = client(&config, &relay, &bob)?;
    let mut events = caller.subscribe();

    caller.start_call(chat.clone(), vec![bob.clone()]).await?;
    if !wait_connected(&mut events).await {
        warn!("No connection within {:?}, hanging up", CONNECT_TIMEOUT);
        caller.end_call().await?;
        return Ok(());
    }

    if let Some(track) = caller.media().current().and_then(|s| s.audio_track().cloned()) {
        let silence = Sample {
            data: Bytes::from_static(&[0xf8, 0xff, 0xfe]),
            duration: FRAME,
            ..Default::default()
        };
        for _ in 0..50 {
            track.write_sample(&silence).await?;
            tokio::time::sleep(FRAME).await;
        }
    }

    info!("Caller: {:?}", caller.snapshot());
    info!("Callee: {:?}", callee.snapshot());
    caller.end_call().await?;
    // call_end доходит до второго клиента через relay
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Callee state after hang-up: {:?}", callee.state());
    Ok(())
}
