//! Two and three clients calling each other over the in-memory relay

use std::sync::Arc;

use chatcall_lib::events::{CallEvent, EndReason};
use chatcall_lib::peer::types::{ChatId, IceCandidate, ParticipantId, PeerState};
use chatcall_lib::signaling::RawSignal;
use chatcall_lib::testing::{FakeDevices, FakePeerFactory};
use chatcall_lib::{
    BearerToken, CallController, CallError, CallState, Config, MediaAcquisition, MemoryRelay, PeerRegistry,
    SignalingAdapter,
};
use tokio::sync::{broadcast, mpsc};
use tokio_test::{assert_err, assert_ok};

struct Client {
    id: ParticipantId,
    controller: CallController,
    devices: Arc<FakeDevices>,
    factory: Arc<FakePeerFactory>,
    inbound: mpsc::UnboundedReceiver<RawSignal>,
    events: broadcast::Receiver<CallEvent>,
}

impl Client {
    fn new(relay: &Arc<MemoryRelay>, chat: &ChatId, id: &str) -> Self {
        let config = Config::default();
        let id = ParticipantId::new(id);
        relay.add_member(chat, &id);
        let token = BearerToken::unsigned_for(&id);
        let (transport, inbound) = relay.connect(&token).unwrap();

        let devices = Arc::new(FakeDevices::default());
        let factory = Arc::new(FakePeerFactory::default());
        let media = Arc::new(MediaAcquisition::new(devices.clone()));
        let (registry, peer_events) = PeerRegistry::new(&config, factory.clone(), media);
        let signaling = SignalingAdapter::new(Arc::new(transport), token);
        let controller = CallController::new(&config, Arc::new(registry), peer_events, signaling);
        let events = controller.subscribe();
        Self {
            id,
            controller,
            devices,
            factory,
            inbound,
            events,
        }
    }

    /// Handle everything the relay delivered so far
    async fn deliver(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(raw) = self.inbound.try_recv() {
            let _ = self.controller.handle_raw(raw).await;
            handled += 1;
        }
        handled + self.controller.pump().await
    }

    fn drain_events(&mut self) -> Vec<CallEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    fn candidate(&self, peer: &ParticipantId, n: u32) {
        let sink = self.factory.last_sink(peer).unwrap();
        sink.local_candidate(IceCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"
        )));
    }
}

async fn settle(clients: &mut [&mut Client]) {
    loop {
        let mut handled = 0;
        for client in clients.iter_mut() {
            handled += client.deliver().await;
        }
        if handled == 0 {
            return;
        }
    }
}

fn chat() -> ChatId {
    ChatId::new("c1")
}

#[tokio::test]
async fn test_two_party_call_connects_and_ends() {
    let relay = MemoryRelay::new();
    let mut a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");

    assert_ok!(a.controller.start_call(chat(), vec![b.id.clone()]).await);
    assert_eq!(a.controller.state(), CallState::Active);
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(b.controller.state(), CallState::Active);
    assert!(!b.controller.snapshot().initiator);
    let a_link = a.factory.last_link(&b.id).unwrap();
    let b_link = b.factory.last_link(&a.id).unwrap();
    assert_eq!(a_link.remote_description().unwrap(), b_link.local_description().unwrap());
    assert_eq!(b_link.remote_description().unwrap(), a_link.local_description().unwrap());

    a.candidate(&b.id, 1);
    b.candidate(&a.id, 2);
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b_link.candidates().len(), 1);
    assert_eq!(a_link.candidates().len(), 1);

    b.factory.last_sink(&a.id).unwrap().state_changed(PeerState::Connected);
    settle(&mut [&mut a, &mut b]).await;
    assert!(b
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::PeerConnected { participant } if participant == &a.id)));

    a.controller.end_call().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(b.controller.state(), CallState::Idle);
    let ended = b.drain_events().into_iter().find_map(|e| match e {
        CallEvent::CallEnded { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(ended, Some(EndReason::Remote(Some(a.id.clone()))));
    assert!(a.devices.live_tracks().is_empty());
    assert!(b.devices.live_tracks().is_empty());
    assert!(a_link.is_closed() && b_link.is_closed());
}

#[tokio::test]
async fn test_candidates_before_offer_is_handled_are_applied_in_order() {
    let relay = MemoryRelay::new();
    let mut a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");

    a.controller.start_call(chat(), vec![b.id.clone()]).await.unwrap();
    for n in 1..=3 {
        a.candidate(&b.id, n);
    }
    a.controller.pump().await;

    // оффер и три кандидата уже в очереди B; обрабатываем всё разом
    settle(&mut [&mut b, &mut a]).await;

    let link = b.factory.last_link(&a.id).unwrap();
    let applied: Vec<_> = link.candidates().into_iter().map(|c| c.candidate).collect();
    assert_eq!(applied.len(), 3);
    assert!(applied[0].starts_with("candidate:1") && applied[2].starts_with("candidate:3"));
    assert_eq!(b.controller.registry().pending_candidates(&a.id), 0);
}

#[tokio::test]
async fn test_candidates_arriving_before_answerer_has_a_connection_are_parked() {
    let relay = MemoryRelay::new();
    let a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");

    a.controller.start_call(chat(), vec![b.id.clone()]).await.unwrap();
    a.candidate(&b.id, 1);
    a.controller.pump().await;

    // B ещё захватывает медиа, когда приходит кандидат
    b.devices.hold();
    let offer = b.inbound.try_recv().unwrap();
    let candidate = b.inbound.try_recv().unwrap();
    let (answered, _) = tokio::join!(b.controller.handle_raw(offer), async {
        b.controller.handle_raw(candidate).await.unwrap();
        assert_eq!(b.controller.registry().pending_candidates(&a.id), 1);
        b.devices.release();
    });
    answered.unwrap();

    let link = b.factory.last_link(&a.id).unwrap();
    assert_eq!(link.candidates().len(), 1);
    assert_eq!(b.controller.registry().pending_candidates(&a.id), 0);
}

#[tokio::test]
async fn test_mesh_call_and_one_peer_failing() {
    let relay = MemoryRelay::new();
    let mut a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");
    let mut c = Client::new(&relay, &chat(), "3");

    a.controller
        .start_call(chat(), vec![b.id.clone(), c.id.clone()])
        .await
        .unwrap();
    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert_eq!(a.controller.registry().participants(), vec![b.id.clone(), c.id.clone()]);
    assert_eq!(b.controller.state(), CallState::Active);
    assert_eq!(c.controller.state(), CallState::Active);

    a.factory.last_sink(&b.id).unwrap().state_changed(PeerState::Failed);
    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert_eq!(a.controller.state(), CallState::Active);
    assert_eq!(a.controller.registry().participants(), vec![c.id.clone()]);
}

#[tokio::test]
async fn test_only_the_ender_sends_call_end() {
    let relay = MemoryRelay::new();
    let mut a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");
    a.controller.start_call(chat(), vec![b.id.clone()]).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    b.controller.end_call().await.unwrap();
    a.deliver().await;

    assert_eq!(a.controller.state(), CallState::Idle);
    // A не отвечает своим call_end: B ничего не получил
    assert!(b.inbound.try_recv().is_err());
}

#[tokio::test]
async fn test_screen_share_round_trip_keeps_microphone() {
    let relay = MemoryRelay::new();
    let mut a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");
    a.controller.start_call(chat(), vec![b.id.clone()]).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    let mic = a.controller.media().current().unwrap().audio_track().unwrap().clone();
    let link = a.factory.last_link(&b.id).unwrap();

    assert!(a.controller.toggle_screen_share().await.unwrap());
    let screen = a.controller.media().current().unwrap().video_track().unwrap().clone();
    assert_eq!(link.video_track_id().as_deref(), Some(screen.id()));

    // система завершила захват экрана
    screen.stop();
    a.controller.pump().await;

    let current = a.controller.media().current().unwrap();
    let camera = current.video_track().unwrap();
    assert_eq!(camera.label(), "camera");
    assert_eq!(link.video_track_id().as_deref(), Some(camera.id()));
    assert!(Arc::ptr_eq(current.audio_track().unwrap(), &mic));
    assert!(!mic.is_stopped());
    let live: Vec<_> = a.devices.live_tracks().iter().map(|t| t.label().to_string()).collect();
    assert_eq!(live.len(), 2);
    assert!(live.contains(&"camera".to_string()) && live.contains(&"microphone".to_string()));
    // на той стороне повторных переговоров не было
    assert_eq!(b.factory.last_link(&a.id).unwrap().remote_sets(), 1);
}

#[tokio::test]
async fn test_denied_media_never_reaches_active() {
    let relay = MemoryRelay::new();
    let a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");
    b.devices.deny(true);

    assert_ok!(a.controller.start_call(chat(), vec![b.id.clone()]).await);
    let offer = b.inbound.try_recv().unwrap();
    assert_err!(b.controller.handle_raw(offer).await);

    assert_eq!(b.controller.state(), CallState::Idle);
    let states: Vec<_> = b
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![CallState::Answering, CallState::Idle]);
    assert!(b.controller.registry().is_empty());
}

#[tokio::test]
async fn test_hang_up_while_capturing_discards_stream() {
    let relay = MemoryRelay::new();
    let mut a = Client::new(&relay, &chat(), "1");
    let mut b = Client::new(&relay, &chat(), "2");
    a.devices.hold();

    let (started, _) = tokio::join!(a.controller.start_call(chat(), vec![b.id.clone()]), async {
        a.controller.end_call().await.unwrap();
        a.devices.release();
    });
    assert!(matches!(started, Err(CallError::Cancelled)));
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(a.controller.state(), CallState::Idle);
    assert_eq!(b.controller.state(), CallState::Idle);
    assert!(!a.controller.media().has_local_stream());
    assert!(a.devices.live_tracks().is_empty());
    assert_eq!(a.factory.created(), 0);
}
