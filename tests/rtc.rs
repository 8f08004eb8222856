mod common;

use common::*;
use duocall::error::NegotiationError;
use duocall::media::{SampleWrite, SyntheticDevices, TrackSource};
use duocall::peer::types::{ConnectionState, IceCandidate, SdpKind, TransportEvent};
use duocall::peer::{RtcTransport, Transport, TransportEvents};
use duocall::signaling::LocalRelay;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use webrtc::media::Sample;

/// Один webrtc-rs транспорт и всё, что он успел сообщить
struct Endpoint {
    transport: RtcTransport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    candidates: Vec<IceCandidate>,
    state: ConnectionState,
}

impl Endpoint {
    async fn new() -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let sink: TransportEvents = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let transport = RtcTransport::new(&[], sink).await.expect("peer connection");
        Self {
            transport,
            events,
            candidates: Vec::new(),
            state: ConnectionState::New,
        }
    }

    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                TransportEvent::LocalCandidate(Some(candidate)) => self.candidates.push(candidate),
                TransportEvent::ConnectionState(state) => self.state = state,
                _ => {}
            }
        }
    }
}

/// Пересылает кандидаты в обе стороны, пока оба соединения не станут connected.
/// Вызывается после обмена описаниями.
async fn connect(a: &mut Endpoint, b: &mut Endpoint) {
    timeout(Duration::from_secs(30), async {
        loop {
            a.drain();
            b.drain();
            for candidate in a.candidates.drain(..) {
                b.transport.add_ice_candidate(candidate).await.expect("candidate from a");
            }
            for candidate in b.candidates.drain(..) {
                a.transport.add_ice_candidate(candidate).await.expect("candidate from b");
            }
            if a.state == ConnectionState::Connected && b.state == ConnectionState::Connected {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("transports did not connect");
}

fn ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines().find_map(|line| line.strip_prefix("a=ice-ufrag:"))
}

fn opus_frame() -> Sample {
    Sample {
        data: vec![0xf8, 0xff, 0xfe].into(),
        duration: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_side_of_an_offer_collision_answers_the_remote_offer() {
    init_tracing();
    let mut a = Endpoint::new().await;
    let mut b = Endpoint::new().await;

    let a_offer = a.transport.create_offer(false).await.unwrap();
    let b_offer = b.transport.create_offer(false).await.unwrap();
    assert_eq!(b_offer.kind, SdpKind::Offer);

    b.transport
        .set_remote_description(a_offer, true)
        .await
        .expect("remote offer replaces the unanswered local one");
    let answer = b.transport.create_answer().await.expect("answer");
    a.transport
        .set_remote_description(answer, false)
        .await
        .expect("answer to the surviving offer");

    connect(&mut a, &mut b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ice_restart_offer_carries_new_credentials() {
    init_tracing();
    let mut a = Endpoint::new().await;
    let mut b = Endpoint::new().await;

    let offer = a.transport.create_offer(false).await.unwrap();
    let first_ufrag = ice_ufrag(&offer.sdp).map(str::to_owned);
    assert!(first_ufrag.is_some());
    b.transport.set_remote_description(offer, false).await.unwrap();
    let answer = b.transport.create_answer().await.unwrap();
    a.transport.set_remote_description(answer, false).await.unwrap();
    connect(&mut a, &mut b).await;

    let restart = a.transport.create_offer(true).await.unwrap();
    assert_ne!(ice_ufrag(&restart.sdp).map(str::to_owned), first_ufrag);
    b.transport
        .set_remote_description(restart, false)
        .await
        .expect("restart offer");
    let answer = b.transport.create_answer().await.expect("restart answer");
    a.transport
        .set_remote_description(answer, false)
        .await
        .expect("restart answer applied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_transport_reports_closed() {
    let a = Endpoint::new().await;
    a.transport.close().await;
    assert!(matches!(
        a.transport.create_offer(false).await,
        Err(NegotiationError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn controllers_call_each_other_over_webrtc() {
    init_tracing();
    let relay = LocalRelay::new();
    let mut a = start_rtc_peer(relay.connect(), Arc::new(SyntheticDevices::new())).await;
    wait_until(|| relay.members(ROOM).len() == 1).await;
    let b = start_rtc_peer(relay.connect(), Arc::new(SyntheticDevices::new())).await;

    wait_for_state(&a.controller, ConnectionState::Connected).await;
    wait_for_state(&b.controller, ConnectionState::Connected).await;

    // микрофон a начинает отдавать семплы; трек появляется у b
    let mic = a
        .devices
        .tracks()
        .into_iter()
        .find(|t| t.source() == TrackSource::Microphone)
        .expect("microphone issued");
    let feeder = tokio::spawn({
        let mic = mic.clone();
        async move {
            loop {
                let _ = mic.write_sample(&opus_frame()).await;
                sleep(Duration::from_millis(20)).await;
            }
        }
    });

    wait_until(|| b.recorder.has_remote_stream()).await;
    let stream = b.recorder.remote_stream().expect("remote stream");
    assert!(stream
        .track_ids
        .iter()
        .any(|id| b.controller.remote_track(id).is_some()));
    assert!(b.controller.remote_track("no-such-track").is_none());

    wait_until(|| a.recorder.samples() >= 1).await;

    a.controller.toggle_audio();
    wait_until(|| a.recorder.audio_enabled() == Some(false)).await;
    assert_eq!(mic.write_sample(&opus_frame()).await.unwrap(), SampleWrite::Muted);

    a.controller.toggle_screen_share();
    wait_until(|| a.recorder.screen_sharing() == Some(true)).await;
    wait_until(|| count_logs(&a.controller, "Outgoing video track replaced") == 1).await;
    assert_eq!(count_logs(&a.controller, "Sending offer"), 1);

    feeder.abort();
    a.controller.end_call();
    a.controller.closed().await;
    assert_eq!(a.controller.connection_state(), ConnectionState::Closed);
    assert_eq!(mic.write_sample(&opus_frame()).await.unwrap(), SampleWrite::Ended);
}
