//! End-to-end call flows through the CallManager facade
//!
//! Every test drives the manager with the recording collaborators from
//! `rvoip_call_manager_core::testing` and checks the registry, the state
//! machines and what reached the platform.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::timeout;
use tracing_test::traced_test;

use rvoip_call_manager_core::testing::{
    MockRenderer, MockVibrator, RecordingAudioPlatform, RecordingTelephony, TelephonyCommand,
};
use rvoip_call_manager_core::{
    AudioDevice, AudioMode, CallEndedType, CallId, CallManager, CallManagerBuilder, CallManagerConfig,
    CallManagerError, CallManagerEvent, CallState, CallStateKind, CallType, CallWaitingDecision, DialRequest,
    ImsCallMode, IncomingCall, SlotId, ToneDescriptor, VideoState,
};

struct Harness {
    manager: CallManager,
    telephony: Arc<RecordingTelephony>,
    platform: Arc<RecordingAudioPlatform>,
    renderer: Arc<MockRenderer>,
    vibrator: Arc<MockVibrator>,
}

fn harness_with(call_waiting: bool) -> Harness {
    let config = CallManagerConfig {
        call_waiting_enabled: call_waiting,
        render_period_ms: 5,
        tone_duration_ms: 500,
        ..Default::default()
    };
    let telephony = Arc::new(RecordingTelephony::new());
    let platform = Arc::new(RecordingAudioPlatform::new());
    let renderer = Arc::new(MockRenderer::new());
    let vibrator = Arc::new(MockVibrator::new());
    let manager = CallManagerBuilder::new()
        .config(config)
        .telephony(telephony.clone())
        .audio_platform(platform.clone())
        .renderer(renderer.clone())
        .vibrator(vibrator.clone())
        .build()
        .unwrap();
    manager.start().unwrap();
    Harness {
        manager,
        telephony,
        platform,
        renderer,
        vibrator,
    }
}

fn harness() -> Harness {
    harness_with(true)
}

impl Harness {
    async fn incoming(&self, call_type: CallType) -> (CallId, CallWaitingDecision) {
        self.manager
            .on_incoming_call(IncomingCall::new("5550100", SlotId(0), call_type))
            .await
            .unwrap()
    }

    /// An answered voice call
    async fn active_call(&self) -> CallId {
        let (call_id, _) = self.incoming(CallType::Cs).await;
        self.manager.answer_call(call_id, VideoState::Voice).await.unwrap();
        call_id
    }

    /// A dialed call the network has connected
    async fn connected_dial(&self, number: &str) -> CallId {
        let call_id = self
            .manager
            .dial_call(DialRequest::new(number, SlotId(0), CallType::Cs))
            .await
            .unwrap();
        self.manager
            .on_call_state_report(call_id, CallState::Alerting, None)
            .await
            .unwrap();
        self.manager
            .on_call_state_report(call_id, CallState::Active, None)
            .await
            .unwrap();
        call_id
    }

    fn state(&self, call_id: CallId) -> CallState {
        self.manager.get_call_state(call_id).unwrap()
    }
}

#[tokio::test]
async fn test_incoming_call_lifecycle() {
    let h = harness();
    let mut events = h.manager.subscribe();

    let (call_id, decision) = h.incoming(CallType::Cs).await;
    assert_eq!(decision, CallWaitingDecision::Answer);
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Incoming);
    assert_eq!(h.manager.audio_device().await, AudioDevice::Speaker);
    assert!(h.manager.is_ringing());
    assert!(h.vibrator.is_vibrating());

    h.manager.answer_call(call_id, VideoState::Voice).await.unwrap();
    assert_eq!(h.state(call_id), CallState::Active);
    assert!(!h.manager.is_ringing());
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Cs);
    assert_eq!(h.manager.audio_device().await, AudioDevice::Earpiece);
    assert_eq!(h.platform.last_mode(), Some(AudioMode::InCall));

    h.manager.hang_up_call(call_id).await.unwrap();
    assert!(!h.manager.has_call());
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Inactive);
    assert_eq!(h.manager.audio_device().await, AudioDevice::Disabled);
    assert_eq!(
        h.telephony.commands(),
        vec![
            TelephonyCommand::Answer(call_id, VideoState::Voice),
            TelephonyCommand::HangUp(call_id),
        ]
    );

    let mut added = false;
    let mut removed = false;
    while let Ok(Some(Ok(event))) = timeout(Duration::from_millis(50), events.next()).await {
        match event {
            CallManagerEvent::CallAdded { call } => added |= call.call_id == call_id,
            CallManagerEvent::CallRemoved { call_id: id, ended_type } => {
                removed |= id == call_id && ended_type == CallEndedType::Normal
            }
            _ => {}
        }
    }
    assert!(added && removed);
}

#[tokio::test]
async fn test_video_call_waiting_holds_active_call() {
    let h = harness();
    let first = h.active_call().await;

    let (second, decision) = h
        .manager
        .on_incoming_call(IncomingCall::new("5550101", SlotId(0), CallType::Ims).video())
        .await
        .unwrap();
    assert_eq!(decision, CallWaitingDecision::AutoHold);
    assert_eq!(h.state(first), CallState::Holding);
    assert_eq!(h.state(second), CallState::Incoming);
    assert_eq!(h.manager.audio_device().await, AudioDevice::Speaker);
    assert!(h.telephony.commands().contains(&TelephonyCommand::Hold(first)));

    h.manager.answer_call(second, VideoState::Video).await.unwrap();
    assert_eq!(h.state(second), CallState::Active);
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Ims);
    assert_eq!(h.manager.audio_device().await, AudioDevice::Speaker);
}

#[tokio::test]
#[traced_test]
async fn test_call_waiting_disabled_rejects_second_call() {
    let h = harness_with(false);
    let first = h.active_call().await;

    let (second, decision) = h.incoming(CallType::Cs).await;
    assert_eq!(decision, CallWaitingDecision::Reject);
    assert_eq!(h.state(first), CallState::Active);
    assert!(h.manager.get_call(second).is_none());
    assert!(matches!(
        h.manager.get_call_state(second),
        Err(CallManagerError::CallNotFound { .. })
    ));
    assert!(h.telephony.commands().contains(&TelephonyCommand::Reject(second)));
    assert!(logs_contain("call waiting is disabled"));
}

#[tokio::test]
async fn test_accessory_priority() {
    let h = harness();
    h.active_call().await;

    h.manager.on_wired_headset(true).await.unwrap();
    assert_eq!(h.manager.audio_device().await, AudioDevice::WiredHeadset);

    h.manager.on_bluetooth_sco(true).await.unwrap();
    assert_eq!(h.manager.audio_device().await, AudioDevice::BluetoothSco);

    h.manager.on_wired_headset(false).await.unwrap();
    assert_eq!(h.manager.audio_device().await, AudioDevice::BluetoothSco);

    h.manager.on_bluetooth_sco(false).await.unwrap();
    assert_eq!(h.manager.audio_device().await, AudioDevice::Earpiece);
    assert_eq!(h.platform.last_route(), Some(AudioDevice::Earpiece));
}

#[tokio::test]
async fn test_emergency_call_forces_unmute() {
    let h = harness();
    h.manager.set_muted(true).await.unwrap();
    assert!(h.manager.is_muted().await);
    assert!(h.platform.is_muted());

    let call_id = h
        .manager
        .dial_call(DialRequest::new("112", SlotId(0), CallType::Cs).emergency())
        .await
        .unwrap();
    assert!(h.manager.get_call(call_id).unwrap().is_emergency);
    assert!(!h.manager.is_muted().await);
    assert!(!h.platform.is_muted());

    // Muting stays off while the emergency call exists
    h.manager.set_muted(true).await.unwrap();
    assert!(!h.manager.is_muted().await);
}

#[tokio::test]
async fn test_busy_network_plays_engaged_tone() {
    let h = harness();
    let call_id = h
        .manager
        .dial_call(DialRequest::new("5550100", SlotId(0), CallType::Cs))
        .await
        .unwrap();
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Dialing);

    h.manager
        .on_call_state_report(call_id, CallState::Disconnected, Some(CallEndedType::Busy))
        .await
        .unwrap();
    assert!(!h.manager.has_call());
    assert_eq!(h.manager.audio().current_tone(), Some(ToneDescriptor::Engaged));
}

#[tokio::test]
async fn test_hold_switch_and_resume() {
    let h = harness();
    let first = h.active_call().await;
    let second = h.connected_dial("5550102").await;
    assert_eq!(h.state(first), CallState::Holding);
    assert_eq!(h.state(second), CallState::Active);

    h.manager.switch_call(second).await.unwrap();
    assert_eq!(h.state(first), CallState::Active);
    assert_eq!(h.state(second), CallState::Holding);
    assert!(h.telephony.commands().contains(&TelephonyCommand::Switch(second)));

    h.manager.hang_up_call(first).await.unwrap();
    assert_eq!(h.state(second), CallState::Active);
    assert!(h.telephony.commands().contains(&TelephonyCommand::Unhold(second)));
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Cs);

    assert!(matches!(
        h.manager.unhold_call(second).await,
        Err(CallManagerError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_conference_merge_and_split() {
    let h = harness();
    let first = h.active_call().await;
    let second = h.connected_dial("5550102").await;

    h.manager.combine_conference(second).await.unwrap();
    for call_id in [first, second] {
        let call = h.manager.get_call(call_id).unwrap();
        assert_eq!(call.state, CallState::Active);
        assert_eq!(call.conference_id, Some(second));
    }

    h.manager.separate_conference(first).await.unwrap();
    let first_call = h.manager.get_call(first).unwrap();
    let second_call = h.manager.get_call(second).unwrap();
    assert_eq!(first_call.state, CallState::Active);
    assert_eq!(second_call.state, CallState::Holding);
    assert_eq!(first_call.conference_id, None);
    assert_eq!(second_call.conference_id, None);

    assert!(matches!(
        h.manager.kick_out_from_conference(first).await,
        Err(CallManagerError::InvalidState { .. })
    ));
    assert!(matches!(
        h.manager.join_conference(first, Vec::new()).await,
        Err(CallManagerError::NotAllowed { .. })
    ));
    h.manager
        .join_conference(first, vec!["5550103".to_string()])
        .await
        .unwrap();
    assert!(h.telephony.commands().contains(&TelephonyCommand::InviteToConference(
        SlotId(0),
        vec!["5550103".to_string()]
    )));
}

#[tokio::test]
async fn test_ims_only_requests() {
    let h = harness();
    let cs = h.active_call().await;
    assert!(matches!(
        h.manager.start_rtt(cs, "hi").await,
        Err(CallManagerError::Unsupported { call_type: CallType::Cs, .. })
    ));
    h.manager.hang_up_call(cs).await.unwrap();

    let (ims, _) = h.incoming(CallType::Ims).await;
    h.manager.answer_call(ims, VideoState::Voice).await.unwrap();
    h.manager.start_rtt(ims, "hi").await.unwrap();
    h.manager.stop_rtt(ims).await.unwrap();

    h.manager
        .update_ims_call_mode(ims, ImsCallMode::SendReceive)
        .await
        .unwrap();
    assert_eq!(h.manager.get_call(ims).unwrap().video_state, VideoState::Video);
    assert_eq!(h.manager.audio_device().await, AudioDevice::Speaker);
}

#[tokio::test]
async fn test_bearer_handover() {
    let h = harness();
    let call_id = h.active_call().await;
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Cs);

    h.manager.on_call_type_changed(call_id, CallType::Ims).await.unwrap();
    assert_eq!(h.manager.get_call(call_id).unwrap().call_type, CallType::Ims);
    assert_eq!(h.manager.audio().call_state().await, CallStateKind::Ims);
}

#[tokio::test]
async fn test_dtmf_feedback() {
    let h = harness();
    let call_id = h.active_call().await;
    h.manager.start_dtmf(call_id, '5').await.unwrap();
    assert_eq!(h.manager.audio().current_tone(), Some(ToneDescriptor::Dtmf5));
    h.manager.stop_dtmf(call_id).await.unwrap();
    assert!(!h.manager.audio().is_tone_playing());
    assert!(h.telephony.commands().contains(&TelephonyCommand::StartDtmf(call_id, '5')));
}

#[tokio::test]
async fn test_renderer_released_after_render_failure() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.renderer.fail_render_after(2);

    h.incoming(CallType::Cs).await;
    let failed = timeout(Duration::from_secs(1), async {
        while let Some(Ok(event)) = events.next().await {
            if let CallManagerEvent::PlaybackFailed { .. } = event {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(failed);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.renderer.release_count(), h.renderer.open_count());
}

#[tokio::test]
async fn test_call_record_json() {
    let h = harness();
    let call_id = h.active_call().await;
    let record = h.manager.get_call(call_id).unwrap();

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["state"], "active");
    assert_eq!(json["call_type"], "cs");
    assert_eq!(json["video_state"], "voice");
}

#[tokio::test]
async fn test_shutdown_silences_playback() {
    let h = harness();
    h.incoming(CallType::Cs).await;
    assert!(h.manager.is_ringing());

    h.manager.shutdown().await.unwrap();
    assert!(!h.manager.is_ringing());
    assert!(!h.vibrator.is_vibrating());
    assert!(matches!(
        h.manager.dial_call(DialRequest::new("5550100", SlotId(0), CallType::Cs)).await,
        Err(CallManagerError::NotInitialized)
    ));
}
