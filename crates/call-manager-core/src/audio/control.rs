//! Audio control manager
//!
//! Orchestrates the call-state and audio-device machines. Registry changes
//! reported by the request process are translated into [`AudioEvent`]s,
//! fed to the call-state machine, and the resulting posture drives the
//! audio interrupt state, the output route, the audio mode and tone/ring
//! playback.
//!
//! Every path into the machines (direct calls and the queued worker) goes
//! through one async mutex, so events are processed strictly one at a time.
//! The registry is only read through snapshots and is never locked while
//! playback or platform calls are awaited.

use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::call_state::{AudioMode, CallSnapshot, CallStateEffect, CallStateKind, CallStateMachine};
use crate::audio::device_state::{
    AudioDevice, AudioDeviceStateMachine, AudioInterruptState, DeviceContext, DeviceStateKind, ScoLink,
};
use crate::audio::event::AudioEvent;
use crate::audio::ring::Ring;
use crate::audio::tone::{Tone, ToneDescriptor};
use crate::config::{CallManagerConfig, RingerMode};
use crate::error::{CallManagerError, CallManagerResult};
use crate::events::{CallManagerEvent, EventEmitter};
use crate::platform::{AudioPlatform, AudioRenderer, Vibrator};
use crate::registry::{foreground_of, CallRegistry};
use crate::types::{CallEndedType, CallId, CallRecord, CallState, CallType, SlotId, VideoState};

/// Everything the dispatch lock protects
struct FsmPair {
    call: CallStateMachine,
    device: AudioDeviceStateMachine,
    interrupt: AudioInterruptState,
    bt_sco_available: bool,
    wired_headset_available: bool,
    muted: bool,
    /// Video-ness seen by the last route update
    video: bool,
}

impl FsmPair {
    fn new() -> Self {
        Self {
            call: CallStateMachine::new(),
            device: AudioDeviceStateMachine::new(),
            interrupt: AudioInterruptState::UnInterrupt,
            bt_sco_available: false,
            wired_headset_available: false,
            muted: false,
            video: false,
        }
    }

    fn route(&self) -> (DeviceStateKind, ScoLink) {
        (self.device.current(), self.device.sco_link())
    }
}

/// Call classes that have a `New*`/`NoMore*` event pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallClass {
    Dialing,
    Alerting,
    Ringing,
    Active,
}

impl CallClass {
    fn of(state: CallState) -> Option<Self> {
        match state {
            CallState::Dialing => Some(CallClass::Dialing),
            CallState::Alerting => Some(CallClass::Alerting),
            CallState::Incoming | CallState::Waiting => Some(CallClass::Ringing),
            CallState::Active => Some(CallClass::Active),
            _ => None,
        }
    }

    fn count(self, calls: &[CallRecord]) -> usize {
        calls
            .iter()
            .filter(|call| CallClass::of(call.state) == Some(self))
            .count()
    }

    fn first_event(self, call_type: CallType) -> AudioEvent {
        match self {
            CallClass::Dialing => AudioEvent::NewDialingCall,
            CallClass::Alerting => AudioEvent::NewAlertingCall,
            CallClass::Ringing => AudioEvent::NewIncomingCall,
            CallClass::Active if call_type == CallType::Ims => AudioEvent::NewActiveImsCall,
            CallClass::Active => AudioEvent::NewActiveCsCall,
        }
    }

    fn last_event(self) -> AudioEvent {
        match self {
            CallClass::Dialing => AudioEvent::NoMoreDialingCall,
            CallClass::Alerting => AudioEvent::NoMoreAlertingCall,
            CallClass::Ringing => AudioEvent::NoMoreIncomingCall,
            CallClass::Active => AudioEvent::NoMoreActiveCall,
        }
    }
}

/// Events raised when one call moves from `prior` to `next`
///
/// `calls` already reflects the move. `None` stands for "not registered".
fn call_events(
    calls: &[CallRecord],
    call_type: CallType,
    prior: Option<CallState>,
    next: Option<CallState>,
) -> Vec<AudioEvent> {
    let prior_class = prior.and_then(CallClass::of);
    let next_class = next.and_then(CallClass::of);
    if prior_class == next_class {
        return Vec::new();
    }
    let mut events = Vec::new();
    if let Some(class) = next_class {
        if class.count(calls) == 1 {
            events.push(class.first_event(call_type));
        }
    }
    if let Some(class) = prior_class {
        if class.count(calls) == 0 {
            events.push(class.last_event());
        }
    }
    events
}

fn is_bearer(kind: CallStateKind) -> bool {
    matches!(kind, CallStateKind::Cs | CallStateKind::Ims | CallStateKind::Ott)
}

/// Whether the machine has drifted from what the registry implies in a way
/// no event will fix
fn needs_reevaluation(current: CallStateKind, expected: CallStateKind, snapshot: &CallSnapshot) -> bool {
    current != expected
        && (expected == CallStateKind::Inactive
            || matches!(current, CallStateKind::Inactive | CallStateKind::Holding)
            || (is_bearer(current) && (is_bearer(expected) || snapshot.active == 0)))
}

fn video_in_use(calls: &[CallRecord]) -> bool {
    calls
        .iter()
        .any(|call| call.state == CallState::Active && AudioControlManager::is_video_call(call.video_state))
        || foreground_of(calls).is_some_and(|call| AudioControlManager::is_video_call(call.video_state))
}

fn ended_tone(ended_type: CallEndedType) -> ToneDescriptor {
    match ended_type {
        CallEndedType::Busy => ToneDescriptor::Engaged,
        CallEndedType::Normal => ToneDescriptor::Finished,
        CallEndedType::InvalidNumber => ToneDescriptor::InvalidNumber,
        CallEndedType::Unknown => ToneDescriptor::Unknown,
    }
}

/// The audio orchestrator
pub struct AudioControlManager {
    registry: Arc<CallRegistry>,
    platform: Arc<dyn AudioPlatform>,
    tone: Tone,
    ring: Ring,
    events: EventEmitter,
    fsm: Mutex<FsmPair>,
    queue_capacity: usize,
    queue: parking_lot::Mutex<Option<mpsc::Sender<AudioEvent>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AudioControlManager {
    pub fn new(
        config: &CallManagerConfig,
        registry: Arc<CallRegistry>,
        platform: Arc<dyn AudioPlatform>,
        renderer: Arc<dyn AudioRenderer>,
        vibrator: Arc<dyn Vibrator>,
        events: EventEmitter,
    ) -> Self {
        let tone = Tone::new(
            renderer.clone(),
            events.clone(),
            config.render_period(),
            config.tone_duration(),
        );
        let ring = Ring::new(config, renderer, vibrator, events.clone());
        Self {
            registry,
            platform,
            tone,
            ring,
            events,
            fsm: Mutex::new(FsmPair::new()),
            queue_capacity: config.event_queue_capacity,
            queue: parking_lot::Mutex::new(None),
            worker: parking_lot::Mutex::new(None),
        }
    }

    /// Start the worker draining [`submit`](Self::submit)ted events
    pub fn init(self: &Arc<Self>) -> CallManagerResult<()> {
        let mut queue = self.queue.lock();
        if queue.is_some() {
            return Err(CallManagerError::AlreadyInitialized);
        }
        let (tx, mut rx) = mpsc::channel(self.queue_capacity);
        let manager: Weak<Self> = Arc::downgrade(self);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.dispatch(event).await;
            }
            debug!("audio event worker stopped");
        });
        *queue = Some(tx);
        *self.worker.lock() = Some(worker);
        info!("audio control manager initialized");
        Ok(())
    }

    /// Drain the queue, stop the worker and silence all playback
    pub async fn shutdown(&self) -> CallManagerResult<()> {
        let sender = self.queue.lock().take();
        if sender.is_none() {
            return Err(CallManagerError::NotInitialized);
        }
        drop(sender);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("audio event worker ended abnormally: {}", e);
            }
        }
        futures::join!(self.tone.stop(), self.ring.stop());
        info!("audio control manager shut down");
        Ok(())
    }

    /// Queue an event for the worker
    pub fn submit(&self, event: AudioEvent) -> CallManagerResult<()> {
        let queue = self.queue.lock();
        let sender = queue.as_ref().ok_or(CallManagerError::NotInitialized)?;
        sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CallManagerError::resource("audio event queue", "queue is full")
            }
            mpsc::error::TrySendError::Closed(_) => CallManagerError::NotInitialized,
        })
    }

    /// Process one event now; returns whether the target machine accepted it
    pub async fn dispatch(&self, event: AudioEvent) -> bool {
        let mut fsm = self.fsm.lock().await;
        self.dispatch_locked(&mut fsm, event).await
    }

    async fn dispatch_locked(&self, fsm: &mut FsmPair, event: AudioEvent) -> bool {
        if event.is_call_event() {
            self.dispatch_call_event(fsm, event).await
        } else if event.is_device_event() {
            self.dispatch_device_event(fsm, event)
        } else {
            debug!("ignoring {}", event);
            false
        }
    }

    async fn dispatch_call_event(&self, fsm: &mut FsmPair, event: AudioEvent) -> bool {
        let calls = self.registry.snapshot();
        let snapshot = CallSnapshot::from_records(&calls);
        let previous = fsm.call.current();
        if !fsm.call.process_event(event, &snapshot) {
            return false;
        }
        self.after_call_transition(fsm, previous, &calls, &snapshot).await;
        true
    }

    fn dispatch_device_event(&self, fsm: &mut FsmPair, event: AudioEvent) -> bool {
        match event {
            AudioEvent::WiredHeadsetConnected => fsm.wired_headset_available = true,
            AudioEvent::WiredHeadsetDisconnected => fsm.wired_headset_available = false,
            AudioEvent::BluetoothScoConnected => fsm.bt_sco_available = true,
            AudioEvent::BluetoothScoDisconnected => fsm.bt_sco_available = false,
            _ => {}
        }
        let calls = self.registry.snapshot();
        let ctx = self.device_context(fsm, &calls);
        let before = fsm.route();
        let accepted = fsm.device.process_event(event, &ctx);
        if !accepted && event == AudioEvent::AudioDeactivated {
            fsm.device.disable_all();
        }
        self.publish_route(fsm, before);
        accepted
    }

    /// Run queued effects and bring interrupt and route in line
    async fn after_call_transition(
        &self,
        fsm: &mut FsmPair,
        previous: CallStateKind,
        calls: &[CallRecord],
        snapshot: &CallSnapshot,
    ) {
        let current = fsm.call.current();
        if current != previous {
            self.events
                .emit(CallManagerEvent::CallPostureChanged { previous, current });
        }
        for effect in fsm.call.take_effects() {
            self.execute_effect(effect, calls).await;
        }
        if snapshot.incoming == 0 {
            self.tone.stop_if(ToneDescriptor::Waiting).await;
        }
        self.update_interrupt(fsm, calls);
        self.update_video_route(fsm, calls);
    }

    async fn execute_effect(&self, effect: CallStateEffect, calls: &[CallRecord]) {
        match effect {
            CallStateEffect::PlayRingback => {
                if let Err(e) = self.tone.play(ToneDescriptor::Ringback).await {
                    warn!("ringback failed: {}", e);
                }
            }
            CallStateEffect::StopRingback => {
                self.tone.stop_if(ToneDescriptor::Ringback).await;
            }
            CallStateEffect::StartRinging => {
                let slot = Self::ringing_slot(calls);
                if let Err(e) = self.start_ringing(slot).await {
                    warn!("ringtone failed: {}", e);
                    self.events.emit(CallManagerEvent::PlaybackFailed {
                        source: "ringtone".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            CallStateEffect::StopRinging => {
                self.stop_ringtone().await;
            }
            CallStateEffect::PlayWaitingTone => {
                if let Err(e) = self.tone.play(ToneDescriptor::Waiting).await {
                    warn!("call waiting tone failed: {}", e);
                }
            }
            CallStateEffect::MuteNetworkRingTone => {
                self.mute_network_ring_tone().await;
            }
            CallStateEffect::AudioModeChanged(mode) => {
                if let Err(e) = self.platform.set_audio_mode(mode) {
                    warn!("failed to set audio mode {:?}: {}", mode, e);
                }
                info!("audio mode -> {:?}", mode);
                self.events.emit(CallManagerEvent::AudioModeChanged { mode });
            }
        }
    }

    fn update_interrupt(&self, fsm: &mut FsmPair, calls: &[CallRecord]) {
        let next = match fsm.call.current() {
            CallStateKind::Inactive => AudioInterruptState::UnInterrupt,
            CallStateKind::Incoming => AudioInterruptState::InRinging,
            _ => AudioInterruptState::InInterrupt,
        };
        if next == fsm.interrupt {
            return;
        }
        debug!("audio interrupt {:?} -> {:?}", fsm.interrupt, next);
        fsm.interrupt = next;

        let event = match next {
            AudioInterruptState::UnInterrupt => AudioEvent::AudioDeactivated,
            AudioInterruptState::InRinging => AudioEvent::AudioRinging,
            AudioInterruptState::InInterrupt => AudioEvent::AudioActivated,
        };
        let ctx = self.device_context(fsm, calls);
        let before = fsm.route();
        if !fsm.device.process_event(event, &ctx) && event == AudioEvent::AudioDeactivated {
            fsm.device.disable_all();
        }
        self.publish_route(fsm, before);

        if next == AudioInterruptState::UnInterrupt {
            self.apply_mute(fsm, false);
        }
    }

    /// Force the speaker when the calls turn video; a later earpiece choice stands
    fn update_video_route(&self, fsm: &mut FsmPair, calls: &[CallRecord]) -> bool {
        let video = video_in_use(calls);
        let became_video = video && !fsm.video;
        fsm.video = video;
        became_video && self.force_video_speaker(fsm, calls)
    }

    fn force_video_speaker(&self, fsm: &mut FsmPair, calls: &[CallRecord]) -> bool {
        if fsm.device.current() != DeviceStateKind::Earpiece {
            return false;
        }
        let ctx = self.device_context(fsm, calls);
        let before = fsm.route();
        match fsm.device.switch_device(AudioDevice::Speaker, &ctx) {
            Ok(()) => {
                info!("video call moved audio to the speaker");
                self.publish_route(fsm, before);
                true
            }
            Err(e) => {
                debug!("could not move video call to the speaker: {}", e);
                false
            }
        }
    }

    fn device_context(&self, fsm: &FsmPair, calls: &[CallRecord]) -> DeviceContext {
        DeviceContext {
            bt_sco_available: fsm.bt_sco_available,
            wired_headset_available: fsm.wired_headset_available,
            interrupt: fsm.interrupt,
            video_active: video_in_use(calls),
            speakerphone_on: foreground_of(calls).is_some_and(|call| call.speakerphone_on),
        }
    }

    fn publish_route(&self, fsm: &FsmPair, before: (DeviceStateKind, ScoLink)) {
        let (previous, previous_link) = before;
        let (current, link) = fsm.route();
        if current != previous {
            if let Err(e) = self.platform.set_output_route(current.device()) {
                warn!("failed to route audio to {}: {}", current, e);
            }
            self.events.emit(CallManagerEvent::AudioDeviceChanged {
                previous: previous.device(),
                current: current.device(),
            });
        }
        if link != previous_link {
            if let Err(e) = self.platform.set_sco_link(link) {
                warn!("failed to set sco link {:?}: {}", link, e);
            }
        }
    }

    fn apply_mute(&self, fsm: &mut FsmPair, muted: bool) {
        if fsm.muted == muted {
            return;
        }
        if let Err(e) = self.platform.set_microphone_mute(muted) {
            warn!("failed to set microphone mute {}: {}", muted, e);
            return;
        }
        fsm.muted = muted;
        self.events.emit(CallManagerEvent::MuteChanged { muted });
    }

    fn ringing_slot(calls: &[CallRecord]) -> SlotId {
        calls
            .iter()
            .find(|call| call.state.is_ringing())
            .map(|call| call.slot_id)
            .unwrap_or_default()
    }

    /// Translate one call's move into events and settle the machines
    async fn apply_call_change(&self, call_type: CallType, prior: Option<CallState>, next: Option<CallState>) {
        let mut fsm = self.fsm.lock().await;
        let calls = self.registry.snapshot();
        for event in call_events(&calls, call_type, prior, next) {
            self.dispatch_locked(&mut fsm, event).await;
        }
        self.settle(&mut fsm).await;
    }

    async fn settle(&self, fsm: &mut FsmPair) {
        let calls = self.registry.snapshot();
        let snapshot = CallSnapshot::from_records(&calls);
        let previous = fsm.call.current();
        let expected = CallStateKind::from_snapshot(&snapshot);
        if needs_reevaluation(previous, expected, &snapshot) {
            debug!("call state {} re-evaluated to {}", previous, expected);
            fsm.call.switch_to(expected, &snapshot);
        }
        self.after_call_transition(fsm, previous, &calls, &snapshot).await;
    }

    /// A call was registered
    pub async fn new_call_created(&self, call: &CallRecord) {
        self.apply_call_change(call.call_type, None, Some(call.state)).await;
        if call.is_emergency {
            let mut fsm = self.fsm.lock().await;
            if fsm.muted {
                info!("emergency call {} forces the microphone on", call.call_id);
            }
            self.apply_mute(&mut fsm, false);
        }
    }

    /// A call left the registry
    pub async fn call_destroyed(&self, call: &CallRecord) {
        self.apply_call_change(call.call_type, Some(call.state), None).await;
    }

    /// A registered call changed state
    pub async fn call_state_updated(
        &self,
        call_id: CallId,
        prior: CallState,
        next: CallState,
    ) -> CallManagerResult<()> {
        let call = self.registry.require(call_id)?;
        self.apply_call_change(call.call_type, Some(prior), Some(next)).await;
        if next == CallState::Disconnected
            && matches!(prior, CallState::Active | CallState::Dialing | CallState::Holding)
        {
            self.play_call_ended_tone(call.ended_type).await?;
        }
        Ok(())
    }

    /// A ringing call was answered
    pub async fn incoming_call_activated(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.registry.require(call_id)?;
        self.apply_call_change(call.call_type, Some(CallState::Incoming), Some(call.state))
            .await;
        Ok(())
    }

    /// A ringing call went away unanswered
    pub async fn incoming_call_hung_up(&self, call: &CallRecord) {
        self.apply_call_change(call.call_type, Some(CallState::Incoming), None).await;
        if !self.registry.has_ringing_call() {
            self.stop_ringtone().await;
        }
    }

    /// A call switched bearer, e.g. CS to IMS after an SRVCC-style handover
    pub async fn call_type_changed(
        &self,
        call_id: CallId,
        old: CallType,
        new: CallType,
    ) -> CallManagerResult<()> {
        let call = self.registry.require(call_id)?;
        let foreground_active = self
            .registry
            .find_by_state(CallState::Active)
            .first()
            .is_some_and(|active| active.call_id == call.call_id);
        let event = match (old, new) {
            (CallType::Cs, CallType::Ims) => Some(AudioEvent::CallTypeCsChangeIms),
            (CallType::Ims, CallType::Cs) => Some(AudioEvent::CallTypeImsChangeCs),
            _ => None,
        };
        let mut fsm = self.fsm.lock().await;
        if let (Some(event), true) = (event, foreground_active) {
            self.dispatch_locked(&mut fsm, event).await;
        }
        self.settle(&mut fsm).await;
        Ok(())
    }

    /// Record a video state change and re-evaluate the route
    pub async fn video_state_updated(
        &self,
        call_id: CallId,
        old: VideoState,
        new: VideoState,
    ) -> CallManagerResult<()> {
        self.registry.update_with(call_id, |call| call.video_state = new)?;
        if old != new {
            self.events.emit(CallManagerEvent::VideoStateChanged {
                call_id,
                previous: old,
                current: new,
            });
        }
        if Self::is_video_call(old) != Self::is_video_call(new) {
            self.update_device_type_for_video_call().await;
        }
        Ok(())
    }

    /// Move a video call off the earpiece; returns whether the route changed
    pub async fn update_device_type_for_video_call(&self) -> bool {
        let mut fsm = self.fsm.lock().await;
        let calls = self.registry.snapshot();
        fsm.video = video_in_use(&calls);
        fsm.video && self.force_video_speaker(&mut fsm, &calls)
    }

    /// Only full two-way video counts; one-way video is routed like voice
    pub fn is_video_call(video_state: VideoState) -> bool {
        video_state == VideoState::Video
    }

    /// Explicit route choice
    pub async fn set_audio_device(&self, device: AudioDevice) -> CallManagerResult<()> {
        let mut fsm = self.fsm.lock().await;
        let calls = self.registry.snapshot();
        let ctx = self.device_context(&fsm, &calls);
        let before = fsm.route();
        fsm.device.switch_device(device, &ctx)?;
        if let Some(foreground) = foreground_of(&calls) {
            let speaker = device == AudioDevice::Speaker;
            if let Err(e) = self
                .registry
                .update_with(foreground.call_id, |call| call.speakerphone_on = speaker)
            {
                debug!("foreground call vanished while routing: {}", e);
            }
        }
        self.publish_route(&fsm, before);
        Ok(())
    }

    /// Mute or unmute the microphone; muting is ignored during an emergency call
    pub async fn set_mute(&self, muted: bool) -> CallManagerResult<()> {
        let mut fsm = self.fsm.lock().await;
        let effective = muted && !self.registry.has_emergency_call();
        if muted && !effective {
            warn!("microphone stays on during an emergency call");
        }
        if fsm.muted != effective {
            self.platform.set_microphone_mute(effective)?;
            fsm.muted = effective;
            self.events.emit(CallManagerEvent::MuteChanged { muted: effective });
        }
        Ok(())
    }

    pub async fn is_muted(&self) -> bool {
        self.fsm.lock().await.muted
    }

    /// Ring for the first ringing call
    pub async fn play_ringtone(&self) -> CallManagerResult<()> {
        let calls = self.registry.snapshot();
        self.start_ringing(Self::ringing_slot(&calls)).await
    }

    async fn start_ringing(&self, slot_id: SlotId) -> CallManagerResult<()> {
        self.ring.play(slot_id).await?;
        self.events.emit(CallManagerEvent::RingingChanged { ringing: true });
        Ok(())
    }

    pub async fn stop_ringtone(&self) -> bool {
        let stopped = self.ring.stop().await;
        if stopped {
            self.events.emit(CallManagerEvent::RingingChanged { ringing: false });
        }
        stopped
    }

    pub async fn play_call_tone(&self, tone: ToneDescriptor) -> CallManagerResult<()> {
        self.tone.play(tone).await
    }

    pub async fn stop_call_tone(&self) -> bool {
        self.tone.stop().await
    }

    pub async fn play_ringback(&self) -> CallManagerResult<()> {
        self.tone.play(ToneDescriptor::Ringback).await
    }

    pub async fn play_waiting_tone(&self) -> CallManagerResult<()> {
        self.tone.play(ToneDescriptor::Waiting).await
    }

    pub async fn play_holding_tone(&self) -> CallManagerResult<()> {
        self.tone.play(ToneDescriptor::Waiting).await
    }

    /// Local DTMF feedback; characters off the dial pad are ignored
    pub async fn start_dtmf(&self, digit: char) -> CallManagerResult<()> {
        self.tone.play(Tone::convert_digit_to_tone(digit)).await
    }

    pub async fn stop_dtmf(&self) -> bool {
        match self.tone.current() {
            Some(tone) if tone.is_dtmf() => self.tone.stop_if(tone).await,
            _ => false,
        }
    }

    pub async fn play_call_ended_tone(&self, ended_type: CallEndedType) -> CallManagerResult<()> {
        self.tone.play(ended_tone(ended_type)).await
    }

    /// Stop the network ringback; returns whether it was playing
    pub async fn mute_network_ring_tone(&self) -> bool {
        self.tone.stop_if(ToneDescriptor::Ringback).await
    }

    /// Takes effect from the next ring
    pub fn set_ringer_mode(&self, mode: RingerMode) {
        self.ring.set_ringer_mode(mode);
    }

    pub fn foreground_call(&self) -> Option<CallRecord> {
        self.registry.foreground()
    }

    /// Foreground call unless it is on hold
    pub fn current_call(&self) -> Option<CallRecord> {
        self.registry
            .foreground()
            .filter(|call| call.state != CallState::Holding)
    }

    pub async fn call_state(&self) -> CallStateKind {
        self.fsm.lock().await.call.current()
    }

    pub async fn audio_mode(&self) -> AudioMode {
        self.fsm.lock().await.call.audio_mode()
    }

    pub async fn audio_device(&self) -> AudioDevice {
        self.fsm.lock().await.device.current().device()
    }

    pub async fn audio_interrupt_state(&self) -> AudioInterruptState {
        self.fsm.lock().await.interrupt
    }

    pub async fn is_audio_active(&self) -> bool {
        self.fsm.lock().await.interrupt != AudioInterruptState::UnInterrupt
    }

    pub async fn sco_link(&self) -> ScoLink {
        self.fsm.lock().await.device.sco_link()
    }

    pub fn is_ringing(&self) -> bool {
        self.ring.is_ringing()
    }

    pub fn is_tone_playing(&self) -> bool {
        self.tone.current().is_some()
    }

    pub fn current_tone(&self) -> Option<ToneDescriptor> {
        self.tone.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallManagerEvent> {
        self.events.receiver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallManagerConfigBuilder;
    use crate::testing::{MockRenderer, MockVibrator, RecordingAudioPlatform};
    use crate::types::CallDirection;
    use std::time::Duration;

    struct Fixture {
        manager: Arc<AudioControlManager>,
        registry: Arc<CallRegistry>,
        platform: Arc<RecordingAudioPlatform>,
    }

    fn fixture() -> Fixture {
        let config = CallManagerConfigBuilder::new()
            .render_period(Duration::from_millis(5))
            .tone_duration(Duration::from_millis(200))
            .build()
            .unwrap();
        let registry = Arc::new(CallRegistry::new());
        let platform = Arc::new(RecordingAudioPlatform::new());
        let manager = Arc::new(AudioControlManager::new(
            &config,
            registry.clone(),
            platform.clone(),
            Arc::new(MockRenderer::new()),
            Arc::new(MockVibrator::new()),
            EventEmitter::default(),
        ));
        Fixture {
            manager,
            registry,
            platform,
        }
    }

    impl Fixture {
        async fn add(&self, call_type: CallType, state: CallState) -> CallRecord {
            let call = CallRecord::new(
                self.registry.allocate_id(),
                SlotId(0),
                call_type,
                state,
                CallDirection::Incoming,
                "5551234",
            );
            self.registry.insert(call.clone()).unwrap();
            self.manager.new_call_created(&call).await;
            call
        }

        async fn move_to(&self, call_id: CallId, next: CallState) {
            let prior = self.registry.update_state(call_id, next).unwrap();
            self.manager.call_state_updated(call_id, prior, next).await.unwrap();
        }

        async fn remove(&self, call_id: CallId) {
            let call = self.registry.remove(call_id).unwrap();
            self.manager.call_destroyed(&call).await;
        }
    }

    #[tokio::test]
    async fn test_incoming_call_rings_on_speaker() {
        let f = fixture();
        f.add(CallType::Cs, CallState::Incoming).await;

        assert_eq!(f.manager.call_state().await, CallStateKind::Incoming);
        assert_eq!(f.manager.audio_interrupt_state().await, AudioInterruptState::InRinging);
        assert_eq!(f.manager.audio_device().await, AudioDevice::Speaker);
        assert!(f.manager.is_ringing());
        assert_eq!(f.platform.last_mode(), Some(AudioMode::Ringtone));
    }

    #[tokio::test]
    async fn test_answer_moves_to_earpiece() {
        let f = fixture();
        let call = f.add(CallType::Cs, CallState::Incoming).await;
        f.registry.update_state(call.call_id, CallState::Active).unwrap();
        f.manager.incoming_call_activated(call.call_id).await.unwrap();

        assert_eq!(f.manager.call_state().await, CallStateKind::Cs);
        assert_eq!(f.manager.audio_device().await, AudioDevice::Earpiece);
        assert!(!f.manager.is_ringing());
        assert_eq!(f.platform.last_mode(), Some(AudioMode::InCall));
    }

    #[tokio::test]
    async fn test_hang_up_plays_ended_tone_and_releases_route() {
        let f = fixture();
        let call = f.add(CallType::Ims, CallState::Active).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Ims);

        f.move_to(call.call_id, CallState::Disconnected).await;
        assert_eq!(f.manager.current_tone(), Some(ToneDescriptor::Finished));
        f.remove(call.call_id).await;

        assert_eq!(f.manager.call_state().await, CallStateKind::Inactive);
        assert_eq!(f.manager.audio_device().await, AudioDevice::Disabled);
        assert!(!f.manager.is_audio_active().await);
        assert_eq!(f.platform.last_mode(), Some(AudioMode::Idle));
    }

    #[tokio::test]
    async fn test_busy_call_plays_engaged() {
        let f = fixture();
        let call = f.add(CallType::Cs, CallState::Dialing).await;
        f.registry
            .update_with(call.call_id, |call| call.ended_type = CallEndedType::Busy)
            .unwrap();
        f.move_to(call.call_id, CallState::Disconnected).await;
        assert_eq!(f.manager.current_tone(), Some(ToneDescriptor::Engaged));
    }

    #[tokio::test]
    async fn test_alerting_plays_ringback_until_answered() {
        let f = fixture();
        let call = f.add(CallType::Cs, CallState::Dialing).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Dialing);

        f.move_to(call.call_id, CallState::Alerting).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Alerting);
        assert_eq!(f.manager.current_tone(), Some(ToneDescriptor::Ringback));

        f.move_to(call.call_id, CallState::Active).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Cs);
        assert_eq!(f.manager.current_tone(), None);
    }

    #[tokio::test]
    async fn test_waiting_call_plays_waiting_tone() {
        let f = fixture();
        f.add(CallType::Cs, CallState::Active).await;
        let waiting = f.add(CallType::Cs, CallState::Waiting).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Cs);
        assert_eq!(f.manager.current_tone(), Some(ToneDescriptor::Waiting));

        let call = f.registry.remove(waiting.call_id).unwrap();
        f.manager.incoming_call_hung_up(&call).await;
        assert_eq!(f.manager.current_tone(), None);
        assert_eq!(f.manager.call_state().await, CallStateKind::Cs);
    }

    #[tokio::test]
    async fn test_ott_call_is_settled_to_ott() {
        let f = fixture();
        f.add(CallType::Ott, CallState::Active).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Ott);
        assert_eq!(f.platform.last_mode(), Some(AudioMode::InVoip));
    }

    #[tokio::test]
    async fn test_last_held_call_leaving_goes_inactive() {
        let f = fixture();
        let call = f.add(CallType::Cs, CallState::Active).await;
        f.move_to(call.call_id, CallState::Holding).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Holding);

        f.remove(call.call_id).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Inactive);
    }

    #[tokio::test]
    async fn test_sco_beats_wired_headset_in_either_order() {
        for order in [
            [AudioEvent::WiredHeadsetConnected, AudioEvent::BluetoothScoConnected],
            [AudioEvent::BluetoothScoConnected, AudioEvent::WiredHeadsetConnected],
        ] {
            let f = fixture();
            f.add(CallType::Cs, CallState::Active).await;
            for event in order {
                f.manager.dispatch(event).await;
            }
            assert_eq!(f.manager.audio_device().await, AudioDevice::BluetoothSco);
            assert_eq!(f.manager.sco_link().await, ScoLink::Voice);
        }
    }

    #[tokio::test]
    async fn test_wired_headset_unplug_keeps_sco() {
        let f = fixture();
        f.add(CallType::Cs, CallState::Active).await;
        f.manager.dispatch(AudioEvent::WiredHeadsetConnected).await;
        assert_eq!(f.manager.audio_device().await, AudioDevice::WiredHeadset);
        assert!(f.manager.dispatch(AudioEvent::BluetoothScoConnected).await);
        assert!(!f.manager.dispatch(AudioEvent::WiredHeadsetDisconnected).await);
        assert_eq!(f.manager.audio_device().await, AudioDevice::BluetoothSco);

        f.manager.dispatch(AudioEvent::BluetoothScoDisconnected).await;
        assert_eq!(f.manager.audio_device().await, AudioDevice::Earpiece);
        assert_eq!(f.platform.sco_links().last(), Some(&ScoLink::Closed));
    }

    #[tokio::test]
    async fn test_video_call_uses_speaker() {
        let f = fixture();
        let call = f.add(CallType::Ims, CallState::Active).await;
        assert_eq!(f.manager.audio_device().await, AudioDevice::Earpiece);

        f.manager
            .video_state_updated(call.call_id, VideoState::Voice, VideoState::Video)
            .await
            .unwrap();
        assert_eq!(f.manager.audio_device().await, AudioDevice::Speaker);
        assert_eq!(f.platform.last_route(), Some(AudioDevice::Speaker));
    }

    #[tokio::test]
    async fn test_earpiece_choice_survives_later_call_events() {
        let f = fixture();
        let call = f.add(CallType::Ims, CallState::Active).await;
        f.manager
            .video_state_updated(call.call_id, VideoState::Voice, VideoState::Video)
            .await
            .unwrap();
        assert_eq!(f.manager.audio_device().await, AudioDevice::Speaker);

        f.manager.set_audio_device(AudioDevice::Earpiece).await.unwrap();
        f.add(CallType::Ims, CallState::Waiting).await;
        assert_eq!(f.manager.audio_device().await, AudioDevice::Earpiece);
        assert_eq!(f.platform.last_route(), Some(AudioDevice::Earpiece));
    }

    #[tokio::test]
    async fn test_one_way_video_is_not_video() {
        assert!(AudioControlManager::is_video_call(VideoState::Video));
        assert!(!AudioControlManager::is_video_call(VideoState::SendOnly));
        assert!(!AudioControlManager::is_video_call(VideoState::ReceiveOnly));
        assert!(!AudioControlManager::is_video_call(VideoState::Voice));
    }

    #[tokio::test]
    async fn test_emergency_call_forces_unmute() {
        let f = fixture();
        f.add(CallType::Cs, CallState::Active).await;
        f.manager.set_mute(true).await.unwrap();
        assert!(f.manager.is_muted().await);
        assert!(f.platform.is_muted());

        let emergency = CallRecord::new(
            f.registry.allocate_id(),
            SlotId(0),
            CallType::Cs,
            CallState::Dialing,
            CallDirection::Outgoing,
            "112",
        )
        .with_emergency(true);
        f.registry.insert(emergency.clone()).unwrap();
        f.manager.new_call_created(&emergency).await;
        assert!(!f.manager.is_muted().await);

        f.manager.set_mute(true).await.unwrap();
        assert!(!f.manager.is_muted().await);
        assert!(!f.platform.is_muted());
    }

    #[tokio::test]
    async fn test_set_audio_device_requires_call_audio() {
        let f = fixture();
        let err = f.manager.set_audio_device(AudioDevice::Speaker).await.unwrap_err();
        assert!(matches!(err, CallManagerError::DeviceUnavailable { .. }));

        f.add(CallType::Cs, CallState::Active).await;
        f.manager.set_audio_device(AudioDevice::Speaker).await.unwrap();
        assert_eq!(f.manager.audio_device().await, AudioDevice::Speaker);
        assert!(f.manager.foreground_call().unwrap().speakerphone_on);

        let err = f.manager.set_audio_device(AudioDevice::BluetoothSco).await.unwrap_err();
        assert!(matches!(err, CallManagerError::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_held_call_from_nothing_settles_to_holding() {
        let f = fixture();
        f.add(CallType::Cs, CallState::Holding).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Holding);
        assert_eq!(f.manager.audio_interrupt_state().await, AudioInterruptState::InInterrupt);
    }

    #[tokio::test]
    async fn test_dialing_beside_held_call_leaves_holding() {
        let f = fixture();
        let call = f.add(CallType::Cs, CallState::Active).await;
        f.move_to(call.call_id, CallState::Holding).await;
        f.add(CallType::Cs, CallState::Dialing).await;
        assert_eq!(f.manager.call_state().await, CallStateKind::Dialing);
    }

    #[tokio::test]
    async fn test_rejected_event_leaves_call_state_alone() {
        let f = fixture();
        f.add(CallType::Cs, CallState::Holding).await;
        // Registered without telling the orchestrator
        let dialing = CallRecord::new(
            f.registry.allocate_id(),
            SlotId(0),
            CallType::Cs,
            CallState::Dialing,
            CallDirection::Outgoing,
            "5550102",
        );
        f.registry.insert(dialing).unwrap();

        let before = f.manager.call_state().await;
        assert!(!f.manager.dispatch(AudioEvent::NoMoreActiveCall).await);
        assert_eq!(before, CallStateKind::Holding);
        assert_eq!(f.manager.call_state().await, CallStateKind::Holding);
    }

    #[tokio::test]
    async fn test_unknown_event_is_rejected() {
        let f = fixture();
        assert!(!f.manager.dispatch(AudioEvent::UnknownEvent).await);
        assert_eq!(f.manager.call_state().await, CallStateKind::Inactive);
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let f = fixture();
        assert!(matches!(
            f.manager.submit(AudioEvent::WiredHeadsetConnected),
            Err(CallManagerError::NotInitialized)
        ));

        f.manager.init().unwrap();
        assert!(matches!(f.manager.init(), Err(CallManagerError::AlreadyInitialized)));

        f.add(CallType::Cs, CallState::Active).await;
        f.manager.submit(AudioEvent::WiredHeadsetConnected).unwrap();
        f.manager.shutdown().await.unwrap();
        assert_eq!(f.manager.audio_device().await, AudioDevice::WiredHeadset);
        assert!(matches!(f.manager.shutdown().await, Err(CallManagerError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_dtmf_feedback() {
        let f = fixture();
        f.manager.start_dtmf('7').await.unwrap();
        assert_eq!(f.manager.current_tone(), Some(ToneDescriptor::Dtmf7));
        assert!(f.manager.stop_dtmf().await);
        assert!(!f.manager.stop_dtmf().await);

        f.manager.start_dtmf('x').await.unwrap();
        assert!(!f.manager.is_tone_playing());
    }
}
