//! Call request process
//!
//! Carries out user requests (dial, answer, hold, conference, ...) and radio
//! reports. Admission is decided by [`AdmissionPolicy`]; the resulting
//! actions are applied to existing calls through the [`TelephonyBackend`],
//! and every registry change is reported to the [`AudioControlManager`].
//!
//! The registry is only touched through short synchronous calls, never
//! while the backend or the audio side is awaited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::admission::policy::{AdmissionOutcome, AdmissionPolicy, AdmissionRequest, CallAction, CallWaitingDecision};
use crate::audio::control::AudioControlManager;
use crate::error::{CallManagerError, CallManagerResult};
use crate::events::{CallManagerEvent, EventEmitter};
use crate::platform::TelephonyBackend;
use crate::registry::CallRegistry;
use crate::types::{
    CallDirection, CallEndedType, CallId, CallRecord, CallState, CallType, DialRequest, ImsCallMode, IncomingCall,
    VideoState,
};

/// Clears the dial flag on every exit path
struct DialGuard<'a>(&'a AtomicBool);

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CallRequestProcess {
    registry: Arc<CallRegistry>,
    backend: Arc<dyn TelephonyBackend>,
    audio: Arc<AudioControlManager>,
    policy: AdmissionPolicy,
    events: EventEmitter,
    dial_in_progress: AtomicBool,
}

impl CallRequestProcess {
    pub fn new(
        registry: Arc<CallRegistry>,
        backend: Arc<dyn TelephonyBackend>,
        audio: Arc<AudioControlManager>,
        policy: AdmissionPolicy,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry,
            backend,
            audio,
            policy,
            events,
            dial_in_progress: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    fn evaluate(&self, request: &AdmissionRequest, call_id: Option<CallId>) -> AdmissionOutcome {
        let outcome = self.policy.evaluate(request, &self.registry.snapshot());
        self.events.emit(CallManagerEvent::AdmissionDecided {
            call_id,
            decision: outcome.decision,
        });
        outcome
    }

    fn require_state(&self, call_id: CallId, allowed: &[CallState], operation: &str) -> CallManagerResult<CallRecord> {
        let call = self.registry.require(call_id)?;
        if !allowed.contains(&call.state) {
            return Err(CallManagerError::invalid_state(call_id, call.state, operation));
        }
        Ok(call)
    }

    fn require_ims(&self, call_id: CallId, operation: &str) -> CallManagerResult<CallRecord> {
        let call = self.registry.require(call_id)?;
        if call.call_type != CallType::Ims {
            return Err(CallManagerError::unsupported(operation, call.call_type));
        }
        Ok(call)
    }

    /// Register a call and announce it
    async fn register(&self, call: CallRecord) -> CallManagerResult<()> {
        self.registry.insert(call.clone())?;
        self.events.emit(CallManagerEvent::CallAdded { call: call.clone() });
        self.audio.new_call_created(&call).await;
        Ok(())
    }

    /// Drop a call from the registry and announce it
    async fn unregister(&self, call_id: CallId) -> Option<CallRecord> {
        let call = self.registry.remove(call_id)?;
        self.events.emit(CallManagerEvent::CallRemoved {
            call_id,
            ended_type: call.ended_type,
        });
        if call.state.is_ringing() {
            self.audio.incoming_call_hung_up(&call).await;
        } else {
            self.audio.call_destroyed(&call).await;
        }
        Some(call)
    }

    /// Move a call to `next` and report it; returns the previous state
    async fn set_state(&self, call_id: CallId, next: CallState) -> CallManagerResult<CallState> {
        let prior = self.registry.update_state(call_id, next)?;
        if prior != next {
            debug!("call {} {} -> {}", call_id, prior, next);
            self.events.emit(CallManagerEvent::CallStateChanged {
                call_id,
                previous: prior,
                current: next,
            });
            self.audio.call_state_updated(call_id, prior, next).await?;
        }
        Ok(prior)
    }

    /// Disconnect and remove a call
    async fn finish_call(&self, call_id: CallId, ended_type: CallEndedType) -> CallManagerResult<()> {
        self.registry.update_with(call_id, |call| call.ended_type = ended_type)?;
        self.set_state(call_id, CallState::Disconnected).await?;
        self.unregister(call_id).await;
        Ok(())
    }

    async fn execute_actions(&self, actions: &[CallAction]) -> CallManagerResult<()> {
        for action in actions {
            match *action {
                CallAction::Hold(call_id) => {
                    let call = self.registry.require(call_id)?;
                    self.backend.hold(&call).await?;
                    self.set_state(call_id, CallState::Holding).await?;
                }
                CallAction::HangUp(call_id) => {
                    let call = self.registry.require(call_id)?;
                    self.backend.hang_up(&call).await?;
                    self.finish_call(call_id, CallEndedType::Normal).await?;
                }
                CallAction::Reject(call_id) => {
                    let call = self.registry.require(call_id)?;
                    self.backend.reject(&call).await?;
                    self.unregister(call_id).await;
                }
            }
            debug!("applied {:?}", action);
        }
        Ok(())
    }

    /// Place an outgoing call
    pub async fn dial_request(&self, request: DialRequest) -> CallManagerResult<CallId> {
        if self.dial_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CallManagerError::DialInProgress);
        }
        let _guard = DialGuard(&self.dial_in_progress);

        let admission = AdmissionRequest::dial(request.slot_id, request.call_type, request.is_emergency);
        let outcome = self.evaluate(&admission, None);
        if outcome.is_rejected() {
            let reason = outcome.reason.unwrap_or_else(|| "dial rejected".to_string());
            info!("dial to {} rejected: {}", request.phone_number, reason);
            return Err(CallManagerError::not_allowed(reason));
        }
        self.execute_actions(&outcome.actions).await?;

        let call = CallRecord::new(
            self.registry.allocate_id(),
            request.slot_id,
            request.call_type,
            CallState::Dialing,
            CallDirection::Outgoing,
            request.phone_number,
        )
        .with_video_state(request.video_state)
        .with_emergency(request.is_emergency);
        let call_id = call.call_id;
        self.register(call.clone()).await?;

        if let Err(e) = self.backend.dial(&call).await {
            error!("dial of call {} failed: {}", call_id, e);
            self.unregister(call_id).await;
            return Err(e);
        }
        info!("dialing call {} on {} ({})", call_id, call.slot_id, call.call_type);
        Ok(call_id)
    }

    /// A call arrived from the network
    pub async fn incoming_call(&self, incoming: IncomingCall) -> CallManagerResult<(CallId, CallWaitingDecision)> {
        let mut call = CallRecord::new(
            self.registry.allocate_id(),
            incoming.slot_id,
            incoming.call_type,
            CallState::Incoming,
            CallDirection::Incoming,
            incoming.phone_number,
        )
        .with_video_state(incoming.video_state);
        let call_id = call.call_id;

        let admission = AdmissionRequest::incoming(incoming.slot_id, incoming.call_type);
        let outcome = self.evaluate(&admission, Some(call_id));
        if outcome.is_rejected() {
            info!(
                "incoming call {} rejected: {}",
                call_id,
                outcome.reason.as_deref().unwrap_or("no reason")
            );
            self.backend.reject(&call).await?;
            return Ok((call_id, outcome.decision));
        }

        if let Err(e) = self.execute_actions(&outcome.actions).await {
            warn!("incoming call {} dropped: could not make room: {}", call_id, e);
            if let Err(reject_err) = self.backend.reject(&call).await {
                warn!("failed to reject incoming call {}: {}", call_id, reject_err);
            }
            return Err(e);
        }
        if outcome.decision == CallWaitingDecision::QueueAsWaiting {
            call.state = CallState::Waiting;
        }
        self.register(call).await?;
        info!("incoming call {} admitted as {:?}", call_id, outcome.decision);
        Ok((call_id, outcome.decision))
    }

    /// Answer a ringing call
    pub async fn answer_request(&self, call_id: CallId, video_state: VideoState) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Incoming, CallState::Waiting], "answer")?;

        if call.call_type != CallType::Voip {
            let outcome = self.evaluate(&AdmissionRequest::answer(&call, video_state), Some(call_id));
            if outcome.is_rejected() {
                return Err(CallManagerError::not_allowed(
                    outcome.reason.unwrap_or_else(|| "answer rejected".to_string()),
                ));
            }
            self.execute_actions(&outcome.actions).await?;
        }

        self.backend.answer(&call, video_state).await?;
        let prior = self.registry.update_with(call_id, |call| {
            call.video_state = video_state;
            std::mem::replace(&mut call.state, CallState::Active)
        })?;
        self.events.emit(CallManagerEvent::CallStateChanged {
            call_id,
            previous: prior,
            current: CallState::Active,
        });
        self.audio.incoming_call_activated(call_id).await?;
        info!("answered call {}", call_id);
        Ok(())
    }

    /// Decline a ringing call
    pub async fn reject_request(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Incoming, CallState::Waiting], "reject")?;
        self.backend.reject(&call).await?;
        for held in self.registry.find_by_state(CallState::Holding) {
            self.registry
                .update_with(held.call_id, |held| held.can_unhold = false)?;
        }
        self.unregister(call_id).await;
        info!("rejected call {}", call_id);
        Ok(())
    }

    /// End a call; a held call is resumed when the active one goes away
    pub async fn hang_up_request(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.registry.require(call_id)?;
        if call.state.is_terminal() {
            return Err(CallManagerError::invalid_state(call_id, call.state, "hang up"));
        }
        self.backend.hang_up(&call).await?;
        self.finish_call(call_id, CallEndedType::Normal).await?;
        info!("hung up call {}", call_id);

        if call.state == CallState::Active && !self.registry.has_active_call() {
            let resumable = self
                .registry
                .find_by_state(CallState::Holding)
                .into_iter()
                .find(|held| held.can_unhold);
            if let Some(held) = resumable {
                if let Err(e) = self.resume(&held).await {
                    warn!("could not resume held call {}: {}", held.call_id, e);
                }
            }
        }
        Ok(())
    }

    async fn resume(&self, held: &CallRecord) -> CallManagerResult<()> {
        self.backend.unhold(held).await?;
        self.set_state(held.call_id, CallState::Active).await?;
        Ok(())
    }

    pub async fn hold_request(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Active], "hold")?;
        self.backend.hold(&call).await?;
        self.set_state(call_id, CallState::Holding).await?;
        Ok(())
    }

    /// Resume a held call, holding whatever is active first
    pub async fn unhold_request(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Holding], "unhold")?;
        for active in self.registry.find_by_state(CallState::Active) {
            self.backend.hold(&active).await?;
            self.set_state(active.call_id, CallState::Holding).await?;
        }
        self.registry.update_with(call_id, |call| call.can_unhold = true)?;
        self.resume(&call).await
    }

    /// Swap the active and the held call
    pub async fn switch_request(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Active, CallState::Holding], "switch")?;
        let (to_hold, to_resume) = if call.state == CallState::Holding {
            (self.registry.find_by_state(CallState::Active), call.clone())
        } else {
            let held = self
                .registry
                .find_by_state(CallState::Holding)
                .into_iter()
                .next()
                .ok_or_else(|| CallManagerError::not_allowed("no held call to switch to"))?;
            (vec![call.clone()], held)
        };
        if to_hold.is_empty() {
            return Err(CallManagerError::not_allowed("no active call to switch from"));
        }

        self.backend.switch(&call).await?;
        for active in to_hold {
            self.set_state(active.call_id, CallState::Holding).await?;
        }
        self.set_state(to_resume.call_id, CallState::Active).await?;
        info!("switched to call {}", to_resume.call_id);
        Ok(())
    }

    /// Merge the held call into a conference with the active main call
    pub async fn combine_conference(&self, main_call_id: CallId) -> CallManagerResult<()> {
        let main = self.require_state(main_call_id, &[CallState::Active], "combine conference")?;
        let peers = self.registry.find_by_state(CallState::Holding);
        if peers.is_empty() {
            return Err(CallManagerError::not_allowed("no held call to merge"));
        }

        self.backend.combine_conference(&main).await?;
        self.registry
            .update_with(main_call_id, |call| call.conference_id = Some(main_call_id))?;
        for peer in peers {
            self.registry
                .update_with(peer.call_id, |call| call.conference_id = Some(main_call_id))?;
            self.set_state(peer.call_id, CallState::Active).await?;
        }
        info!("conference {} formed", main_call_id);
        Ok(())
    }

    fn conference_members(&self, conference_id: CallId) -> Vec<CallRecord> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|call| call.conference_id == Some(conference_id))
            .collect()
    }

    /// A lone remaining member is no longer in a conference
    fn dissolve_if_single(&self, conference_id: CallId) -> CallManagerResult<()> {
        let members = self.conference_members(conference_id);
        if let [last] = members.as_slice() {
            self.registry
                .update_with(last.call_id, |call| call.conference_id = None)?;
            debug!("conference {} dissolved", conference_id);
        }
        Ok(())
    }

    fn require_member(&self, call_id: CallId, operation: &str) -> CallManagerResult<(CallRecord, CallId)> {
        let call = self.registry.require(call_id)?;
        match call.conference_id {
            Some(conference_id) => Ok((call, conference_id)),
            None => Err(CallManagerError::invalid_state(call_id, call.state, operation)),
        }
    }

    /// Take one member private; the rest of the conference is held
    pub async fn separate_conference(&self, call_id: CallId) -> CallManagerResult<()> {
        let (call, conference_id) = self.require_member(call_id, "separate from conference")?;
        self.backend.separate_conference(&call).await?;

        self.registry.update_with(call_id, |call| call.conference_id = None)?;
        for member in self.conference_members(conference_id) {
            if member.state == CallState::Active {
                self.set_state(member.call_id, CallState::Holding).await?;
            }
        }
        self.dissolve_if_single(conference_id)?;
        if call.state != CallState::Active {
            self.set_state(call_id, CallState::Active).await?;
        }
        info!("call {} separated from conference {}", call_id, conference_id);
        Ok(())
    }

    /// Drop one member from the conference
    pub async fn kick_out_from_conference(&self, call_id: CallId) -> CallManagerResult<()> {
        let (call, conference_id) = self.require_member(call_id, "kick out of conference")?;
        self.backend.kick_out_from_conference(&call).await?;
        self.finish_call(call_id, CallEndedType::Normal).await?;
        self.dissolve_if_single(conference_id)?;
        info!("call {} removed from conference {}", call_id, conference_id);
        Ok(())
    }

    /// Invite more parties into the conversation around an active call
    pub async fn join_conference(&self, call_id: CallId, numbers: Vec<String>) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Active], "join conference")?;
        if numbers.is_empty() {
            return Err(CallManagerError::not_allowed("no numbers to invite"));
        }
        self.backend.invite_to_conference(call.slot_id, &numbers).await?;
        info!("invited {} party(ies) into call {}", numbers.len(), call_id);
        Ok(())
    }

    pub async fn start_rtt(&self, call_id: CallId, message: &str) -> CallManagerResult<()> {
        let call = self.require_ims(call_id, "start rtt")?;
        self.backend.start_rtt(&call, message).await
    }

    pub async fn stop_rtt(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.require_ims(call_id, "stop rtt")?;
        self.backend.stop_rtt(&call).await
    }

    /// Upgrade or downgrade the media of an IMS call
    pub async fn update_ims_call_mode(&self, call_id: CallId, mode: ImsCallMode) -> CallManagerResult<()> {
        let call = self.require_ims(call_id, "update call mode")?;
        self.backend.update_call_mode(&call, mode).await?;
        self.audio
            .video_state_updated(call_id, call.video_state, VideoState::from(mode))
            .await
    }

    pub async fn start_dtmf(&self, call_id: CallId, digit: char) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Active], "send dtmf")?;
        self.backend.start_dtmf(&call, digit).await?;
        self.audio.start_dtmf(digit).await
    }

    pub async fn stop_dtmf(&self, call_id: CallId) -> CallManagerResult<()> {
        let call = self.require_state(call_id, &[CallState::Active], "stop dtmf")?;
        self.backend.stop_dtmf(&call).await?;
        self.audio.stop_dtmf().await;
        Ok(())
    }

    /// State change reported by the radio layer
    pub async fn on_call_state_report(
        &self,
        call_id: CallId,
        state: CallState,
        ended_type: Option<CallEndedType>,
    ) -> CallManagerResult<()> {
        self.registry.require(call_id)?;
        if let Some(ended_type) = ended_type {
            self.registry.update_with(call_id, |call| call.ended_type = ended_type)?;
        }
        match state {
            CallState::Disconnected | CallState::Idle => {
                self.set_state(call_id, CallState::Disconnected).await?;
                self.unregister(call_id).await;
                info!("call {} ended by the network", call_id);
            }
            _ => {
                self.set_state(call_id, state).await?;
            }
        }
        Ok(())
    }

    /// Bearer change reported by the radio layer
    pub async fn on_call_type_changed(&self, call_id: CallId, call_type: CallType) -> CallManagerResult<()> {
        let old = self
            .registry
            .update_with(call_id, |call| std::mem::replace(&mut call.call_type, call_type))?;
        if old != call_type {
            info!("call {} moved from {} to {}", call_id, old, call_type);
            self.audio.call_type_changed(call_id, old, call_type).await?;
        }
        Ok(())
    }

    pub async fn on_video_state_changed(&self, call_id: CallId, video_state: VideoState) -> CallManagerResult<()> {
        let old = self.registry.require(call_id)?.video_state;
        self.audio.video_state_updated(call_id, old, video_state).await
    }
}
