//! Call admission and call-waiting policy
//!
//! Decides what happens when a call is requested (incoming, answered or
//! dialed) while other calls exist. The policy is a pure function of the
//! request and a snapshot of the existing calls; it never touches the
//! registry or the backend. [`crate::admission::request`] carries out the
//! outcome.
//!
//! The more calls exist, the less permissive the outcome: adding a call to
//! the snapshot never turns a rejection into an answer.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CallManagerConfig;
use crate::types::{CallId, CallRecord, CallState, CallType, SlotId, VideoState};

/// What to do with the requesting call
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallWaitingDecision {
    /// Proceed (ring, answer or dial)
    Answer,
    /// Proceed after holding the current call
    AutoHold,
    /// Refuse the request
    Reject,
    /// Let it ring as a waiting call
    QueueAsWaiting,
}

impl CallWaitingDecision {
    /// Rank used to compare decisions; higher lets more through
    pub fn permissiveness(&self) -> u8 {
        match self {
            CallWaitingDecision::Answer => 3,
            CallWaitingDecision::AutoHold => 2,
            CallWaitingDecision::QueueAsWaiting => 1,
            CallWaitingDecision::Reject => 0,
        }
    }
}

/// Change to apply to an existing call before the request proceeds
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallAction {
    Hold(CallId),
    HangUp(CallId),
    /// Decline a ringing call
    Reject(CallId),
}

/// Kind of call request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// A call arrives from the network
    Incoming,
    /// The user answers a ringing call
    Answer { video_state: VideoState },
    /// The user places a call
    Dial { is_emergency: bool },
}

/// A call request to evaluate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub kind: RequestKind,
    /// The requesting call, if it is already registered
    pub call_id: Option<CallId>,
    pub slot_id: SlotId,
    pub call_type: CallType,
}

impl AdmissionRequest {
    pub fn incoming(slot_id: SlotId, call_type: CallType) -> Self {
        Self {
            kind: RequestKind::Incoming,
            call_id: None,
            slot_id,
            call_type,
        }
    }

    pub fn answer(call: &CallRecord, video_state: VideoState) -> Self {
        Self {
            kind: RequestKind::Answer { video_state },
            call_id: Some(call.call_id),
            slot_id: call.slot_id,
            call_type: call.call_type,
        }
    }

    pub fn dial(slot_id: SlotId, call_type: CallType, is_emergency: bool) -> Self {
        Self {
            kind: RequestKind::Dial { is_emergency },
            call_id: None,
            slot_id,
            call_type,
        }
    }
}

/// Result of evaluating a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub decision: CallWaitingDecision,
    /// Applied in order before the request proceeds
    pub actions: Vec<CallAction>,
    /// Set when the decision is `Reject`
    pub reason: Option<String>,
}

impl AdmissionOutcome {
    fn answer() -> Self {
        Self::with(CallWaitingDecision::Answer, Vec::new())
    }

    fn queue() -> Self {
        Self::with(CallWaitingDecision::QueueAsWaiting, Vec::new())
    }

    fn with(decision: CallWaitingDecision, actions: Vec<CallAction>) -> Self {
        Self {
            decision,
            actions,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            decision: CallWaitingDecision::Reject,
            actions: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.decision == CallWaitingDecision::Reject
    }
}

pub fn has_active_call<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> bool {
    calls.into_iter().any(|call| call.state == CallState::Active)
}

pub fn has_dialing_call<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> bool {
    calls.into_iter().any(|call| call.state == CallState::Dialing)
}

/// Dialing or alerting
pub fn has_connecting_call<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> bool {
    calls.into_iter().any(|call| call.state.is_connecting())
}

/// Active or holding, i.e. connected at some point
pub fn has_activated_call<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> bool {
    calls
        .into_iter()
        .any(|call| matches!(call.state, CallState::Active | CallState::Holding))
}

/// Incoming or waiting
pub fn has_ringing_call<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> bool {
    calls.into_iter().any(|call| call.state.is_ringing())
}

pub fn has_emergency_call<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> bool {
    calls
        .into_iter()
        .any(|call| call.is_emergency && !call.state.is_terminal())
}

/// Answering with video ends every call that is connecting or connected
pub fn need_answer_vt_and_end_active_vo<'a>(
    answer_video: VideoState,
    others: impl IntoIterator<Item = &'a CallRecord>,
) -> bool {
    answer_video != VideoState::Voice
        && others.into_iter().any(|call| {
            call.state.is_connecting() || matches!(call.state, CallState::Active | CallState::Holding)
        })
}

/// Answering voice ends the calls while a connected call carries video
pub fn need_answer_vo_and_end_active_vt<'a>(
    answer_video: VideoState,
    others: impl IntoIterator<Item = &'a CallRecord>,
) -> bool {
    answer_video == VideoState::Voice
        && has_activated_call(others.into_iter().filter(|call| call.is_video()))
}

/// Hang up every call that is connecting or connected
fn end_calls_for_video(existing: &[&CallRecord]) -> AdmissionOutcome {
    let actions = existing
        .iter()
        .filter(|call| {
            call.state.is_connecting() || matches!(call.state, CallState::Active | CallState::Holding)
        })
        .map(|call| CallAction::HangUp(call.call_id))
        .collect();
    AdmissionOutcome::with(CallWaitingDecision::Answer, actions)
}

/// Admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    call_waiting_enabled: bool,
    max_calls: usize,
}

impl AdmissionPolicy {
    pub fn new(call_waiting_enabled: bool, max_calls: usize) -> Self {
        Self {
            call_waiting_enabled,
            max_calls,
        }
    }

    pub fn from_config(config: &CallManagerConfig) -> Self {
        Self::new(config.call_waiting_enabled, config.max_calls)
    }

    pub fn call_waiting_enabled(&self) -> bool {
        self.call_waiting_enabled
    }

    /// Decide a request against the calls in `calls`
    ///
    /// The requesting call and calls that are idle or on their way out are
    /// ignored.
    pub fn evaluate(&self, request: &AdmissionRequest, calls: &[CallRecord]) -> AdmissionOutcome {
        let existing: Vec<&CallRecord> = calls
            .iter()
            .filter(|call| !call.state.is_terminal() && Some(call.call_id) != request.call_id)
            .collect();

        let outcome = match request.kind {
            RequestKind::Incoming => self.evaluate_incoming(request, &existing),
            RequestKind::Answer { video_state } => self.evaluate_answer(video_state, &existing),
            RequestKind::Dial { is_emergency: true } => self.evaluate_emergency_dial(&existing),
            RequestKind::Dial { is_emergency: false } => self.evaluate_dial(&existing),
        };
        debug!(
            "admission of {:?} on {} against {} call(s): {:?}",
            request.kind,
            request.slot_id,
            existing.len(),
            outcome.decision
        );
        outcome
    }

    fn evaluate_incoming(&self, request: &AdmissionRequest, existing: &[&CallRecord]) -> AdmissionOutcome {
        if existing.is_empty() {
            return AdmissionOutcome::answer();
        }
        if !self.call_waiting_enabled && has_active_call(existing.iter().copied()) {
            return AdmissionOutcome::reject("call waiting is disabled");
        }
        match existing {
            [other] => match other.state {
                CallState::Active => {
                    AdmissionOutcome::with(CallWaitingDecision::AutoHold, vec![CallAction::Hold(other.call_id)])
                }
                CallState::Holding | CallState::Dialing | CallState::Alerting => AdmissionOutcome::answer(),
                CallState::Incoming | CallState::Waiting => AdmissionOutcome::queue(),
                state => AdmissionOutcome::reject(format!("unexpected call in state {}", state)),
            },
            [first, second] => {
                if let Some((held, active)) = held_and_active(*first, *second) {
                    // A held call on another slot is displaced by the slot the
                    // new call arrives on
                    if held.slot_id != request.slot_id && active.slot_id == request.slot_id {
                        return AdmissionOutcome::with(
                            CallWaitingDecision::AutoHold,
                            vec![CallAction::HangUp(held.call_id), CallAction::Hold(active.call_id)],
                        );
                    }
                    return AdmissionOutcome::queue();
                }
                let connected = |call: &CallRecord| matches!(call.state, CallState::Active | CallState::Holding);
                let pending = |call: &CallRecord| call.state.is_connecting() || call.state.is_ringing();
                if first.state == CallState::Holding && second.state == CallState::Holding {
                    AdmissionOutcome::queue()
                } else if (connected(*first) && pending(*second)) || (connected(*second) && pending(*first)) {
                    AdmissionOutcome::queue()
                } else {
                    AdmissionOutcome::reject(format!(
                        "cannot take a call while {} and {}",
                        first.state, second.state
                    ))
                }
            }
            _ => AdmissionOutcome::reject("unsupported call mix"),
        }
    }

    fn evaluate_answer(&self, video_state: VideoState, existing: &[&CallRecord]) -> AdmissionOutcome {
        if existing.len() <= 2
            && (need_answer_vt_and_end_active_vo(video_state, existing.iter().copied())
                || need_answer_vo_and_end_active_vt(video_state, existing.iter().copied()))
        {
            return end_calls_for_video(existing);
        }
        match existing {
            [] => AdmissionOutcome::answer(),
            [other] => match other.state {
                CallState::Active => {
                    AdmissionOutcome::with(CallWaitingDecision::AutoHold, vec![CallAction::Hold(other.call_id)])
                }
                CallState::Holding | CallState::Incoming | CallState::Waiting => AdmissionOutcome::answer(),
                CallState::Dialing | CallState::Alerting => AdmissionOutcome::with(
                    CallWaitingDecision::Answer,
                    vec![CallAction::HangUp(other.call_id)],
                ),
                state => AdmissionOutcome::reject(format!("unexpected call in state {}", state)),
            },
            [first, second] => {
                if let Some((held, active)) = held_and_active(first, second) {
                    return AdmissionOutcome::with(
                        CallWaitingDecision::AutoHold,
                        vec![CallAction::HangUp(held.call_id), CallAction::Hold(active.call_id)],
                    );
                }
                if first.state == CallState::Holding && second.state == CallState::Holding {
                    return AdmissionOutcome::answer();
                }
                let (anchor, other) = match (first.state, second.state) {
                    (CallState::Active | CallState::Holding, _) => (first, second),
                    (_, CallState::Active | CallState::Holding) => (second, first),
                    _ => {
                        return AdmissionOutcome::reject(format!(
                            "cannot answer while {} and {}",
                            first.state, second.state
                        ));
                    }
                };
                match (anchor.state, other.state) {
                    (CallState::Holding, s) if s.is_connecting() => AdmissionOutcome::with(
                        CallWaitingDecision::Answer,
                        vec![CallAction::HangUp(other.call_id)],
                    ),
                    (CallState::Active, s) if s.is_connecting() => AdmissionOutcome::with(
                        CallWaitingDecision::AutoHold,
                        vec![CallAction::HangUp(other.call_id), CallAction::Hold(anchor.call_id)],
                    ),
                    (CallState::Active, s) if s.is_ringing() => {
                        AdmissionOutcome::with(CallWaitingDecision::AutoHold, vec![CallAction::Hold(anchor.call_id)])
                    }
                    (CallState::Holding, s) if s.is_ringing() => AdmissionOutcome::answer(),
                    _ => AdmissionOutcome::reject(format!(
                        "cannot answer while {} and {}",
                        first.state, second.state
                    )),
                }
            }
            _ => AdmissionOutcome::reject("unsupported call mix"),
        }
    }

    fn evaluate_emergency_dial(&self, existing: &[&CallRecord]) -> AdmissionOutcome {
        if existing
            .iter()
            .any(|call| call.is_emergency && call.state.is_connecting())
        {
            return AdmissionOutcome::reject("an emergency call is already connecting");
        }
        let actions = existing
            .iter()
            .filter_map(|call| match call.state {
                CallState::Dialing | CallState::Alerting | CallState::Active | CallState::Holding => {
                    Some(CallAction::HangUp(call.call_id))
                }
                CallState::Incoming | CallState::Waiting => Some(CallAction::Reject(call.call_id)),
                _ => None,
            })
            .collect();
        AdmissionOutcome::with(CallWaitingDecision::Answer, actions)
    }

    fn evaluate_dial(&self, existing: &[&CallRecord]) -> AdmissionOutcome {
        if existing.is_empty() {
            return AdmissionOutcome::answer();
        }
        if has_connecting_call(existing.iter().copied()) {
            return AdmissionOutcome::reject("a call is already connecting");
        }
        if has_ringing_call(existing.iter().copied()) {
            return AdmissionOutcome::reject("ringing call present");
        }
        if existing.len() >= self.max_calls {
            return AdmissionOutcome::reject(format!("call limit of {} reached", self.max_calls));
        }
        match existing {
            [other] if other.state == CallState::Active => {
                AdmissionOutcome::with(CallWaitingDecision::AutoHold, vec![CallAction::Hold(other.call_id)])
            }
            [other] if other.state == CallState::Holding => AdmissionOutcome::answer(),
            _ => AdmissionOutcome::reject("too many calls to place another"),
        }
    }
}

fn held_and_active<'a>(
    first: &'a CallRecord,
    second: &'a CallRecord,
) -> Option<(&'a CallRecord, &'a CallRecord)> {
    match (first.state, second.state) {
        (CallState::Holding, CallState::Active) => Some((first, second)),
        (CallState::Active, CallState::Holding) => Some((second, first)),
        _ => None,
    }
}
