//! Call-state machine
//!
//! Tracks the aggregate posture of all calls (dialing, alerting, ringing,
//! active on a given bearer, holding, idle). Each node decides on its own
//! which [`AudioEvent`]s it accepts; anything else is rejected and leaves the
//! machine where it was.
//!
//! The machine never touches audio hardware. Transitions queue
//! [`CallStateEffect`]s that the orchestrator drains and executes once it has
//! released the call registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::audio::event::AudioEvent;
use crate::types::{CallId, CallRecord, CallState, CallType};

/// Node of the call-state machine
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallStateKind {
    Inactive,
    Dialing,
    Alerting,
    Incoming,
    /// Active circuit-switched call
    Cs,
    /// Active IMS call
    Ims,
    /// Active over-the-top call
    Ott,
    Holding,
}

impl fmt::Display for CallStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Audio scene the platform should be in
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AudioMode {
    Idle,
    Ringtone,
    InCall,
    InVoip,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStateEffect {
    PlayRingback,
    StopRingback,
    StartRinging,
    StopRinging,
    PlayWaitingTone,
    /// Nothing is ringing, alerting or dialing any more
    MuteNetworkRingTone,
    AudioModeChanged(AudioMode),
}

/// Call counts the nodes consult when deciding a transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub active: usize,
    pub alerting: usize,
    pub dialing: usize,
    /// Incoming and waiting calls
    pub incoming: usize,
    pub holding: usize,
    /// Bearer of the foreground active call
    pub active_call_type: Option<CallType>,
}

impl CallSnapshot {
    /// Count the given records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CallRecord>) -> Self {
        let mut snapshot = Self::default();
        let mut foreground: Option<(CallId, CallType)> = None;
        for record in records {
            match record.state {
                CallState::Active => {
                    snapshot.active += 1;
                    if foreground.map_or(true, |(id, _)| record.call_id < id) {
                        foreground = Some((record.call_id, record.call_type));
                    }
                }
                CallState::Alerting => snapshot.alerting += 1,
                CallState::Dialing => snapshot.dialing += 1,
                CallState::Incoming | CallState::Waiting => snapshot.incoming += 1,
                CallState::Holding => snapshot.holding += 1,
                CallState::Idle | CallState::Disconnecting | CallState::Disconnected => {}
            }
        }
        snapshot.active_call_type = foreground.map(|(_, call_type)| call_type);
        snapshot
    }

    /// Whether anything still produces or expects a ring signal
    pub fn has_ring_activity(&self) -> bool {
        self.incoming > 0 || self.alerting > 0 || self.dialing > 0
    }
}

enum Step {
    Reject,
    Stay,
    Goto(CallStateKind),
    Reevaluate,
    WaitingTone,
}

impl CallStateKind {
    fn active_for(call_type: Option<CallType>) -> Self {
        match call_type {
            Some(CallType::Ims) => CallStateKind::Ims,
            Some(CallType::Ott) | Some(CallType::Voip) => CallStateKind::Ott,
            _ => CallStateKind::Cs,
        }
    }

    /// State that matches the calls currently present
    ///
    /// Priority: active, alerting, dialing, ringing, holding, idle.
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Self {
        if snapshot.active > 0 {
            Self::active_for(snapshot.active_call_type)
        } else if snapshot.alerting > 0 {
            CallStateKind::Alerting
        } else if snapshot.dialing > 0 {
            CallStateKind::Dialing
        } else if snapshot.incoming > 0 {
            CallStateKind::Incoming
        } else if snapshot.holding > 0 {
            CallStateKind::Holding
        } else {
            CallStateKind::Inactive
        }
    }

    /// Audio mode entered with this state; `None` keeps the previous one
    pub fn audio_mode(&self) -> Option<AudioMode> {
        match self {
            CallStateKind::Inactive | CallStateKind::Dialing | CallStateKind::Alerting => {
                Some(AudioMode::Idle)
            }
            CallStateKind::Incoming => Some(AudioMode::Ringtone),
            CallStateKind::Cs => Some(AudioMode::InCall),
            CallStateKind::Ims | CallStateKind::Ott => Some(AudioMode::InVoip),
            CallStateKind::Holding => None,
        }
    }

    fn on_event(self, event: AudioEvent, snapshot: &CallSnapshot) -> Step {
        use AudioEvent::*;
        match self {
            CallStateKind::Inactive => match event {
                NewDialingCall => Step::Goto(CallStateKind::Dialing),
                NewActiveCsCall => Step::Goto(CallStateKind::Cs),
                NewActiveImsCall => Step::Goto(CallStateKind::Ims),
                NewAlertingCall => Step::Goto(CallStateKind::Alerting),
                NewIncomingCall => Step::Goto(CallStateKind::Incoming),
                _ => Step::Reject,
            },
            CallStateKind::Dialing => match event {
                NoMoreDialingCall => Step::Reevaluate,
                NewActiveCsCall => Step::Goto(CallStateKind::Cs),
                NewActiveImsCall => Step::Goto(CallStateKind::Ims),
                NewAlertingCall => Step::Goto(CallStateKind::Alerting),
                _ => Step::Reject,
            },
            CallStateKind::Alerting => match event {
                NoMoreAlertingCall => Step::Reevaluate,
                NewActiveCsCall => Step::Goto(CallStateKind::Cs),
                NewActiveImsCall => Step::Goto(CallStateKind::Ims),
                _ => Step::Reject,
            },
            CallStateKind::Incoming => match event {
                NoMoreIncomingCall => Step::Reevaluate,
                NewActiveCsCall if snapshot.active == 1 => Step::Goto(CallStateKind::Cs),
                NewActiveImsCall if snapshot.active == 1 => Step::Goto(CallStateKind::Ims),
                NewActiveCsCall | NewActiveImsCall => Step::Stay,
                _ => Step::Reject,
            },
            CallStateKind::Cs => match event {
                NoMoreActiveCall => Step::Reevaluate,
                NewIncomingCall => Step::WaitingTone,
                CallTypeCsChangeIms => Step::Goto(CallStateKind::Ims),
                _ => Step::Reject,
            },
            CallStateKind::Ims => match event {
                NoMoreActiveCall => Step::Reevaluate,
                NewIncomingCall => Step::WaitingTone,
                CallTypeImsChangeCs => Step::Goto(CallStateKind::Cs),
                _ => Step::Reject,
            },
            // Left only through re-evaluation by the orchestrator
            CallStateKind::Ott => Step::Reject,
            CallStateKind::Holding => match event {
                NewActiveCsCall if snapshot.active == 1 => Step::Goto(CallStateKind::Cs),
                NewActiveImsCall if snapshot.active == 1 => Step::Goto(CallStateKind::Ims),
                NewIncomingCall if snapshot.incoming == 1 => Step::Goto(CallStateKind::Incoming),
                NewActiveCsCall | NewActiveImsCall | NewIncomingCall => Step::Stay,
                _ => Step::Reject,
            },
        }
    }
}

/// The call-state machine
///
/// Not internally synchronized; the orchestrator serializes access.
#[derive(Debug)]
pub struct CallStateMachine {
    current: CallStateKind,
    audio_mode: AudioMode,
    pending: Vec<CallStateEffect>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            current: CallStateKind::Inactive,
            audio_mode: AudioMode::Idle,
            pending: Vec::new(),
        }
    }

    pub fn current(&self) -> CallStateKind {
        self.current
    }

    pub fn audio_mode(&self) -> AudioMode {
        self.audio_mode
    }

    /// Feed one event; returns whether the current node accepted it
    pub fn process_event(&mut self, event: AudioEvent, snapshot: &CallSnapshot) -> bool {
        match self.current.on_event(event, snapshot) {
            Step::Reject => {
                debug!("call state {} rejected {}", self.current, event);
                false
            }
            Step::Stay => true,
            Step::WaitingTone => {
                self.pending.push(CallStateEffect::PlayWaitingTone);
                true
            }
            Step::Goto(next) => {
                self.transition(next, snapshot);
                true
            }
            Step::Reevaluate => {
                self.transition(CallStateKind::from_snapshot(snapshot), snapshot);
                true
            }
        }
    }

    /// Force a state, bypassing node rules
    ///
    /// Returns whether the state changed.
    pub fn switch_to(&mut self, next: CallStateKind, snapshot: &CallSnapshot) -> bool {
        self.transition(next, snapshot)
    }

    /// Drain the effects queued by previous transitions
    pub fn take_effects(&mut self) -> Vec<CallStateEffect> {
        std::mem::take(&mut self.pending)
    }

    fn transition(&mut self, next: CallStateKind, snapshot: &CallSnapshot) -> bool {
        let previous = self.current;
        if previous == next {
            return false;
        }

        match previous {
            CallStateKind::Alerting => self.pending.push(CallStateEffect::StopRingback),
            CallStateKind::Incoming => self.pending.push(CallStateEffect::StopRinging),
            _ => {}
        }
        match next {
            CallStateKind::Alerting => self.pending.push(CallStateEffect::PlayRingback),
            CallStateKind::Incoming => self.pending.push(CallStateEffect::StartRinging),
            _ => {}
        }
        if let Some(mode) = next.audio_mode() {
            if mode != self.audio_mode {
                self.audio_mode = mode;
                self.pending.push(CallStateEffect::AudioModeChanged(mode));
            }
        }
        if !snapshot.has_ring_activity() {
            self.pending.push(CallStateEffect::MuteNetworkRingTone);
        }

        self.current = next;
        info!("call state {} -> {}", previous, next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [CallStateKind; 8] = [
        CallStateKind::Inactive,
        CallStateKind::Dialing,
        CallStateKind::Alerting,
        CallStateKind::Incoming,
        CallStateKind::Cs,
        CallStateKind::Ims,
        CallStateKind::Ott,
        CallStateKind::Holding,
    ];

    fn machine_in(kind: CallStateKind) -> CallStateMachine {
        let mut machine = CallStateMachine::new();
        machine.switch_to(kind, &CallSnapshot::default());
        machine.take_effects();
        machine
    }

    fn snapshot(active: usize, incoming: usize) -> CallSnapshot {
        CallSnapshot {
            active,
            incoming,
            active_call_type: (active > 0).then_some(CallType::Cs),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_event_always_rejected() {
        for kind in ALL_STATES {
            let mut machine = machine_in(kind);
            assert!(!machine.process_event(AudioEvent::UnknownEvent, &snapshot(1, 1)));
            assert_eq!(machine.current(), kind);
        }
    }

    #[test]
    fn test_cs_state() {
        let mut machine = machine_in(CallStateKind::Cs);
        assert!(machine.process_event(AudioEvent::NewIncomingCall, &snapshot(1, 1)));
        assert_eq!(machine.current(), CallStateKind::Cs);
        assert_eq!(machine.take_effects(), vec![CallStateEffect::PlayWaitingTone]);

        assert!(!machine.process_event(AudioEvent::CallTypeImsChangeCs, &snapshot(1, 0)));
        assert!(!machine.process_event(AudioEvent::NewDialingCall, &snapshot(1, 0)));

        assert!(machine.process_event(AudioEvent::CallTypeCsChangeIms, &snapshot(1, 0)));
        assert_eq!(machine.current(), CallStateKind::Ims);
    }

    #[test]
    fn test_ims_state() {
        let mut machine = machine_in(CallStateKind::Ims);
        assert!(!machine.process_event(AudioEvent::CallTypeCsChangeIms, &snapshot(1, 0)));
        assert!(machine.process_event(AudioEvent::CallTypeImsChangeCs, &snapshot(1, 0)));
        assert_eq!(machine.current(), CallStateKind::Cs);
        assert_eq!(machine.audio_mode(), AudioMode::InCall);
    }

    #[test]
    fn test_no_more_active_call_reevaluates() {
        let mut machine = machine_in(CallStateKind::Cs);
        let held = CallSnapshot {
            holding: 1,
            ..Default::default()
        };
        assert!(machine.process_event(AudioEvent::NoMoreActiveCall, &held));
        assert_eq!(machine.current(), CallStateKind::Holding);
        // Holding keeps the in-call mode
        assert_eq!(machine.audio_mode(), AudioMode::InCall);

        let mut machine = machine_in(CallStateKind::Ims);
        assert!(machine.process_event(AudioEvent::NoMoreActiveCall, &CallSnapshot::default()));
        assert_eq!(machine.current(), CallStateKind::Inactive);
        assert!(machine.take_effects().contains(&CallStateEffect::MuteNetworkRingTone));
    }

    #[test]
    fn test_ott_rejects_everything() {
        let mut machine = machine_in(CallStateKind::Ott);
        for event in AudioEvent::ALL {
            assert!(!machine.process_event(event, &snapshot(1, 1)));
        }
        assert_eq!(machine.current(), CallStateKind::Ott);
    }

    #[test]
    fn test_holding_state() {
        let mut machine = machine_in(CallStateKind::Holding);
        assert!(!machine.process_event(AudioEvent::NoMoreActiveCall, &snapshot(0, 0)));

        // Two active calls: accepted, no switch
        assert!(machine.process_event(AudioEvent::NewActiveCsCall, &snapshot(2, 0)));
        assert_eq!(machine.current(), CallStateKind::Holding);

        assert!(machine.process_event(AudioEvent::NewIncomingCall, &snapshot(0, 1)));
        assert_eq!(machine.current(), CallStateKind::Incoming);
        assert_eq!(machine.audio_mode(), AudioMode::Ringtone);

        let mut machine = machine_in(CallStateKind::Holding);
        assert!(machine.process_event(AudioEvent::NewActiveImsCall, &snapshot(1, 0)));
        assert_eq!(machine.current(), CallStateKind::Ims);
    }

    #[test]
    fn test_alerting_state() {
        let mut machine = CallStateMachine::new();
        let alerting = CallSnapshot {
            alerting: 1,
            ..Default::default()
        };
        assert!(machine.process_event(AudioEvent::NewAlertingCall, &alerting));
        assert_eq!(machine.current(), CallStateKind::Alerting);
        assert_eq!(machine.take_effects(), vec![CallStateEffect::PlayRingback]);

        assert!(!machine.process_event(AudioEvent::NewIncomingCall, &alerting));
        assert!(machine.process_event(AudioEvent::NoMoreAlertingCall, &CallSnapshot::default()));
        assert_eq!(machine.current(), CallStateKind::Inactive);
        assert_eq!(
            machine.take_effects(),
            vec![CallStateEffect::StopRingback, CallStateEffect::MuteNetworkRingTone]
        );
    }

    #[test]
    fn test_alerting_to_active() {
        let mut machine = machine_in(CallStateKind::Alerting);
        assert!(machine.process_event(AudioEvent::NewActiveImsCall, &snapshot(1, 0)));
        assert_eq!(machine.current(), CallStateKind::Ims);
        let effects = machine.take_effects();
        assert!(effects.contains(&CallStateEffect::StopRingback));
        assert!(effects.contains(&CallStateEffect::AudioModeChanged(AudioMode::InVoip)));
        assert!(effects.contains(&CallStateEffect::MuteNetworkRingTone));
    }

    #[test]
    fn test_incoming_state() {
        let mut machine = CallStateMachine::new();
        assert!(machine.process_event(AudioEvent::NewIncomingCall, &snapshot(0, 1)));
        assert_eq!(machine.current(), CallStateKind::Incoming);
        assert_eq!(
            machine.take_effects(),
            vec![
                CallStateEffect::StartRinging,
                CallStateEffect::AudioModeChanged(AudioMode::Ringtone)
            ]
        );

        assert!(!machine.process_event(AudioEvent::NewDialingCall, &snapshot(0, 1)));
        assert!(machine.process_event(AudioEvent::NewActiveCsCall, &snapshot(1, 0)));
        assert_eq!(machine.current(), CallStateKind::Cs);
        assert!(machine.take_effects().contains(&CallStateEffect::StopRinging));
    }

    #[test]
    fn test_incoming_left_when_ringing_stops() {
        let mut machine = machine_in(CallStateKind::Incoming);
        let held = CallSnapshot {
            holding: 1,
            ..Default::default()
        };
        assert!(machine.process_event(AudioEvent::NoMoreIncomingCall, &held));
        assert_eq!(machine.current(), CallStateKind::Holding);
    }

    #[test]
    fn test_dialing_state() {
        let mut machine = CallStateMachine::new();
        let dialing = CallSnapshot {
            dialing: 1,
            ..Default::default()
        };
        assert!(machine.process_event(AudioEvent::NewDialingCall, &dialing));
        assert_eq!(machine.current(), CallStateKind::Dialing);
        assert!(!machine.process_event(AudioEvent::NewIncomingCall, &dialing));

        assert!(machine.process_event(AudioEvent::NoMoreDialingCall, &CallSnapshot::default()));
        assert_eq!(machine.current(), CallStateKind::Inactive);

        let mut machine = machine_in(CallStateKind::Dialing);
        assert!(machine.process_event(AudioEvent::NewAlertingCall, &CallSnapshot::default()));
        assert_eq!(machine.current(), CallStateKind::Alerting);
    }

    #[test]
    fn test_inactive_state() {
        for (event, expected) in [
            (AudioEvent::NewDialingCall, CallStateKind::Dialing),
            (AudioEvent::NewActiveCsCall, CallStateKind::Cs),
            (AudioEvent::NewActiveImsCall, CallStateKind::Ims),
            (AudioEvent::NewAlertingCall, CallStateKind::Alerting),
            (AudioEvent::NewIncomingCall, CallStateKind::Incoming),
        ] {
            let mut machine = CallStateMachine::new();
            assert!(machine.process_event(event, &snapshot(1, 1)));
            assert_eq!(machine.current(), expected);
        }
        let mut machine = CallStateMachine::new();
        assert!(!machine.process_event(AudioEvent::NoMoreActiveCall, &snapshot(0, 0)));
        assert!(!machine.process_event(AudioEvent::WiredHeadsetConnected, &snapshot(0, 0)));
    }

    #[test]
    fn test_from_snapshot_priority() {
        let all = CallSnapshot {
            active: 1,
            alerting: 1,
            dialing: 1,
            incoming: 1,
            holding: 1,
            active_call_type: Some(CallType::Ott),
        };
        assert_eq!(CallStateKind::from_snapshot(&all), CallStateKind::Ott);
        let no_active = CallSnapshot { active: 0, active_call_type: None, ..all };
        assert_eq!(CallStateKind::from_snapshot(&no_active), CallStateKind::Alerting);
        let held_and_ringing = CallSnapshot {
            incoming: 1,
            holding: 1,
            ..Default::default()
        };
        assert_eq!(CallStateKind::from_snapshot(&held_and_ringing), CallStateKind::Incoming);
        assert_eq!(CallStateKind::from_snapshot(&CallSnapshot::default()), CallStateKind::Inactive);
    }

    fn any_state() -> impl Strategy<Value = CallStateKind> {
        prop::sample::select(ALL_STATES.to_vec())
    }

    fn any_event() -> impl Strategy<Value = AudioEvent> {
        prop::sample::select(AudioEvent::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_rejection_leaves_state(
            kind in any_state(),
            event in any_event(),
            active in 0usize..3,
            incoming in 0usize..3,
            holding in 0usize..2,
        ) {
            let mut machine = machine_in(kind);
            let snap = CallSnapshot { holding, ..snapshot(active, incoming) };
            if !machine.process_event(event, &snap) {
                prop_assert_eq!(machine.current(), kind);
                prop_assert!(machine.take_effects().is_empty());
            }
        }

        #[test]
        fn prop_device_events_never_reach_call_nodes(kind in any_state(), event in any_event()) {
            prop_assume!(!event.is_call_event());
            let mut machine = machine_in(kind);
            prop_assert!(!machine.process_event(event, &snapshot(1, 1)));
        }
    }
}
