//! Shared event vocabulary for the call-state and audio-device state machines

use serde::{Deserialize, Serialize};
use std::fmt;

/// A call or accessory transition
///
/// Call events drive the call-state machine, accessory and audio focus
/// events drive the audio-device machine. The orchestrator routes each event
/// to exactly one of them.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AudioEvent {
    // Call events
    NewIncomingCall,
    NoMoreIncomingCall,
    NewDialingCall,
    NoMoreDialingCall,
    NewActiveCsCall,
    NewActiveImsCall,
    NoMoreActiveCall,
    CallTypeCsChangeIms,
    CallTypeImsChangeCs,
    NewAlertingCall,
    NoMoreAlertingCall,

    // Accessory events
    WiredHeadsetConnected,
    WiredHeadsetDisconnected,
    BluetoothScoConnected,
    BluetoothScoDisconnected,

    // Audio focus events
    AudioActivated,
    AudioDeactivated,
    AudioRinging,

    UnknownEvent,
}

impl AudioEvent {
    /// All events, in declaration order
    pub const ALL: [AudioEvent; 19] = [
        AudioEvent::NewIncomingCall,
        AudioEvent::NoMoreIncomingCall,
        AudioEvent::NewDialingCall,
        AudioEvent::NoMoreDialingCall,
        AudioEvent::NewActiveCsCall,
        AudioEvent::NewActiveImsCall,
        AudioEvent::NoMoreActiveCall,
        AudioEvent::CallTypeCsChangeIms,
        AudioEvent::CallTypeImsChangeCs,
        AudioEvent::NewAlertingCall,
        AudioEvent::NoMoreAlertingCall,
        AudioEvent::WiredHeadsetConnected,
        AudioEvent::WiredHeadsetDisconnected,
        AudioEvent::BluetoothScoConnected,
        AudioEvent::BluetoothScoDisconnected,
        AudioEvent::AudioActivated,
        AudioEvent::AudioDeactivated,
        AudioEvent::AudioRinging,
        AudioEvent::UnknownEvent,
    ];

    /// Events handled by the call-state machine
    pub fn is_call_event(&self) -> bool {
        matches!(
            self,
            AudioEvent::NewIncomingCall
                | AudioEvent::NoMoreIncomingCall
                | AudioEvent::NewDialingCall
                | AudioEvent::NoMoreDialingCall
                | AudioEvent::NewActiveCsCall
                | AudioEvent::NewActiveImsCall
                | AudioEvent::NoMoreActiveCall
                | AudioEvent::CallTypeCsChangeIms
                | AudioEvent::CallTypeImsChangeCs
                | AudioEvent::NewAlertingCall
                | AudioEvent::NoMoreAlertingCall
        )
    }

    /// Events handled by the audio-device machine
    pub fn is_device_event(&self) -> bool {
        matches!(
            self,
            AudioEvent::WiredHeadsetConnected
                | AudioEvent::WiredHeadsetDisconnected
                | AudioEvent::BluetoothScoConnected
                | AudioEvent::BluetoothScoDisconnected
                | AudioEvent::AudioActivated
                | AudioEvent::AudioDeactivated
                | AudioEvent::AudioRinging
        )
    }
}

impl fmt::Display for AudioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
