//! Call records and the value types shared by the policy, registry and audio layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable call identifier, allocated by the registry and never reused
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CallId(pub u32);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIM slot / account index
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Default)]
pub struct SlotId(pub u8);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Bearer a call is carried on
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Circuit switched
    Cs,
    /// IP Multimedia Subsystem
    Ims,
    /// Over-the-top application call
    Ott,
    /// Third party VoIP call
    Voip,
}

impl CallType {
    /// Carrier calls are the ones the radio layer arbitrates
    pub fn is_carrier(&self) -> bool {
        matches!(self, CallType::Cs | CallType::Ims)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallType::Cs => "cs",
            CallType::Ims => "ims",
            CallType::Ott => "ott",
            CallType::Voip => "voip",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a single call leg
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Active,
    Holding,
    Disconnecting,
    Disconnected,
}

impl CallState {
    /// Dialing or alerting
    pub fn is_connecting(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::Alerting)
    }

    /// Incoming or waiting
    pub fn is_ringing(&self) -> bool {
        matches!(self, CallState::Incoming | CallState::Waiting)
    }

    /// Calls that no longer take part in arbitration
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Idle | CallState::Disconnecting | CallState::Disconnected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Alerting => "alerting",
            CallState::Incoming => "incoming",
            CallState::Waiting => "waiting",
            CallState::Active => "active",
            CallState::Holding => "holding",
            CallState::Disconnecting => "disconnecting",
            CallState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Media posture of a call
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    #[default]
    Voice,
    Video,
    SendOnly,
    ReceiveOnly,
}

/// Mobile originated or mobile terminated
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call ended, used to pick the call-ended tone
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum CallEndedType {
    #[default]
    Normal,
    Busy,
    InvalidNumber,
    Unknown,
}

/// IMS media mode requested by the user
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ImsCallMode {
    AudioOnly,
    SendOnly,
    ReceiveOnly,
    SendReceive,
}

impl From<ImsCallMode> for VideoState {
    fn from(mode: ImsCallMode) -> Self {
        match mode {
            ImsCallMode::AudioOnly => VideoState::Voice,
            ImsCallMode::SendOnly => VideoState::SendOnly,
            ImsCallMode::ReceiveOnly => VideoState::ReceiveOnly,
            ImsCallMode::SendReceive => VideoState::Video,
        }
    }
}

/// One call leg as tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub slot_id: SlotId,
    pub call_type: CallType,
    pub state: CallState,
    pub video_state: VideoState,
    pub direction: CallDirection,
    pub phone_number: String,
    pub is_emergency: bool,
    /// Cleared when a waiting call is rejected while this call is held
    pub can_unhold: bool,
    pub speakerphone_on: bool,
    /// Main call of the conference this call belongs to
    pub conference_id: Option<CallId>,
    pub ended_type: CallEndedType,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    /// Build a record for a call that has not been registered yet
    pub fn new(
        call_id: CallId,
        slot_id: SlotId,
        call_type: CallType,
        state: CallState,
        direction: CallDirection,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            call_id,
            slot_id,
            call_type,
            state,
            video_state: VideoState::Voice,
            direction,
            phone_number: phone_number.into(),
            is_emergency: false,
            can_unhold: true,
            speakerphone_on: false,
            conference_id: None,
            ended_type: CallEndedType::Normal,
            created_at: Utc::now(),
        }
    }

    pub fn with_video_state(mut self, video_state: VideoState) -> Self {
        self.video_state = video_state;
        self
    }

    pub fn with_emergency(mut self, is_emergency: bool) -> Self {
        self.is_emergency = is_emergency;
        self
    }

    /// True for any state that carries video in at least one direction
    pub fn is_video(&self) -> bool {
        self.video_state != VideoState::Voice
    }
}

/// Parameters of an outgoing call request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRequest {
    pub phone_number: String,
    pub slot_id: SlotId,
    pub call_type: CallType,
    pub video_state: VideoState,
    pub is_emergency: bool,
}

impl DialRequest {
    pub fn new(phone_number: impl Into<String>, slot_id: SlotId, call_type: CallType) -> Self {
        Self {
            phone_number: phone_number.into(),
            slot_id,
            call_type,
            video_state: VideoState::Voice,
            is_emergency: false,
        }
    }

    pub fn video(mut self) -> Self {
        self.video_state = VideoState::Video;
        self
    }

    pub fn emergency(mut self) -> Self {
        self.is_emergency = true;
        self
    }
}

/// An incoming call reported by the telephony layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingCall {
    pub phone_number: String,
    pub slot_id: SlotId,
    pub call_type: CallType,
    pub video_state: VideoState,
}

impl IncomingCall {
    pub fn new(phone_number: impl Into<String>, slot_id: SlotId, call_type: CallType) -> Self {
        Self {
            phone_number: phone_number.into(),
            slot_id,
            call_type,
            video_state: VideoState::Voice,
        }
    }

    pub fn video(mut self) -> Self {
        self.video_state = VideoState::Video;
        self
    }
}
