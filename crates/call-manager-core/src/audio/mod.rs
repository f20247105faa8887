//! Call audio: state machines, orchestration and playback
//!
//! - [`event`]: the [`AudioEvent`](event::AudioEvent) vocabulary shared by both machines
//! - [`call_state`]: aggregate call posture and the audio mode it implies
//! - [`device_state`]: output route selection
//! - [`control`]: the orchestrator feeding both machines
//! - [`tone`], [`ring`], [`player`]: playback

pub mod call_state;
pub mod control;
pub mod device_state;
pub mod event;
pub mod player;
pub mod ring;
pub mod tone;

pub use call_state::{AudioMode, CallSnapshot, CallStateKind, CallStateMachine};
pub use control::AudioControlManager;
pub use device_state::{
    AudioDevice, AudioDeviceStateMachine, AudioInterruptState, DeviceContext, DeviceStateKind, ScoLink,
};
pub use event::AudioEvent;
pub use ring::Ring;
pub use tone::{Tone, ToneDescriptor, ToneType};
