//! # Call Manager Core
//!
//! Coordinates the calls on a phone: which call may ring, be answered or be
//! dialed while others exist, and what the audio path does about it.
//!
//! - **admission**: the call-waiting policy and the request process that carries it out
//! - **audio**: the call-state and audio-device state machines, their orchestrator,
//!   and tone/ring playback
//! - **registry**: the table of live calls
//! - **platform**: traits the host implements for the radio, audio and vibrator services
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_call_manager_core::testing::*;
//! use rvoip_call_manager_core::{CallManagerBuilder, CallType, IncomingCall, SlotId, VideoState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CallManagerBuilder::new()
//!         .telephony(Arc::new(RecordingTelephony::new()))
//!         .audio_platform(Arc::new(RecordingAudioPlatform::new()))
//!         .renderer(Arc::new(MockRenderer::new()))
//!         .vibrator(Arc::new(MockVibrator::new()))
//!         .build()?;
//!     manager.start()?;
//!
//!     // The radio layer reports a call; it rings until answered
//!     let (call_id, _decision) = manager
//!         .on_incoming_call(IncomingCall::new("5550100", SlotId(0), CallType::Cs))
//!         .await?;
//!     manager.answer_call(call_id, VideoState::Voice).await?;
//!
//!     manager.hang_up_call(call_id).await?;
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! Every state machine transition is serialized through the
//! [`AudioControlManager`]. Accessory reports may arrive from any thread via
//! [`AudioControlManager::submit`]; they are drained by one worker task.

pub mod admission;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod platform;
pub mod registry;
pub mod testing;
pub mod types;

pub use admission::{AdmissionPolicy, CallRequestProcess, CallWaitingDecision};
pub use audio::{
    AudioControlManager, AudioDevice, AudioEvent, AudioInterruptState, AudioMode, CallStateKind, DeviceStateKind,
    ScoLink, ToneDescriptor,
};
pub use config::{CallManagerConfig, CallManagerConfigBuilder, RingerMode};
pub use error::{CallManagerError, CallManagerResult, ErrorCategory};
pub use events::{CallManagerEvent, EventEmitter, EventStream};
pub use logging::{setup_logging, LoggingConfig};
pub use manager::{CallManager, CallManagerBuilder};
pub use registry::CallRegistry;
pub use types::{
    CallDirection, CallEndedType, CallId, CallRecord, CallState, CallType, DialRequest, ImsCallMode, IncomingCall,
    SlotId, VideoState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
