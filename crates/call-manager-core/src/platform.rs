//! Collaborator interfaces consumed by the core
//!
//! The radio stack, the platform audio service, the audio renderer and the
//! vibrator live outside this crate. The core only talks to them through
//! these traits; [`crate::testing`] has in-memory implementations.

use async_trait::async_trait;
use std::time::Duration;

use crate::audio::call_state::AudioMode;
use crate::audio::device_state::{AudioDevice, ScoLink};
use crate::audio::tone::ToneType;
use crate::error::CallManagerResult;
use crate::types::{CallRecord, ImsCallMode, SlotId, VideoState};

/// Radio / IMS / OTT call control
#[async_trait]
pub trait TelephonyBackend: Send + Sync {
    async fn dial(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn answer(&self, call: &CallRecord, video_state: VideoState) -> CallManagerResult<()>;
    async fn reject(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn hang_up(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn hold(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn unhold(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn switch(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn combine_conference(&self, main_call: &CallRecord) -> CallManagerResult<()>;
    async fn separate_conference(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn kick_out_from_conference(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn invite_to_conference(&self, slot_id: SlotId, numbers: &[String]) -> CallManagerResult<()>;
    async fn start_rtt(&self, call: &CallRecord, message: &str) -> CallManagerResult<()>;
    async fn stop_rtt(&self, call: &CallRecord) -> CallManagerResult<()>;
    async fn update_call_mode(&self, call: &CallRecord, mode: ImsCallMode) -> CallManagerResult<()>;
    async fn start_dtmf(&self, call: &CallRecord, digit: char) -> CallManagerResult<()>;
    async fn stop_dtmf(&self, call: &CallRecord) -> CallManagerResult<()>;
}

/// Platform audio service
///
/// Calls are expected to return quickly; they are made while the
/// orchestrator holds its dispatch lock.
pub trait AudioPlatform: Send + Sync {
    fn set_audio_mode(&self, mode: AudioMode) -> CallManagerResult<()>;
    fn set_microphone_mute(&self, muted: bool) -> CallManagerResult<()>;
    fn set_output_route(&self, device: AudioDevice) -> CallManagerResult<()>;
    fn set_sco_link(&self, link: ScoLink) -> CallManagerResult<()>;
}

/// What a playback worker renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    Tone(ToneType),
    Ringtone { path: String, slot_id: SlotId },
}

/// Opens render streams on the audio hardware
#[async_trait]
pub trait AudioRenderer: Send + Sync {
    /// Acquire the renderer for one playback
    async fn open(&self, source: &PlaybackSource) -> CallManagerResult<Box<dyn RenderStream>>;
}

/// An acquired renderer
#[async_trait]
pub trait RenderStream: Send {
    /// Render one period; may block on hardware for about that long
    async fn render(&mut self, period: Duration) -> CallManagerResult<()>;

    /// Give the renderer back
    fn release(&mut self);
}

/// Haptic feedback for incoming calls
pub trait Vibrator: Send + Sync {
    fn start(&self, pattern_ms: &[u64]) -> CallManagerResult<()>;
    fn stop(&self) -> CallManagerResult<()>;
}
