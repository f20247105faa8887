//! In-memory collaborators for tests
//!
//! These implement the [`crate::platform`] traits without any radio or audio
//! hardware. Each one records what it was asked to do so tests can assert on
//! it, and most can be told to fail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::call_state::AudioMode;
use crate::audio::device_state::{AudioDevice, ScoLink};
use crate::error::{CallManagerError, CallManagerResult};
use crate::platform::{AudioPlatform, AudioRenderer, PlaybackSource, RenderStream, TelephonyBackend, Vibrator};
use crate::types::{CallId, CallRecord, ImsCallMode, SlotId, VideoState};

/// A request forwarded to the telephony backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyCommand {
    Dial(CallId),
    Answer(CallId, VideoState),
    Reject(CallId),
    HangUp(CallId),
    Hold(CallId),
    Unhold(CallId),
    Switch(CallId),
    CombineConference(CallId),
    SeparateConference(CallId),
    KickOut(CallId),
    InviteToConference(SlotId, Vec<String>),
    StartRtt(CallId, String),
    StopRtt(CallId),
    UpdateCallMode(CallId, ImsCallMode),
    StartDtmf(CallId, char),
    StopDtmf(CallId),
}

/// Telephony backend that records every command
#[derive(Default)]
pub struct RecordingTelephony {
    commands: Mutex<Vec<TelephonyCommand>>,
    failing: Mutex<HashSet<&'static str>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` (e.g. `"dial"`, `"hold"`) fail until cleared
    pub fn fail_operation(&self, operation: &'static str, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(operation);
        } else {
            failing.remove(operation);
        }
    }

    /// Make every command take `delay` before it completes
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn commands(&self) -> Vec<TelephonyCommand> {
        self.commands.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }

    async fn record(&self, operation: &'static str, command: TelephonyCommand) -> CallManagerResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(operation) {
            return Err(CallManagerError::backend(operation, "injected failure"));
        }
        self.commands.lock().push(command);
        Ok(())
    }
}

#[async_trait]
impl TelephonyBackend for RecordingTelephony {
    async fn dial(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("dial", TelephonyCommand::Dial(call.call_id)).await
    }

    async fn answer(&self, call: &CallRecord, video_state: VideoState) -> CallManagerResult<()> {
        self.record("answer", TelephonyCommand::Answer(call.call_id, video_state)).await
    }

    async fn reject(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("reject", TelephonyCommand::Reject(call.call_id)).await
    }

    async fn hang_up(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("hang_up", TelephonyCommand::HangUp(call.call_id)).await
    }

    async fn hold(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("hold", TelephonyCommand::Hold(call.call_id)).await
    }

    async fn unhold(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("unhold", TelephonyCommand::Unhold(call.call_id)).await
    }

    async fn switch(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("switch", TelephonyCommand::Switch(call.call_id)).await
    }

    async fn combine_conference(&self, main_call: &CallRecord) -> CallManagerResult<()> {
        self.record("combine_conference", TelephonyCommand::CombineConference(main_call.call_id)).await
    }

    async fn separate_conference(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("separate_conference", TelephonyCommand::SeparateConference(call.call_id)).await
    }

    async fn kick_out_from_conference(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("kick_out_from_conference", TelephonyCommand::KickOut(call.call_id)).await
    }

    async fn invite_to_conference(&self, slot_id: SlotId, numbers: &[String]) -> CallManagerResult<()> {
        self.record(
            "invite_to_conference",
            TelephonyCommand::InviteToConference(slot_id, numbers.to_vec()),
        )
        .await
    }

    async fn start_rtt(&self, call: &CallRecord, message: &str) -> CallManagerResult<()> {
        self.record("start_rtt", TelephonyCommand::StartRtt(call.call_id, message.to_string())).await
    }

    async fn stop_rtt(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("stop_rtt", TelephonyCommand::StopRtt(call.call_id)).await
    }

    async fn update_call_mode(&self, call: &CallRecord, mode: ImsCallMode) -> CallManagerResult<()> {
        self.record("update_call_mode", TelephonyCommand::UpdateCallMode(call.call_id, mode)).await
    }

    async fn start_dtmf(&self, call: &CallRecord, digit: char) -> CallManagerResult<()> {
        self.record("start_dtmf", TelephonyCommand::StartDtmf(call.call_id, digit)).await
    }

    async fn stop_dtmf(&self, call: &CallRecord) -> CallManagerResult<()> {
        self.record("stop_dtmf", TelephonyCommand::StopDtmf(call.call_id)).await
    }
}

/// Audio service that records mode, mute, route and SCO changes
#[derive(Default)]
pub struct RecordingAudioPlatform {
    modes: Mutex<Vec<AudioMode>>,
    routes: Mutex<Vec<AudioDevice>>,
    sco_links: Mutex<Vec<ScoLink>>,
    muted: AtomicBool,
}

impl RecordingAudioPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modes(&self) -> Vec<AudioMode> {
        self.modes.lock().clone()
    }

    pub fn last_mode(&self) -> Option<AudioMode> {
        self.modes.lock().last().copied()
    }

    pub fn routes(&self) -> Vec<AudioDevice> {
        self.routes.lock().clone()
    }

    pub fn last_route(&self) -> Option<AudioDevice> {
        self.routes.lock().last().copied()
    }

    pub fn sco_links(&self) -> Vec<ScoLink> {
        self.sco_links.lock().clone()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

impl AudioPlatform for RecordingAudioPlatform {
    fn set_audio_mode(&self, mode: AudioMode) -> CallManagerResult<()> {
        self.modes.lock().push(mode);
        Ok(())
    }

    fn set_microphone_mute(&self, muted: bool) -> CallManagerResult<()> {
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn set_output_route(&self, device: AudioDevice) -> CallManagerResult<()> {
        self.routes.lock().push(device);
        Ok(())
    }

    fn set_sco_link(&self, link: ScoLink) -> CallManagerResult<()> {
        self.sco_links.lock().push(link);
        Ok(())
    }
}

#[derive(Default)]
struct RendererCounters {
    opens: AtomicUsize,
    releases: AtomicUsize,
    periods: AtomicUsize,
    fail_open: AtomicBool,
    /// Successful renders before failing; 0 means never fail
    fail_after: AtomicUsize,
}

/// Renderer that sleeps for each period instead of touching hardware
#[derive(Default)]
pub struct MockRenderer {
    counters: Arc<RendererCounters>,
    sources: Mutex<Vec<PlaybackSource>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successfully opened streams
    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    /// Periods rendered across all streams
    pub fn rendered_periods(&self) -> usize {
        self.counters.periods.load(Ordering::SeqCst)
    }

    /// Sources opened so far, oldest first
    pub fn sources(&self) -> Vec<PlaybackSource> {
        self.sources.lock().clone()
    }

    pub fn fail_open(&self, fail: bool) {
        self.counters.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Fail each stream's render call after `periods` successful ones
    pub fn fail_render_after(&self, periods: usize) {
        self.counters.fail_after.store(periods, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioRenderer for MockRenderer {
    async fn open(&self, source: &PlaybackSource) -> CallManagerResult<Box<dyn RenderStream>> {
        if self.counters.fail_open.load(Ordering::SeqCst) {
            return Err(CallManagerError::resource("renderer", "device busy"));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().push(source.clone());
        Ok(Box::new(MockStream {
            counters: self.counters.clone(),
            rendered: 0,
            released: false,
        }))
    }
}

struct MockStream {
    counters: Arc<RendererCounters>,
    rendered: usize,
    released: bool,
}

#[async_trait]
impl RenderStream for MockStream {
    async fn render(&mut self, period: Duration) -> CallManagerResult<()> {
        let fail_after = self.counters.fail_after.load(Ordering::SeqCst);
        if fail_after > 0 && self.rendered >= fail_after {
            return Err(CallManagerError::resource("renderer", "write failed"));
        }
        tokio::time::sleep(period).await;
        self.rendered += 1;
        self.counters.periods.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Vibrator that only tracks whether it is running
#[derive(Default)]
pub struct MockVibrator {
    vibrating: AtomicBool,
    starts: AtomicUsize,
    fail: AtomicBool,
}

impl MockVibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_vibrating(&self) -> bool {
        self.vibrating.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Vibrator for MockVibrator {
    fn start(&self, _pattern_ms: &[u64]) -> CallManagerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallManagerError::resource("vibrator", "not available"));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.vibrating.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> CallManagerResult<()> {
        self.vibrating.store(false, Ordering::SeqCst);
        Ok(())
    }
}
