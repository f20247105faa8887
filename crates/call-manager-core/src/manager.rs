//! Call manager facade
//!
//! Wires the registry, admission, request process and audio orchestrator
//! together behind one handle. Hosts construct it with [`CallManagerBuilder`],
//! call [`CallManager::start`], and feed radio and accessory reports through
//! the `on_*` methods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionPolicy, CallRequestProcess, CallWaitingDecision};
use crate::audio::control::AudioControlManager;
use crate::audio::device_state::AudioDevice;
use crate::audio::event::AudioEvent;
use crate::config::{CallManagerConfig, RingerMode};
use crate::error::{CallManagerError, CallManagerResult};
use crate::events::{EventEmitter, EventStream};
use crate::logging::{setup_logging, LoggingConfig};
use crate::platform::{AudioPlatform, AudioRenderer, TelephonyBackend, Vibrator};
use crate::registry::CallRegistry;
use crate::types::{
    CallEndedType, CallId, CallRecord, CallState, CallType, DialRequest, ImsCallMode, IncomingCall, VideoState,
};

/// Builder for [`CallManager`]
///
/// ```rust
/// use std::sync::Arc;
/// use rvoip_call_manager_core::{CallManagerBuilder, CallManagerConfig, LoggingConfig};
/// use rvoip_call_manager_core::testing::*;
/// use tracing::Level;
///
/// # tokio_test::block_on(async {
/// let manager = CallManagerBuilder::new()
///     .config(CallManagerConfig::default())
///     .logging(LoggingConfig::new(Level::INFO).with_audio_level(Level::DEBUG))
///     .telephony(Arc::new(RecordingTelephony::new()))
///     .audio_platform(Arc::new(RecordingAudioPlatform::new()))
///     .renderer(Arc::new(MockRenderer::new()))
///     .vibrator(Arc::new(MockVibrator::new()))
///     .build()
///     .unwrap();
/// manager.start().unwrap();
/// manager.shutdown().await.unwrap();
/// # })
/// ```
#[derive(Default)]
pub struct CallManagerBuilder {
    config: CallManagerConfig,
    logging: Option<LoggingConfig>,
    telephony: Option<Arc<dyn TelephonyBackend>>,
    audio_platform: Option<Arc<dyn AudioPlatform>>,
    renderer: Option<Arc<dyn AudioRenderer>>,
    vibrator: Option<Arc<dyn Vibrator>>,
}

impl CallManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a global tracing subscriber when the manager is built
    ///
    /// A subscriber the host already installed is kept.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn telephony(mut self, backend: Arc<dyn TelephonyBackend>) -> Self {
        self.telephony = Some(backend);
        self
    }

    pub fn audio_platform(mut self, platform: Arc<dyn AudioPlatform>) -> Self {
        self.audio_platform = Some(platform);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn AudioRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn vibrator(mut self, vibrator: Arc<dyn Vibrator>) -> Self {
        self.vibrator = Some(vibrator);
        self
    }

    /// Validate the configuration and assemble the manager
    pub fn build(self) -> CallManagerResult<CallManager> {
        self.config.validate()?;
        let telephony = self
            .telephony
            .ok_or_else(|| CallManagerError::config("a telephony backend is required"))?;
        let platform = self
            .audio_platform
            .ok_or_else(|| CallManagerError::config("an audio platform is required"))?;
        let renderer = self
            .renderer
            .ok_or_else(|| CallManagerError::config("an audio renderer is required"))?;
        let vibrator = self
            .vibrator
            .ok_or_else(|| CallManagerError::config("a vibrator is required"))?;
        if let Some(logging) = &self.logging {
            match setup_logging(logging) {
                Ok(()) => info!("call manager core v{} logging at {}", crate::VERSION, logging.level),
                Err(e) => warn!("keeping the existing tracing subscriber: {}", e),
            }
        }

        let events = EventEmitter::new(self.config.event_channel_capacity);
        let registry = Arc::new(CallRegistry::new());
        let audio = Arc::new(AudioControlManager::new(
            &self.config,
            registry.clone(),
            platform,
            renderer,
            vibrator,
            events.clone(),
        ));
        let requests = CallRequestProcess::new(
            registry.clone(),
            telephony,
            audio.clone(),
            AdmissionPolicy::from_config(&self.config),
            events.clone(),
        );

        Ok(CallManager {
            config: self.config,
            registry,
            audio,
            requests,
            events,
            started: AtomicBool::new(false),
        })
    }
}

/// Coordinates every call on the device
pub struct CallManager {
    config: CallManagerConfig,
    registry: Arc<CallRegistry>,
    audio: Arc<AudioControlManager>,
    requests: CallRequestProcess,
    events: EventEmitter,
    started: AtomicBool,
}

impl CallManager {
    /// Start the audio event worker
    pub fn start(&self) -> CallManagerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CallManagerError::AlreadyInitialized);
        }
        if let Err(e) = self.audio.init() {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(
            "call manager started (call waiting {}, max {} calls)",
            self.config.call_waiting_enabled, self.config.max_calls
        );
        Ok(())
    }

    /// Stop the worker and any playback; tracked calls are left as they are
    pub async fn shutdown(&self) -> CallManagerResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(CallManagerError::NotInitialized);
        }
        self.audio.shutdown().await?;
        info!("call manager stopped with {} call(s) tracked", self.registry.len());
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> CallManagerResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(CallManagerError::NotInitialized)
        }
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn audio(&self) -> &Arc<AudioControlManager> {
        &self.audio
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    // Call control

    pub async fn dial_call(&self, request: DialRequest) -> CallManagerResult<CallId> {
        self.ensure_started()?;
        self.requests.dial_request(request).await
    }

    pub async fn answer_call(&self, call_id: CallId, video_state: VideoState) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.answer_request(call_id, video_state).await
    }

    pub async fn reject_call(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.reject_request(call_id).await
    }

    pub async fn hang_up_call(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.hang_up_request(call_id).await
    }

    pub async fn hold_call(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.hold_request(call_id).await
    }

    pub async fn unhold_call(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.unhold_request(call_id).await
    }

    pub async fn switch_call(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.switch_request(call_id).await
    }

    pub async fn start_dtmf(&self, call_id: CallId, digit: char) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.start_dtmf(call_id, digit).await
    }

    pub async fn stop_dtmf(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.stop_dtmf(call_id).await
    }

    // Conference

    pub async fn combine_conference(&self, main_call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.combine_conference(main_call_id).await
    }

    pub async fn separate_conference(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.separate_conference(call_id).await
    }

    pub async fn kick_out_from_conference(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.kick_out_from_conference(call_id).await
    }

    pub async fn join_conference(&self, call_id: CallId, numbers: Vec<String>) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.join_conference(call_id, numbers).await
    }

    // IMS

    pub async fn update_ims_call_mode(&self, call_id: CallId, mode: ImsCallMode) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.update_ims_call_mode(call_id, mode).await
    }

    pub async fn start_rtt(&self, call_id: CallId, message: &str) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.start_rtt(call_id, message).await
    }

    pub async fn stop_rtt(&self, call_id: CallId) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.stop_rtt(call_id).await
    }

    // Audio

    pub async fn set_muted(&self, muted: bool) -> CallManagerResult<()> {
        self.audio.set_mute(muted).await
    }

    pub async fn is_muted(&self) -> bool {
        self.audio.is_muted().await
    }

    pub async fn set_audio_device(&self, device: AudioDevice) -> CallManagerResult<()> {
        self.audio.set_audio_device(device).await
    }

    pub async fn audio_device(&self) -> AudioDevice {
        self.audio.audio_device().await
    }

    pub fn set_ringer_mode(&self, mode: RingerMode) {
        self.audio.set_ringer_mode(mode);
    }

    // Queries

    pub fn get_call_state(&self, call_id: CallId) -> CallManagerResult<CallState> {
        Ok(self.registry.require(call_id)?.state)
    }

    pub fn get_call(&self, call_id: CallId) -> Option<CallRecord> {
        self.registry.get(call_id)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.registry.snapshot()
    }

    pub fn is_ringing(&self) -> bool {
        self.audio.is_ringing()
    }

    /// Whether any call is tracked
    pub fn has_call(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn foreground_call(&self) -> Option<CallRecord> {
        self.audio.foreground_call()
    }

    // Telephony reports

    pub async fn on_incoming_call(&self, incoming: IncomingCall) -> CallManagerResult<(CallId, CallWaitingDecision)> {
        self.ensure_started()?;
        self.requests.incoming_call(incoming).await
    }

    pub async fn on_call_state_report(
        &self,
        call_id: CallId,
        state: CallState,
        ended_type: Option<CallEndedType>,
    ) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.on_call_state_report(call_id, state, ended_type).await
    }

    pub async fn on_call_type_changed(&self, call_id: CallId, call_type: CallType) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.on_call_type_changed(call_id, call_type).await
    }

    pub async fn on_video_state_changed(&self, call_id: CallId, video_state: VideoState) -> CallManagerResult<()> {
        self.ensure_started()?;
        self.requests.on_video_state_changed(call_id, video_state).await
    }

    // Accessory reports

    pub async fn on_wired_headset(&self, connected: bool) -> CallManagerResult<()> {
        let event = if connected {
            AudioEvent::WiredHeadsetConnected
        } else {
            AudioEvent::WiredHeadsetDisconnected
        };
        self.accessory(event).await
    }

    pub async fn on_bluetooth_sco(&self, connected: bool) -> CallManagerResult<()> {
        let event = if connected {
            AudioEvent::BluetoothScoConnected
        } else {
            AudioEvent::BluetoothScoDisconnected
        };
        self.accessory(event).await
    }

    async fn accessory(&self, event: AudioEvent) -> CallManagerResult<()> {
        self.ensure_started()?;
        if !self.audio.dispatch(event).await {
            debug!("accessory event {:?} left the route unchanged", event);
        }
        Ok(())
    }
}
