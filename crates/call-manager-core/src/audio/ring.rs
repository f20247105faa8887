//! Incoming-call ringer
//!
//! Combines the ringtone playback worker with the vibrator according to the
//! configured [`RingerMode`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::player::PlaybackHandle;
use crate::config::{CallManagerConfig, RingerMode};
use crate::error::{CallManagerError, CallManagerResult};
use crate::events::EventEmitter;
use crate::platform::{AudioRenderer, PlaybackSource, Vibrator};
use crate::types::SlotId;

struct RingSettings {
    mode: RingerMode,
    ringtone_path: String,
}

pub struct Ring {
    renderer: Arc<dyn AudioRenderer>,
    vibrator: Arc<dyn Vibrator>,
    events: EventEmitter,
    period: Duration,
    vibration_pattern_ms: Vec<u64>,
    settings: Mutex<RingSettings>,
    playback: Mutex<Option<PlaybackHandle>>,
    vibrating: AtomicBool,
}

impl Ring {
    pub fn new(
        config: &CallManagerConfig,
        renderer: Arc<dyn AudioRenderer>,
        vibrator: Arc<dyn Vibrator>,
        events: EventEmitter,
    ) -> Self {
        Self {
            renderer,
            vibrator,
            events,
            period: config.render_period(),
            vibration_pattern_ms: config.vibration_pattern_ms.clone(),
            settings: Mutex::new(RingSettings {
                mode: config.ringer_mode,
                ringtone_path: config.ringtone_path.clone(),
            }),
            playback: Mutex::new(None),
            vibrating: AtomicBool::new(false),
        }
    }

    /// Start ringing for a call on `slot_id`
    pub async fn play(&self, slot_id: SlotId) -> CallManagerResult<()> {
        let (mode, path) = {
            let settings = self.settings.lock();
            (settings.mode, settings.ringtone_path.clone())
        };
        if mode == RingerMode::Normal && path.is_empty() {
            return Err(CallManagerError::resource("ringtone", "ringtone path is empty"));
        }

        self.stop().await;

        if matches!(mode, RingerMode::Normal | RingerMode::Vibrate) {
            match self.vibrator.start(&self.vibration_pattern_ms) {
                Ok(()) => self.vibrating.store(true, Ordering::SeqCst),
                Err(e) => warn!("vibration failed to start: {}", e),
            }
        }

        if mode == RingerMode::Normal {
            let handle = PlaybackHandle::spawn(
                self.renderer.clone(),
                PlaybackSource::Ringtone { path, slot_id },
                self.period,
                None,
                self.events.clone(),
            );
            let stale = self.playback.lock().replace(handle);
            if let Some(stale) = stale {
                stale.stop().await;
            }
        }

        info!("ringing for {} in {:?} mode", slot_id, mode);
        Ok(())
    }

    /// Stop ringtone and vibration; returns whether either was running
    pub async fn stop(&self) -> bool {
        let handle = self.playback.lock().take();
        let mut stopped = false;
        if let Some(handle) = handle {
            stopped = !handle.is_finished();
            handle.stop().await;
        }
        if self.vibrating.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.vibrator.stop() {
                warn!("vibration failed to stop: {}", e);
            }
            stopped = true;
        }
        if stopped {
            debug!("ringing stopped");
        }
        stopped
    }

    /// Whether the ringtone is audible or the vibrator is running
    pub fn is_ringing(&self) -> bool {
        let audible = self
            .playback
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        audible || self.vibrating.load(Ordering::SeqCst)
    }

    pub fn ringer_mode(&self) -> RingerMode {
        self.settings.lock().mode
    }

    /// Takes effect from the next `play`
    pub fn set_ringer_mode(&self, mode: RingerMode) {
        self.settings.lock().mode = mode;
    }

    pub fn set_ringtone_path(&self, path: impl Into<String>) {
        self.settings.lock().ringtone_path = path.into();
    }
}
