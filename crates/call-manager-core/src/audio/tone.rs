//! Call progress and DTMF tones

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::player::PlaybackHandle;
use crate::error::CallManagerResult;
use crate::events::{CallManagerEvent, EventEmitter};
use crate::platform::{AudioRenderer, PlaybackSource};

/// Tone requested by the call logic
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ToneDescriptor {
    Unknown,
    Engaged,
    Finished,
    Waiting,
    Ringback,
    NoService,
    InvalidNumber,
    CallRecording,
    Dtmf0,
    Dtmf1,
    Dtmf2,
    Dtmf3,
    Dtmf4,
    Dtmf5,
    Dtmf6,
    Dtmf7,
    Dtmf8,
    Dtmf9,
    /// `*`
    DtmfP,
    /// `#`
    DtmfW,
}

/// Tone as understood by the renderer
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ToneType {
    /// DTMF digit 0-9
    Dial(u8),
    /// DTMF `*`
    DialS,
    /// DTMF `#`
    DialP,
    SupervisoryRingtone,
    SupervisoryCallWaiting,
    SupervisoryBusy,
    SupervisoryCongestion,
    SupervisoryRadioNotAvailable,
    PropPrompt,
    PropBeep,
    /// No such tone
    NumTones,
}

impl ToneDescriptor {
    pub fn is_dtmf(&self) -> bool {
        matches!(
            self,
            ToneDescriptor::Dtmf0
                | ToneDescriptor::Dtmf1
                | ToneDescriptor::Dtmf2
                | ToneDescriptor::Dtmf3
                | ToneDescriptor::Dtmf4
                | ToneDescriptor::Dtmf5
                | ToneDescriptor::Dtmf6
                | ToneDescriptor::Dtmf7
                | ToneDescriptor::Dtmf8
                | ToneDescriptor::Dtmf9
                | ToneDescriptor::DtmfP
                | ToneDescriptor::DtmfW
        )
    }

    /// Tones that play until stopped rather than for a fixed time
    pub fn is_looping(&self) -> bool {
        self.is_dtmf() || matches!(self, ToneDescriptor::Ringback | ToneDescriptor::Waiting)
    }
}

/// Tone player
///
/// At most one tone plays at a time; starting a tone replaces the previous
/// one.
pub struct Tone {
    renderer: Arc<dyn AudioRenderer>,
    events: EventEmitter,
    period: Duration,
    duration: Duration,
    current: Mutex<Option<(ToneDescriptor, PlaybackHandle)>>,
}

impl Tone {
    pub fn new(
        renderer: Arc<dyn AudioRenderer>,
        events: EventEmitter,
        period: Duration,
        duration: Duration,
    ) -> Self {
        Self {
            renderer,
            events,
            period,
            duration,
            current: Mutex::new(None),
        }
    }

    /// Map a dial pad character to a tone
    pub fn convert_digit_to_tone(digit: char) -> ToneDescriptor {
        match digit {
            '0' => ToneDescriptor::Dtmf0,
            '1' => ToneDescriptor::Dtmf1,
            '2' => ToneDescriptor::Dtmf2,
            '3' => ToneDescriptor::Dtmf3,
            '4' => ToneDescriptor::Dtmf4,
            '5' => ToneDescriptor::Dtmf5,
            '6' => ToneDescriptor::Dtmf6,
            '7' => ToneDescriptor::Dtmf7,
            '8' => ToneDescriptor::Dtmf8,
            '9' => ToneDescriptor::Dtmf9,
            '*' => ToneDescriptor::DtmfP,
            '#' => ToneDescriptor::DtmfW,
            _ => ToneDescriptor::Unknown,
        }
    }

    pub fn convert_tone_descriptor_to_tone_type(tone: ToneDescriptor) -> ToneType {
        match tone {
            ToneDescriptor::Dtmf0 => ToneType::Dial(0),
            ToneDescriptor::Dtmf1 => ToneType::Dial(1),
            ToneDescriptor::Dtmf2 => ToneType::Dial(2),
            ToneDescriptor::Dtmf3 => ToneType::Dial(3),
            ToneDescriptor::Dtmf4 => ToneType::Dial(4),
            ToneDescriptor::Dtmf5 => ToneType::Dial(5),
            ToneDescriptor::Dtmf6 => ToneType::Dial(6),
            ToneDescriptor::Dtmf7 => ToneType::Dial(7),
            ToneDescriptor::Dtmf8 => ToneType::Dial(8),
            ToneDescriptor::Dtmf9 => ToneType::Dial(9),
            ToneDescriptor::DtmfP => ToneType::DialS,
            ToneDescriptor::DtmfW => ToneType::DialP,
            ToneDescriptor::Ringback => ToneType::SupervisoryRingtone,
            ToneDescriptor::Waiting => ToneType::SupervisoryCallWaiting,
            ToneDescriptor::Engaged => ToneType::SupervisoryBusy,
            ToneDescriptor::Finished => ToneType::PropPrompt,
            ToneDescriptor::NoService => ToneType::SupervisoryRadioNotAvailable,
            ToneDescriptor::InvalidNumber => ToneType::SupervisoryCongestion,
            ToneDescriptor::CallRecording => ToneType::PropBeep,
            ToneDescriptor::Unknown => ToneType::NumTones,
        }
    }

    /// Start a tone, replacing whatever is playing
    ///
    /// Returns once the worker is spawned. An unknown tone is a no-op.
    pub async fn play(&self, tone: ToneDescriptor) -> CallManagerResult<()> {
        let tone_type = Self::convert_tone_descriptor_to_tone_type(tone);
        if tone_type == ToneType::NumTones {
            debug!("ignoring unknown tone");
            return Ok(());
        }
        self.stop().await;

        let limit = (!tone.is_looping()).then_some(self.duration);
        let handle = PlaybackHandle::spawn(
            self.renderer.clone(),
            PlaybackSource::Tone(tone_type),
            self.period,
            limit,
            self.events.clone(),
        );
        let previous = self.current.lock().replace((tone, handle));
        // Raced with a concurrent play; the older one loses
        if let Some((_, stale)) = previous {
            stale.stop().await;
        }
        info!("playing tone {:?}", tone);
        self.events.emit(CallManagerEvent::ToneStarted { tone });
        Ok(())
    }

    /// Stop the current tone; returns whether one was playing
    pub async fn stop(&self) -> bool {
        let current = self.current.lock().take();
        match current {
            Some((tone, handle)) => {
                let was_live = !handle.is_finished();
                handle.stop().await;
                debug!("stopped tone {:?}", tone);
                was_live
            }
            None => false,
        }
    }

    /// Stop only if `tone` is the one playing
    pub async fn stop_if(&self, tone: ToneDescriptor) -> bool {
        let matches = matches!(self.current.lock().as_ref(), Some((current, _)) if *current == tone);
        if matches {
            self.stop().await
        } else {
            false
        }
    }

    /// Tone currently owned by the player, if its worker is still running
    pub fn current(&self) -> Option<ToneDescriptor> {
        self.current
            .lock()
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(tone, _)| *tone)
    }

    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| handle.is_playing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRenderer;

    fn tone_player(renderer: Arc<MockRenderer>) -> Tone {
        Tone::new(
            renderer,
            EventEmitter::default(),
            Duration::from_millis(5),
            Duration::from_millis(40),
        )
    }

    #[test]
    fn test_digit_mapping() {
        let expected = [
            ('0', ToneDescriptor::Dtmf0, ToneType::Dial(0)),
            ('1', ToneDescriptor::Dtmf1, ToneType::Dial(1)),
            ('2', ToneDescriptor::Dtmf2, ToneType::Dial(2)),
            ('3', ToneDescriptor::Dtmf3, ToneType::Dial(3)),
            ('4', ToneDescriptor::Dtmf4, ToneType::Dial(4)),
            ('5', ToneDescriptor::Dtmf5, ToneType::Dial(5)),
            ('6', ToneDescriptor::Dtmf6, ToneType::Dial(6)),
            ('7', ToneDescriptor::Dtmf7, ToneType::Dial(7)),
            ('8', ToneDescriptor::Dtmf8, ToneType::Dial(8)),
            ('9', ToneDescriptor::Dtmf9, ToneType::Dial(9)),
            ('*', ToneDescriptor::DtmfP, ToneType::DialS),
            ('#', ToneDescriptor::DtmfW, ToneType::DialP),
        ];
        for (digit, descriptor, tone_type) in expected {
            let converted = Tone::convert_digit_to_tone(digit);
            assert_eq!(converted, descriptor);
            assert_eq!(Tone::convert_tone_descriptor_to_tone_type(converted), tone_type);
        }
    }

    #[test]
    fn test_other_characters_are_unknown() {
        for digit in ['a', 'A', '+', ' ', 'p', ',', '\0'] {
            let converted = Tone::convert_digit_to_tone(digit);
            assert_eq!(converted, ToneDescriptor::Unknown);
            assert_eq!(Tone::convert_tone_descriptor_to_tone_type(converted), ToneType::NumTones);
        }
    }

    #[test]
    fn test_supervisory_mapping() {
        assert_eq!(
            Tone::convert_tone_descriptor_to_tone_type(ToneDescriptor::Ringback),
            ToneType::SupervisoryRingtone
        );
        assert_eq!(
            Tone::convert_tone_descriptor_to_tone_type(ToneDescriptor::Waiting),
            ToneType::SupervisoryCallWaiting
        );
        assert!(ToneDescriptor::Ringback.is_looping());
        assert!(!ToneDescriptor::Engaged.is_looping());
    }

    #[tokio::test]
    async fn test_play_and_stop() {
        let renderer = Arc::new(MockRenderer::new());
        let tone = tone_player(renderer.clone());
        tone.play(ToneDescriptor::Ringback).await.unwrap();
        assert_eq!(tone.current(), Some(ToneDescriptor::Ringback));

        assert!(!tone.stop_if(ToneDescriptor::Waiting).await);
        assert!(tone.stop_if(ToneDescriptor::Ringback).await);
        assert_eq!(tone.current(), None);
        assert_eq!(renderer.release_count(), renderer.open_count());
        assert!(!tone.stop().await);
    }

    #[tokio::test]
    async fn test_play_replaces_previous_tone() {
        let renderer = Arc::new(MockRenderer::new());
        let tone = tone_player(renderer.clone());
        tone.play(ToneDescriptor::Dtmf5).await.unwrap();
        tone.play(ToneDescriptor::Waiting).await.unwrap();
        assert_eq!(tone.current(), Some(ToneDescriptor::Waiting));
        tone.stop().await;
        assert_eq!(renderer.release_count(), renderer.open_count());
    }

    #[tokio::test]
    async fn test_one_shot_tone_expires() {
        let renderer = Arc::new(MockRenderer::new());
        let tone = tone_player(renderer.clone());
        tone.play(ToneDescriptor::Engaged).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(tone.current(), None);
        assert!(!tone.is_playing());
        assert_eq!(renderer.release_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tone_is_noop() {
        let renderer = Arc::new(MockRenderer::new());
        let tone = tone_player(renderer.clone());
        tone.play(ToneDescriptor::Unknown).await.unwrap();
        assert_eq!(tone.current(), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(renderer.open_count(), 0);
    }
}
