//! Notifications published by the call manager

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::admission::policy::CallWaitingDecision;
use crate::audio::call_state::{AudioMode, CallStateKind};
use crate::audio::device_state::AudioDevice;
use crate::audio::tone::ToneDescriptor;
use crate::types::{CallEndedType, CallId, CallRecord, CallState, VideoState};

/// Events emitted by the call manager core
#[derive(Debug, Clone)]
pub enum CallManagerEvent {
    /// A call was registered
    CallAdded { call: CallRecord },

    /// A registered call changed state
    CallStateChanged {
        call_id: CallId,
        previous: CallState,
        current: CallState,
    },

    /// A call left the registry
    CallRemoved {
        call_id: CallId,
        ended_type: CallEndedType,
    },

    /// The admission policy decided on a new call request
    AdmissionDecided {
        call_id: Option<CallId>,
        decision: CallWaitingDecision,
    },

    /// The call-state machine moved
    CallPostureChanged {
        previous: CallStateKind,
        current: CallStateKind,
    },

    AudioModeChanged { mode: AudioMode },

    AudioDeviceChanged {
        previous: AudioDevice,
        current: AudioDevice,
    },

    VideoStateChanged {
        call_id: CallId,
        previous: VideoState,
        current: VideoState,
    },

    MuteChanged { muted: bool },

    RingingChanged { ringing: bool },

    ToneStarted { tone: ToneDescriptor },

    /// A playback worker could not acquire or drive the renderer
    PlaybackFailed { source: String, reason: String },
}

/// Stream of events for async consumers
pub type EventStream = BroadcastStream<CallManagerEvent>;

/// Fan-out of [`CallManagerEvent`]s
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CallManagerEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: CallManagerEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe as a stream
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscribe with a plain receiver
    pub fn receiver(&self) -> broadcast::Receiver<CallManagerEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_emit_and_stream() {
        let emitter = EventEmitter::new(8);
        emitter.emit(CallManagerEvent::MuteChanged { muted: true });

        let mut stream = emitter.subscribe();
        assert_eq!(emitter.receiver_count(), 1);
        emitter.emit(CallManagerEvent::RingingChanged { ringing: true });

        match stream.next().await {
            Some(Ok(CallManagerEvent::RingingChanged { ringing })) => assert!(ringing),
            other => panic!("unexpected {:?}", other),
        }
    }
}
