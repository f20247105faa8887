//! Playback worker shared by the tone and ring players
//!
//! Each playback runs on its own tokio task. The task acquires a render
//! stream, renders period after period until it is told to stop, its time
//! limit expires or the renderer fails, and gives the stream back through
//! [`RendererGuard`] no matter which of those happened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::CallManagerResult;
use crate::events::{CallManagerEvent, EventEmitter};
use crate::platform::{AudioRenderer, PlaybackSource, RenderStream};

/// How a playback ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Time limit reached
    Completed,
    /// Stopped by the owner
    Stopped,
    /// Renderer could not be acquired or failed mid-way
    Failed(String),
}

/// Releases the render stream when dropped
pub struct RendererGuard {
    stream: Option<Box<dyn RenderStream>>,
}

impl RendererGuard {
    pub fn new(stream: Box<dyn RenderStream>) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub async fn render(&mut self, period: Duration) -> CallManagerResult<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.render(period).await,
            None => Ok(()),
        }
    }
}

impl Drop for RendererGuard {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
        }
    }
}

/// Handle to a running playback
pub struct PlaybackHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<PlaybackOutcome>,
    playing: Arc<AtomicBool>,
}

impl PlaybackHandle {
    /// Spawn a playback worker
    ///
    /// Returns as soon as the task is spawned; the renderer is acquired
    /// asynchronously. `limit` of `None` plays until stopped.
    pub fn spawn(
        renderer: Arc<dyn AudioRenderer>,
        source: PlaybackSource,
        period: Duration,
        limit: Option<Duration>,
        events: EventEmitter,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let playing = Arc::new(AtomicBool::new(false));
        let playing_flag = playing.clone();

        let task = tokio::spawn(async move {
            let stream = match renderer.open(&source).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to acquire renderer for {:?}: {}", source, e);
                    events.emit(CallManagerEvent::PlaybackFailed {
                        source: format!("{:?}", source),
                        reason: e.to_string(),
                    });
                    return PlaybackOutcome::Failed(e.to_string());
                }
            };
            let mut guard = RendererGuard::new(stream);
            playing_flag.store(true, Ordering::SeqCst);
            debug!("playback of {:?} started", source);

            let expiry = async move {
                match limit {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(expiry);

            let outcome = loop {
                tokio::select! {
                    // A dropped sender also means stop
                    _ = stop_rx.changed() => break PlaybackOutcome::Stopped,
                    _ = &mut expiry => break PlaybackOutcome::Completed,
                    result = guard.render(period) => {
                        if let Err(e) = result {
                            error!("render of {:?} failed: {}", source, e);
                            events.emit(CallManagerEvent::PlaybackFailed {
                                source: format!("{:?}", source),
                                reason: e.to_string(),
                            });
                            break PlaybackOutcome::Failed(e.to_string());
                        }
                    }
                }
            };

            playing_flag.store(false, Ordering::SeqCst);
            drop(guard);
            debug!("playback of {:?} ended: {:?}", source, outcome);
            outcome
        });

        Self {
            stop_tx,
            task,
            playing,
        }
    }

    /// Whether the renderer is acquired and rendering
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the worker and wait for it to release the renderer
    pub async fn stop(self) -> PlaybackOutcome {
        let _ = self.stop_tx.send(true);
        self.wait().await
    }

    /// Wait for the worker to end on its own
    pub async fn wait(self) -> PlaybackOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => PlaybackOutcome::Failed(format!("playback task ended abnormally: {}", e)),
        }
    }
}
