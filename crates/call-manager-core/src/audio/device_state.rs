//! Audio-device (output route) state machine
//!
//! Route priority is Bluetooth SCO, then wired headset, then speaker while
//! ringing or in video, then earpiece. The priority falls out of which events
//! each node accepts: the Bluetooth node ignores a headset being plugged in,
//! the headset node yields to SCO, and the earpiece/speaker nodes yield to
//! both. [`select_route`] applies the same order whenever a route has to be
//! picked from scratch.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::audio::event::AudioEvent;
use crate::error::{CallManagerError, CallManagerResult};

/// Physical output route
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AudioDevice {
    Earpiece,
    Speaker,
    WiredHeadset,
    BluetoothSco,
    /// No route; audio is not in use
    Disabled,
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Node of the audio-device machine
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum DeviceStateKind {
    Earpiece,
    Speaker,
    WiredHeadset,
    BluetoothSco,
    Inactive,
}

impl DeviceStateKind {
    pub fn device(&self) -> AudioDevice {
        match self {
            DeviceStateKind::Earpiece => AudioDevice::Earpiece,
            DeviceStateKind::Speaker => AudioDevice::Speaker,
            DeviceStateKind::WiredHeadset => AudioDevice::WiredHeadset,
            DeviceStateKind::BluetoothSco => AudioDevice::BluetoothSco,
            DeviceStateKind::Inactive => AudioDevice::Disabled,
        }
    }
}

impl fmt::Display for DeviceStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the Bluetooth SCO link is open for
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScoLink {
    Closed,
    /// Two-way voice
    Voice,
    /// Ring signal only
    Ringing,
}

/// Whether the call path currently holds audio focus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum AudioInterruptState {
    /// No call audio
    #[default]
    UnInterrupt,
    /// A call is ringing
    InRinging,
    /// A call owns the audio path
    InInterrupt,
}

/// Inputs to route selection, maintained by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceContext {
    pub bt_sco_available: bool,
    pub wired_headset_available: bool,
    pub interrupt: AudioInterruptState,
    /// An active or foreground call is video
    pub video_active: bool,
    /// The foreground call asked for speakerphone
    pub speakerphone_on: bool,
}

/// Pick a route from scratch
pub fn select_route(ctx: &DeviceContext) -> DeviceStateKind {
    if ctx.interrupt == AudioInterruptState::UnInterrupt {
        return DeviceStateKind::Inactive;
    }
    if ctx.bt_sco_available {
        DeviceStateKind::BluetoothSco
    } else if ctx.wired_headset_available {
        DeviceStateKind::WiredHeadset
    } else if ctx.interrupt == AudioInterruptState::InRinging
        || ctx.video_active
        || ctx.speakerphone_on
    {
        DeviceStateKind::Speaker
    } else {
        DeviceStateKind::Earpiece
    }
}

enum Step {
    Reject,
    Stay,
    Goto(DeviceStateKind),
    Reselect,
    OpenSco(ScoLink),
    Deactivate,
}

impl DeviceStateKind {
    fn on_event(self, event: AudioEvent) -> Step {
        use AudioEvent::*;
        match self {
            DeviceStateKind::Earpiece => match event {
                WiredHeadsetConnected => Step::Goto(DeviceStateKind::WiredHeadset),
                BluetoothScoConnected => Step::Goto(DeviceStateKind::BluetoothSco),
                _ => Step::Reject,
            },
            DeviceStateKind::Speaker => match event {
                WiredHeadsetConnected => Step::Goto(DeviceStateKind::WiredHeadset),
                BluetoothScoConnected => Step::Goto(DeviceStateKind::BluetoothSco),
                AudioActivated => Step::Reselect,
                _ => Step::Reject,
            },
            DeviceStateKind::WiredHeadset => match event {
                WiredHeadsetDisconnected => Step::Reselect,
                BluetoothScoConnected => Step::Goto(DeviceStateKind::BluetoothSco),
                _ => Step::Reject,
            },
            DeviceStateKind::BluetoothSco => match event {
                BluetoothScoConnected => Step::Stay,
                BluetoothScoDisconnected => Step::Reselect,
                AudioActivated => Step::OpenSco(ScoLink::Voice),
                AudioRinging => Step::OpenSco(ScoLink::Ringing),
                AudioDeactivated => Step::Deactivate,
                _ => Step::Reject,
            },
            DeviceStateKind::Inactive => match event {
                AudioActivated | AudioRinging => Step::Reselect,
                AudioDeactivated => Step::Stay,
                _ => Step::Reject,
            },
        }
    }
}

/// The audio-device machine
///
/// Not internally synchronized; the orchestrator serializes access.
#[derive(Debug)]
pub struct AudioDeviceStateMachine {
    current: DeviceStateKind,
    sco_link: ScoLink,
}

impl Default for AudioDeviceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDeviceStateMachine {
    pub fn new() -> Self {
        Self {
            current: DeviceStateKind::Inactive,
            sco_link: ScoLink::Closed,
        }
    }

    pub fn current(&self) -> DeviceStateKind {
        self.current
    }

    pub fn sco_link(&self) -> ScoLink {
        self.sco_link
    }

    /// Feed one event; returns whether the current node accepted it
    pub fn process_event(&mut self, event: AudioEvent, ctx: &DeviceContext) -> bool {
        match self.current.on_event(event) {
            Step::Reject => {
                debug!("device state {} rejected {}", self.current, event);
                false
            }
            Step::Stay => true,
            Step::Goto(next) => {
                self.set_current(next, ctx);
                true
            }
            Step::Reselect => {
                self.set_current(select_route(ctx), ctx);
                true
            }
            Step::OpenSco(link) => {
                if self.sco_link != link {
                    debug!("sco link {:?} -> {:?}", self.sco_link, link);
                    self.sco_link = link;
                }
                true
            }
            Step::Deactivate => {
                self.set_current(DeviceStateKind::Inactive, ctx);
                true
            }
        }
    }

    /// Explicit route choice, usually from the user
    pub fn switch_device(&mut self, device: AudioDevice, ctx: &DeviceContext) -> CallManagerResult<()> {
        let target = match device {
            AudioDevice::Disabled => {
                self.disable_all();
                return Ok(());
            }
            AudioDevice::BluetoothSco if !ctx.bt_sco_available => None,
            AudioDevice::WiredHeadset if !ctx.wired_headset_available => None,
            AudioDevice::BluetoothSco => Some(DeviceStateKind::BluetoothSco),
            AudioDevice::WiredHeadset => Some(DeviceStateKind::WiredHeadset),
            AudioDevice::Speaker => Some(DeviceStateKind::Speaker),
            AudioDevice::Earpiece => Some(DeviceStateKind::Earpiece),
        };
        let Some(target) = target else {
            return Err(CallManagerError::DeviceUnavailable {
                device: device.to_string(),
            });
        };
        if ctx.interrupt == AudioInterruptState::UnInterrupt {
            return Err(CallManagerError::DeviceUnavailable {
                device: format!("{} (no call audio)", device),
            });
        }
        self.set_current(target, ctx);
        Ok(())
    }

    /// Drop the route entirely
    pub fn disable_all(&mut self) {
        if self.current != DeviceStateKind::Inactive {
            info!("audio device {} -> {}", self.current, DeviceStateKind::Inactive);
        }
        self.current = DeviceStateKind::Inactive;
        self.sco_link = ScoLink::Closed;
    }

    fn set_current(&mut self, next: DeviceStateKind, ctx: &DeviceContext) {
        if next == DeviceStateKind::BluetoothSco {
            self.sco_link = match ctx.interrupt {
                AudioInterruptState::InInterrupt => ScoLink::Voice,
                AudioInterruptState::InRinging => ScoLink::Ringing,
                AudioInterruptState::UnInterrupt => ScoLink::Closed,
            };
        } else {
            self.sco_link = ScoLink::Closed;
        }
        if next != self.current {
            info!("audio device {} -> {}", self.current, next);
            self.current = next;
        }
    }
}
