//! Call admission
//!
//! [`policy`] decides; [`request`] carries the decision out against the
//! registry, the telephony backend and the audio orchestrator.

pub mod policy;
pub mod request;

pub use policy::{
    AdmissionOutcome, AdmissionPolicy, AdmissionRequest, CallAction, CallWaitingDecision, RequestKind,
};
pub use request::CallRequestProcess;
