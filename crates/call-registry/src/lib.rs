//! Call state registry: the single source of truth for a call's
//! identifiers, resource handles, and lifecycle phase.
//!
//! Every other component reads and writes call state through this crate.
//! Transitions on the same call key are serialized; calls are fully
//! independent of each other; reads never block writers.

pub mod error;
pub mod record;
pub mod registry;

pub use error::{Error, Result};
pub use record::{CallKey, CallPhase, CallRecord, SwitchHandles};
pub use registry::CallRegistry;
