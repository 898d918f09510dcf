//! Ring Bridge Library
//!
//! Real-time bridge between a periodic audio cycle and a driver-owned
//! shared-memory ring buffer arena.

pub mod driver;
pub mod session;
pub mod shm;

pub use driver::{ControlChannel, ControlError, EndpointKind, SignalError, WakeHandle};
pub use session::{
    BufferParams, EndpointConfig, EndpointTargets, FormatChangeHook, Session, SessionConfig,
    SessionError, TickTargets,
};
