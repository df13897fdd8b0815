//! Windowed request/response correlation over [`sluice_queue::Queue`]s.

pub mod correlator;
pub mod error;

pub use correlator::{correlate_window, Correlate, WindowConfig, WindowMatch};
pub use error::{AbortionSource, CorrelationFault, WindowCorrelationError};
