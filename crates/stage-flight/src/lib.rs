//! Arrow-Flight-based columnar streaming transport (spec §4.5).

pub mod registry;
pub mod service;

pub use registry::{StreamRegistry, StreamState, StreamStats};
pub use service::FlightTransport;
