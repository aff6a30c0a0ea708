pub mod config;
pub mod errors;
pub mod sink;
pub mod types;

pub use config::{AudioConfiguration, StreamConfiguration};
pub use errors::AddressError;
pub use sink::{DecodeUnit, DecodeUnitSink};
pub use types::*;
