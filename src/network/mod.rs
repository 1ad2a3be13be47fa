//! Remote device protocol: framing, server, client handle and error mapping.

pub mod client;
pub mod error_mapping;
pub mod protocol;
pub mod server;

pub use client::{normalize_address, DeviceProxy};
pub use protocol::{
    AttributeWrite, DeviceRequest, DeviceResponse, DeviceState, EncodedValue, RequestType,
    ResponseStatus,
};
pub use server::{DeviceHandler, DeviceServer, ServerHandle};
