//! AMF0 (Action Message Format) implementation
//!
//! AMF0 is the binary serialization RTMP uses for command parameters,
//! status objects and stream metadata.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfValue, Properties};
