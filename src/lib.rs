//! **FAST** (**F**IX **A**dapted for **ST**reaming protocol) is a space and processing
//! efficient encoding method for message oriented data streams.
//!
//! The FAST protocol has been developed as part of the FIX Market Data Optimization Working Group.
//! FAST data compression is designed for electronic exchange of financial data, particularly
//! for high volume, low latency data dissemination. Compression is achieved by carrying, per field,
//! a *previous value* across messages and transmitting only what is needed to reconstruct the
//! current value under the field's *operator* (`none`, `constant`, `default`, `copy`, `increment`,
//! `delta`, `tail`).
//!
//! For the FAST protocol description see the [technical specification](https://www.fixtrading.org/standards/fast-online/).
//!
//! The `fastwire` crate provides an encoder and a decoder for FAST protocol messages.
//!
//! # Usage
//!
//! Templates are defined in XML, e.g.:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8" ?>
//! <templates xmlns="http://www.fixprotocol.org/ns/fast/td/1.1">
//!     <template id="1" name="MDHeartbeat">
//!         <uInt32 id="34" name="MsgSeqNum"/>
//!         <uInt64 id="52" name="SendingTime"/>
//!     </template>
//!     <template id="2" name="MDLogout">
//!         <uInt32 id="34" name="MsgSeqNum"/>
//!         <string id="58" name="Text" presence="optional"/>
//!     </template>
//! </templates>
//! ```
//!
//! A message is a tree of [`Field`]s aligned with the template's field layout:
//!
//! ```rust,ignore
//! use fastwire::{Encoder, Field, Message, Value};
//!
//! let mut encoder = Encoder::new_from_xml(include_str!("templates.xml"))?;
//!
//! let msg = Message::new(1, vec![
//!     Field::Scalar(Some(Value::UInt32(1))),
//!     Field::Scalar(Some(Value::UInt64(20240606000000000))),
//! ]);
//!
//! // Append to a growable buffer...
//! let raw: Vec<u8> = encoder.encode_vec(&msg, false)?;
//!
//! // ...or serialize into a fixed buffer, failing when it is too small.
//! let mut buf = [0u8; 64];
//! let size = encoder.encode_buffer(&msg, &mut buf, false)?;
//! ```
//!
//! Decoding mirrors encoding:
//!
//! ```rust,ignore
//! use fastwire::Decoder;
//!
//! let mut decoder = Decoder::new_from_xml(include_str!("templates.xml"))?;
//! let msg = decoder.decode_vec(raw)?;
//! ```
//!
//! Both halves keep mutable dictionary state (the previous values), so an encoder or decoder
//! instance must not be shared between threads. Distinct instances are fully independent.
//!
pub use base::decimal::Decimal;
pub use base::message::{Field, Message};
pub use base::types::{Operator, Presence, Template};
pub use base::value::{Value, ValueType};
pub use decoder::decoder::Decoder;
pub use decoder::reader::Reader;
pub use encoder::buffer::{Buffer, FixedBuffer};
pub use encoder::encoder::Encoder;

mod base;
mod common;
mod decoder;
mod encoder;
mod utils;

#[cfg(test)]
mod tests;


pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    ///! Errors raised while building templates from malformed definitions.
    #[error("Static Error: {0}")]
    Static(String),

    ///! Errors raised by the wire rules while encoding or decoding.
    #[error("Dynamic Error: {0}")]
    Dynamic(#[from] DynamicError),

    ///! Errors raised by API misuse, e.g. a message that does not match its template.
    #[error("Runtime Error: {0}")]
    Runtime(String),

    ///! A fixed output buffer ran out of space.
    #[error("Buffer capacity exceeded")]
    CapacityExceeded,

    ///! End of file/stream reached.
    #[error("End of file/stream reached")]
    Eof,

    ///! Unexpected end of file/stream reached.
    #[error("Unexpected end of file/stream reached")]
    UnexpectedEof,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse integer: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("Failed to parse float: {0}")]
    ParseFloatError(#[from] std::num::ParseFloatError),

    #[error(transparent)]
    FromUtf8Error(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    XMLTreeError(#[from] roxmltree::Error),
}

/// Dynamic errors of the FAST wire contract.
///
/// These carry the template id and field path where the stream went wrong, so a failed
/// `encode`/`decode` call can be attributed to a concrete field occurrence.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DynamicError {
    ///! A mandatory copy/increment/delta field found an empty previous value. [ERR D6]
    #[error("[ERR D6] field '{path}' of template {template_id} is mandatory but its previous value is empty")]
    EmptyPreviousValue { template_id: u32, path: String },

    ///! The stream referenced a template id that is not registered. [ERR D9]
    #[error("[ERR D9] unknown template id: {template_id}")]
    UnknownTemplate { template_id: u32 },

    ///! A value does not fit the declared integer width, or a delta/increment overflowed. [ERR D2]
    #[error("[ERR D2] value is out of range: {detail}")]
    OutOfRange { detail: String },

    ///! A string delta asked to strip more than the base value holds. [ERR D7]
    #[error("[ERR D7] subtraction length {length} exceeds base value length {base_length}")]
    SubtractionLength { length: i64, base_length: usize },

    ///! A decimal exponent is outside [-63, 63]. [ERR R1]
    #[error("[ERR R1] exponent value is out of range: {exponent}")]
    ExponentOutOfRange { exponent: i32 },
}
