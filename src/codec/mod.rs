//! Codec module - typed argument values and metadata-driven payloads.
//!
//! - [`Value`] / [`Fields`] / [`Args`] - dynamic values keyed by parameter name
//! - [`PayloadCodec`] - serializes values into a payload and parses payloads
//!   back into fields, one reader/writer per [`ParamType`](crate::meta::ParamType)
//! - `records` - fixed layouts of management table entries and beacons
//!
//! # Design
//!
//! The codec is a marker struct with static methods. Parameter lists come
//! from the registry; the codec itself holds no state.
//!
//! # Example
//!
//! ```
//! use unpi_client::codec::{PayloadCodec, Value};
//! use unpi_client::meta::{Param, ParamType};
//!
//! let params = vec![Param::new("value", ParamType::U32)];
//! let payload = PayloadCodec::encode(&params, &[Some(Value::from(7u32))]).unwrap();
//! assert_eq!(&payload[..], &[7, 0, 0, 0]);
//!
//! let fields = PayloadCodec::decode(&params, &payload, false).unwrap();
//! assert_eq!(fields["value"], Value::Number(7));
//! ```

mod payload;
mod records;
mod value;

pub use payload::{PayloadCodec, GENERIC_RSP_LEN};
pub use value::{Args, Fields, Value};
