//! # unpi-client
//!
//! Async host-side driver for coprocessors speaking the TI Unified NPI
//! (MT/ZNP) serial protocol.
//!
//! ## Architecture
//!
//! - **Frame codec**: `FE | LEN | TYPE/SUBSYS | CMD | payload | FCS` framing
//!   with an XOR check byte, reassembled from arbitrary byte chunks
//! - **Registry**: subsystem, command and parameter definitions loaded from
//!   JSON, driving payload encoding and decoding
//! - **Pipeline**: one synchronous exchange on the wire at a time, with
//!   echo-based realignment when a reply goes missing
//!
//! ## Example
//!
//! ```ignore
//! use unpi_client::{Args, Driver};
//!
//! #[tokio::main]
//! async fn main() -> unpi_client::Result<()> {
//!     let driver = Driver::builder().start(serial_port).await?;
//!     let info = driver.util_request("getDeviceInfo", Args::empty()).await?;
//!     println!("ieee address: {}", info["ieeeaddr"]);
//!     driver.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod communicator;
pub mod error;
pub mod meta;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod writer;

mod command;
mod driver;
mod event;

pub use codec::{Args, Fields, Value};
pub use command::{Command, PendingKey, Ticket};
pub use driver::{Driver, DriverBuilder, DriverInfo};
pub use error::{Result, UnpiError};
pub use event::Event;
pub use meta::Registry;
