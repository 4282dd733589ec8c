//! `canlink`: a vendor-neutral concurrent CAN / CAN-FD frame I/O engine.
//!
//! A [`CanBus`](bus::CanBus) runs on top of any [`CanTransport`]
//! implementation (raw socket, vendor SDK, test mock) and provides the
//! machinery every adapter otherwise duplicates: a background receive loop
//! with batching, error-frame classification, and software filter
//! fallback; a multi-consumer frame pipe serving blocking, suspending, and
//! streaming receivers with defined ordering and backpressure; and a
//! periodic transmission scheduler with hardware-slot offload and a
//! software timer fallback.

/// Bus facade: lifecycle plus the transmit/receive/subscribe surfaces.
pub mod bus;
/// YAML configuration loading.
pub mod config;
/// Error taxonomy shared across the crate.
pub mod error;
/// Error-frame decoding into structured records.
pub mod error_frame;
/// Software fallback acceptance filtering.
pub mod filter;
/// Frame and receive-record data model.
pub mod frame;
/// Periodic transmission scheduling.
pub mod periodic;
/// The producer/consumer frame pipe.
pub mod pipe;
mod rx;
mod subscribers;
/// The transport contract adapters implement.
pub mod transport;
/// ControlCAN-style vendor DLL transport.
pub mod vci;

pub use bus::{BusOptions, CanBus};
pub use config::BusConfig;
pub use error::CanError;
pub use error_frame::{CanErrorInfo, ControllerStatus, FrameErrorType, ProtocolViolationType};
pub use filter::{FilterRule, SoftwareFilter};
pub use frame::{CanFrame, CanReceiveData, Direction, IdType};
pub use periodic::{PeriodicTx, PeriodicTxOptions, RepeatCount};
pub use pipe::FramePipe;
pub use subscribers::SubscriptionId;
pub use transport::{CanTransport, PeriodicSlot, WaitStatus};
