//! # CAN Vehicle Diagnostics Manager
//!
//! An embedded-style diagnostic request manager mediating between an
//! upstream command channel and the CAN bus fabric: it admits one-shot and
//! recurring OBD-II/UDS requests, schedules their transmission, matches
//! incoming frames to outstanding requests, reassembles multi-frame
//! responses, and publishes decoded results on an output pipeline.
//!
//! ## Features
//!
//! - **Fixed slot pool**: a bounded set of simultaneous requests, no
//!   allocation at steady state
//! - **Recurring queries**: staggered-start recurring requests up to 10 Hz
//!   with round-robin fairness
//! - **Functional broadcasts**: `0x7DF` queries fan in responses from every
//!   module for the full timeout window
//! - **Filter accounting**: response acceptance filters shared across
//!   requests by reference counting
//! - **Emulation**: synthesized responses for bench work without a bus
//!
//! ## Quick Start
//!
//! ```rust
//! use diagbus::codec::DiagnosticRequest;
//! use diagbus::request::RequestOptions;
//! use diagbus::{CanBus, DiagnosticsManager, ManagerConfig};
//!
//! let mut buses = heapless::Vec::new();
//! buses.push(CanBus::new(1, true)).ok();
//! let mut manager = DiagnosticsManager::new(buses, ManagerConfig::default());
//!
//! // Query engine speed from the ECM.
//! let request = DiagnosticRequest::with_pid(0x7E0, 0x01, 0x0C);
//! manager
//!     .add_one_shot(1, request, RequestOptions::default())
//!     .unwrap();
//!
//! manager.send_requests(1);
//! assert!(manager.bus(1).unwrap().tx_queue_len() > 0);
//! ```
//!
//! ## Architecture
//!
//! - [`manager`] - Slot pool, request lifecycle, scheduler, and dispatcher
//! - [`bus`] - CAN buses, transmit queues, and acceptance filters
//! - [`codec`] - Shim binding to the UDS/ISO-TP protocol codec
//! - [`command`] - Upstream add/cancel control commands
//! - [`pipeline`] - Structured vehicle messages bound for the host
//! - [`emulator`] - Synthesized responses without bus I/O
//! - [`obd2`] - OBD-II constants and built-in decoders
//!
//! The manager is single-threaded and cooperative: the firmware main loop
//! interleaves `send_requests` per bus per tick, `receive` per dequeued
//! frame, and `handle_command` on upstream input.

pub mod bus;
pub mod clock;
pub mod codec;
pub mod command;
pub mod emulator;
pub mod manager;
pub mod obd2;
pub mod pipeline;
pub mod request;
pub mod testing;

// Re-export main public types for convenience
pub use bus::{CanBus, CanMessage, CanMessageFormat};
pub use clock::{Clock, SystemClock};
pub use command::{CommandAction, CommandRequest, DecodedType, DiagnosticControlCommand};
pub use manager::{
    DiagnosticsError, DiagnosticsManager, ManagerConfig, MAX_SIMULTANEOUS_DIAG_REQUESTS,
};
pub use pipeline::{Pipeline, VehicleMessage};
pub use request::RequestOptions;
