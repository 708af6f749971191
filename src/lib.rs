//! Neovolt - Modbus TCP driver for Neovolt/Bytewatt hybrid inverters
//!
//! Polls the inverter's register blocks at adaptive per-block rates,
//! normalizes the raw words into physical units, derives house load and
//! daily energy, and drives the battery through the fixed dispatch
//! command frame. A Dynamic Export controller closes the loop between
//! live grid measurements and battery discharge.

pub mod config;
pub mod coordinator;
pub mod derived;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod fleet;
pub mod logging;
pub mod modbus;
pub mod persistence;
pub mod polling;
pub mod recovery;
pub mod registers;
pub mod snapshot;

pub use config::Config;
pub use coordinator::Coordinator;
pub use dispatch::{DispatchCommand, DispatchMode};
pub use error::{NeovoltError, Result};
pub use export::{DynamicExportController, DynamicExportParams};
pub use fleet::{Fleet, FleetAggregate};
pub use modbus::{ModbusLike, ModbusTransport};
pub use snapshot::SharedSnapshot;
