//! This crate controls power supplies that share a serial bus and speak the
//! Basic Small Message Protocol (BSMP).
//!
//! Each physical channel gets one scan thread. The thread owns every request
//! on that channel: it polls each device's monitoring group into a local
//! mirror, executes queued writes after each scan pass, and transfers
//! waveforms when no synchronized playback is running. Control-system glue
//! talks to the [`Facility`] only, which never blocks on bus I/O.
//!
//! The channel itself is anything implementing [`embedded_io::Read`] and
//! [`embedded_io::Write`], opened through a [`transport::Connect`]
//! implementation so it can be reopened after a fault.
//!
//! Supported device models:
//! * FBP
//! * FAC DC/DC
//!
//! Frame layout on the wire:
//! `[address][command][size u16 BE][payload][checksum]`.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod context;
pub mod curve;
pub mod device;
pub mod error;
pub mod mirror;
pub mod property;
pub mod scaling;
pub mod scan;
pub mod status;
pub mod transport;
pub mod udc;

#[cfg(test)]
mod mock_bus;

pub use catalog::DeviceModel;
pub use config::Config;
pub use context::Facility;
pub use error::{Error, ReadError, Result, WriteError};
pub use mirror::ConnectionState;
pub use property::{Property, PvValue, Reading, WriteTicket};
