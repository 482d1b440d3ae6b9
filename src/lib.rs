//! Driver for the Metrolab THM1176 three-axis Hall magnetometer.
//!
//! The instrument is configured with [`Thm1176::setup`] and then polled in a
//! blocking loop by [`Thm1176::start`], which appends every decoded block of
//! samples to a shared [`Accumulator`]. Another thread can watch the data or
//! end the run through an [`AcquisitionHandle`].
//!
//! Any [`Transport`] can carry the commands. [`usbtmc::Device`] talks to real
//! hardware, [`LoopbackTransport`] replays scripted replies.

mod command;
mod config;
mod decode;
mod driver;
mod error;
mod loopback;
mod sample;
mod status;
mod transport;
pub mod usbtmc;

pub use command::{fetch_command, periodic_trigger, setup_plan, Command, SetupPlan, FETCH_DIGITS};
pub use config::{
    validate_trigger_period, ConfigError, ConfigUpdate, Configuration, DataFormat, Range,
    MAX_BLOCK_SIZE, TRIGGER_PERIOD_BOUNDS,
};
pub use decode::{
    block_timeline, decode_ascii, decode_binary, parse_block_header, BlockHeader, Identity,
    Malformed, Reading,
};
pub use driver::{
    AcquisitionHandle, AcquisitionState, RunSummary, SetupReport, Thm1176,
    MAX_CONSECUTIVE_MALFORMED,
};
pub use error::{Error, Result};
pub use loopback::LoopbackTransport;
pub use sample::{Accumulator, FetchKind, SampleCycle};
pub use status::{drain_errors, parse_error_reply, ErrorLog, StatusByte, MAX_ERROR_QUERIES};
pub use transport::{Transport, TransportError};
