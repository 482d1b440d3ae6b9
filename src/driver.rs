//! The acquisition state machine.
//!
//! ```text
//! Idle --start--> Armed --:INIT--> Running --stop flag--> Stopping --:ABORT--> Idle
//! ```
//!
//! The driver owns the transport; a run blocks the calling thread until the
//! stop flag is observed at the head of the loop. Other threads talk to a
//! running acquisition through an [`AcquisitionHandle`].

use crate::{
    command::{fetch_command, setup_plan, Command},
    config::{ConfigError, ConfigUpdate, Configuration, DataFormat},
    decode::{decode_ascii, decode_binary, Identity},
    sample::{Accumulator, SampleCycle},
    status::{drain_errors, ErrorLog},
    transport::{ask, ask_raw, send, Transport},
    Error, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info, warn};

/// Consecutive undecodable replies tolerated before a run is aborted
pub const MAX_CONSECUTIVE_MALFORMED: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionState {
    #[default]
    Idle,
    Armed,
    Running,
    Stopping,
}

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    state: Mutex<AcquisitionState>,
    data: RwLock<Accumulator>,
    errors: ErrorLog,
}

/// Cross-thread view of an acquisition: stop it, read its data
#[derive(Debug, Clone)]
pub struct AcquisitionHandle {
    shared: Arc<Shared>,
}

impl AcquisitionHandle {
    /// Ask the run loop to stop after the cycle in flight. Only a run that is
    /// armed or running can be stopped; otherwise this does nothing.
    pub fn stop(&self) {
        let state = self.shared.state.lock();
        if matches!(*state, AcquisitionState::Armed | AcquisitionState::Running) {
            self.shared.stop.store(true, Ordering::SeqCst);
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> AcquisitionState {
        *self.shared.state.lock()
    }

    /// Copy of the accumulated data; always holds whole cycles
    pub fn snapshot(&self) -> Accumulator {
        self.shared.data.read().clone()
    }

    /// Read the accumulated data in place, holding off appends meanwhile
    pub fn with_data<R>(&self, f: impl FnOnce(&Accumulator) -> R) -> R {
        f(&self.shared.data.read())
    }

    pub fn error_log(&self) -> Vec<String> {
        self.shared.errors.entries()
    }
}

/// Outcome of [`Thm1176::setup`]
#[derive(Debug)]
pub struct SetupReport {
    /// Rejected configuration values, already substituted or ignored
    pub warnings: Vec<ConfigError>,
    /// Whether timer-triggered continuous acquisition was configured
    pub periodic_trigger: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Cycles appended to the accumulator
    pub cycles: usize,
    /// Cycles dropped because their reply could not be decoded
    pub skipped: usize,
}

/// A THM1176 field probe behind some transport
pub struct Thm1176<T> {
    transport: T,
    config: Configuration,
    fetch: Option<Command>,
    shared: Arc<Shared>,
}

impl<T: Transport> Thm1176<T> {
    /// Wrap a transport. Nothing is sent until [`Thm1176::setup`].
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: Configuration::default(),
            fetch: None,
            shared: Arc::default(),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn state(&self) -> AcquisitionState {
        *self.shared.state.lock()
    }

    pub fn handle(&self) -> AcquisitionHandle {
        AcquisitionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// The stop flag only changes under the state lock, so a stop can never
    /// outlive the run it was meant for
    fn set_state(&self, next: AcquisitionState) {
        let mut state = self.shared.state.lock();
        info!(from = ?*state, to = ?next, "Acquisition state");
        if matches!(next, AcquisitionState::Armed | AcquisitionState::Idle) {
            self.shared.stop.store(false, Ordering::SeqCst);
        }
        *state = next;
    }

    /// Query and parse the instrument identification
    pub fn identify(&mut self) -> Result<Identity> {
        let reply = ask(&mut self.transport, &Command::Identify)?;
        let identity: Identity = reply.parse()?;
        info!(%identity, "Identified instrument");
        Ok(identity)
    }

    /// Merge `update` into the cached configuration and send it to the
    /// instrument. The configuration is only committed once every command has
    /// been written.
    pub fn setup(&mut self, update: ConfigUpdate) -> Result<SetupReport> {
        let mut config = self.config.clone();
        let mut warnings = config.apply(update);
        let plan = setup_plan(&config);
        for command in &plan.commands {
            send(&mut self.transport, command)?;
        }

        let periodic_trigger = plan.periodic_trigger();
        warnings.extend(plan.trigger_warning);
        self.fetch = Some(fetch_command(&config));
        self.config = config;
        info!(config = ?self.config, "Instrument configured");
        Ok(SetupReport {
            warnings,
            periodic_trigger,
        })
    }

    /// One fetch, decoded, with any pending instrument errors drained.
    /// Nothing is appended to the accumulator.
    pub fn fetch_cycle(&mut self) -> Result<SampleCycle> {
        let fetch = self.fetch.as_ref().ok_or(Error::NotConfigured)?;
        let reading = match self.config.format {
            DataFormat::Ascii => {
                let reply = ask(&mut self.transport, fetch)?;
                decode_ascii(&reply, &self.config)?
            }
            DataFormat::Integer => {
                let reply = ask_raw(&mut self.transport, fetch)?;
                decode_binary(&reply, &self.config)?
            }
        };
        if reading.status.has_pending_error() {
            drain_errors(&mut self.transport, &self.shared.errors)?;
        }
        Ok(reading.cycle)
    }

    /// Drain the instrument's error queue once, regardless of status
    pub fn check_errors(&mut self) -> Result<usize> {
        drain_errors(&mut self.transport, &self.shared.errors)
    }

    /// Arm the trigger and acquire until the stop flag is raised.
    ///
    /// The accumulator is cleared first. A stop requested while armed, before
    /// the first cycle, still yields a clean abort. If the transport fails the
    /// run ends without the abort command and the error is returned.
    pub fn start(&mut self) -> Result<RunSummary> {
        if self.fetch.is_none() {
            return Err(Error::NotConfigured);
        }

        self.shared.data.write().clear();
        self.set_state(AcquisitionState::Armed);
        if let Err(e) = send(&mut self.transport, &Command::Initiate) {
            error!("{e}");
            self.finish();
            return Err(e);
        }
        self.set_state(AcquisitionState::Running);

        match self.run() {
            Ok(summary) => {
                self.abort()?;
                info!(cycles = summary.cycles, skipped = summary.skipped, "Run complete");
                Ok(summary)
            }
            Err(e) if e.is_fatal() => {
                error!("Acquisition lost the transport: {e}");
                self.finish();
                Err(e)
            }
            Err(e) => {
                error!("Acquisition aborted: {e}");
                if let Err(abort) = self.abort() {
                    error!("Abort failed as well: {abort}");
                }
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut malformed_streak = 0;

        while !self.shared.stop.load(Ordering::SeqCst) {
            match self.fetch_cycle() {
                Ok(cycle) => {
                    self.shared.data.write().append(&cycle);
                    summary.cycles += 1;
                    malformed_streak = 0;
                }
                Err(Error::MalformedResponse(e)) => {
                    summary.skipped += 1;
                    malformed_streak += 1;
                    warn!("Skipping cycle: {e}");
                    if malformed_streak >= MAX_CONSECUTIVE_MALFORMED {
                        return Err(Error::MalformedResponse(e));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Running -> Stopping -> Idle
    fn abort(&mut self) -> Result<()> {
        self.set_state(AcquisitionState::Stopping);
        let status = ask(&mut self.transport, &Command::AbortStatus);
        self.finish();
        let status = status?;
        info!(status = %status, "Stopped acquisition");
        Ok(())
    }

    fn finish(&mut self) {
        self.set_state(AcquisitionState::Idle);
    }
}
