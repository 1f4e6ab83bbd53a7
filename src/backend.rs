//! Backend composition root.
//!
//! A [`Backend`] ties together the parameter engine, the switching-signal
//! encoder, and the scan state machine for one bank, and owns the publish
//! step that pushes derived values to the device registers and the status
//! store. Observing submode families share this one implementation; their
//! differences live in data (the [`vela_config::ModeConfig`]) and in the
//! derived-value chain, not in override hierarchies.

use crate::device::Digitizer;
use crate::error::{Error, Result};
use crate::params::ParamEngine;
use crate::process::{CommandChannel, Coordinator};
use crate::scan::{self, ScanMachine, ScanState};
use crate::status::StatusStore;
use crate::switching::{Phase, SourceSelect, SwitchingCycle};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vela_config::{BankConfig, Config, ModeConfig, ScanStatus};

/// One phase of a full-cycle specification.
///
/// Durations are given as fractions of the cycle period; the backend
/// converts them to granules when the cycle is installed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CyclePhase {
    /// Phase duration as a fraction of the cycle period.
    pub fraction: f64,
    /// Whether data is blanked during this phase.
    pub blanking: bool,
    /// Cal diode state.
    pub cal: bool,
    /// Signal/reference select 1.
    pub sig_ref_1: bool,
    /// Signal/reference select 2.
    pub sig_ref_2: bool,
    /// Advanced signal/reference select.
    pub adv_sig_ref: bool,
}

/// Spectrometer backend for one bank.
pub struct Backend {
    device: Arc<dyn Digitizer>,
    status: StatusStore,
    engine: ParamEngine,
    cycle: SwitchingCycle,
    scan: ScanMachine,
    bank: BankConfig,
    modes: HashMap<String, ModeConfig>,
    mode_name: String,
    source_select: SourceSelect,
    prepared: bool,
}

impl Backend {
    /// Creates a backend from its configuration and programs the default
    /// mode's bitstream.
    pub async fn new(
        config: &Config,
        device: Arc<dyn Digitizer>,
        status: StatusStore,
    ) -> Result<Backend> {
        let bank = config.bank.clone();
        let hpc = Coordinator::new(
            "hpc",
            bank.hpc_program.clone(),
            bank.hpc_args.clone(),
            CommandChannel::Fifo(PathBuf::from(&bank.hpc_fifo)),
        );
        let fits = bank.fits_program.clone().map(|program| {
            Coordinator::new("fits", program, bank.fits_args.clone(), CommandChannel::Stdin)
        });
        let mode = config
            .modes
            .get(&config.default_mode)
            .ok_or_else(|| {
                Error::Configuration(format!("default mode {} not configured", config.default_mode))
            })?
            .clone();
        let engine = ParamEngine::new(mode.clone());
        let scan = ScanMachine::new(
            device.clone(),
            status.clone(),
            hpc,
            fits,
            Duration::from_secs(mode.arm_delay_secs.into()),
        );
        let mut backend = Backend {
            device,
            status,
            cycle: SwitchingCycle::new(engine.granule_period()),
            engine,
            scan,
            bank,
            modes: config.modes.clone(),
            mode_name: config.default_mode.clone(),
            source_select: SourceSelect::default(),
            prepared: false,
        };
        backend.install_mode(mode).await?;
        Ok(backend)
    }

    /// Selects an observing mode: programs its bitstream, runs its reset
    /// phase, and resets mode-supplied parameter defaults.
    pub async fn set_mode(&mut self, name: &str) -> Result<()> {
        if self.scan.state() == ScanState::Running {
            return Err(Error::Configuration(
                "cannot change mode while a scan is running".to_string(),
            ));
        }
        let mode = self
            .modes
            .get(name)
            .ok_or_else(|| {
                let legal: Vec<&String> = self.modes.keys().collect();
                Error::invalid_parameter(
                    "mode",
                    format!("unknown mode {name}; legal modes are {legal:?}"),
                )
            })?
            .clone();
        self.mode_name = name.to_string();
        self.install_mode(mode).await
    }

    async fn install_mode(&mut self, mode: ModeConfig) -> Result<()> {
        tracing::info!(mode = %self.mode_name, bitstream = %mode.bitstream, "installing mode");
        self.device.program(&mode.bitstream)?;
        scan::run_command_phase(self.device.as_ref(), &mode.reset_phase).await?;
        self.scan
            .set_arm_delay(Duration::from_secs(mode.arm_delay_secs.into()));
        self.engine.set_mode(mode);
        // default cycle: one full-duty phase, no cal, no blanking
        self.cycle = SwitchingCycle::new(self.engine.granule_period());
        self.cycle.add_phase(Phase {
            duration: (1.0 / self.cycle.granule_period()).round() as u32,
            blanking: false,
            cal: false,
            sig_ref_1: false,
            sig_ref_2: false,
            adv_sig_ref: false,
        })?;
        self.prepared = false;
        Ok(())
    }

    /// Returns the current mode name.
    pub fn mode_name(&self) -> &str {
        &self.mode_name
    }

    /// Sets one observation parameter. Invalidates any previous `prepare`.
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<()> {
        self.engine.set_param(name, value)?;
        self.prepared = false;
        Ok(())
    }

    /// Removes all switching-cycle phases.
    pub fn clear_phases(&mut self) {
        self.cycle.clear();
        self.prepared = false;
    }

    /// Appends one switching-cycle phase with a duration in granules.
    pub fn add_phase(&mut self, phase: Phase) -> Result<()> {
        self.cycle.add_phase(phase)?;
        self.prepared = false;
        Ok(())
    }

    /// Sets the driver selection for the switching lines.
    pub fn set_source_select(&mut self, select: SourceSelect) {
        self.source_select = select;
        self.prepared = false;
    }

    /// Replaces the switching cycle from a period and fractional phases.
    ///
    /// The fractions must be positive and sum to 1.
    pub fn set_full_cycle(&mut self, period_secs: f64, phases: &[CyclePhase]) -> Result<()> {
        if phases.is_empty() {
            return Err(Error::invalid_parameter(
                "phases",
                "a switching cycle needs at least one phase",
            ));
        }
        let total: f64 = phases.iter().map(|p| p.fraction).sum();
        if phases.iter().any(|p| p.fraction <= 0.0) || (total - 1.0).abs() > 1e-6 {
            return Err(Error::invalid_parameter(
                "phases",
                format!("phase fractions must be positive and sum to 1, got {total}"),
            ));
        }
        let granule = self.cycle.granule_period();
        let mut cycle = SwitchingCycle::new(granule);
        for p in phases {
            let duration = (p.fraction * period_secs / granule).round() as u32;
            if duration == 0 {
                return Err(Error::invalid_parameter(
                    "phases",
                    format!("phase fraction {} is shorter than one granule", p.fraction),
                ));
            }
            cycle.add_phase(Phase {
                duration,
                blanking: p.blanking,
                cal: p.cal,
                sig_ref_1: p.sig_ref_1,
                sig_ref_2: p.sig_ref_2,
                adv_sig_ref: p.adv_sig_ref,
            })?;
        }
        self.cycle = cycle;
        self.prepared = false;
        Ok(())
    }

    /// Runs the derived-value chain and publishes the results.
    ///
    /// Everything is computed and validated first; only then are registers,
    /// buffers, and the status store written, so a failing chain leaves the
    /// device untouched.
    pub fn prepare(&mut self) -> Result<()> {
        let derived = self.engine.derive(&self.cycle)?;
        let lookup_table = self.cycle.lookup_table()?;
        let boundaries = self.cycle.phase_boundaries()?;
        let sw_period = u32::try_from(self.cycle.total_duration_granules())
            .map_err(|_| Error::Configuration("switching cycle too long for register".into()))?;

        // register and buffer publication
        self.device.write_register("acc_len", derived.acc_len_reg)?;
        self.device.write_register("sw_period", sw_period)?;
        self.device
            .write_register("sw_source_sel", self.source_select.register_word())?;
        self.device
            .write_register("fft_select", derived.hw_nchan.trailing_zeros())?;
        self.device
            .write_register("dest_port", u32::from(self.bank.data_port))?;
        self.device.write_buffer("ssg_lut", &lookup_table)?;
        self.device
            .configure_network(&self.bank.data_mac, &self.bank.data_ip, self.bank.data_port)?;

        // status publication, committed as a whole
        self.status.update("BANKNAM", &self.bank.name);
        self.status.update("MODENAME", &self.mode_name);
        self.status.update("EXPOSURE", derived.exposure);
        self.status.update("HWEXPOSR", derived.hw_exposure);
        self.status.update("SWPERINT", derived.swper_int);
        self.status.update("CHAN_BW", derived.chan_bw);
        self.status.update("EFSAMPFR", derived.sampler_frequency);
        self.status.update("ACC_LEN", derived.acc_len);
        self.status.update("NCHAN", derived.hw_nchan);
        self.status.update("DOWNSAMP", derived.down_sample);
        self.status.update("FRQDECIM", derived.freq_decimation);
        self.status.update("PKTFMT", derived.packet_format);
        self.status.update("POLMODE", derived.pol_mode);
        self.status.update("BLOCSIZE", derived.block_size);
        self.status.update("FFTLEN", derived.fft_len);
        self.status.update("OVERLAP", derived.overlap);
        self.status.update("NUMPHASE", boundaries.len());
        self.status
            .update("SWPERIOD", self.cycle.total_duration_secs());
        self.status.update(
            "PHSSTART",
            join(boundaries.iter().map(|b| b.start_fraction)),
        );
        self.status
            .update("PHSCAL", join(boundaries.iter().map(|b| u8::from(b.cal))));
        self.status.update(
            "PHSSR1",
            join(boundaries.iter().map(|b| u8::from(b.sig_ref_1))),
        );
        self.status.update(
            "PHSBLNK",
            join(boundaries.iter().map(|b| b.blanking_secs)),
        );
        for (key, value) in self.engine.pass_through() {
            self.status.update(key, value);
        }
        for (key, value) in &self.engine.mode().extra_status {
            self.status.update(key.clone(), value);
        }
        self.status.write();

        self.prepared = true;
        Ok(())
    }

    /// Returns the earliest feasible scan start time.
    pub fn earliest_start(&self) -> DateTime<Utc> {
        self.scan.earliest_start()
    }

    /// Starts a scan at the requested time, or at the earliest feasible one.
    ///
    /// `prepare()` must have been called since the last parameter change.
    pub async fn start(&mut self, requested: Option<DateTime<Utc>>) -> Result<(bool, String)> {
        if !self.prepared {
            return Err(Error::Configuration(
                "prepare() has not been called since the last parameter change".to_string(),
            ));
        }
        let arm_phase = self.engine.mode().arm_phase.clone();
        let result = self.scan.start(requested, &arm_phase).await?;
        if result.0 {
            let postarm = self.engine.mode().postarm_phase.clone();
            scan::run_command_phase(self.device.as_ref(), &postarm).await?;
        }
        Ok(result)
    }

    /// Stops the running scan (or exits monitor mode).
    pub async fn stop(&mut self) -> Result<(bool, String)> {
        self.scan.stop().await
    }

    /// Puts the backend in monitor mode.
    pub async fn monitor(&mut self) -> Result<(bool, String)> {
        self.scan.monitor().await
    }

    /// Reports the scan status from the state machine and the status store.
    pub fn scan_status(&self) -> ScanStatus {
        ScanStatus {
            running: self.scan.state() == ScanState::Running,
            start_time: self.scan.start_time().map(|t| t.to_rfc3339()),
            net_status: self
                .status
                .get(scan::NET_STATUS_KEY)
                .unwrap_or_else(|| "unknown".to_string()),
            disk_status: self
                .status
                .get(scan::DISK_STATUS_KEY)
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Stops the managed external processes.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.scan.shutdown().await
    }
}

fn join(values: impl Iterator<Item = impl ToString>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
