//! Parameter and derived-value engine.
//!
//! The engine holds the observation parameters of one bank and, on
//! `prepare()`, evaluates a fixed chain of derived-value computations that
//! turn physical and observational parameters into hardware register values.
//! The chain must run in declared order because later steps consume earlier
//! outputs. Steps 1-7 are pure over engine state; only the publish step in
//! [`crate::backend`] has externally observable effects, so the whole chain
//! is unit-testable without hardware.

use crate::error::{Error, Result};
use crate::switching::SwitchingCycle;
use vela_config::{ModeConfig, Submode};

/// Names of the settable parameters, used in rejection messages.
pub const PARAM_NAMES: &[&str] = &[
    "frequency",
    "rf_frequency",
    "nchan",
    "exposure",
    "scan_length",
    "dm",
    "observer",
    "source",
];

// Legal ranges. The oscillator range matches what the synthesizer can lock
// to; the accumulation length register is 16 bits wide.
const FREQUENCY_RANGE: std::ops::RangeInclusive<f64> = 1e8..=2.56e9;
const RF_FREQUENCY_RANGE: std::ops::RangeInclusive<f64> = 2e8..=1.2e11;
const NCHAN_RANGE: std::ops::RangeInclusive<u32> = 64..=16384;
const EXPOSURE_RANGE: std::ops::RangeInclusive<f64> = 1e-6..=60.0;
const SCAN_LENGTH_RANGE: std::ops::RangeInclusive<f64> = 1e-3..=86400.0;
const MAX_DM: f64 = 1e4;
const ACC_LEN_BITS: u32 = 16;

// Exposure quantization convention carried from the hardware backend: the
// requested integration is extended to the next whole period only when the
// fractional remainder exceeds 1% of the period, otherwise it is truncated.
const EXPOSURE_ROUND_THRESHOLD: f64 = 0.01;

// Data blocks handed to the HPC pipeline are at most 32 MiB.
const MAX_BLOCK_SIZE: usize = 32 * 1024 * 1024;

/// Packet formats emitted by the board.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PacketFormat {
    /// Accumulated spectra in SPEAD frames.
    Spead,
    /// Raw voltage samples for coherent dedispersion.
    Raw,
}

impl std::fmt::Display for PacketFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketFormat::Spead => write!(f, "SPEAD"),
            PacketFormat::Raw => write!(f, "RAW"),
        }
    }
}

/// Polarization recording modes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PolMode {
    /// Full-Stokes accumulated products.
    FullStokes,
    /// Dual-polarization voltages.
    DualVoltage,
}

impl std::fmt::Display for PolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolMode::FullStokes => write!(f, "FULL"),
            PolMode::DualVoltage => write!(f, "DUAL"),
        }
    }
}

/// Parameter engine.
///
/// Parameters are mutated only through [`ParamEngine::set_param`], which
/// validates each value at the point of assignment.
#[derive(Debug, Clone)]
pub struct ParamEngine {
    mode: ModeConfig,
    frequency: f64,
    rf_frequency: f64,
    nchan: u32,
    exposure: f64,
    scan_length: f64,
    dm: f64,
    observer: String,
    source: String,
}

/// Values derived from the parameter set by one `prepare()` run.
///
/// Recomputed in full on every run; nothing is cached across calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    /// Channel count implemented by the hardware channelizer.
    pub hw_nchan: u32,
    /// Spectra accumulated per dump (a power of two).
    pub acc_len: u32,
    /// Value of the accumulation length register, `acc_len - 1`.
    pub acc_len_reg: u32,
    /// Sampler clock in Hz.
    pub sampler_frequency: f64,
    /// Width of one spectral channel in Hz.
    pub chan_bw: f64,
    /// Time-series down-sampling factor.
    pub down_sample: u32,
    /// Spectral decimation factor applied on output.
    pub freq_decimation: u32,
    /// Actual exposure after quantization, in seconds.
    pub exposure: f64,
    /// Switching periods (or exposure granules) per integration.
    pub swper_int: u32,
    /// Duration of one hardware exposure granule in seconds.
    pub hw_exposure: f64,
    /// Packet format emitted by the board.
    pub packet_format: PacketFormat,
    /// Polarization recording mode.
    pub pol_mode: PolMode,
    /// FFT length used by the HPC pipeline (coherent modes only).
    pub fft_len: u32,
    /// Overlap-save overlap in samples (coherent modes only).
    pub overlap: u32,
    /// Data block size handed to the HPC pipeline, in bytes.
    pub block_size: usize,
}

impl ParamEngine {
    /// Creates an engine with the defaults of the given mode.
    pub fn new(mode: ModeConfig) -> ParamEngine {
        ParamEngine {
            frequency: mode.frequency,
            rf_frequency: 1.4e9,
            nchan: mode.nchan,
            exposure: 1.0,
            scan_length: 30.0,
            dm: 0.0,
            observer: String::new(),
            source: String::new(),
            mode,
        }
    }

    /// Replaces the observing mode, resetting mode-supplied defaults.
    pub fn set_mode(&mut self, mode: ModeConfig) {
        self.frequency = mode.frequency;
        self.nchan = mode.nchan;
        self.mode = mode;
    }

    /// Returns the current observing mode configuration.
    pub fn mode(&self) -> &ModeConfig {
        &self.mode
    }

    /// Returns the switching-signal granule period in seconds.
    ///
    /// The granule is a fixed number of device clocks, so its period follows
    /// the sampler frequency of the current parameter set.
    pub fn granule_period(&self) -> f64 {
        f64::from(self.mode.granule_clocks) / self.sampler_frequency()
    }

    /// Returns the requested (unquantized) exposure in seconds.
    pub fn requested_exposure(&self) -> f64 {
        self.exposure
    }

    /// Returns the scan length in seconds.
    pub fn scan_length(&self) -> f64 {
        self.scan_length
    }

    /// Sets one parameter from its textual value.
    ///
    /// Unknown parameter names and out-of-range values are rejected with
    /// [`Error::InvalidParameter`]; the engine state is unchanged on
    /// rejection.
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "frequency" => {
                self.frequency = parse_range(name, value, FREQUENCY_RANGE)?;
            }
            "rf_frequency" => {
                self.rf_frequency = parse_range(name, value, RF_FREQUENCY_RANGE)?;
            }
            "nchan" => {
                let nchan: u32 = value.parse().map_err(|_| {
                    Error::invalid_parameter(name, format!("{value} is not an integer"))
                })?;
                if !NCHAN_RANGE.contains(&nchan) || !nchan.is_power_of_two() {
                    return Err(Error::invalid_parameter(
                        name,
                        format!(
                            "{nchan} is not a power of two in {}..={}",
                            NCHAN_RANGE.start(),
                            NCHAN_RANGE.end()
                        ),
                    ));
                }
                self.nchan = nchan;
            }
            "exposure" => {
                self.exposure = parse_range(name, value, EXPOSURE_RANGE)?;
            }
            "scan_length" => {
                self.scan_length = parse_range(name, value, SCAN_LENGTH_RANGE)?;
            }
            "dm" => {
                self.dm = parse_range(name, value, 0.0..=MAX_DM)?;
            }
            "observer" => {
                self.observer = value.to_string();
            }
            "source" => {
                self.source = value.to_string();
            }
            _ => {
                return Err(Error::invalid_parameter(
                    name,
                    format!("unknown parameter; legal parameters are {PARAM_NAMES:?}"),
                ));
            }
        }
        Ok(())
    }

    fn sampler_frequency(&self) -> f64 {
        self.frequency / self.mode.frequency_divisor
    }

    /// Runs the derived-value chain.
    ///
    /// Pure over engine state and the switching cycle; publication is done
    /// separately by the backend so that a failure here leaves the device
    /// untouched.
    pub fn derive(&self, cycle: &SwitchingCycle) -> Result<Derived> {
        // Step 1: hardware channel count. The coherent-mode channelizer only
        // produces coarse channels; it tops out at 512.
        let hw_nchan = match self.mode.submode {
            Submode::Hbw | Submode::Lbw => self.nchan,
            Submode::Coherent => self.nchan.min(512),
        };

        // Step 2: accumulation length. One spectrum spans 2*nchan samples,
        // so the dump rate per requested integration follows directly from
        // the oscillator frequency and channel count. The register holds
        // 2^k - 1 for k in 0..=16.
        let spectrum_rate = self.frequency / self.mode.frequency_divisor / (2.0 * hw_nchan as f64);
        let acc_exact = self.exposure * spectrum_rate;
        if acc_exact < 0.5 {
            return Err(Error::Configuration(format!(
                "accumulation length {acc_exact:.3} below one spectrum; \
                 increase integration time or bandwidth"
            )));
        }
        let k = acc_exact.log2().round() as u32;
        if k > ACC_LEN_BITS {
            return Err(Error::Configuration(format!(
                "accumulation length 2^{k} exceeds the {ACC_LEN_BITS}-bit register; \
                 reduce integration time or bandwidth"
            )));
        }
        let acc_len = 1u32 << k;

        // Step 3: sampler clock.
        let sampler_frequency = self.sampler_frequency();

        // Step 4: channel bandwidth.
        let chan_bw = sampler_frequency / (2.0 * hw_nchan as f64);

        // Step 5: decimation factors.
        let (down_sample, freq_decimation) = match self.mode.submode {
            Submode::Hbw => (1, 1),
            Submode::Lbw => (2, 2),
            Submode::Coherent => (1, 1),
        };

        // Step 6: exposure quantization.
        let hw_exposure = acc_len as f64 * 2.0 * hw_nchan as f64 / sampler_frequency;
        let quantum = if cycle.num_phases() > 1 {
            cycle.total_duration_secs()
        } else {
            hw_exposure
        };
        let swper_int = quantize_exposure(self.exposure, quantum);
        let exposure = swper_int as f64 * quantum;

        // Step 7: packet format, polarization mode, and block sizing.
        let (packet_format, pol_mode) = match self.mode.submode {
            Submode::Hbw | Submode::Lbw => (PacketFormat::Spead, PolMode::FullStokes),
            Submode::Coherent => (PacketFormat::Raw, PolMode::DualVoltage),
        };
        let (fft_len, overlap) = match self.mode.submode {
            Submode::Coherent => self.fft_sizing(chan_bw)?,
            _ => (0, 0),
        };
        let block_size = match self.mode.submode {
            Submode::Coherent => {
                // dual-pol complex 8-bit samples; blocks hold whole FFTs
                let fft_bytes = fft_len as usize * 4;
                (MAX_BLOCK_SIZE / fft_bytes) * fft_bytes
            }
            _ => {
                // full-Stokes u32 accumulators; blocks hold whole spectra
                let spectrum_bytes = hw_nchan as usize * 4 * 4 / freq_decimation as usize;
                (MAX_BLOCK_SIZE / spectrum_bytes).min(1024) * spectrum_bytes
            }
        };

        Ok(Derived {
            hw_nchan,
            acc_len,
            acc_len_reg: acc_len - 1,
            sampler_frequency,
            chan_bw,
            down_sample,
            freq_decimation,
            exposure,
            swper_int,
            hw_exposure,
            packet_format,
            pol_mode,
            fft_len,
            overlap,
            block_size,
        })
    }

    // Overlap-save sizing for coherent dedispersion: the overlap covers the
    // dispersion smearing across one channel at the sky frequency, and the
    // FFT length doubles from the mode baseline until it exceeds twice the
    // overlap.
    fn fft_sizing(&self, chan_bw: f64) -> Result<(u32, u32)> {
        let f_mhz = self.rf_frequency / 1e6;
        let chan_bw_mhz = chan_bw / 1e6;
        let smear_secs = 8.3e3 * self.dm * chan_bw_mhz / f_mhz.powi(3);
        let overlap_samples = (smear_secs * chan_bw).ceil() as u64;
        let overlap = overlap_samples.max(1).next_power_of_two();
        let overlap = u32::try_from(overlap).map_err(|_| {
            Error::Configuration(format!("dedispersion overlap {overlap} too large"))
        })?;
        let mut fft_len = self.mode.fft_baseline;
        while fft_len <= 2 * overlap {
            fft_len = fft_len.checked_mul(2).ok_or_else(|| {
                Error::Configuration(format!(
                    "no realizable FFT length for dm {} at {} MHz",
                    self.dm, f_mhz
                ))
            })?;
        }
        Ok((fft_len, overlap))
    }

    /// Returns the pass-through parameters published with the derived set.
    pub fn pass_through(&self) -> Vec<(&'static str, String)> {
        vec![
            ("OBSERVER", self.observer.clone()),
            ("SRC_NAME", self.source.clone()),
            ("OBSFREQ", format!("{}", self.rf_frequency)),
            ("DM", format!("{}", self.dm)),
            ("SCANLEN", format!("{}", self.scan_length)),
            ("SUBMODE", self.mode.submode.to_string()),
        ]
    }
}

// Number of whole quantization periods covering the requested exposure.
// Rounds up only when the remainder exceeds 1% of the period.
fn quantize_exposure(requested: f64, quantum: f64) -> u32 {
    let periods = requested / quantum;
    let whole = periods.floor();
    let n = if periods - whole > EXPOSURE_ROUND_THRESHOLD {
        whole + 1.0
    } else {
        whole
    };
    (n as u32).max(1)
}

fn parse_range(name: &str, value: &str, range: std::ops::RangeInclusive<f64>) -> Result<f64> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| Error::invalid_parameter(name, format!("{value} is not a number")))?;
    if !range.contains(&parsed) {
        return Err(Error::invalid_parameter(
            name,
            format!(
                "{parsed} is outside the legal range {}..={}",
                range.start(),
                range.end()
            ),
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::switching::Phase;

    // BANKA/MODE1-style fixture: 1.44 GHz oscillator, 1024 channels.
    pub(crate) fn mode1() -> ModeConfig {
        ModeConfig {
            bitstream: "vela_hbw_1024.bof".to_string(),
            submode: Submode::Hbw,
            frequency: 1.44e9,
            frequency_divisor: 1.0,
            granule_clocks: 1440,
            nchan: 1024,
            arm_delay_secs: 2,
            fft_baseline: 16384,
            reset_phase: vec![],
            arm_phase: vec![],
            postarm_phase: vec![],
            extra_status: Default::default(),
        }
    }

    fn cycle_100ms(engine: &ParamEngine) -> SwitchingCycle {
        // two-phase cal cycle totalling 0.1 s
        let mut cycle = SwitchingCycle::new(engine.granule_period());
        let granules = (0.05 / engine.granule_period()).round() as u32;
        for cal in [true, false] {
            cycle.add_phase(Phase {
                duration: granules,
                blanking: false,
                cal,
                sig_ref_1: false,
                sig_ref_2: false,
                adv_sig_ref: false,
            })
            .unwrap();
        }
        cycle
    }

    #[test]
    fn mode1_fixture_values() {
        let mut engine = ParamEngine::new(mode1());
        engine.set_param("exposure", "0.1").unwrap();
        let cycle = cycle_100ms(&engine);
        assert!((cycle.total_duration_secs() - 0.1).abs() < 1e-9);
        let derived = engine.derive(&cycle).unwrap();
        assert_eq!(derived.chan_bw, 1.44e9 / 1024.0 / 2.0);
        assert_eq!(derived.swper_int, 1);
        assert!((derived.exposure - 0.1).abs() < 1e-9);
        assert_eq!(derived.hw_nchan, 1024);
        assert_eq!(derived.packet_format, PacketFormat::Spead);
    }

    #[test]
    fn acc_len_is_power_of_two_minus_one() {
        let mut engine = ParamEngine::new(mode1());
        engine.set_param("exposure", "0.1").unwrap();
        let cycle = cycle_100ms(&engine);
        let derived = engine.derive(&cycle).unwrap();
        // 0.1 s * 703125 spectra/s = 70312.5, rounds to 2^16
        assert_eq!(derived.acc_len, 65536);
        assert_eq!(derived.acc_len_reg, 65535);
    }

    #[test]
    fn acc_len_overflow_is_a_configuration_error() {
        let mut engine = ParamEngine::new(mode1());
        engine.set_param("exposure", "0.2").unwrap();
        let cycle = cycle_100ms(&engine);
        assert!(matches!(
            engine.derive(&cycle),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn acc_len_underflow_is_a_configuration_error() {
        let mut engine = ParamEngine::new(mode1());
        // 100 MHz over 16384 channels gives 3052 spectra/s; 0.1 ms of
        // integration covers less than one spectrum
        engine.set_param("frequency", "1e8").unwrap();
        engine.set_param("nchan", "16384").unwrap();
        engine.set_param("exposure", "1e-4").unwrap();
        let cycle = SwitchingCycle::new(engine.granule_period());
        assert!(matches!(
            engine.derive(&cycle),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn exposure_rounding_threshold() {
        // remainder of 5% of the period rounds up
        assert_eq!(quantize_exposure(0.105, 0.1), 2);
        // remainder below 1% of the period truncates
        assert_eq!(quantize_exposure(0.1005, 0.1), 1);
        // exact multiple stays exact
        assert_eq!(quantize_exposure(0.3, 0.1), 3);
        // an exposure shorter than one period still covers one period
        assert_eq!(quantize_exposure(0.01, 0.1), 1);
    }

    #[test]
    fn lbw_decimation_factors() {
        let mut mode = mode1();
        mode.submode = Submode::Lbw;
        let mut engine = ParamEngine::new(mode);
        engine.set_param("exposure", "0.05").unwrap();
        let cycle = SwitchingCycle::new(engine.granule_period());
        let derived = engine.derive(&cycle).unwrap();
        assert_eq!(derived.down_sample, 2);
        assert_eq!(derived.freq_decimation, 2);
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut engine = ParamEngine::new(mode1());
        let err = engine.set_param("bogus", "1").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("frequency"));
    }

    #[test]
    fn nchan_must_be_a_power_of_two() {
        let mut engine = ParamEngine::new(mode1());
        assert!(engine.set_param("nchan", "1000").is_err());
        assert!(engine.set_param("nchan", "32768").is_err());
        engine.set_param("nchan", "2048").unwrap();
    }

    #[test]
    fn rejected_value_leaves_state_unchanged() {
        let mut engine = ParamEngine::new(mode1());
        engine.set_param("frequency", "1.44e9").unwrap();
        assert!(engine.set_param("frequency", "5e9").is_err());
        assert_eq!(engine.sampler_frequency(), 1.44e9);
    }

    #[test]
    fn coherent_fft_sizing_doubles_past_overlap() {
        let mut mode = mode1();
        mode.submode = Submode::Coherent;
        mode.nchan = 512;
        let mut engine = ParamEngine::new(mode);
        engine.set_param("exposure", "0.01").unwrap();
        engine.set_param("dm", "100").unwrap();
        engine.set_param("rf_frequency", "1.4e9").unwrap();
        let cycle = SwitchingCycle::new(engine.granule_period());
        let derived = engine.derive(&cycle).unwrap();
        assert!(derived.fft_len > 2 * derived.overlap);
        assert!(derived.overlap.is_power_of_two());
        assert!(derived.fft_len >= 16384);
        assert_eq!(derived.pol_mode, PolMode::DualVoltage);
        assert_eq!(derived.packet_format, PacketFormat::Raw);
        // blocks hold whole FFTs
        assert_eq!(derived.block_size % (derived.fft_len as usize * 4), 0);
    }

    #[test]
    fn zero_dm_still_sizes_an_fft() {
        let mut mode = mode1();
        mode.submode = Submode::Coherent;
        let mut engine = ParamEngine::new(mode);
        engine.set_param("exposure", "0.01").unwrap();
        let cycle = SwitchingCycle::new(engine.granule_period());
        let derived = engine.derive(&cycle).unwrap();
        assert_eq!(derived.fft_len, 16384);
    }
}
