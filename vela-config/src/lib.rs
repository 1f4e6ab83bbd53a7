//! vela-config contains the configuration schemas shared by the velad daemon
//! and its remote-control clients.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level backend configuration.
///
/// This is the root of the configuration file loaded by the daemon. It holds
/// one [`ModeConfig`] per observing mode, the per-bank settings, and the name
/// of the mode selected at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Observing modes, keyed by mode name (for example `MODE1`).
    pub modes: HashMap<String, ModeConfig>,
    /// Settings of the bank controlled by this daemon instance.
    pub bank: BankConfig,
    /// Mode selected when the daemon starts.
    pub default_mode: String,
}

/// Per-observing-mode configuration.
///
/// Each observing mode selects an FPGA bitstream and the constants that the
/// parameter engine needs to derive register values for that bitstream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModeConfig {
    /// FPGA bitstream programmed when the mode is selected.
    pub bitstream: String,
    /// Observing submode family implemented by the bitstream.
    pub submode: Submode,
    /// Default tunable-oscillator frequency in Hz.
    pub frequency: f64,
    /// Fixed divisor relating the oscillator frequency to the sampler clock.
    pub frequency_divisor: f64,
    /// Device clocks per switching-signal granule.
    ///
    /// The switching-signal granule period is this value divided by the
    /// sampler frequency.
    pub granule_clocks: u32,
    /// Default number of spectral channels.
    pub nchan: u32,
    /// Seconds of lead time the hardware needs between a start request and
    /// the PPS edge it arms on.
    pub arm_delay_secs: u32,
    /// Baseline FFT length for the coherent-dedispersion sizing search.
    pub fft_baseline: u32,
    /// Register commands issued to reset the device when the mode is set.
    pub reset_phase: Vec<RegisterCommand>,
    /// Register commands issued to arm the device at scan start.
    pub arm_phase: Vec<RegisterCommand>,
    /// Register commands issued right after arming.
    pub postarm_phase: Vec<RegisterCommand>,
    /// Extra key/value pairs published verbatim to the status store.
    #[serde(default)]
    pub extra_status: HashMap<String, String>,
}

/// One command of a device command phase.
///
/// A phase is an ordered list of commands. The keyword `wait` sleeps for the
/// number of seconds in `value`; any other name is a register write of the
/// parsed `value`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisterCommand {
    /// Register name, or the keyword `wait`.
    pub register: String,
    /// Parameter string: a `u32` register value, or seconds for `wait`.
    pub value: String,
}

/// Per-bank configuration.
///
/// A bank is one digitizer board together with the HPC pipeline and FITS
/// writer processes that consume its data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BankConfig {
    /// Bank name (for example `BANKA`).
    pub name: String,
    /// HPC pipeline executable.
    pub hpc_program: String,
    /// Arguments passed to the HPC pipeline executable.
    #[serde(default)]
    pub hpc_args: Vec<String>,
    /// Named pipe on which the HPC pipeline listens for commands.
    pub hpc_fifo: String,
    /// FITS writer executable, if this bank records FITS output.
    pub fits_program: Option<String>,
    /// Arguments passed to the FITS writer executable.
    #[serde(default)]
    pub fits_args: Vec<String>,
    /// MAC address of the board's data network interface.
    pub data_mac: String,
    /// IP address of the board's data network interface.
    pub data_ip: String,
    /// UDP port the board sends data packets to.
    pub data_port: u16,
}

/// Observing submode families.
///
/// The submode selects the channelization and recording strategy of the
/// bitstream and drives the derived-value chain of the parameter engine.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Submode {
    /// Wideband spectral-line mode: full-rate sampling, direct channelizer.
    Hbw,
    /// Narrowband spectral-line mode: decimated sampling ahead of the
    /// channelizer.
    Lbw,
    /// Coherent-dedispersion pulsar mode: raw voltages shipped to the HPC
    /// pipeline, which dedisperses with overlap-save FFTs.
    Coherent,
}

/// Scan status report.
///
/// Returned by the daemon's `status` command and mirrored in the status
/// store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanStatus {
    /// Whether a scan is currently running.
    pub running: bool,
    /// Scan start time in RFC 3339 format, if a scan is running.
    pub start_time: Option<String>,
    /// Network receive status reported by the HPC pipeline.
    pub net_status: String,
    /// Disk status reported by the FITS writer.
    pub disk_status: String,
}

macro_rules! impl_str_conv {
    ($ty:ty, $($s:expr => $v:ident),*) => {
        impl std::str::FromStr for $ty {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                Ok(match s {
                    $($s => <$ty>::$v,)*
                    _ => return Err(()),
                })
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, "{}", match self {
                    $(<$ty>::$v => $s,)*
                })
            }
        }
    }
}

impl_str_conv!(
    Submode,
    "hbw" => Hbw,
    "lbw" => Lbw,
    "coherent" => Coherent
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn submode_str_conv() {
        assert_eq!("lbw".parse::<Submode>(), Ok(Submode::Lbw));
        assert_eq!(Submode::Coherent.to_string(), "coherent");
        assert!("spectral".parse::<Submode>().is_err());
    }

    #[test]
    fn mode_config_json() {
        let json = r#"{
            "bitstream": "vela_hbw_1024.bof",
            "submode": "Hbw",
            "frequency": 1.44e9,
            "frequency_divisor": 1.0,
            "granule_clocks": 1440,
            "nchan": 1024,
            "arm_delay_secs": 2,
            "fft_baseline": 16384,
            "reset_phase": [{"register": "reset", "value": "1"}],
            "arm_phase": [
                {"register": "arm", "value": "0"},
                {"register": "arm", "value": "1"}
            ],
            "postarm_phase": []
        }"#;
        let mode: ModeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(mode.submode, Submode::Hbw);
        assert_eq!(mode.arm_phase.len(), 2);
        assert!(mode.extra_status.is_empty());
    }
}
