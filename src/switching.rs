//! Switching-signal encoder.
//!
//! The backend drives a synchronous switching signal that cycles the
//! receiver through blanking, calibration, and signal/reference states in
//! lockstep with data capture. The cycle is described as an ordered list of
//! phases with durations in hardware granules, and is uploaded to the device
//! as a lookup table of packed control words. This module builds that table
//! and derives the GBT-convention phase-boundary metadata published to the
//! status store.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

// Flag bit positions in a lookup-table word. The duration occupies the
// remaining high bits.
const BIT_BLANKING: u32 = 0;
const BIT_CAL: u32 = 1;
const BIT_SIG_REF_1: u32 = 2;
const BIT_SIG_REF_2: u32 = 3;
const BIT_ADV_SIG_REF: u32 = 4;
const FLAG_BITS: u32 = 5;

/// Largest phase duration in granules that fits a lookup-table word next to
/// the flag bits.
pub const MAX_PHASE_DURATION: u32 = (1 << (32 - FLAG_BITS)) - 1;

// Hardware convention: the cal and sig/ref-1 lines are active-low on the
// board, so their sense is inverted in the uploaded word. Re-derive this
// mask when retargeting a different register map.
const POLARITY_MASK: u32 = (1 << BIT_CAL) | (1 << BIT_SIG_REF_1);

/// One phase of the switching cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Phase {
    /// Phase duration in hardware granules.
    pub duration: u32,
    /// Whether data is blanked during this phase.
    pub blanking: bool,
    /// Whether the cal diode is on during this phase.
    pub cal: bool,
    /// Signal/reference select 1.
    pub sig_ref_1: bool,
    /// Signal/reference select 2.
    pub sig_ref_2: bool,
    /// Advanced signal/reference select.
    pub adv_sig_ref: bool,
}

impl Phase {
    // Flag combination that defines a GBT phase. Blanking is excluded:
    // blanked granules belong to the boundary they precede.
    fn gbt_state(&self) -> (bool, bool, bool, bool) {
        (self.cal, self.sig_ref_1, self.sig_ref_2, self.adv_sig_ref)
    }

    fn word(&self) -> u32 {
        let flags = (u32::from(self.blanking) << BIT_BLANKING)
            | (u32::from(self.cal) << BIT_CAL)
            | (u32::from(self.sig_ref_1) << BIT_SIG_REF_1)
            | (u32::from(self.sig_ref_2) << BIT_SIG_REF_2)
            | (u32::from(self.adv_sig_ref) << BIT_ADV_SIG_REF);
        (self.duration << FLAG_BITS) | (flags ^ POLARITY_MASK)
    }
}

/// One GBT phase boundary.
///
/// A GBT phase is a maximal run of switching phases that share the same
/// non-blanking flag combination. Each boundary records where in the cycle
/// the run starts and the receiver state there.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PhaseBoundary {
    /// Start of the run as a fraction of the full cycle, in `[0, 1)`.
    pub start_fraction: f64,
    /// Cal diode state at the boundary.
    pub cal: bool,
    /// Signal/reference select 1 at the boundary.
    pub sig_ref_1: bool,
    /// Signal/reference select 2 at the boundary.
    pub sig_ref_2: bool,
    /// Advanced signal/reference select at the boundary.
    pub adv_sig_ref: bool,
    /// Total blanked time within the run, in seconds.
    pub blanking_secs: f64,
}

/// Sources that can drive a switching line.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum SwitchSource {
    /// Driven by the board's own switching-signal generator.
    #[default]
    Internal,
    /// Driven by the site-wide external switching signal.
    External,
    /// Held at a fixed manual level.
    Manual,
}

impl SwitchSource {
    fn bits(self) -> u32 {
        match self {
            SwitchSource::Internal => 0b00,
            SwitchSource::External => 0b01,
            SwitchSource::Manual => 0b10,
        }
    }
}

/// Driver selection for each switching line.
///
/// The key space is small and fully known, so the selection is an explicit
/// struct with one named field per line rather than a nested lookup table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SourceSelect {
    /// Driver of the cal line.
    pub cal: SwitchSource,
    /// Driver of the sig/ref-1 line.
    pub sig_ref_1: SwitchSource,
    /// Driver of the blanking line.
    pub blanking: SwitchSource,
}

impl SourceSelect {
    /// Encodes the selection as the source-select register word, two bits
    /// per line.
    pub fn register_word(&self) -> u32 {
        self.cal.bits() | (self.sig_ref_1.bits() << 2) | (self.blanking.bits() << 4)
    }
}

/// Switching cycle.
///
/// An ordered, cyclic sequence of [`Phase`]s. The granule period is fixed
/// per backend configuration (it is derived from the device clock) and is
/// supplied at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchingCycle {
    granule_period: f64,
    phases: Vec<Phase>,
}

impl SwitchingCycle {
    /// Creates an empty cycle with the given granule period in seconds.
    pub fn new(granule_period: f64) -> SwitchingCycle {
        SwitchingCycle {
            granule_period,
            phases: Vec::new(),
        }
    }

    /// Removes all phases.
    pub fn clear(&mut self) {
        self.phases.clear();
    }

    /// Appends one phase to the cycle.
    ///
    /// The duration must fit the lookup-table word next to the flag bits;
    /// longer phases are rejected so the encoder never truncates.
    pub fn add_phase(&mut self, phase: Phase) -> Result<()> {
        if phase.duration > MAX_PHASE_DURATION {
            return Err(Error::invalid_parameter(
                "phase",
                format!(
                    "duration {} granules exceeds the maximum of {MAX_PHASE_DURATION}",
                    phase.duration
                ),
            ));
        }
        self.phases.push(phase);
        Ok(())
    }

    /// Returns the number of phases in the cycle.
    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    /// Returns the granule period in seconds.
    pub fn granule_period(&self) -> f64 {
        self.granule_period
    }

    /// Returns the total cycle duration in granules.
    ///
    /// This raw granule sum is written directly to the cycle-length register.
    pub fn total_duration_granules(&self) -> u64 {
        self.phases.iter().map(|p| u64::from(p.duration)).sum()
    }

    /// Returns the total cycle duration in seconds.
    ///
    /// A cycle with fewer than two phases has no meaningful period; by
    /// convention this returns 1 in that case, so that exposure
    /// quantization against the "cycle period" stays well defined.
    pub fn total_duration_secs(&self) -> f64 {
        if self.phases.len() < 2 {
            return 1.0;
        }
        self.total_duration_granules() as f64 * self.granule_period
    }

    /// Builds the packed lookup table uploaded to the device.
    ///
    /// One big-endian `u32` word per phase: the duration in the high bits
    /// and the flag bits (with the hardware polarity applied) in the low
    /// five bits.
    pub fn lookup_table(&self) -> Result<Bytes> {
        if self.phases.is_empty() {
            return Err(Error::Configuration(
                "switching cycle has no phases".to_string(),
            ));
        }
        let mut table = BytesMut::with_capacity(self.phases.len() * 4);
        for phase in &self.phases {
            table.put_u32(phase.word());
        }
        Ok(table.freeze())
    }

    /// Computes the GBT phase boundaries of the cycle.
    ///
    /// Walks the phases in order, starting a new boundary whenever the
    /// non-blanking flag combination changes, and reports each boundary's
    /// start as a fraction of the total cycle duration.
    pub fn phase_boundaries(&self) -> Result<Vec<PhaseBoundary>> {
        if self.phases.is_empty() {
            return Err(Error::Configuration(
                "switching cycle has no phases".to_string(),
            ));
        }
        let total = self.total_duration_granules() as f64;
        let mut boundaries: Vec<PhaseBoundary> = Vec::new();
        let mut elapsed = 0u64;
        let mut previous = None;
        for phase in &self.phases {
            let state = phase.gbt_state();
            if previous != Some(state) {
                boundaries.push(PhaseBoundary {
                    start_fraction: elapsed as f64 / total,
                    cal: phase.cal,
                    sig_ref_1: phase.sig_ref_1,
                    sig_ref_2: phase.sig_ref_2,
                    adv_sig_ref: phase.adv_sig_ref,
                    blanking_secs: 0.0,
                });
                previous = Some(state);
            }
            if phase.blanking {
                let boundary = boundaries.last_mut().unwrap();
                boundary.blanking_secs += f64::from(phase.duration) * self.granule_period;
            }
            elapsed += u64::from(phase.duration);
        }
        Ok(boundaries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn phase(duration: u32, blanking: bool, cal: bool, sig_ref_1: bool) -> Phase {
        Phase {
            duration,
            blanking,
            cal,
            sig_ref_1,
            sig_ref_2: false,
            adv_sig_ref: false,
        }
    }

    #[test]
    fn lookup_table_round_trip() {
        let mut cycle = SwitchingCycle::new(1e-3);
        let phases = [
            phase(10, true, true, false),
            phase(90, false, true, false),
            phase(10, true, false, true),
            phase(90, false, false, true),
        ];
        for p in phases {
            cycle.add_phase(p).unwrap();
        }
        assert_eq!(cycle.total_duration_granules(), 200);
        let table = cycle.lookup_table().unwrap();
        assert_eq!(table.len(), phases.len() * 4);
        for (chunk, p) in table.chunks(4).zip(phases.iter()) {
            let word = u32::from_be_bytes(chunk.try_into().unwrap());
            assert_eq!(word >> FLAG_BITS, p.duration);
            let flags = (word & ((1 << FLAG_BITS) - 1)) ^ POLARITY_MASK;
            assert_eq!(flags & (1 << BIT_BLANKING) != 0, p.blanking);
            assert_eq!(flags & (1 << BIT_CAL) != 0, p.cal);
            assert_eq!(flags & (1 << BIT_SIG_REF_1) != 0, p.sig_ref_1);
            assert_eq!(flags & (1 << BIT_SIG_REF_2) != 0, p.sig_ref_2);
            assert_eq!(flags & (1 << BIT_ADV_SIG_REF) != 0, p.adv_sig_ref);
        }
    }

    #[test]
    fn single_phase_duration_convention() {
        let mut cycle = SwitchingCycle::new(1e-3);
        cycle.add_phase(phase(12345, false, false, false)).unwrap();
        assert_eq!(cycle.total_duration_secs(), 1.0);
        // with two phases the real period is reported
        cycle.add_phase(phase(655, false, true, false)).unwrap();
        assert_eq!(cycle.total_duration_secs(), 13.0);
    }

    #[test]
    fn boundary_detection_merges_equal_states() {
        let mut cycle = SwitchingCycle::new(1e-3);
        cycle.add_phase(phase(10, false, true, true)).unwrap();
        cycle.add_phase(phase(10, false, true, true)).unwrap();
        cycle.add_phase(phase(5, false, false, true)).unwrap();
        let boundaries = cycle.phase_boundaries().unwrap();
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].start_fraction, 0.0);
        assert!(boundaries[0].cal);
        assert_eq!(boundaries[1].start_fraction, 0.8);
        assert!(!boundaries[1].cal);
        assert!(boundaries[1].sig_ref_1);
    }

    #[test]
    fn boundary_blanking_accumulates_within_run() {
        let mut cycle = SwitchingCycle::new(1e-3);
        cycle.add_phase(phase(10, true, true, false)).unwrap();
        cycle.add_phase(phase(90, false, true, false)).unwrap();
        cycle.add_phase(phase(10, true, false, false)).unwrap();
        cycle.add_phase(phase(90, false, false, false)).unwrap();
        let boundaries = cycle.phase_boundaries().unwrap();
        assert_eq!(boundaries.len(), 2);
        assert!((boundaries[0].blanking_secs - 10e-3).abs() < 1e-12);
        assert!((boundaries[1].blanking_secs - 10e-3).abs() < 1e-12);
        assert_eq!(boundaries[1].start_fraction, 0.5);
    }

    #[test]
    fn source_select_encoding() {
        assert_eq!(SourceSelect::default().register_word(), 0);
        let select = SourceSelect {
            cal: SwitchSource::Manual,
            sig_ref_1: SwitchSource::External,
            blanking: SwitchSource::Internal,
        };
        assert_eq!(select.register_word(), 0b00_01_10);
    }

    #[test]
    fn oversized_phase_duration_is_rejected() {
        let mut cycle = SwitchingCycle::new(1e-3);
        cycle.add_phase(phase(MAX_PHASE_DURATION, false, false, false)).unwrap();
        let err = cycle
            .add_phase(phase(MAX_PHASE_DURATION + 1, false, true, false))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
        assert_eq!(cycle.num_phases(), 1);
        // the accepted maximum encodes without truncation
        let table = cycle.lookup_table().unwrap();
        let word = u32::from_be_bytes(table[..4].try_into().unwrap());
        assert_eq!(word >> FLAG_BITS, MAX_PHASE_DURATION);
    }

    #[test]
    fn empty_cycle_fails_fast() {
        let cycle = SwitchingCycle::new(1e-3);
        assert!(cycle.lookup_table().is_err());
        assert!(cycle.phase_boundaries().is_err());
    }
}
