//! velad is the control daemon for a Vela spectrometer bank. It configures
//! an FPGA digitizer/correlator board from observation parameters, encodes
//! the synchronous cal/sig-ref switching signal, and arms data-taking scans
//! on a PPS boundary while coordinating the external HPC pipeline and FITS
//! writer processes through their command channels and the shared status
//! store.

#![warn(missing_docs)]

pub mod app;
pub mod args;
pub mod backend;
pub mod device;
pub mod error;
pub mod params;
pub mod process;
pub mod scan;
pub mod status;
pub mod switching;
