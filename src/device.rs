//! Digitizer device interface.
//!
//! This module defines the seam between the backend core and the FPGA
//! digitizer/correlator board. The board is opaque to the core: it exposes
//! named registers, named buffers, bitstream programming, and data network
//! bring-up. A simulated implementation backed by an in-memory register map
//! is provided for tests and for running the daemon with no hardware
//! attached.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Digitizer board interface.
///
/// All operations are synchronous register-level accesses; a failed or
/// non-acknowledged operation is reported as [`Error::Device`] and is fatal
/// for the `prepare()` or `start()` call that issued it.
pub trait Digitizer: Send + Sync {
    /// Writes a named 32-bit register.
    fn write_register(&self, name: &str, value: u32) -> Result<()>;

    /// Reads a named 32-bit register.
    fn read_register(&self, name: &str) -> Result<u32>;

    /// Programs the FPGA with the named bitstream.
    fn program(&self, bitstream: &str) -> Result<()>;

    /// Writes bytes to a named device buffer.
    fn write_buffer(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Reads `nbytes` from a named device buffer.
    fn read_buffer(&self, name: &str, nbytes: usize) -> Result<Vec<u8>>;

    /// Brings up the board's data network interface.
    fn configure_network(&self, mac: &str, ip: &str, port: u16) -> Result<()>;
}

/// Simulated digitizer.
///
/// Keeps registers and buffers in memory and accepts every operation. Used
/// by the daemon's `--simulate` mode and by the unit tests, which inspect
/// the register map to check what the core published.
#[derive(Debug, Default)]
pub struct SimDigitizer {
    state: Mutex<SimState>,
}

#[derive(Debug, Default)]
struct SimState {
    registers: HashMap<String, u32>,
    buffers: HashMap<String, Vec<u8>>,
    bitstream: Option<String>,
}

impl SimDigitizer {
    /// Creates a simulated digitizer with empty registers and buffers.
    pub fn new() -> SimDigitizer {
        SimDigitizer::default()
    }

    /// Returns the last value written to a register, if any.
    pub fn register(&self, name: &str) -> Option<u32> {
        self.state.lock().unwrap().registers.get(name).copied()
    }

    /// Returns a copy of a named buffer, if it has been written.
    pub fn buffer(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().buffers.get(name).cloned()
    }

    /// Returns the currently programmed bitstream name, if any.
    pub fn bitstream(&self) -> Option<String> {
        self.state.lock().unwrap().bitstream.clone()
    }
}

impl Digitizer for SimDigitizer {
    fn write_register(&self, name: &str, value: u32) -> Result<()> {
        tracing::debug!(register = name, value, "sim register write");
        self.state
            .lock()
            .unwrap()
            .registers
            .insert(name.to_string(), value);
        Ok(())
    }

    fn read_register(&self, name: &str) -> Result<u32> {
        self.state
            .lock()
            .unwrap()
            .registers
            .get(name)
            .copied()
            .ok_or_else(|| Error::Device(format!("register {name} has not been written")))
    }

    fn program(&self, bitstream: &str) -> Result<()> {
        tracing::info!(bitstream, "sim programming bitstream");
        let mut state = self.state.lock().unwrap();
        state.bitstream = Some(bitstream.to_string());
        // a new bitstream starts from power-on register state
        state.registers.clear();
        state.buffers.clear();
        Ok(())
    }

    fn write_buffer(&self, name: &str, data: &[u8]) -> Result<()> {
        tracing::debug!(buffer = name, nbytes = data.len(), "sim buffer write");
        self.state
            .lock()
            .unwrap()
            .buffers
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn read_buffer(&self, name: &str, nbytes: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let buffer = state
            .buffers
            .get(name)
            .ok_or_else(|| Error::Device(format!("buffer {name} has not been written")))?;
        Ok(buffer.iter().copied().take(nbytes).collect())
    }

    fn configure_network(&self, mac: &str, ip: &str, port: u16) -> Result<()> {
        tracing::info!(mac, ip, port, "sim data network bring-up");
        Ok(())
    }
}
