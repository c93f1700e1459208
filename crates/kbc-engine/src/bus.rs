//! Hardware seam.
//!
//! All port I/O the engine performs goes through [`PortIo`], so the same
//! engine drives real hardware (an implementation doing raw `in`/`out` on
//! ports 0x60/0x64 lives with the platform glue, not here) and simulated
//! controllers in tests.

/// Raw register access to an 8042-style controller.
///
/// `read_status` and `read_data` are also called from the interrupt entry
/// path, so implementations must not block.
pub trait PortIo: Send {
    /// Read the status register (port 0x64).
    fn read_status(&mut self) -> u8;
    /// Read the output buffer (port 0x60). Only valid while the status
    /// register reports `OUTPUT_FULL`.
    fn read_data(&mut self) -> u8;
    /// Write a byte to the data port (port 0x60).
    fn write_data(&mut self, byte: u8);
    /// Write a controller command opcode (port 0x64).
    fn write_command(&mut self, byte: u8);
}
