#![forbid(unsafe_code)]

//! Fixed register layout of the 8042-style keyboard/mouse controller.
//!
//! This crate exists so the transaction engine (`kbc-engine`) and any platform
//! glue that wires the controller's ports and IRQ lines agree on values that
//! must match exactly at runtime: port addresses, status-register bits, the
//! command/configuration byte layout, controller command opcodes and the byte
//! sentinels devices reply with.

use bitflags::bitflags;

/// I/O port for reading/writing device data and controller command parameters.
pub const DATA_PORT: u16 = 0x60;

/// I/O port that reads the status register and writes controller commands.
pub const COMMAND_PORT: u16 = 0x64;

bitflags! {
    /// Status register, read from [`COMMAND_PORT`].
    ///
    /// When the auxiliary multiplexer is active, bits 6..7 are repurposed as
    /// the sub-port index of the byte currently in the output buffer (see
    /// [`mux_sub_port`]); otherwise they report timeout/parity errors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// A byte is waiting in the output buffer.
        const OUTPUT_FULL = 0x01;
        /// The input buffer is still holding a byte the controller has not
        /// consumed; writes must wait for this bit to clear.
        const INPUT_FULL = 0x02;
        /// Self-test completed ("system" flag).
        const SYSTEM = 0x04;
        /// Last write went to the command port rather than the data port.
        const COMMAND = 0x08;
        /// The byte in the output buffer came from the auxiliary channel.
        const AUX_OUTPUT_FULL = 0x20;
        const TIMEOUT_ERROR = 0x40;
        const PARITY_ERROR = 0x80;
    }
}

bitflags! {
    /// The command/configuration byte (controller RAM byte 0).
    ///
    /// This single register is shared by every driver on the bus: interrupt
    /// enables and clock gates for both channels live here, so mutations must
    /// always be read-modify-write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandByte: u8 {
        /// Raise IRQ1 when primary-channel data fills the output buffer.
        const PRIMARY_INTERRUPT = 0x01;
        /// Raise IRQ12 when auxiliary-channel data fills the output buffer.
        const AUX_INTERRUPT = 0x02;
        /// Self-test passed; mirrors [`Status::SYSTEM`].
        const SYSTEM = 0x04;
        /// Hold the primary device's clock line low (inhibit the device).
        const DISABLE_PRIMARY_CLOCK = 0x10;
        /// Hold the auxiliary device's clock line low.
        const DISABLE_AUX_CLOCK = 0x20;
        /// Translate scan codes to set 1 on the primary channel.
        const TRANSLATE = 0x40;
    }
}

/// Controller command opcodes, written to [`COMMAND_PORT`].
pub mod cmd {
    /// Read the command byte; the value appears in the output buffer.
    pub const READ_COMMAND_BYTE: u8 = 0x20;
    /// Write the command byte; the value follows on the data port.
    pub const WRITE_COMMAND_BYTE: u8 = 0x60;
    pub const DISABLE_AUX: u8 = 0xA7;
    pub const ENABLE_AUX: u8 = 0xA8;
    pub const TEST_AUX: u8 = 0xA9;
    /// Controller self-test; replies [`reply::SELF_TEST_OK`] on success.
    pub const SELF_TEST: u8 = 0xAA;
    pub const TEST_PRIMARY: u8 = 0xAB;
    pub const DISABLE_PRIMARY: u8 = 0xAD;
    pub const ENABLE_PRIMARY: u8 = 0xAE;
    /// Echo the next data byte back on the auxiliary channel (loopback).
    pub const AUX_LOOPBACK: u8 = 0xD3;
    /// Route the next data byte to the auxiliary device.
    pub const WRITE_AUX: u8 = 0xD4;
}

/// Byte sentinels devices and the controller reply with.
pub mod reply {
    /// Device acknowledgement of a received command byte.
    pub const ACK: u8 = 0xFA;
    /// Device asks for the last byte to be resent.
    pub const RESEND: u8 = 0xFE;
    /// Controller self-test passed.
    pub const SELF_TEST_OK: u8 = 0x55;
    /// Device power-on/reset self-test passed.
    pub const BAT_OK: u8 = 0xAA;
}

/// Auxiliary multiplexer addressing extension.
pub mod mux {
    /// Number of multiplexed auxiliary sub-ports.
    pub const PORTS: usize = 4;

    /// Route the next data byte to mux sub-port `n`: opcode `WRITE_BASE + n`.
    pub const WRITE_BASE: u8 = 0x90;

    /// Loopback bytes of the capability probe, sent in order. A multiplexer
    /// intercepts the final `0xA4` and substitutes its version byte; a plain
    /// controller echoes `0xA4` unchanged.
    pub const PROBE_SEQUENCE: [u8; 3] = [0xF0, 0x56, 0xA4];

    /// Bit position of the sub-port index within the status register.
    pub const PORT_SHIFT: u32 = 6;
}

/// Extracts the mux sub-port index (0..4) from a raw status byte.
///
/// Only meaningful while the multiplexer is active and
/// [`Status::AUX_OUTPUT_FULL`] is set.
pub fn mux_sub_port(status: u8) -> u8 {
    (status >> mux::PORT_SHIFT) & 0x03
}
