//! Per-port driver bindings.
//!
//! A port is one logical channel of the controller: the primary
//! (keyboard-like) channel, the auxiliary (mouse-like) channel, or one of
//! four multiplexed auxiliary sub-ports. At most one driver is bound to a
//! port at a time; the binding carries the driver's input and power
//! callbacks plus a suppression counter used to bracket sensitive command
//! sequences.

use std::sync::Arc;

use crate::controller::Shared;
use crate::error::EngineError;
use crate::power::PowerState;

/// One logical channel on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortId {
    /// Primary (keyboard-like) channel.
    Primary,
    /// Auxiliary (mouse-like) channel.
    Aux,
    /// Multiplexed auxiliary sub-port, 0..4. Only attachable while the
    /// multiplexer is active.
    Mux(u8),
}

impl PortId {
    /// Total number of addressable ports, multiplexed sub-ports included.
    pub const COUNT: usize = 2 + kbc_pc_constants::mux::PORTS;

    pub(crate) fn index(self) -> usize {
        match self {
            PortId::Primary => 0,
            PortId::Aux => 1,
            PortId::Mux(n) => 2 + n as usize,
        }
    }
}

/// What a driver's input handler did with a delivered byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The byte completed a packet; higher layers can be notified.
    PacketReady,
    /// More bytes are needed before a packet is complete.
    Buffering,
}

/// Receives unsolicited bytes for a port, one at a time, on whatever thread
/// delivered the interrupt.
pub trait InputHandler: Send + Sync {
    fn byte(&self, byte: u8) -> HandlerOutcome;
}

impl<F> InputHandler for F
where
    F: Fn(u8) -> HandlerOutcome + Send + Sync,
{
    fn byte(&self, byte: u8) -> HandlerOutcome {
        self(byte)
    }
}

/// Notified after each applied power transition so the driver can
/// reinitialize device-side state (for example, re-enable streaming mode
/// after a wake).
pub trait PowerHandler: Send + Sync {
    fn power_changed(&self, state: PowerState);
}

impl<F> PowerHandler for F
where
    F: Fn(PowerState) + Send + Sync,
{
    fn power_changed(&self, state: PowerState) {
        self(state)
    }
}

/// Driver binding state for one port.
#[derive(Default)]
pub(crate) struct PortSlot {
    pub(crate) bound: bool,
    pub(crate) input: Option<Arc<dyn InputHandler>>,
    pub(crate) power: Option<Arc<dyn PowerHandler>>,
    /// While non-zero, unsolicited bytes for this port are dropped.
    pub(crate) suppress: u32,
}

/// Exclusive claim on one port, returned by [`crate::Controller::attach`].
///
/// Dropping the handle (or calling [`PortHandle::detach`]) releases the port
/// and clears its callbacks.
pub struct PortHandle {
    shared: Arc<Shared>,
    port: PortId,
}

impl PortHandle {
    pub(crate) fn claim(shared: Arc<Shared>, port: PortId) -> Result<Self, EngineError> {
        match port {
            PortId::Mux(n) => {
                if usize::from(n) >= kbc_pc_constants::mux::PORTS
                    || !shared.mux_active.load(std::sync::atomic::Ordering::Acquire)
                {
                    return Err(EngineError::NoSuchPort(port));
                }
            }
            PortId::Primary | PortId::Aux => {}
        }
        let mut ports = shared.ports.lock().unwrap();
        let slot = &mut ports[port.index()];
        if slot.bound {
            return Err(EngineError::PortBusy(port));
        }
        *slot = PortSlot {
            bound: true,
            ..PortSlot::default()
        };
        drop(ports);
        Ok(PortHandle { shared, port })
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn set_input_handler(&self, handler: Arc<dyn InputHandler>) {
        self.shared.ports.lock().unwrap()[self.port.index()].input = Some(handler);
    }

    pub fn clear_input_handler(&self) {
        self.shared.ports.lock().unwrap()[self.port.index()].input = None;
    }

    pub fn set_power_handler(&self, handler: Arc<dyn PowerHandler>) {
        self.shared.ports.lock().unwrap()[self.port.index()].power = Some(handler);
    }

    /// Drops unsolicited bytes for this port until a matching
    /// [`resume_input`](Self::resume_input). Nests.
    pub fn suppress_input(&self) {
        self.shared.ports.lock().unwrap()[self.port.index()].suppress += 1;
    }

    pub fn resume_input(&self) {
        let mut ports = self.shared.ports.lock().unwrap();
        let slot = &mut ports[self.port.index()];
        debug_assert!(slot.suppress > 0, "resume_input without suppress_input");
        slot.suppress = slot.suppress.saturating_sub(1);
    }

    /// Releases the port explicitly. Equivalent to dropping the handle.
    pub fn detach(self) {}
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        let mut ports = self.shared.ports.lock().unwrap();
        ports[self.port.index()] = PortSlot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_indices_are_dense_and_distinct() {
        let mut seen = [false; PortId::COUNT];
        for port in [
            PortId::Primary,
            PortId::Aux,
            PortId::Mux(0),
            PortId::Mux(1),
            PortId::Mux(2),
            PortId::Mux(3),
        ] {
            let idx = port.index();
            assert!(!seen[idx]);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
