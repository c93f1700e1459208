//! Interrupt dispatch.
//!
//! Entered from [`crate::Controller::handle_interrupt`] on whatever thread
//! the platform delivers interrupts on. The work done here is the minimum:
//! decode the source port from the status register, read the byte, and
//! either capture it for the processor (a transaction is expecting data on
//! that port) or hand it straight to the bound driver. All decisions beyond
//! that belong to the processor thread.

use std::sync::atomic::Ordering;

use tracing::trace;

use kbc_pc_constants::{mux_sub_port, Status};

use crate::controller::Shared;
use crate::port::{HandlerOutcome, InputHandler, PortId};

/// Bound on bytes drained per interrupt; coalesced interrupts deliver
/// several bytes, a misbehaving controller must not trap us here.
const MAX_DRAIN: usize = 16;

pub(crate) fn handle_interrupt(shared: &Shared) {
    for _ in 0..MAX_DRAIN {
        let (status, byte) = {
            let mut io = shared.io.lock().unwrap();
            let status = Status::from_bits_retain(io.read_status());
            if !status.contains(Status::OUTPUT_FULL) {
                return;
            }
            (status, io.read_data())
        };
        let port = resolve_port(shared, status);
        route_byte(shared, port, byte);
    }
}

/// Decodes which port the byte in the output buffer came from.
fn resolve_port(shared: &Shared, status: Status) -> PortId {
    if !status.contains(Status::AUX_OUTPUT_FULL) {
        return PortId::Primary;
    }
    if shared.mux_active.load(Ordering::Acquire) {
        PortId::Mux(mux_sub_port(status.bits()))
    } else {
        PortId::Aux
    }
}

/// Captured-or-unsolicited routing for one byte.
fn route_byte(shared: &Shared, port: PortId, byte: u8) {
    if shared.expecting[port.index()].load(Ordering::Acquire) {
        if !shared.rings[port.index()].push(byte) {
            trace!(?port, byte, "capture ring full, byte dropped");
        }
        // Wake the processor if it is parked waiting for this byte. Taking
        // the queue lock (even empty) orders the push before the wakeup.
        drop(shared.queue.lock().unwrap());
        shared.queue_cv.notify_all();
        return;
    }
    deliver_unsolicited(shared, port, byte);
}

/// Hands a byte to the port's bound driver, honoring the suppression
/// counter. Also used by the processor to reroute out-of-order bytes.
pub(crate) fn deliver_unsolicited(shared: &Shared, port: PortId, byte: u8) {
    let handler: Option<std::sync::Arc<dyn InputHandler>> = {
        let ports = shared.ports.lock().unwrap();
        let slot = &ports[port.index()];
        if slot.suppress > 0 {
            trace!(?port, byte, "input suppressed, byte dropped");
            return;
        }
        slot.input.clone()
    };
    match handler {
        Some(handler) => {
            if handler.byte(byte) == HandlerOutcome::PacketReady {
                trace!(?port, "packet ready");
            }
        }
        None => trace!(?port, byte, "no driver bound, byte dropped"),
    }
}
