//! Command requests: ordered lists of primitive bus operations forming one
//! logical transaction with a device.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kbc_pc_constants::CommandByte;

use crate::error::FailureKind;
use crate::port::PortId;
use crate::queue::CompletionGate;

/// Upper bound on primitives per request. Transactions longer than this are
/// a sign the caller should be splitting them anyway.
pub const MAX_PRIMITIVES: usize = 30;

/// One atomic bus operation within a request.
///
/// Primary-channel reads consume the primary port's capture ring; the `Aux`
/// variants consume the ring of the request's auxiliary target (the plain
/// auxiliary channel, or a mux sub-port for requests built with
/// [`Request::for_port`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Pop one primary-channel byte; the value is appended to
    /// [`Request::captured`].
    ReadData,
    /// Pop one primary-channel byte and require it to equal the operand.
    ReadDataAndCompare(u8),
    /// Write a byte to the data port (reaches the primary device).
    WriteData(u8),
    /// Write a controller command opcode to the command port.
    WriteCommand(u8),
    /// Send a command byte to the auxiliary target and require an
    /// acknowledgement (`0xFA`) back.
    SendCommandAndCompareAck(u8),
    /// Pop one auxiliary-target byte into [`Request::captured`].
    ReadAuxData,
    /// Pop one auxiliary-target byte and require it to equal the operand.
    ReadAuxDataAndCompare(u8),
    /// Drain the capture rings and the hardware output buffer.
    FlushData,
    /// Suspend this request's progress; the rest of the engine stays live.
    Sleep(Duration),
    /// Read-modify-write the command byte under its dedicated lock,
    /// preserving bits in neither mask. The prior value is appended to
    /// [`Request::captured`].
    ModifyCommandByte { set: CommandByte, clear: CommandByte },
}

/// How a request reports completion.
pub(crate) enum Completion {
    /// The engine drops the request when it finishes.
    FireAndForget,
    /// The engine hands the finished request to the callback, which owns it
    /// from then on.
    Callback(Box<dyn FnOnce(Request) + Send>),
    /// A parked submitter is waiting on the gate.
    Blocking(Arc<CompletionGate>),
}

/// An ordered, bounded sequence of [`Primitive`]s plus execution state.
///
/// The primitive list is populated up front; execution advances a cursor and
/// stops at the first failure. `executed() < len()` after completion is the
/// caller-visible partial-failure signal, with [`failed_at`](Self::failed_at)
/// naming the primitive that stopped it.
///
/// There is no cancellation of a submitted request: once queued it runs (or
/// fails) to completion, and callers wanting it gone must let it fail via
/// timeout.
pub struct Request {
    target: PortId,
    /// Bound chosen at construction; `primitives` never grows past it.
    capacity: usize,
    primitives: Vec<Primitive>,
    executed: usize,
    failure: Option<FailureKind>,
    /// Bytes captured by `ReadData`, `ReadAuxData` and `ModifyCommandByte`,
    /// in execution order.
    captured: Vec<u8>,
    pub(crate) completion: Completion,
}

impl Request {
    /// A request with the default primitive capacity, auxiliary primitives
    /// targeting the plain auxiliary channel.
    pub fn new() -> Self {
        Self::with_capacity(MAX_PRIMITIVES)
    }

    /// A request holding at most `capacity` primitives. The bound is fixed
    /// here; exceeding it in [`push`](Self::push) is a caller bug.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity <= MAX_PRIMITIVES,
            "request capacity {capacity} exceeds the engine bound {MAX_PRIMITIVES}"
        );
        Self {
            target: PortId::Aux,
            capacity,
            primitives: Vec::with_capacity(capacity),
            executed: 0,
            failure: None,
            captured: Vec::new(),
            completion: Completion::FireAndForget,
        }
    }

    /// A request whose auxiliary primitives target `port` (used for mux
    /// sub-port transactions).
    pub fn for_port(port: PortId) -> Self {
        let mut req = Self::new();
        req.target = match port {
            PortId::Primary => PortId::Aux,
            other => other,
        };
        req
    }

    /// Appends a primitive. Panics past the capacity chosen at construction.
    pub fn push(&mut self, primitive: Primitive) -> &mut Self {
        assert!(
            self.primitives.len() < self.capacity,
            "request is full ({} primitives)",
            self.capacity
        );
        self.primitives.push(primitive);
        self
    }

    /// Installs a completion callback; the finished request is moved into it.
    pub fn on_complete(mut self, callback: impl FnOnce(Request) + Send + 'static) -> Self {
        self.completion = Completion::Callback(Box::new(callback));
        self
    }

    /// Empties the request so it can be repopulated and submitted again.
    pub fn clear(&mut self) {
        self.primitives.clear();
        self.executed = 0;
        self.failure = None;
        self.captured.clear();
        self.completion = Completion::FireAndForget;
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Number of primitives that completed successfully.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// `true` once every primitive has executed successfully.
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.executed == self.primitives.len()
    }

    /// The failing primitive's index and reason, if the request failed.
    pub fn failed_at(&self) -> Option<(usize, FailureKind)> {
        self.failure.map(|kind| (self.executed, kind))
    }

    /// Bytes captured by read primitives, in execution order.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub(crate) fn primitive(&self, index: usize) -> Primitive {
        self.primitives[index]
    }

    pub(crate) fn advance(&mut self) {
        self.executed += 1;
    }

    pub(crate) fn fail(&mut self, kind: FailureKind) {
        self.failure = Some(kind);
    }

    pub(crate) fn capture(&mut self, byte: u8) {
        self.captured.push(byte);
    }

    /// The port auxiliary primitives talk to.
    pub(crate) fn aux_target(&self) -> PortId {
        self.target
    }

    /// Which channels this request expects response bytes on:
    /// `(primary, aux_target)`.
    pub(crate) fn expectations(&self) -> (bool, bool) {
        let mut primary = false;
        let mut aux = false;
        for primitive in &self.primitives {
            match primitive {
                Primitive::ReadData
                | Primitive::ReadDataAndCompare(_)
                | Primitive::ModifyCommandByte { .. } => primary = true,
                Primitive::ReadAuxData
                | Primitive::ReadAuxDataAndCompare(_)
                | Primitive::SendCommandAndCompareAck(_) => aux = true,
                _ => {}
            }
        }
        (primary, aux)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completion = match self.completion {
            Completion::FireAndForget => "fire-and-forget",
            Completion::Callback(_) => "callback",
            Completion::Blocking(_) => "blocking",
        };
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("primitives", &self.primitives)
            .field("executed", &self.executed)
            .field("failure", &self.failure)
            .field("completion", &completion)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_fixed_at_construction() {
        let mut req = Request::with_capacity(2);
        req.push(Primitive::WriteData(0xED));
        req.push(Primitive::ReadDataAndCompare(0xFA));
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            req.push(Primitive::WriteData(0x02));
        }))
        .is_err());
    }

    #[test]
    fn oversized_capacity_is_a_precondition_violation() {
        assert!(std::panic::catch_unwind(|| Request::with_capacity(MAX_PRIMITIVES + 1)).is_err());
    }

    #[test]
    fn clear_resets_execution_state() {
        let mut req = Request::new();
        req.push(Primitive::ReadData);
        req.advance();
        req.fail(FailureKind::Timeout);
        req.capture(0x42);
        req.clear();
        assert!(req.is_empty());
        assert_eq!(req.executed(), 0);
        assert!(req.failed_at().is_none());
        assert!(req.captured().is_empty());
    }

    #[test]
    fn expectations_cover_both_channels() {
        let mut req = Request::new();
        req.push(Primitive::WriteData(0xF4));
        assert_eq!(req.expectations(), (false, false));
        req.push(Primitive::ReadDataAndCompare(0xFA));
        assert_eq!(req.expectations(), (true, false));
        req.push(Primitive::SendCommandAndCompareAck(0xF4));
        assert_eq!(req.expectations(), (true, true));
    }

    #[test]
    fn primary_requests_still_target_the_plain_aux_channel() {
        let req = Request::for_port(PortId::Primary);
        assert_eq!(req.aux_target(), PortId::Aux);
        let req = Request::for_port(PortId::Mux(2));
        assert_eq!(req.aux_target(), PortId::Mux(2));
    }
}
