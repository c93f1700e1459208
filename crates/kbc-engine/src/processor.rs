//! The request processor: the engine's single serialization context.
//!
//! One thread per controller drains the queue one primitive at a time. All
//! queue mutation, primitive execution and power transitions happen here;
//! the interrupt path only captures bytes and signals the condvar. A request
//! that fails stops at the failing primitive and never disturbs the requests
//! behind it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use kbc_pc_constants::{cmd, mux, reply, CommandByte, Status};

use crate::controller::Shared;
use crate::dispatch;
use crate::error::FailureKind;
use crate::port::PortId;
use crate::power;
use crate::request::{Completion, Primitive, Request};

/// Poll interval while waiting for the input buffer to drain.
const INPUT_POLL: Duration = Duration::from_micros(50);

/// Bound on draining a wedged output buffer; a stuck `OUTPUT_FULL` bit must
/// not hang the engine.
const FLUSH_LIMIT: usize = 64;

enum Step {
    Execute(Request),
    Power(power::PowerState),
    Shutdown,
}

pub(crate) fn run(shared: Arc<Shared>) {
    if shared.cfg.reset_on_boot {
        power::reset_controller(&shared);
    }
    loop {
        match next_step(&shared) {
            Step::Shutdown => {
                fail_pending(&shared);
                return;
            }
            Step::Power(target) => power::apply_transition(&shared, target),
            Step::Execute(request) => {
                let done = execute(&shared, request);
                finish(&shared, done);
            }
        }
    }
}

fn next_step(shared: &Shared) -> Step {
    let mut queue = shared.queue.lock().unwrap();
    loop {
        if queue.shutdown {
            return Step::Shutdown;
        }
        if let Some(target) = queue.pending_power.take() {
            return Step::Power(target);
        }
        if queue.power != power::PowerState::Sleep {
            debug_assert!(!queue.active, "a request is already active");
            if let Some(request) = queue.pending.pop_front() {
                queue.active = true;
                return Step::Execute(request);
            }
        }
        queue = shared.queue_cv.wait(queue).unwrap();
    }
}

fn execute(shared: &Shared, mut request: Request) -> Request {
    set_expectations(shared, &request, true);
    while request.executed() < request.len() {
        let primitive = request.primitive(request.executed());
        match exec_primitive(shared, &mut request, primitive) {
            Ok(()) => request.advance(),
            Err(kind) => {
                request.fail(kind);
                break;
            }
        }
    }
    set_expectations(shared, &request, false);
    request
}

/// Marks which ports the interrupt path should capture bytes for while this
/// request is in flight. Bytes arriving on an expected port go to its ring;
/// everything else takes the unsolicited path.
fn set_expectations(shared: &Shared, request: &Request, on: bool) {
    let (primary, aux) = request.expectations();
    if primary {
        shared.expecting[PortId::Primary.index()].store(on, Ordering::Release);
    }
    if aux {
        shared.expecting[request.aux_target().index()].store(on, Ordering::Release);
    }
}

fn exec_primitive(
    shared: &Shared,
    request: &mut Request,
    primitive: Primitive,
) -> Result<(), FailureKind> {
    match primitive {
        Primitive::WriteData(byte) => write_data(shared, byte),
        Primitive::WriteCommand(byte) => write_command(shared, byte),
        Primitive::ReadData => {
            let byte = read_ring(shared, PortId::Primary, shared.cfg.response_timeout)?;
            request.capture(byte);
            Ok(())
        }
        Primitive::ReadDataAndCompare(expected) => {
            read_compare(shared, PortId::Primary, expected)
        }
        Primitive::ReadAuxData => {
            let byte = read_ring(shared, request.aux_target(), shared.cfg.response_timeout)?;
            request.capture(byte);
            Ok(())
        }
        Primitive::ReadAuxDataAndCompare(expected) => {
            read_compare(shared, request.aux_target(), expected)
        }
        Primitive::SendCommandAndCompareAck(byte) => {
            let target = request.aux_target();
            let opcode = match target {
                PortId::Mux(n) => mux::WRITE_BASE + n,
                PortId::Primary | PortId::Aux => cmd::WRITE_AUX,
            };
            write_command(shared, opcode)?;
            write_data(shared, byte)?;
            read_compare(shared, target, reply::ACK)
        }
        Primitive::FlushData => {
            shared.rings[PortId::Primary.index()].clear();
            shared.rings[request.aux_target().index()].clear();
            flush_hardware(shared);
            Ok(())
        }
        Primitive::Sleep(duration) => {
            wait_responsive(shared, duration);
            Ok(())
        }
        Primitive::ModifyCommandByte { set, clear } => {
            let previous = rmw_command_byte(shared, set, clear)?;
            request.capture(previous);
            Ok(())
        }
    }
}

/// Pops a byte from `port`'s capture ring, parking on the queue condvar
/// until the interrupt path delivers one or the deadline passes. Device
/// non-response is an ordinary per-request failure, never a hang.
fn read_ring(shared: &Shared, port: PortId, timeout: Duration) -> Result<u8, FailureKind> {
    let ring = &shared.rings[port.index()];
    if let Some(byte) = ring.try_pop() {
        return Ok(byte);
    }
    let deadline = Instant::now() + timeout;
    let mut queue = shared.queue.lock().unwrap();
    loop {
        if let Some(byte) = ring.try_pop() {
            return Ok(byte);
        }
        if queue.shutdown {
            return Err(FailureKind::EngineDown);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(FailureKind::Timeout);
        }
        let (guard, _) = shared
            .queue_cv
            .wait_timeout(queue, deadline - now)
            .unwrap();
        queue = guard;
    }
}

/// Compare read with the out-of-order correction pass.
///
/// A device is free to emit unsolicited data (a keypress, a movement packet)
/// in the window between our command write and its acknowledgement. When the
/// popped byte mismatches, take exactly one more read: if that one matches,
/// the first byte was a real event that slipped in early, so hand it to the
/// unsolicited path and count the primitive as a success.
fn read_compare(shared: &Shared, port: PortId, expected: u8) -> Result<(), FailureKind> {
    let got = read_ring(shared, port, shared.cfg.response_timeout)?;
    if got == expected {
        return Ok(());
    }
    if !shared.cfg.correct_out_of_order {
        return Err(FailureKind::AcknowledgeMismatch { expected, got });
    }
    match read_ring(shared, port, shared.cfg.correction_window) {
        Ok(second) if second == expected => {
            debug!(?port, byte = got, "out-of-order byte rerouted to input path");
            dispatch::deliver_unsolicited(shared, port, got);
            Ok(())
        }
        Ok(second) => Err(FailureKind::AcknowledgeMismatch {
            expected,
            got: second,
        }),
        Err(FailureKind::Timeout) => Err(FailureKind::AcknowledgeMismatch { expected, got }),
        Err(other) => Err(other),
    }
}

/// Waits for the controller to consume the input buffer, then writes `byte`
/// to the data port.
pub(crate) fn write_data(shared: &Shared, byte: u8) -> Result<(), FailureKind> {
    wait_input_clear(shared)?;
    shared.io.lock().unwrap().write_data(byte);
    Ok(())
}

/// Waits for the input buffer, then writes a command opcode.
pub(crate) fn write_command(shared: &Shared, byte: u8) -> Result<(), FailureKind> {
    wait_input_clear(shared)?;
    shared.io.lock().unwrap().write_command(byte);
    Ok(())
}

fn wait_input_clear(shared: &Shared) -> Result<(), FailureKind> {
    let deadline = Instant::now() + shared.cfg.response_timeout;
    loop {
        let status = Status::from_bits_retain(shared.io.lock().unwrap().read_status());
        if !status.contains(Status::INPUT_FULL) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(FailureKind::Timeout);
        }
        std::thread::sleep(INPUT_POLL);
    }
}

/// Issues a controller command whose reply arrives in the output buffer, and
/// returns that reply. Briefly claims a primary-channel read expectation so
/// the interrupt path captures the reply instead of routing it to a driver.
pub(crate) fn controller_command_response(
    shared: &Shared,
    opcode: u8,
) -> Result<u8, FailureKind> {
    let expecting = &shared.expecting[PortId::Primary.index()];
    let was = expecting.swap(true, Ordering::AcqRel);
    let result = write_command(shared, opcode)
        .and_then(|()| read_ring(shared, PortId::Primary, shared.cfg.response_timeout));
    expecting.store(was, Ordering::Release);
    result
}

/// Read-modify-write of the command byte under its dedicated mutex.
///
/// Several independent drivers own bits of this register; the exclusion here
/// is what keeps one driver's set/clear from clobbering another's bits.
/// Returns the pre-modification value.
pub(crate) fn rmw_command_byte(
    shared: &Shared,
    set: CommandByte,
    clear: CommandByte,
) -> Result<u8, FailureKind> {
    let _excl = shared.cmd_byte.lock().unwrap();
    let previous = controller_command_response(shared, cmd::READ_COMMAND_BYTE)?;
    let next = (CommandByte::from_bits_retain(previous) | set) & !clear;
    write_command(shared, cmd::WRITE_COMMAND_BYTE)?;
    write_data(shared, next.bits())?;
    Ok(previous)
}

/// Drains whatever is sitting in the hardware output buffer.
pub(crate) fn flush_hardware(shared: &Shared) {
    let mut io = shared.io.lock().unwrap();
    for _ in 0..FLUSH_LIMIT {
        let status = Status::from_bits_retain(io.read_status());
        if !status.contains(Status::OUTPUT_FULL) {
            break;
        }
        let _ = io.read_data();
    }
}

/// Sleeps on the queue condvar so a shutdown can cut the wait short.
/// Interrupt capture and unsolicited delivery run on other threads and stay
/// responsive throughout.
pub(crate) fn wait_responsive(shared: &Shared, duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut queue = shared.queue.lock().unwrap();
    while !queue.shutdown {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let (guard, _) = shared
            .queue_cv
            .wait_timeout(queue, deadline - now)
            .unwrap();
        queue = guard;
    }
}

/// Completion handling: release the queue slot, then deliver the finished
/// request to whoever is waiting for it.
fn finish(shared: &Shared, mut request: Request) {
    {
        let mut queue = shared.queue.lock().unwrap();
        queue.active = false;
    }
    if let Some((index, kind)) = request.failed_at() {
        debug!(index, %kind, "request failed");
    }
    match std::mem::replace(&mut request.completion, Completion::FireAndForget) {
        Completion::FireAndForget => drop(request),
        Completion::Callback(callback) => callback(request),
        Completion::Blocking(gate) => gate.complete(request),
    }
}

/// Shutdown path: every request still queued completes as failed so no
/// submitter stays parked forever.
fn fail_pending(shared: &Shared) {
    let drained: Vec<Request> = {
        let mut queue = shared.queue.lock().unwrap();
        queue.pending.drain(..).collect()
    };
    if !drained.is_empty() {
        trace!(count = drained.len(), "failing queued requests on shutdown");
    }
    for mut request in drained {
        request.fail(FailureKind::EngineDown);
        finish(shared, request);
    }
}

/// Queue admission, shared by both submit flavors.
pub(crate) fn enqueue(shared: &Shared, mut request: Request) -> Result<(), crate::SubmitError> {
    debug_assert!(
        request.executed() == 0 && request.failed_at().is_none(),
        "a completed request must be repopulated before resubmission"
    );
    let mut queue = shared.queue.lock().unwrap();
    if queue.shutdown {
        drop(queue);
        request.completion = Completion::FireAndForget;
        return Err(crate::SubmitError::Down(request));
    }
    if queue.power == power::PowerState::Sleep {
        drop(queue);
        request.completion = Completion::FireAndForget;
        return Err(crate::SubmitError::Suspended(request));
    }
    queue.pending.push_back(request);
    drop(queue);
    shared.queue_cv.notify_all();
    Ok(())
}
