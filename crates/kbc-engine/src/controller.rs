//! The controller facade: engine construction, request submission, port
//! attachment and the coarse bus lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use kbc_pc_constants::{cmd, mux, CommandByte};

use crate::bus::PortIo;
use crate::error::{EngineError, SubmitError};
use crate::port::{PortHandle, PortId, PortSlot};
use crate::power::PowerState;
use crate::processor;
use crate::queue::{CompletionGate, QueueState};
use crate::request::{Completion, Primitive, Request};
use crate::ring::ByteRing;

/// Engine tuning and policy knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a read primitive waits for its byte before the request
    /// fails with a timeout.
    pub response_timeout: Duration,
    /// Bound on the single extra read the out-of-order correction pass
    /// takes after a compare mismatch.
    pub correction_window: Duration,
    /// Whether compare mismatches get the correction pass at all. Disable
    /// for deterministic behavior while debugging a protocol exchange.
    pub correct_out_of_order: bool,
    /// Gate both device clocks (and interrupt enables) when entering sleep,
    /// so a floating device cannot wake the system spuriously.
    pub sleep_disables_clocks: bool,
    /// Run the full controller reset sequence when the engine starts.
    pub reset_on_boot: bool,
    /// Run the full controller reset sequence on a sleep-to-normal wake.
    pub reset_on_wake: bool,
    /// Grace period after a wake before the first command is honored, for
    /// slow-resuming hardware.
    pub wake_delay: Duration,
    /// Capture ring capacity per port; must be a power of two.
    pub ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(100),
            correction_window: Duration::from_millis(10),
            correct_out_of_order: true,
            sleep_disables_clocks: false,
            reset_on_boot: false,
            reset_on_wake: false,
            wake_delay: Duration::ZERO,
            ring_capacity: 64,
        }
    }
}

/// State shared between the public API, the processor thread and the
/// interrupt path.
pub(crate) struct Shared {
    pub(crate) cfg: Config,
    pub(crate) io: Mutex<Box<dyn PortIo>>,
    /// One capture ring per port, interrupt producer / processor consumer.
    pub(crate) rings: Vec<ByteRing>,
    /// Per-port flag: the active transaction expects response bytes here.
    pub(crate) expecting: [AtomicBool; PortId::COUNT],
    pub(crate) ports: Mutex<Vec<PortSlot>>,
    pub(crate) queue: Mutex<QueueState>,
    pub(crate) queue_cv: Condvar,
    /// Exclusion for command-byte read-modify-write. Distinct from the
    /// queue mutex so config mutation and queue admission never contend.
    pub(crate) cmd_byte: Mutex<()>,
    /// Coarse driver-level exclusion; see [`Controller::lock_bus`].
    pub(crate) bus_lock: Mutex<()>,
    pub(crate) mux_active: AtomicBool,
}

/// The engine for one 8042-style controller instance.
///
/// Construction spawns the processor thread; dropping the controller shuts
/// it down and joins it.
pub struct Controller {
    shared: Arc<Shared>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(io: Box<dyn PortIo>, cfg: Config) -> Controller {
        assert!(
            cfg.ring_capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        let rings = (0..PortId::COUNT)
            .map(|_| ByteRing::new(cfg.ring_capacity))
            .collect();
        let ports = (0..PortId::COUNT).map(|_| PortSlot::default()).collect();
        let shared = Arc::new(Shared {
            cfg,
            io: Mutex::new(io),
            rings,
            expecting: std::array::from_fn(|_| AtomicBool::new(false)),
            ports: Mutex::new(ports),
            queue: Mutex::new(QueueState::new()),
            queue_cv: Condvar::new(),
            cmd_byte: Mutex::new(()),
            bus_lock: Mutex::new(()),
            mux_active: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            thread::spawn(move || processor::run(shared))
        };
        Controller {
            shared,
            processor: Mutex::new(Some(worker)),
        }
    }

    /// Platform interrupt entry. Call whenever the controller raises either
    /// channel's IRQ; the engine reads the status register itself.
    pub fn handle_interrupt(&self) {
        crate::dispatch::handle_interrupt(&self.shared);
    }

    /// Claims a port for a driver.
    pub fn attach(&self, port: PortId) -> Result<PortHandle, EngineError> {
        PortHandle::claim(self.shared.clone(), port)
    }

    /// Submits a request without blocking. The request completes in
    /// submission order; its callback (if any) fires on the processor
    /// thread. There is no cancellation of a queued request.
    pub fn submit(&self, request: Request) -> Result<(), SubmitError> {
        processor::enqueue(&self.shared, request)
    }

    /// Submits a request and parks the calling thread until it completes.
    /// The finished request is handed back, cursor and captured bytes
    /// included; ownership returning to the caller is what frees it.
    pub fn submit_blocking(&self, mut request: Request) -> Result<Request, SubmitError> {
        debug_assert!(
            matches!(request.completion, Completion::FireAndForget),
            "blocking submission replaces the completion mode"
        );
        let gate = Arc::new(CompletionGate::new());
        request.completion = Completion::Blocking(gate.clone());
        processor::enqueue(&self.shared, request)?;
        Ok(gate.wait())
    }

    /// Sets and clears bits of the shared command byte, returning the
    /// previous value. Runs through the queue like any other transaction,
    /// with the read-modify-write itself under the command-byte mutex.
    pub fn set_command_byte(
        &self,
        set: CommandByte,
        clear: CommandByte,
    ) -> Result<u8, EngineError> {
        let mut request = Request::with_capacity(1);
        request.push(Primitive::ModifyCommandByte { set, clear });
        let done = self.submit_blocking(request).map_err(EngineError::from)?;
        if let Some((index, kind)) = done.failed_at() {
            return Err(EngineError::RequestFailed { index, kind });
        }
        Ok(done.captured().first().copied().unwrap_or_default())
    }

    /// Exclusive access bracketing a multi-request sequence (a probe, a
    /// device handover) against other drivers doing the same. Individual
    /// requests are already serialized by the queue; this lock is only for
    /// sequences that must not interleave at the request level.
    pub fn lock_bus(&self) -> BusGuard<'_> {
        BusGuard {
            _guard: self.shared.bus_lock.lock().unwrap(),
        }
    }

    /// Requests a power transition. The transition is applied on the
    /// processor thread after the in-flight request (if any) drains; this
    /// call never blocks on hardware.
    pub fn request_power_state(&self, target: PowerState) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.pending_power = Some(target);
        drop(queue);
        self.shared.queue_cv.notify_all();
    }

    pub fn power_state(&self) -> PowerState {
        self.shared.queue.lock().unwrap().power
    }

    /// Probes for an auxiliary multiplexer and activates it. Returns
    /// `Ok(false)` when no multiplexer answered, leaving the engine in
    /// plain two-port mode.
    ///
    /// The probe is the loopback handshake: each probe byte is echoed
    /// through the auxiliary channel, and a multiplexer intercepts the
    /// final one to answer with its version instead.
    pub fn enable_aux_multiplexing(&self) -> Result<bool, EngineError> {
        let _bus = self.lock_bus();
        let mut request = Request::with_capacity(9);
        let [first, second, last] = mux::PROBE_SEQUENCE;
        request
            .push(Primitive::WriteCommand(cmd::AUX_LOOPBACK))
            .push(Primitive::WriteData(first))
            .push(Primitive::ReadAuxDataAndCompare(first))
            .push(Primitive::WriteCommand(cmd::AUX_LOOPBACK))
            .push(Primitive::WriteData(second))
            .push(Primitive::ReadAuxDataAndCompare(second))
            .push(Primitive::WriteCommand(cmd::AUX_LOOPBACK))
            .push(Primitive::WriteData(last))
            .push(Primitive::ReadAuxData);
        let done = self.submit_blocking(request).map_err(EngineError::from)?;
        if !done.is_complete() {
            warn!(failed_at = ?done.failed_at(), "mux probe did not complete, staying two-port");
            return Ok(false);
        }
        match done.captured().last().copied() {
            Some(version) if version != last => {
                debug!(version, "aux multiplexer enabled");
                self.shared.mux_active.store(true, Ordering::Release);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn mux_active(&self) -> bool {
        self.shared.mux_active.load(Ordering::Acquire)
    }

    /// Stops the processor thread. Queued requests complete as failed so no
    /// blocked submitter is left parked. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.shutdown = true;
        }
        self.shared.queue_cv.notify_all();
        if let Some(worker) = self.processor.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// RAII form of the driver-level lock/unlock pair; unlock is the drop.
pub struct BusGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}
