//! Simulated 8042-style controller and devices for integration tests.
//!
//! `Sim` models the controller's registers behind the engine's [`PortIo`]
//! seam: bytes written to the devices run through programmable device
//! closures, and device output accumulates in a pending queue that a pump
//! thread delivers through `Controller::handle_interrupt`, the same way a
//! platform's IRQ glue would.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kbc_engine::{Controller, PortIo};

type Device = Box<dyn FnMut(u8) -> Vec<u8> + Send>;

/// Where the next data-port write lands, set by the last controller command.
enum Route {
    Kbd,
    CommandByte,
    Aux,
    AuxLoopback,
    MuxPort(u8),
}

enum Out {
    Kbd(u8),
    Aux(u8),
    Mux(u8, u8),
}

struct SimInner {
    pending: VecDeque<Out>,
    route: Route,
    command_byte: u8,
    kbd: Device,
    aux: Device,
    mux_devices: [Option<Device>; 4],
    mux_version: Option<u8>,
    kbd_writes: Vec<u8>,
    aux_writes: Vec<u8>,
    commands: Vec<u8>,
}

pub struct Sim {
    inner: Arc<Mutex<SimInner>>,
}

impl Sim {
    /// A controller with an always-acknowledging keyboard and mouse and no
    /// multiplexer. Command byte starts in the typical post-firmware state.
    pub fn new() -> Sim {
        Sim {
            inner: Arc::new(Mutex::new(SimInner {
                pending: VecDeque::new(),
                route: Route::Kbd,
                command_byte: 0x45,
                kbd: Box::new(|_| vec![0xFA]),
                aux: Box::new(|_| vec![0xFA]),
                mux_devices: [None, None, None, None],
                mux_version: None,
                kbd_writes: Vec::new(),
                aux_writes: Vec::new(),
                commands: Vec::new(),
            })),
        }
    }

    pub fn bus(&self) -> Box<dyn PortIo> {
        Box::new(SimBus {
            inner: self.inner.clone(),
        })
    }

    pub fn set_kbd_device(&self, device: impl FnMut(u8) -> Vec<u8> + Send + 'static) {
        self.inner.lock().unwrap().kbd = Box::new(device);
    }

    pub fn set_aux_device(&self, device: impl FnMut(u8) -> Vec<u8> + Send + 'static) {
        self.inner.lock().unwrap().aux = Box::new(device);
    }

    /// Puts a multiplexer with the given version byte on the auxiliary
    /// channel.
    pub fn set_mux(&self, version: u8) {
        self.inner.lock().unwrap().mux_version = Some(version);
    }

    pub fn set_mux_device(&self, port: usize, device: impl FnMut(u8) -> Vec<u8> + Send + 'static) {
        self.inner.lock().unwrap().mux_devices[port] = Some(Box::new(device));
    }

    /// Spontaneous device output, as if the user pressed a key.
    pub fn inject_kbd(&self, byte: u8) {
        self.inner.lock().unwrap().pending.push_back(Out::Kbd(byte));
    }

    pub fn inject_aux(&self, byte: u8) {
        self.inner.lock().unwrap().pending.push_back(Out::Aux(byte));
    }

    pub fn inject_mux(&self, port: u8, byte: u8) {
        self.inner
            .lock()
            .unwrap()
            .pending
            .push_back(Out::Mux(port, byte));
    }

    pub fn command_byte(&self) -> u8 {
        self.inner.lock().unwrap().command_byte
    }

    pub fn kbd_writes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().kbd_writes.clone()
    }

    pub fn aux_writes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().aux_writes.clone()
    }

    pub fn commands(&self) -> Vec<u8> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    /// Starts the interrupt pump: whenever device output is pending, invoke
    /// the controller's interrupt entry, as the platform IRQ line would.
    pub fn pump(&self, ctrl: &Arc<Controller>) -> Pump {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            let inner = self.inner.clone();
            let ctrl = ctrl.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let pending = !inner.lock().unwrap().pending.is_empty();
                    if pending {
                        ctrl.handle_interrupt();
                    } else {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
            })
        };
        Pump {
            stop,
            worker: Some(worker),
        }
    }
}

pub struct Pump {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct SimBus {
    inner: Arc<Mutex<SimInner>>,
}

impl PortIo for SimBus {
    fn read_status(&mut self) -> u8 {
        let inner = self.inner.lock().unwrap();
        match inner.pending.front() {
            None => 0x00,
            Some(Out::Kbd(_)) => 0x01,
            Some(Out::Aux(_)) => 0x21,
            Some(Out::Mux(port, _)) => 0x21 | (*port << 6),
        }
    }

    fn read_data(&mut self) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.pop_front() {
            None => 0x00,
            Some(Out::Kbd(b)) | Some(Out::Aux(b)) | Some(Out::Mux(_, b)) => b,
        }
    }

    fn write_data(&mut self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        let route = std::mem::replace(&mut inner.route, Route::Kbd);
        match route {
            Route::Kbd => {
                inner.kbd_writes.push(byte);
                let replies = (inner.kbd)(byte);
                inner.pending.extend(replies.into_iter().map(Out::Kbd));
            }
            Route::CommandByte => inner.command_byte = byte,
            Route::Aux => {
                inner.aux_writes.push(byte);
                let replies = (inner.aux)(byte);
                inner.pending.extend(replies.into_iter().map(Out::Aux));
            }
            Route::AuxLoopback => {
                // A multiplexer intercepts the final probe byte and answers
                // with its version; everything else echoes unchanged.
                let echo = match inner.mux_version {
                    Some(version) if byte == 0xA4 => version,
                    _ => byte,
                };
                inner.pending.push_back(Out::Aux(echo));
            }
            Route::MuxPort(port) => {
                let replies = match inner.mux_devices[port as usize].as_mut() {
                    Some(device) => device(byte),
                    None => vec![0xFE],
                };
                inner
                    .pending
                    .extend(replies.into_iter().map(|b| Out::Mux(port, b)));
            }
        }
    }

    fn write_command(&mut self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(byte);
        match byte {
            0x20 => {
                let value = inner.command_byte;
                inner.pending.push_back(Out::Kbd(value));
            }
            0x60 => inner.route = Route::CommandByte,
            0xAA => inner.pending.push_back(Out::Kbd(0x55)),
            0xD3 => inner.route = Route::AuxLoopback,
            0xD4 => inner.route = Route::Aux,
            0x90..=0x93 => inner.route = Route::MuxPort(byte - 0x90),
            // Port enable/disable and port tests are accepted silently.
            _ => {}
        }
    }
}

/// Polls `cond` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Installs the fmt subscriber so engine tracing shows up under
/// `cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
