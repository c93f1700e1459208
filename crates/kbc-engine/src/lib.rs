#![forbid(unsafe_code)]

//! Request/interrupt engine for an 8042-style two-channel peripheral
//! controller.
//!
//! Several independent drivers (keyboard, pointing device, multiplexed
//! auxiliary devices) share one narrow hardware interface. This crate is the
//! machinery that keeps them from corrupting each other's transactions:
//!
//! - [`Request`]s chain primitive port operations into atomic multi-byte
//!   transactions, executed one at a time in strict FIFO order on a single
//!   processor thread per controller.
//! - The interrupt path ([`Controller::handle_interrupt`]) does O(1),
//!   allocation-free work: decode the source port, capture the byte into a
//!   lock-free ring if a transaction expects it, otherwise hand it to the
//!   bound driver's input handler.
//! - A compare mismatch mid-transaction gets one corrective re-read, since
//!   devices are free to emit real events in the window where software
//!   expects an acknowledgement; the displaced byte is rerouted to the
//!   normal input path.
//! - A tri-state power machine ([`PowerState`]) gates request admission and
//!   drives clock gating / controller reset around sleep transitions.
//!
//! Scan-code decoding, gesture recognition and report construction are
//! consumers of this engine and live elsewhere; nothing here knows what the
//! bytes mean.

mod bus;
mod controller;
mod dispatch;
mod error;
mod port;
mod power;
mod processor;
mod queue;
mod request;
mod ring;

pub use bus::PortIo;
pub use controller::{BusGuard, Config, Controller};
pub use error::{EngineError, FailureKind, SubmitError};
pub use port::{HandlerOutcome, InputHandler, PortHandle, PortId, PowerHandler};
pub use power::PowerState;
pub use request::{Primitive, Request, MAX_PRIMITIVES};
pub use ring::ByteRing;

pub use kbc_pc_constants::{cmd, mux, reply, CommandByte, Status};
