//! Power state machine.
//!
//! Transitions are requested from arbitrary threads but applied only on the
//! processor thread, between requests, so an in-flight transaction always
//! drains before the engine changes state. While `Sleep`, new submissions
//! are rejected; requests already queued stay queued and run after the next
//! wake.

use std::sync::Arc;

use tracing::{debug, warn};

use kbc_pc_constants::{cmd, reply, CommandByte};

use crate::controller::Shared;
use crate::port::PowerHandler;
use crate::processor;

/// Engine power states, ordered by capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerState {
    /// Engine quiesced: submissions rejected, clocks optionally gated.
    Sleep = 0,
    /// Shallow idle: the engine still accepts and executes requests, but
    /// drivers are told to cut device activity where they can.
    Doze = 1,
    /// Fully on.
    Normal = 2,
}

/// Applies a requested transition. Runs on the processor thread with no
/// request active.
pub(crate) fn apply_transition(shared: &Shared, target: PowerState) {
    let current = shared.queue.lock().unwrap().power;
    if current == target {
        return;
    }
    debug!(?current, ?target, "power transition");

    match target {
        PowerState::Sleep => {
            // Gate submissions before touching hardware so the queue cannot
            // grow under the transition.
            shared.queue.lock().unwrap().power = PowerState::Sleep;
            if shared.cfg.sleep_disables_clocks {
                let set = CommandByte::DISABLE_PRIMARY_CLOCK | CommandByte::DISABLE_AUX_CLOCK;
                let clear = CommandByte::PRIMARY_INTERRUPT | CommandByte::AUX_INTERRUPT;
                if let Err(kind) = processor::rmw_command_byte(shared, set, clear) {
                    warn!(%kind, "failed to gate clocks for sleep");
                }
            }
            notify_drivers(shared, PowerState::Sleep);
        }
        PowerState::Doze | PowerState::Normal => {
            if target == PowerState::Normal && current == PowerState::Sleep {
                if shared.cfg.reset_on_wake {
                    reset_controller(shared);
                } else if shared.cfg.sleep_disables_clocks {
                    let set = CommandByte::PRIMARY_INTERRUPT | CommandByte::AUX_INTERRUPT;
                    let clear =
                        CommandByte::DISABLE_PRIMARY_CLOCK | CommandByte::DISABLE_AUX_CLOCK;
                    if let Err(kind) = processor::rmw_command_byte(shared, set, clear) {
                        warn!(%kind, "failed to re-enable clocks after sleep");
                    }
                }
                if !shared.cfg.wake_delay.is_zero() {
                    // Slow-resuming hardware gets its grace period before the
                    // engine honors any post-wake command.
                    processor::wait_responsive(shared, shared.cfg.wake_delay);
                }
            }
            shared.queue.lock().unwrap().power = target;
            notify_drivers(shared, target);
        }
    }
}

/// Full controller reset: quiesce both channels, flush, self-test, re-enable.
pub(crate) fn reset_controller(shared: &Shared) {
    debug!("resetting controller");
    let _ = processor::write_command(shared, cmd::DISABLE_PRIMARY);
    let _ = processor::write_command(shared, cmd::DISABLE_AUX);
    processor::flush_hardware(shared);
    for ring in &shared.rings {
        ring.clear();
    }

    match processor::controller_command_response(shared, cmd::SELF_TEST) {
        Ok(reply::SELF_TEST_OK) => {}
        Ok(other) => warn!(byte = other, "controller self-test returned unexpected byte"),
        Err(kind) => warn!(%kind, "controller self-test did not complete"),
    }

    let _ = processor::write_command(shared, cmd::ENABLE_PRIMARY);
    let _ = processor::write_command(shared, cmd::ENABLE_AUX);
    let set = CommandByte::PRIMARY_INTERRUPT | CommandByte::AUX_INTERRUPT;
    let clear = CommandByte::DISABLE_PRIMARY_CLOCK | CommandByte::DISABLE_AUX_CLOCK;
    if let Err(kind) = processor::rmw_command_byte(shared, set, clear) {
        warn!(%kind, "failed to reprogram command byte after reset");
    }
}

fn notify_drivers(shared: &Shared, state: PowerState) {
    // Snapshot the handlers first; a power callback is free to call back
    // into the engine (including submitting requests).
    let handlers: Vec<Arc<dyn PowerHandler>> = {
        let ports = shared.ports.lock().unwrap();
        ports.iter().filter_map(|slot| slot.power.clone()).collect()
    };
    for handler in handlers {
        handler.power_changed(state);
    }
}
