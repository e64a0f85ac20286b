//! Speed-scaled `embassy-time` driver.
//!
//! Simulation time advances at `speed_percent` of host time so an episode
//! scheduled over tens of minutes of airtime can run in seconds. Wakers are
//! kept in a deadline-ordered table and fired by a dedicated host thread.

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use log::error;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant as HostInstant};

/// Accepted range for the clock speed, in percent of host time.
pub const MIN_SPEED_PERCENT: u32 = 1;
pub const MAX_SPEED_PERCENT: u32 = 1000;

// Scale factor in Q32.32 fixed point; 1.0 == 1 << 32.
const UNITY_Q32: u128 = 1u128 << 32;
const NANOS_PER_SEC: u128 = 1_000_000_000;

// Upper bound on a single sleep of the wake thread so a speed change is picked
// up even if the notification raced with the wait.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct SimClock {
    /// Host instant that maps to `anchor_ticks`.
    anchor_host: HostInstant,
    anchor_ticks: u64,
    scale_q32: u128,
    /// Percent exactly as requested; recomputing it from the scale would round.
    speed_percent: u32,
}

impl SimClock {
    fn ticks_at(&self, host: HostInstant) -> u64 {
        let host_ns = host.saturating_duration_since(self.anchor_host).as_nanos();
        let host_ticks = host_ns * TICK_HZ as u128 / NANOS_PER_SEC;
        let sim_ticks = host_ticks * self.scale_q32 / UNITY_Q32;
        self.anchor_ticks.saturating_add(sim_ticks.min(u64::MAX as u128) as u64)
    }

    fn host_at(&self, ticks: u64) -> HostInstant {
        // Deadlines before the anchor are already due.
        let Some(sim_ticks) = ticks.checked_sub(self.anchor_ticks) else {
            return self.anchor_host;
        };
        let host_ticks = sim_ticks as u128 * UNITY_Q32 / self.scale_q32;
        let host_ns = host_ticks * NANOS_PER_SEC / TICK_HZ as u128;
        self.anchor_host + Duration::from_nanos(host_ns.min(u64::MAX as u128) as u64)
    }

    /// Change the scale while keeping the current simulation time continuous.
    fn rescale(&mut self, percent: u32, host_now: HostInstant) {
        let sim_now = self.ticks_at(host_now);
        let scale_q32 = percent as u128 * UNITY_Q32 / 100;
        let elapsed_sim = sim_now.saturating_sub(self.anchor_ticks) as u128;
        let elapsed_host_ns = elapsed_sim * UNITY_Q32 / scale_q32 * NANOS_PER_SEC / TICK_HZ as u128;
        let elapsed_host = Duration::from_nanos(elapsed_host_ns.min(u64::MAX as u128) as u64);
        self.anchor_host = host_now.checked_sub(elapsed_host).unwrap_or(host_now);
        self.scale_q32 = scale_q32;
        self.speed_percent = percent;
    }
}

#[derive(Default)]
struct WakeTable {
    deadlines: BTreeMap<u64, Vec<Waker>>,
}

static CLOCK: OnceLock<Mutex<SimClock>> = OnceLock::new();
static WAKE_TABLE: OnceLock<Mutex<WakeTable>> = OnceLock::new();
static WAKE_CV: OnceLock<Condvar> = OnceLock::new();
static WAKE_THREAD: OnceLock<()> = OnceLock::new();

// A panic while holding one of these locks cannot leave the clock or the wake
// table half-updated, so a poisoned lock is still safe to use.
fn clock() -> MutexGuard<'static, SimClock> {
    CLOCK
        .get_or_init(|| {
            Mutex::new(SimClock {
                anchor_host: HostInstant::now(),
                anchor_ticks: 0,
                scale_q32: UNITY_Q32,
                speed_percent: 100,
            })
        })
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wake_table() -> MutexGuard<'static, WakeTable> {
    WAKE_TABLE
        .get_or_init(|| Mutex::new(WakeTable::default()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wake_cv() -> &'static Condvar {
    WAKE_CV.get_or_init(Condvar::new)
}

fn sim_ticks_now() -> u64 {
    clock().ticks_at(HostInstant::now())
}

fn host_deadline(ticks: u64) -> HostInstant {
    clock().host_at(ticks)
}

fn start_wake_thread() {
    WAKE_THREAD.get_or_init(|| {
        if let Err(e) = std::thread::Builder::new().name("sim-clock-wake".into()).spawn(wake_loop) {
            error!("Failed to start simulation clock thread: {}", e);
        }
    });
}

fn wake_loop() {
    loop {
        // The clock lock is never taken while the wake table is held.
        let earliest = {
            let mut table = wake_table();
            loop {
                if let Some((&at, _)) = table.deadlines.first_key_value() {
                    break at;
                }
                table = wake_cv().wait(table).unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        let due_at = host_deadline(earliest);
        let host_now = HostInstant::now();
        if due_at > host_now {
            let sleep = (due_at - host_now).min(MAX_SLEEP_SLICE);
            let table = wake_table();
            drop(wake_cv().wait_timeout(table, sleep).unwrap_or_else(|poisoned| poisoned.into_inner()));
            continue;
        }

        let now_ticks = sim_ticks_now();
        let ready: Vec<Waker> = {
            let mut table = wake_table();
            let later = table.deadlines.split_off(&now_ticks.saturating_add(1));
            let due = std::mem::replace(&mut table.deadlines, later);
            due.into_values().flatten().collect()
        };
        for waker in ready {
            waker.wake();
        }
    }
}

struct SimDriver;

impl Driver for SimDriver {
    fn now(&self) -> u64 {
        sim_ticks_now()
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        start_wake_thread();
        {
            let mut table = wake_table();
            let wakers = table.deadlines.entry(at).or_default();
            // Timers re-register on every poll; keep one entry per task.
            if !wakers.iter().any(|w| w.will_wake(waker)) {
                wakers.push(waker.clone());
            }
        }
        wake_cv().notify_all();
    }
}

time_driver_impl!(static DRIVER: SimDriver = SimDriver);

/// Set how fast simulation time runs relative to host time. Values are clamped
/// to `MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT`.
pub fn set_speed_percent(percent: u32) {
    let percent = percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
    {
        let mut clock = clock();
        if clock.speed_percent == percent {
            return;
        }
        clock.rescale(percent, HostInstant::now());
    }
    // The earliest deadline maps to a different host instant now.
    wake_cv().notify_all();
}

pub fn speed_percent() -> u32 {
    clock().speed_percent
}

/// Serialises tests that change the global clock speed.
#[cfg(test)]
pub(crate) static TEST_GUARD: Mutex<()> = Mutex::new(());
