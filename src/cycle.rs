// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Monotonic ticks and the deadline schedules driving the control loop.
//!
//! A [`Schedule`] hands out every elapsed deadline exactly once. If the
//! caller falls behind, [`PollingInterval`] returns the missed deadlines back
//! to back, while [`TimerChannel`] (one tick buffered) drops them.

use crossbeam_channel::Receiver;
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

/// Microsecond timestamp of a wrapping 32 bit counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tick(pub u32);

impl Tick {
    pub const fn wrapping_add(self, us: u32) -> Tick {
        Tick(self.0.wrapping_add(us))
    }

    /// Microseconds from `earlier` to `self`, correct across one wrap.
    pub const fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether at least `delta` microseconds passed since `reference`.
    pub const fn is_expired(self, reference: Tick, delta: u32) -> bool {
        self.since(reference) >= delta
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

fn micros(d: Duration) -> u32 {
    u32::try_from(d.as_micros()).unwrap_or(u32::MAX)
}

/// A monotonic time source.
pub trait Clock {
    fn now(&self) -> Tick;
    /// Give up the processor for about `d`.
    fn pause(&self, d: Duration);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Tick {
        (**self).now()
    }

    fn pause(&self, d: Duration) {
        (**self).pause(d)
    }
}

/// Wall clock time since creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn tick_at(&self, at: Instant) -> Tick {
        Tick(at.saturating_duration_since(self.origin).as_micros() as u32)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Tick {
        self.tick_at(Instant::now())
    }

    fn pause(&self, d: Duration) {
        thread::sleep(d);
    }
}

/// Time that only moves when paused.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn starting_at(tick: Tick) -> Self {
        Self {
            now: AtomicU32::new(tick.0),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.now.fetch_add(micros(d), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick(self.now.load(Ordering::Acquire))
    }

    fn pause(&self, d: Duration) {
        self.advance(d);
    }
}

/// A deadline advancing by a fixed period each time it elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    reference: Tick,
    period: u32,
}

impl Deadline {
    pub fn new(start: Tick, period: Duration) -> Self {
        Self {
            reference: start,
            period: micros(period),
        }
    }

    pub const fn is_due(&self, now: Tick) -> bool {
        now.is_expired(self.reference, self.period)
    }

    /// Consume the elapsed deadline.
    pub fn advance(&mut self) {
        self.reference = self.reference.wrapping_add(self.period);
    }
}

/// Source of elapsed deadlines.
pub trait Schedule {
    /// Block until the next deadline elapsed, returns the time it was seen.
    fn wait(&mut self) -> Tick;
}

/// Checks the deadline, pausing briefly between checks.
pub struct PollingInterval<C> {
    clock: C,
    deadline: Deadline,
    idle: Duration,
}

impl<C: Clock> PollingInterval<C> {
    pub fn new(clock: C, period: Duration, idle: Duration) -> Self {
        let deadline = Deadline::new(clock.now(), period);
        Self {
            clock,
            deadline,
            idle,
        }
    }
}

impl<C: Clock> Schedule for PollingInterval<C> {
    fn wait(&mut self) -> Tick {
        loop {
            let now = self.clock.now();
            if self.deadline.is_due(now) {
                self.deadline.advance();
                return now;
            }
            self.clock.pause(self.idle);
        }
    }
}

/// Blocks on a periodic timer channel.
pub struct TimerChannel {
    ticks: Receiver<Instant>,
    clock: MonotonicClock,
}

impl TimerChannel {
    pub fn new(period: Duration) -> Self {
        Self {
            ticks: crossbeam_channel::tick(period),
            clock: MonotonicClock::new(),
        }
    }
}

impl Schedule for TimerChannel {
    fn wait(&mut self) -> Tick {
        // a tick channel never disconnects
        let at = self.ticks.recv().unwrap_or_else(|_| Instant::now());
        self.clock.tick_at(at)
    }
}

#[test]
fn test_expiry_across_wrap() {
    let reference = Tick(u32::MAX - 500);
    assert!(!Tick(u32::MAX).is_expired(reference, 1000));
    assert!(!Tick(498).is_expired(reference, 1000));
    assert!(Tick(499).is_expired(reference, 1000));
    assert_eq!(Tick(499).since(reference), 1000);
}

#[test]
fn test_deadline_catches_up_one_period_at_a_time() {
    let mut deadline = Deadline::new(Tick(0), Duration::from_micros(2000));
    assert!(!deadline.is_due(Tick(1999)));
    assert!(deadline.is_due(Tick(6500)));
    deadline.advance();
    assert!(deadline.is_due(Tick(6500)));
    deadline.advance();
    assert!(deadline.is_due(Tick(6500)));
    deadline.advance();
    assert!(!deadline.is_due(Tick(6500)));
}

#[test]
fn test_polling_interval_evaluates_once_per_deadline() {
    let clock = ManualClock::default();
    let mut interval =
        PollingInterval::new(&clock, Duration::from_millis(2), Duration::from_micros(100));
    let seen: Vec<_> = (0..3).map(|_| interval.wait()).collect();
    assert_eq!(seen, vec![Tick(2000), Tick(4000), Tick(6000)]);

    // a stall of several periods replays the missed deadlines
    clock.advance(Duration::from_millis(5));
    assert_eq!(interval.wait(), Tick(11000));
    assert_eq!(interval.wait(), Tick(11000));
    assert_eq!(interval.wait(), Tick(12000));
}

#[test]
fn test_tick_display() {
    assert_eq!(Tick(12_003_400).to_string(), "12.003400");
}
