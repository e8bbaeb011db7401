//! Station timer facility
//!
//! The station never blocks: it arms a self-timer through the host
//! [`Timer`] and is re-entered when the host delivers the expiry. Hosts
//! cannot remove scheduled events, so every expiry carries the sequence
//! number it was armed with and a [`SelfTimer`] only honours the most
//! recently armed one.
//
// https://github.com/rust-iot/dot11-mac
// Copyright 2021 Ryan Kurte

use crate::Ts;

/// Timer trait provides monotonic time and expiry scheduling to the station.
///
/// All times are monotonic and relative to the same unknown epoch
pub trait Timer {
    /// Returns the number of microsecond ticks since some unknown epoch
    fn ticks_us(&self) -> Ts;

    /// Returns the number of millisecond ticks since some unknown epoch
    fn ticks_ms(&self) -> Ts {
        self.ticks_us() / 1000
    }

    /// Deliver `handle` back to the station (via `Station::on_timer`) at `at`
    fn schedule(&mut self, at: Ts, handle: TimerHandle);
}

/// Reason a timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerPurpose {
    /// DIFS, EIFS or AIFS gap before contention
    Ifs,
    /// Backoff slots counted down
    Backoff,
    /// Virtual carrier sense reservation ends
    Nav,
    /// Hold for a CTS after sending an RTS
    CtsTimeout,
    /// Hold for an ACK after sending unicast data or management
    AckTimeout,
    /// Hold for data after sending a CTS
    DataTimeout,
    /// Hold for the AP response to a PS-Poll
    PsPollTimeout,
    /// Random delay before an IBSS beacon
    BeaconJitter,
    /// Power-save listen window starts
    Awake,
    /// Beacon transmission or reception is due
    BeaconDue,
    /// IBSS ATIM window closes
    AtimEnd,
}

/// Handle carried by a scheduled expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerHandle {
    pub seq: u32,
    pub purpose: TimerPurpose,
}

/// Sequence-stamped self-timer, at most one purpose is live at a time
#[derive(Debug, Clone, PartialEq)]
pub struct SelfTimer {
    seq: u32,
    live: Option<(TimerPurpose, Ts)>,
}

impl SelfTimer {
    pub fn new() -> Self {
        Self { seq: 0, live: None }
    }

    /// Arm the timer for `delay` from now, invalidating any prior expiry
    pub fn arm<T: Timer>(&mut self, timer: &mut T, delay: Ts, purpose: TimerPurpose) -> TimerHandle {
        self.seq = self.seq.wrapping_add(1);

        let at = timer.ticks_us() + delay;
        let handle = TimerHandle { seq: self.seq, purpose };

        self.live = Some((purpose, at));
        timer.schedule(at, handle);

        handle
    }

    /// Cancel by advancing the sequence, outstanding expiries become stale
    pub fn cancel(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.live = None;
    }

    /// Check whether `handle` matches the armed timer
    pub fn is_current(&self, handle: &TimerHandle) -> bool {
        match self.live {
            Some((purpose, _)) => handle.seq == self.seq && handle.purpose == purpose,
            None => false,
        }
    }

    /// Consume a matching expiry, returns false for stale handles
    pub fn expire(&mut self, handle: &TimerHandle) -> bool {
        if !self.is_current(handle) {
            return false;
        }

        self.live = None;
        true
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Purpose of the armed timer
    pub fn purpose(&self) -> Option<TimerPurpose> {
        self.live.map(|(p, _)| p)
    }

    /// Scheduled expiry time of the armed timer
    pub fn expiry(&self) -> Option<Ts> {
        self.live.map(|(_, at)| at)
    }
}

impl Default for SelfTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;

    #[derive(Debug, Default)]
    struct Inner {
        now: Ts,
        scheduled: Vec<(Ts, TimerHandle)>,
    }

    /// Mock timer implementation to assist with testing,
    /// records scheduled expiries for the test to deliver
    #[derive(Clone, Debug)]
    pub struct MockTimer (Arc<Mutex<Inner>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner::default())))
        }

        pub fn set_us(&mut self, val: Ts) {
            self.0.lock().unwrap().now = val;
        }

        pub fn inc(&mut self, us: Ts) {
            self.0.lock().unwrap().now += us;
        }

        pub fn val(&self) -> Ts {
            self.0.lock().unwrap().now
        }

        /// All expiries scheduled so far, stale ones included
        pub fn scheduled(&self) -> Vec<(Ts, TimerHandle)> {
            self.0.lock().unwrap().scheduled.clone()
        }

        /// Most recent expiry scheduled for `purpose`
        pub fn last(&self, purpose: TimerPurpose) -> Option<(Ts, TimerHandle)> {
            self.0.lock().unwrap().scheduled.iter()
                .rev()
                .find(|(_, h)| h.purpose == purpose)
                .cloned()
        }

        /// Remove and return the earliest scheduled expiry, advancing time to it
        pub fn pop(&mut self) -> Option<(Ts, TimerHandle)> {
            let mut inner = self.0.lock().unwrap();

            let idx = inner.scheduled.iter()
                .enumerate()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(i, _)| i)?;

            let (at, h) = inner.scheduled.remove(idx);
            if at > inner.now {
                inner.now = at;
            }

            Some((at, h))
        }

        pub fn clear(&mut self) {
            self.0.lock().unwrap().scheduled.clear();
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_us(&self) -> Ts {
            self.0.lock().unwrap().now
        }

        fn schedule(&mut self, at: Ts, handle: TimerHandle) {
            self.0.lock().unwrap().scheduled.push((at, handle));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::mock::MockTimer;

    #[test]
    fn arm_schedules_with_sequence() {
        let mut timer = MockTimer::new();
        let mut t = SelfTimer::new();

        timer.set_us(100);
        let h = t.arm(&mut timer, 50, TimerPurpose::Ifs);

        assert_eq!(h.seq, 1);
        assert_eq!(t.expiry(), Some(150));
        assert_eq!(timer.scheduled(), &[(150, h)]);
        assert!(t.is_current(&h));
    }

    #[test]
    fn rearm_makes_prior_stale() {
        let mut timer = MockTimer::new();
        let mut t = SelfTimer::new();

        let first = t.arm(&mut timer, 10, TimerPurpose::Ifs);
        let second = t.arm(&mut timer, 20, TimerPurpose::Backoff);

        assert!(!t.is_current(&first));
        assert!(!t.expire(&first));
        assert_eq!(t.purpose(), Some(TimerPurpose::Backoff));

        assert!(t.expire(&second));
        assert_eq!(t.purpose(), None);

        // A delivered expiry cannot fire twice
        assert!(!t.expire(&second));
    }

    #[test]
    fn cancel_invalidates_without_scheduling() {
        let mut timer = MockTimer::new();
        let mut t = SelfTimer::new();

        let h = t.arm(&mut timer, 10, TimerPurpose::AckTimeout);
        t.cancel();

        assert_eq!(t.seq(), 2);
        assert_eq!(timer.scheduled().len(), 1);
        assert!(!t.expire(&h));
    }

    #[test]
    fn purpose_must_match() {
        let mut timer = MockTimer::new();
        let mut t = SelfTimer::new();

        let h = t.arm(&mut timer, 10, TimerPurpose::CtsTimeout);
        let forged = TimerHandle{ seq: h.seq, purpose: TimerPurpose::AckTimeout };

        assert!(!t.is_current(&forged));
        assert!(t.is_current(&h));
    }
}
