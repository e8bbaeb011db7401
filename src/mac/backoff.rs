//! Backoff and retry engine
//!
//! Binary exponential backoff over a bounded contention window, plus the
//! short / long retry accounting that decides between retransmission and
//! dropping a frame once its retry limit is reached.

use log::{debug, warn};
use rand_core::RngCore;

use crate::Ts;

/// Contention window and backoff counter for one contender
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    cw: u16,
    cw_min: u16,
    cw_max: u16,
    slots: u32,
}

impl Backoff {
    pub fn new(cw_min: u16, cw_max: u16) -> Self {
        Self {
            cw: cw_min,
            cw_min,
            cw_max,
            slots: 0,
        }
    }

    /// Current contention window
    pub fn cw(&self) -> u16 {
        self.cw
    }

    pub fn bounds(&self) -> (u16, u16) {
        (self.cw_min, self.cw_max)
    }

    /// Remaining backoff slots
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Double the window, `CW' = min(cw_max, (CW + 1) * 2 - 1)`
    pub fn increase(&mut self) {
        let next = (self.cw as u32 + 1) * 2 - 1;
        self.cw = next.min(self.cw_max as u32) as u16;
    }

    /// Return the window to its minimum
    pub fn reset(&mut self) {
        self.cw = self.cw_min;
    }

    /// Draw a new counter uniformly from `[0, CW]`
    pub fn draw<R: RngCore>(&mut self, rng: &mut R) -> u32 {
        self.slots = rng.next_u32() % (self.cw as u32 + 1);
        self.slots
    }

    /// Draw a new counter only when the current one has run out
    pub fn set_if_zero<R: RngCore>(&mut self, rng: &mut R) -> u32 {
        if self.slots == 0 {
            self.draw(rng);
        }
        self.slots
    }

    /// Freeze the countdown after `elapsed` of idle medium, only whole
    /// slots count
    pub fn pause(&mut self, elapsed: Ts, slot_time: Ts) -> u32 {
        let done = (elapsed / slot_time.max(1)) as u32;
        self.slots = self.slots.saturating_sub(done);
        self.slots
    }

    /// Countdown complete
    pub fn clear(&mut self) {
        self.slots = 0;
    }
}

/// Short / long retry counts
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryCounters {
    pub short: u8,
    pub long: u8,
}

impl RetryCounters {
    pub fn reset(&mut self) {
        self.short = 0;
        self.long = 0;
    }

    pub fn is_zero(&self) -> bool {
        self.short == 0 && self.long == 0
    }

    fn get_mut(&mut self, class: RetryClass) -> &mut u8 {
        match class {
            RetryClass::Short => &mut self.short,
            RetryClass::Long => &mut self.long,
        }
    }
}

/// Retry limit applied to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Short,
    Long,
}

impl RetryClass {
    /// RTS attempts and frames at or below the RTS threshold use the short limit
    pub fn classify(frame_len: usize, rts_threshold: usize, awaiting_cts: bool) -> Self {
        if awaiting_cts || frame_len <= rts_threshold {
            RetryClass::Short
        } else {
            RetryClass::Long
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryLimits {
    pub short: u8,
    pub long: u8,
}

impl RetryLimits {
    fn get(&self, class: RetryClass) -> u8 {
        match class {
            RetryClass::Short => self.short,
            RetryClass::Long => self.long,
        }
    }
}

/// Outcome of a missed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retransmit, `attempt` retries made so far
    Retry { attempt: u8 },
    /// Retry limit reached, the frame must be dropped
    Exhausted,
}

/// Account for a missed CTS / ACK.
///
/// `global` is always updated, `per_ac` mirrors it when the station runs
/// EDCA. On retry the window doubles and a counter is drawn only if the
/// previous one ran out, on exhaustion the counter and window reset.
pub fn on_missed_response<R: RngCore>(
    class: RetryClass,
    limits: &RetryLimits,
    global: &mut RetryCounters,
    per_ac: Option<&mut RetryCounters>,
    backoff: &mut Backoff,
    rng: &mut R,
) -> RetryDecision {
    let limit = limits.get(class);

    let count = global.get_mut(class);
    *count = count.saturating_add(1);
    let attempt = *count;

    if let Some(ac) = per_ac {
        let c = ac.get_mut(class);
        *c = c.saturating_add(1);

        if attempt >= limit {
            *c = 0;
        }
    }

    if attempt < limit {
        backoff.increase();
        let slots = backoff.set_if_zero(rng);

        debug!("{:?} retry {} of {}, cw {} backoff {} slots", class, attempt, limit, backoff.cw(), slots);

        return RetryDecision::Retry{ attempt };
    }

    warn!("{:?} retry limit ({}) reached", class, limit);

    *global.get_mut(class) = 0;
    backoff.reset();

    RetryDecision::Exhausted
}

#[cfg(test)]
mod test {
    use rand::rngs::mock::StepRng;

    use super::*;

    const LIMITS: RetryLimits = RetryLimits{ short: 7, long: 4 };

    #[test]
    fn window_doubles_within_bounds() {
        let mut b = Backoff::new(15, 1023);
        let mut prev = b.cw();

        for _ in 0..10 {
            b.increase();

            assert_eq!(b.cw(), ((prev as u32 + 1) * 2 - 1).min(1023) as u16);
            assert!(b.cw() >= 15 && b.cw() <= 1023);
            prev = b.cw();
        }

        assert_eq!(b.cw(), 1023);

        b.reset();
        assert_eq!(b.cw(), 15);
    }

    #[test]
    fn draw_within_window() {
        let mut b = Backoff::new(7, 15);

        // Draws wrap into [0, CW]
        let mut rng = StepRng::new(13, 0);
        assert_eq!(b.draw(&mut rng), 5);

        // Existing counters are kept
        let mut rng = StepRng::new(2, 0);
        assert_eq!(b.set_if_zero(&mut rng), 5);

        b.clear();
        assert_eq!(b.set_if_zero(&mut rng), 2);
    }

    #[test]
    fn pause_counts_whole_slots() {
        let mut b = Backoff::new(31, 1023);
        let mut rng = StepRng::new(10, 0);
        b.draw(&mut rng);

        assert_eq!(b.pause(59, 20), 8);
        assert_eq!(b.pause(500, 20), 0);
    }

    #[test]
    fn monotonic_until_exhausted() {
        let mut rng = StepRng::new(0, 0);
        let mut b = Backoff::new(31, 1023);
        let mut global = RetryCounters::default();

        let mut prev = b.cw();
        for i in 1..LIMITS.short {
            let d = on_missed_response(RetryClass::Short, &LIMITS, &mut global, None, &mut b, &mut rng);

            assert_eq!(d, RetryDecision::Retry{ attempt: i });
            assert_eq!(b.cw(), ((prev as u32 + 1) * 2 - 1).min(1023) as u16);
            prev = b.cw();
        }

        let d = on_missed_response(RetryClass::Short, &LIMITS, &mut global, None, &mut b, &mut rng);
        assert_eq!(d, RetryDecision::Exhausted);
        assert_eq!(global.short, 0);
        assert_eq!(b.cw(), 31);
    }

    #[test]
    fn short_and_long_are_separate() {
        let mut rng = StepRng::new(0, 0);
        let mut b = Backoff::new(31, 1023);
        let mut global = RetryCounters::default();

        let class = RetryClass::classify(200, 500, false);
        assert_eq!(class, RetryClass::Short);
        on_missed_response(class, &LIMITS, &mut global, None, &mut b, &mut rng);
        assert_eq!(global, RetryCounters{ short: 1, long: 0 });

        let class = RetryClass::classify(1500, 500, false);
        assert_eq!(class, RetryClass::Long);
        on_missed_response(class, &LIMITS, &mut global, None, &mut b, &mut rng);
        assert_eq!(global, RetryCounters{ short: 1, long: 1 });

        // A missing CTS counts against the short limit regardless of size
        assert_eq!(RetryClass::classify(1500, 500, true), RetryClass::Short);
    }

    #[test]
    fn long_limit_exhausts() {
        let mut rng = StepRng::new(0, 0);
        let mut b = Backoff::new(31, 1023);
        let mut global = RetryCounters::default();

        for _ in 1..LIMITS.long {
            on_missed_response(RetryClass::Long, &LIMITS, &mut global, None, &mut b, &mut rng);
        }
        assert_eq!(global.long, 3);

        let d = on_missed_response(RetryClass::Long, &LIMITS, &mut global, None, &mut b, &mut rng);
        assert_eq!(d, RetryDecision::Exhausted);
        assert_eq!(global.long, 0);
    }

    #[test]
    fn per_category_mirror() {
        let mut rng = StepRng::new(0, 0);
        let mut b = Backoff::new(7, 15);
        let mut global = RetryCounters::default();
        let mut ac = RetryCounters::default();

        on_missed_response(RetryClass::Short, &LIMITS, &mut global, Some(&mut ac), &mut b, &mut rng);
        on_missed_response(RetryClass::Short, &LIMITS, &mut global, Some(&mut ac), &mut b, &mut rng);

        assert_eq!(global.short, 2);
        assert_eq!(ac.short, 2);
        assert_eq!(b.cw(), 15);
    }

    #[test]
    fn backoff_kept_across_retries() {
        let mut b = Backoff::new(31, 1023);
        let mut global = RetryCounters::default();

        let mut rng = StepRng::new(9, 0);
        b.draw(&mut rng);

        // Counter still running, no redraw
        let mut rng = StepRng::new(3, 0);
        on_missed_response(RetryClass::Short, &LIMITS, &mut global, None, &mut b, &mut rng);
        assert_eq!(b.slots(), 9);

        // Counter ran out, redraw from the doubled window
        b.clear();
        on_missed_response(RetryClass::Short, &LIMITS, &mut global, None, &mut b, &mut rng);
        assert_eq!(b.slots(), 3);
    }
}
