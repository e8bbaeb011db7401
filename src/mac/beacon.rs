//! Beacon and power-save coordination
//!
//! IBSS members share beacon generation: each schedules a beacon every
//! interval after a random jitter and abandons it on hearing a peer's.
//! Infrastructure stations track the AP's beacons, counting misses and,
//! with power save enabled, use the TIM to decide between polling for
//! buffered frames and sleeping until the next listen window.
//
// https://github.com/rust-iot/dot11-mac
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use log::{trace, debug, info, warn};
use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::{Beacon, Frame, Tim, TIME_UNIT_US};
use crate::phy::{Phy, PhyStatus};
use crate::timer::{SelfTimer, Timer, TimerHandle, TimerPurpose};

use super::config::Role;
use super::station::{Station, State};
use super::stats::inc;
use super::Network;

/// Capability bit advertised by IBSS members
pub const CAPABILITY_IBSS: u16 = 0x0002;

/// Beacon tracking / generation state
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconState {
    pub(crate) timer: SelfTimer,
    /// An IBSS beacon is waiting for the medium
    pub(crate) due: bool,
    pub(crate) interval_us: Ts,
    /// Arrival of the last beacon from our AP
    pub(crate) last_beacon: Option<Ts>,
    /// Consecutive beacons missed while awake
    pub(crate) missed: u32,
    /// DTIM count for the next IBSS beacon
    pub(crate) dtim_count: u8,
}

impl BeaconState {
    pub(crate) fn new(interval_us: Ts) -> Self {
        Self {
            timer: SelfTimer::new(),
            due: false,
            interval_us,
            last_beacon: None,
            missed: 0,
            dtim_count: 0,
        }
    }

    pub fn interval_us(&self) -> Ts {
        self.interval_us
    }

    pub fn last_beacon(&self) -> Option<Ts> {
        self.last_beacon
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

/// Power-save state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PowerSave {
    pub(crate) asleep: bool,
    /// AP buffers group traffic, delivered after the DTIM beacon
    pub(crate) ap_broadcast: bool,
    /// AP buffers unicast traffic for us
    pub(crate) ap_unicast: bool,
    /// PS-Poll waiting to be sent
    pub(crate) poll_pending: bool,
    /// PS-Poll acknowledged, data to follow
    pub(crate) poll_acked: bool,
    pub(crate) dtim_count: u8,
    pub(crate) dtim_period: u8,
    /// Wake time while asleep
    pub(crate) next_awake: Option<Ts>,
}

impl PowerSave {
    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn ap_broadcast(&self) -> bool {
        self.ap_broadcast
    }

    pub fn ap_unicast(&self) -> bool {
        self.ap_unicast
    }

    pub fn poll_pending(&self) -> bool {
        self.poll_pending
    }

    /// Start of the next listen window while asleep
    pub fn next_awake(&self) -> Option<Ts> {
        self.next_awake
    }
}

impl <P, E, N, T, G> Station<P, N, T, G>
where
    P: Phy<Error=E>,
    E: Debug,
    N: Network,
    T: Timer,
    G: RngCore,
{
    pub fn is_asleep(&self) -> bool {
        self.ps.asleep
    }

    pub fn power_save(&self) -> &PowerSave {
        &self.ps
    }

    pub fn beacons(&self) -> &BeaconState {
        &self.beacon
    }

    /// Beacon interval elapsed.
    ///
    /// IBSS stations contend to send a beacon, infrastructure stations
    /// count a missed beacon (unless asleep) and request reassociation
    /// once too many are missed.
    pub fn on_beacon_due(&mut self) -> Result<(), CoreError<E>> {
        match self.config.role {
            Role::Ibss{ .. } => {
                self.beacon.due = true;

                if self.ps.asleep {
                    self.wake()?;
                } else {
                    self.handle_due_beacon()?;
                }
            },
            Role::Infrastructure{ .. } => {
                if !self.ps.asleep {
                    self.beacon.missed += 1;
                    inc(&mut self.stats.beacons_missed);
                    debug!("Missed beacon ({} consecutive)", self.beacon.missed);
                }

                if self.beacon.missed > self.config.beacon.max_missed {
                    warn!("{} beacons missed, requesting reassociation", self.beacon.missed);

                    self.network.reassociate();
                    inc(&mut self.stats.reassociations);
                    self.beacon.missed = 0;
                }

                self.start_beacon_timer();
            },
        }

        Ok(())
    }

    /// Arm the beacon timer one interval from now, infrastructure stations
    /// allow a time unit of lateness before counting a miss
    pub(crate) fn start_beacon_timer(&mut self) {
        let delay = match self.config.role {
            Role::Ibss{ .. } => self.beacon.interval_us,
            Role::Infrastructure{ .. } => self.beacon.interval_us + TIME_UNIT_US,
        };

        let h = self.beacon.timer.arm(&mut self.timer, delay, TimerPurpose::BeaconDue);
        trace!("Beacon timer {} in {} us", h.seq, delay);
    }

    /// Start a due IBSS beacon if the station can, returns true when the
    /// beacon now owns the medium
    pub(crate) fn handle_due_beacon(&mut self) -> Result<bool, CoreError<E>> {
        if !matches!(self.config.role, Role::Ibss{ .. }) {
            self.beacon.due = false;
            return Ok(false)
        }

        let status = self.phy.status().map_err(CoreError::Phy)?;
        if status != PhyStatus::Idle {
            debug!("Beacon deferred, medium {}", status);
            return Ok(false)
        }

        match self.state {
            State::Idle | State::WaitDifsOrEifs => {
                self.exchange_timer.cancel();

                let window = 2 * self.config.cw_min as u32 + 1;
                let slots = self.rng.next_u32() % window;

                debug!("Beacon after {} slots jitter", slots);

                self.set_state(State::WaitForIbssJitter);
                self.arm(slots as Ts * self.config.slot_time_us, TimerPurpose::BeaconJitter);

                Ok(true)
            },
            State::Backoff => {
                let now = self.timer.ticks_us();
                let remaining = self.pause_backoff(now);
                self.exchange_timer.cancel();

                debug!("Beacon preempts backoff, {} slots kept", remaining);

                self.transmit_beacon()?;
                Ok(true)
            },
            State::WaitForIbssJitter => Ok(true),
            s => {
                trace!("Beacon deferred in state {}", s);
                Ok(false)
            },
        }
    }

    pub(crate) fn beacon_jitter_elapsed(&mut self, handle: &TimerHandle) -> Result<(), CoreError<E>> {
        let status = self.phy.status().map_err(CoreError::Phy)?;
        if status != PhyStatus::Idle {
            // Retried when the medium is next idle
            self.exchange_timer.expire(handle);
            self.set_state(State::Idle);
            return Ok(())
        }

        self.transmit_beacon()?;
        self.exchange_timer.expire(handle);

        Ok(())
    }

    fn transmit_beacon(&mut self) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();
        let dtim_period = self.config.beacon.dtim_period.max(1);

        let b = Beacon {
            timestamp: now,
            interval_tu: (self.beacon.interval_us / TIME_UNIT_US) as u16,
            capability: CAPABILITY_IBSS,
            tim: Some(Tim::new(self.beacon.dtim_count, dtim_period, false, &[])),
        };
        let frame = Frame::beacon(self.config.address, self.config.role.bssid(), &b)?;

        debug!("Sending beacon at {} us (DTIM count {})", now, self.beacon.dtim_count);

        self.send(&frame, State::TransmittingBeacon, self.config.basic_rate, 0)
    }

    pub(crate) fn beacon_sent(&mut self) -> Result<(), CoreError<E>> {
        inc(&mut self.stats.beacons_sent);

        let period = self.config.beacon.dtim_period.max(1);
        self.beacon.dtim_count = match self.beacon.dtim_count {
            0 => period - 1,
            c => c - 1,
        };
        self.beacon.due = false;

        self.set_state(State::Idle);
        self.start_beacon_timer();

        if self.ibss_ps() {
            return self.start_atim_window()
        }

        self.check_for_outgoing(false)
    }

    pub(crate) fn handle_beacon(&mut self, frame: &Frame) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        let beacon = match Beacon::decode(frame.body()) {
            Ok(b) => b,
            Err(e) => {
                debug!("Invalid beacon body: {:?}", e);
                inc(&mut self.stats.rx_errors);
                return Ok(())
            },
        };

        if frame.bssid != Some(self.config.role.bssid()) {
            trace!("Beacon from foreign BSS {:?}", frame.bssid);
            return Ok(())
        }

        inc(&mut self.stats.beacons_received);

        if beacon.interval_tu > 0 {
            self.beacon.interval_us = beacon.interval_us();
        }

        match self.config.role {
            Role::Ibss{ .. } => {
                if self.state == State::WaitForIbssJitter {
                    self.exchange_timer.cancel();
                    self.set_state(State::Idle);
                }

                if self.beacon.due {
                    debug!("Beacon from {:?} heard, ours cancelled", frame.transmitter);

                    inc(&mut self.stats.beacons_cancelled);
                    self.beacon.due = false;
                }

                self.start_beacon_timer();

                if self.ibss_ps() {
                    self.start_atim_window()?;
                }
            },
            Role::Infrastructure{ .. } => {
                trace!("AP beacon at {} us", now);

                self.beacon.last_beacon = Some(now);
                self.beacon.missed = 0;
                self.start_beacon_timer();

                if self.ps_active() {
                    self.process_tim(beacon.tim.as_ref())?;
                }
            },
        }

        Ok(())
    }

    fn process_tim(&mut self, tim: Option<&Tim>) -> Result<(), CoreError<E>> {
        let aid = match self.config.role {
            Role::Infrastructure{ aid, .. } => aid,
            Role::Ibss{ .. } => return Ok(()),
        };

        let tim = match tim {
            Some(t) => t,
            None => {
                warn!("AP beacon carries no TIM, staying awake");
                return Ok(())
            },
        };

        inc(&mut self.stats.tim_received);
        if tim.is_dtim() {
            inc(&mut self.stats.dtim_received);
        }

        self.ps.dtim_count = tim.dtim_count;
        self.ps.dtim_period = tim.dtim_period;
        self.ps.ap_broadcast = tim.is_dtim() && tim.broadcast_buffered();
        self.ps.ap_unicast = tim.unicast_buffered(aid);
        self.ps.poll_acked = false;

        debug!("TIM (DTIM count {}): unicast {}, broadcast {}",
            tim.dtim_count, self.ps.ap_unicast, self.ps.ap_broadcast);

        self.check_for_outgoing(false)
    }

    /// Next listen window, one time unit ahead of the expected beacon
    fn next_listen(&self, last_beacon: Ts) -> Ts {
        let ps = &self.config.power_save;
        let mut beacons = ps.listen_interval.max(1) as Ts;

        if ps.receive_dtim && self.ps.dtim_period > 0 {
            let to_dtim = match self.ps.dtim_count {
                0 => self.ps.dtim_period,
                c => c,
            };
            beacons = beacons.min(to_dtim as Ts);
        }

        (last_beacon + beacons * self.beacon.interval_us).saturating_sub(TIME_UNIT_US)
    }

    /// Power down until the next listen window if no traffic is pending
    pub(crate) fn sleep_if_no_data(&mut self) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        if !self.ps_active() || self.ps.asleep || self.state != State::Idle {
            return Ok(())
        }

        if self.ps.ap_broadcast || self.ps.ap_unicast || self.ps.poll_pending || self.has_pending_work() {
            trace!("Traffic pending, staying awake");
            return Ok(())
        }

        let last = match self.beacon.last_beacon {
            Some(t) if self.beacon.missed == 0 => t,
            _ => return Ok(()),
        };

        let wake_at = self.next_listen(last);
        if wake_at <= now {
            return Ok(())
        }

        self.arm(wake_at - now, TimerPurpose::Awake);
        self.phy.sleep().map_err(CoreError::Phy)?;

        self.ps.asleep = true;
        self.ps.next_awake = Some(wake_at);
        inc(&mut self.stats.sleeps);

        info!("Sleeping until {} us", wake_at);

        Ok(())
    }

    pub(crate) fn wake(&mut self) -> Result<(), CoreError<E>> {
        self.phy.listen().map_err(CoreError::Phy)?;

        self.ps.asleep = false;
        self.ps.next_awake = None;

        info!("Awake at {} us", self.timer.ticks_us());

        // Packets deferred while asleep contend now, the backoff left
        // frozen when sleeping resumes as is
        self.check_for_outgoing(false)
    }
}

#[cfg(test)]
mod test {
    use crate::frame::{Address, FrameFlags, FrameType};
    use crate::mac::config::{BeaconConfig, Config, PowerSaveConfig};
    use crate::mac::station::test::*;
    use crate::phy::PhyStatus;
    use crate::timer::TimerPurpose;

    use super::*;

    fn ibss() -> Config {
        Config{ role: Role::Ibss{ bssid: addr(BSSID) }, ..config() }
    }

    fn power_save(listen_interval: u16, receive_dtim: bool) -> Config {
        Config {
            power_save: PowerSaveConfig{ enabled: true, listen_interval, receive_dtim, ..Default::default() },
            ..config()
        }
    }

    #[test]
    fn beacon_preempts_backoff() {
        let mut h = setup(ibss(), 3);

        h.phy.set_status(PhyStatus::Busy);
        h.network.push(addr(PEER), 0, &[0u8; 64]);
        h.mac.on_packet_ready().unwrap();
        h.phy.set_status(PhyStatus::Idle);
        h.mac.on_phy_idle().unwrap();
        h.fire(TimerPurpose::Ifs);

        assert_eq!(h.mac.state(), State::Backoff);
        assert_eq!(h.mac.backoff_slots(), 3);

        h.mac.on_beacon_due().unwrap();
        assert_eq!(h.mac.state(), State::TransmittingBeacon);
        assert_eq!(h.mac.backoff_slots(), 3);
        assert_eq!(h.mac.armed(), None);

        let sent = h.phy.last_sent().unwrap();
        assert_eq!(sent.kind, FrameType::Beacon);
        assert_eq!(sent.frame().receiver, Address::BROADCAST);

        h.tx_done();
        assert_eq!(h.mac.stats().beacons_sent, 1);
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);

        // Contention resumes with the preserved count
        h.fire(TimerPurpose::Ifs);
        assert_eq!(h.mac.state(), State::Backoff);
        let (at, _) = h.timer.last(TimerPurpose::Backoff).unwrap();
        assert_eq!(at, h.timer.val() + 3 * 20);
    }

    #[test]
    fn beacon_after_jitter() {
        let mut h = setup(ibss(), 3);

        h.fire(TimerPurpose::BeaconDue);
        assert_eq!(h.mac.state(), State::WaitForIbssJitter);

        let (at, _) = h.timer.last(TimerPurpose::BeaconJitter).unwrap();
        assert_eq!(at, h.timer.val() + 3 * 20);

        h.fire(TimerPurpose::BeaconJitter);
        assert_eq!(h.mac.state(), State::TransmittingBeacon);

        let f = h.phy.last_sent().unwrap().frame();
        let b = Beacon::decode(f.body()).unwrap();
        assert_eq!(b.interval_tu, 100);
        assert_eq!(b.capability, CAPABILITY_IBSS);

        let before = h.timer.val();
        h.tx_done();
        assert_eq!(h.mac.state(), State::Idle);

        let (at, _) = h.timer.last(TimerPurpose::BeaconDue).unwrap();
        assert_eq!(at, before + 102_400);
    }

    #[test]
    fn peer_beacon_cancels_ours() {
        let mut h = setup(ibss(), 3);

        h.fire(TimerPurpose::BeaconDue);
        let (_, jitter) = h.timer.last(TimerPurpose::BeaconJitter).unwrap();

        h.beacon(None);
        assert_eq!(h.mac.state(), State::Idle);
        assert_eq!(h.mac.stats().beacons_cancelled, 1);
        assert!(!h.mac.beacons().due);

        let before = h.snapshot();
        h.mac.on_timer(jitter).unwrap();
        assert_eq!(h.snapshot(), before);
        assert!(h.phy.sent().is_empty());
    }

    #[test]
    fn missed_beacons_reassociate() {
        let cfg = Config{
            beacon: BeaconConfig{ max_missed: 2, ..Default::default() },
            ..config()
        };
        let mut h = setup(cfg, 0);

        h.fire(TimerPurpose::BeaconDue);
        h.fire(TimerPurpose::BeaconDue);
        assert_eq!(h.mac.beacons().missed(), 2);
        assert_eq!(h.network.reassociations(), 0);

        h.fire(TimerPurpose::BeaconDue);
        assert_eq!(h.network.reassociations(), 1);
        assert_eq!(h.mac.beacons().missed(), 0);
        assert_eq!(h.mac.stats().beacons_missed, 3);

        // A received beacon clears the count
        h.fire(TimerPurpose::BeaconDue);
        h.beacon(None);
        assert_eq!(h.mac.beacons().missed(), 0);
    }

    #[test]
    fn sleeps_until_listen_window() {
        let mut h = setup(power_save(1, true), 0);

        h.beacon(Some(Tim::new(1, 3, false, &[])));

        let wake_at = 1_000 + 102_400 - 1_024;
        assert!(h.mac.is_asleep());
        assert_eq!(h.phy.sleeps(), 1);
        assert_eq!(h.mac.power_save().next_awake(), Some(wake_at));
        assert_eq!(h.timer.last(TimerPurpose::Awake).unwrap().0, wake_at);

        // Packets stay with the network layer while asleep
        h.network.push(addr(PEER), 0, &[0u8; 64]);
        h.mac.on_packet_ready().unwrap();
        assert_eq!(h.network.pending(), 1);
        assert_eq!(h.mac.state(), State::Idle);

        // Beacons are not counted missed while asleep
        let (_, due) = h.timer.last(TimerPurpose::BeaconDue).unwrap();
        h.mac.on_timer(due).unwrap();
        assert_eq!(h.mac.beacons().missed(), 0);

        h.fire(TimerPurpose::Awake);
        assert!(!h.mac.is_asleep());
        assert_eq!(h.phy.listens(), 2);
        assert_eq!(h.network.pending(), 0);
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);
    }

    #[test]
    fn listen_interval_and_dtim() {
        // Woken early for the DTIM beacon
        let mut h = setup(power_save(3, true), 0);
        h.beacon(Some(Tim::new(2, 3, false, &[])));
        assert_eq!(h.mac.power_save().next_awake(), Some(1_000 + 2 * 102_400 - 1_024));

        // Listen interval alone
        let mut h = setup(power_save(3, false), 0);
        h.beacon(Some(Tim::new(2, 3, false, &[])));
        assert_eq!(h.mac.power_save().next_awake(), Some(1_000 + 3 * 102_400 - 1_024));
    }

    #[test]
    fn poll_for_buffered_frames() {
        let mut h = setup(power_save(1, true), 0);

        h.beacon(Some(Tim::new(1, 3, false, &[5])));
        assert!(!h.mac.is_asleep());
        assert!(h.mac.power_save().ap_unicast());
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);

        h.fire(TimerPurpose::Ifs);
        assert_eq!(h.mac.state(), State::TransmittingPsPoll);

        let poll = h.phy.last_sent().unwrap().frame();
        assert_eq!(poll.kind, FrameType::PsPoll);
        assert_eq!(poll.aid(), Some(5));
        assert_eq!(poll.receiver, addr(BSSID));

        h.tx_done();
        assert_eq!(h.mac.state(), State::WaitForPsPollAck);

        // AP answers directly with data, more to follow
        let mut data = Frame::data(addr(STA), addr(BSSID), addr(BSSID), &[1]).unwrap();
        data.flags.insert(FrameFlags::MORE_DATA);
        h.receive(&data);
        assert_eq!(h.mac.state(), State::TransmittingAck);

        h.tx_done();
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);

        // Second poll acknowledged, data follows later
        h.fire(TimerPurpose::Ifs);
        h.tx_done();
        h.receive(&Frame::ack(addr(STA), 0));
        assert_eq!(h.mac.state(), State::Idle);
        assert!(!h.mac.is_asleep());

        let mut data = Frame::data(addr(STA), addr(BSSID), addr(BSSID), &[2]).unwrap();
        data.seq = 1;
        h.receive(&data);
        h.tx_done();

        assert_eq!(h.network.delivered().len(), 2);
        assert_eq!(h.mac.stats().ps_polls_sent, 2);
        assert!(h.mac.is_asleep());
    }

    #[test]
    fn awake_for_dtim_broadcast() {
        let mut h = setup(power_save(1, true), 0);

        h.beacon(Some(Tim::new(0, 3, true, &[])));
        assert!(h.mac.power_save().ap_broadcast());
        assert!(!h.mac.is_asleep());
        assert_eq!(h.mac.stats().dtim_received, 1);

        let group = Frame::data(Address::BROADCAST, addr(BSSID), addr(BSSID), &[3]).unwrap();
        h.receive(&group);
        assert!(!h.mac.power_save().ap_broadcast());

        h.mac.on_phy_idle().unwrap();
        assert!(h.mac.is_asleep());

        // Next DTIM is a full period away
        assert_eq!(h.mac.power_save().next_awake(), Some(1_000 + 102_400 - 1_024));
    }

    #[test]
    fn ap_without_tim_keeps_awake() {
        let mut h = setup(power_save(1, true), 0);

        h.beacon(None);
        assert!(!h.mac.is_asleep());
        assert_eq!(h.mac.beacons().last_beacon(), Some(1_000));
    }
}
