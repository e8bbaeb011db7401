//! Channel-access state machine
//!
//! The station is driven entirely by host events (packet ready, frame
//! received, PHY busy / idle, timer expiry, transmission complete and
//! beacon due) and never blocks. Every handler runs to completion and
//! leaves the station in a well defined [`State`].
//
// https://github.com/rust-iot/dot11-mac
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use heapless::spsc::Queue;
use heapless::Vec;
use log::{trace, debug, warn, error};
use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::{Address, Frame, FrameFlags, FrameType, ACK_LEN, CTS_LEN, MAX_FRAME_LEN};
use crate::phy::{DataRate, Phy, PhyStatus};
use crate::timer::{SelfTimer, Timer, TimerHandle, TimerPurpose};

use super::atim::AtimState;
use super::backoff::{self, Backoff, RetryClass, RetryCounters, RetryDecision, RetryLimits};
use super::beacon::{BeaconState, PowerSave};
use super::config::{Config, Role};
use super::queue::{AccessCategory, AcSet, FrameDescriptor, Outcome};
use super::stats::{inc, MacStats};
use super::{Network, Outgoing};

/// Pending management frames, drained ahead of network traffic
pub const MGMT_QUEUE_LEN: usize = 4;

/// Recent (transmitter, sequence) pairs kept for duplicate detection
const RX_CACHE_LEN: usize = 8;

/// Channel access states
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Idle,
    Backoff,
    WaitDifsOrEifs,
    WaitForNav,
    WaitForIbssJitter,

    WaitForCts,
    WaitForData,
    WaitForAck,
    WaitForPsPollAck,
    WaitForAtimAck,

    TransmittingRts,
    TransmittingCts,
    TransmittingUnicastData,
    TransmittingBroadcastData,
    TransmittingAck,
    TransmittingBeacon,
    TransmittingManagement,
    TransmittingPsPoll,
    TransmittingAtim,
}

impl State {
    pub fn is_transmitting(&self) -> bool {
        use State::*;
        matches!(self, TransmittingRts | TransmittingCts | TransmittingUnicastData
            | TransmittingBroadcastData | TransmittingAck | TransmittingBeacon
            | TransmittingManagement | TransmittingPsPoll | TransmittingAtim)
    }

    /// Holding for a CTS or ACK to our own transmission
    pub fn awaits_response(&self) -> bool {
        matches!(self, State::WaitForCts | State::WaitForAck | State::WaitForPsPollAck | State::WaitForAtimAck)
    }

    /// Deferring for the medium, interrupted by receptions
    pub fn is_contending(&self) -> bool {
        matches!(self, State::Backoff | State::WaitDifsOrEifs | State::WaitForNav | State::WaitForIbssJitter)
    }
}

/// IEEE 802.11 station MAC
///
/// Generic over a PHY (P), network layer (N), timer (T) and random source (G)
pub struct Station<P, N, T, G> {
    pub(crate) config: Config,

    pub(crate) phy: P,
    pub(crate) network: N,
    pub(crate) timer: T,
    pub(crate) rng: G,

    pub(crate) state: State,

    pub(crate) acs: AcSet,
    /// Contention for power-save signalling owned by no category (PS-Poll, ATIM)
    pub(crate) ps_backoff: Backoff,
    /// Retry counts for power-save signalling
    pub(crate) ps_retries: RetryCounters,
    /// Station short / long retry counts for the selected frame
    pub(crate) retries: RetryCounters,

    /// Timer for IFS, backoff, NAV, response holds and sleep
    pub(crate) exchange_timer: SelfTimer,
    /// Start of the current backoff countdown
    pub(crate) backoff_started: Option<Ts>,

    /// Virtual carrier sense, medium reserved until this time
    pub(crate) nav: Ts,
    /// Next contention defers for EIFS after a corrupted reception
    pub(crate) use_eifs: bool,

    seq: u16,
    rx_cache: Vec<(Address, u16), RX_CACHE_LEN>,
    pub(crate) mgmt: Queue<Frame, { MGMT_QUEUE_LEN + 1 }>,

    pub(crate) beacon: BeaconState,
    pub(crate) ps: PowerSave,
    pub(crate) atim: AtimState,

    pub(crate) stats: MacStats,
}

/// Backoff of whichever frame holds the contention
fn active_backoff<'a>(acs: &'a mut AcSet, ps_backoff: &'a mut Backoff) -> &'a mut Backoff {
    match acs.selected() {
        Some(ac) => acs.backoff_mut(ac),
        None => ps_backoff,
    }
}

/// Clamp a time in microseconds to a duration field
fn duration_field(us: Ts) -> u16 {
    us.min(0x7fff) as u16
}

impl <P, E, N, T, G> Station<P, N, T, G>
where
    P: Phy<Error=E>,
    E: Debug,
    N: Network,
    T: Timer,
    G: RngCore,
{
    /// Create a new station, the PHY is placed in receive and the beacon
    /// timer armed
    pub fn new(config: Config, phy: P, network: N, timer: T, rng: G) -> Result<Self, CoreError<E>> {
        config.validate().map_err(CoreError::InvalidConfig)?;

        let (cw_min, cw_max) = config.cw_bounds(AccessCategory::BestEffort);
        let interval = config.beacon_interval_us();

        let mut s = Self {
            acs: AcSet::new(&config),
            ps_backoff: Backoff::new(cw_min, cw_max),
            ps_retries: RetryCounters::default(),
            retries: RetryCounters::default(),

            state: State::Idle,

            exchange_timer: SelfTimer::new(),
            backoff_started: None,

            nav: 0,
            use_eifs: false,

            seq: 0,
            rx_cache: Vec::new(),
            mgmt: Queue::new(),

            beacon: BeaconState::new(interval),
            ps: PowerSave::default(),
            atim: AtimState::default(),

            stats: MacStats::new(),

            config,
            phy,
            network,
            timer,
            rng,
        };

        debug!("Station {:?} starting ({:?}, qos: {})", s.config.address, s.config.role, s.config.qos);

        s.phy.listen().map_err(CoreError::Phy)?;
        s.start_beacon_timer();

        Ok(s)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    pub fn queues(&self) -> &AcSet {
        &self.acs
    }

    /// Retry counters of the frame holding the contention
    pub fn retries(&self) -> RetryCounters {
        self.retries
    }

    /// Retry counters for PS-Poll and ATIM frames
    pub fn ps_retries(&self) -> RetryCounters {
        self.ps_retries
    }

    /// End of the current medium reservation
    pub fn nav(&self) -> Ts {
        self.nav
    }

    /// Whether the next contention uses EIFS
    pub fn uses_eifs(&self) -> bool {
        self.use_eifs
    }

    /// Purpose of the live exchange timer, if any
    pub fn armed(&self) -> Option<TimerPurpose> {
        self.exchange_timer.purpose()
    }

    /// Backoff slots remaining for the frame holding contention
    pub fn backoff_slots(&self) -> u32 {
        match self.acs.selected() {
            Some(ac) => self.acs.queue(ac).backoff().slots(),
            None => self.ps_backoff.slots(),
        }
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Queue a management frame, these contend ahead of network traffic
    pub fn enqueue_management(&mut self, mut frame: Frame) -> Result<(), CoreError<E>> {
        frame.seq = self.next_seq();
        if self.config.power_save.enabled {
            frame.flags.insert(FrameFlags::PWR_MGT);
        }

        debug!("Queue {} management frame to {:?}", frame.kind, frame.receiver);

        self.mgmt.enqueue(frame).map_err(|_| CoreError::BufferFull)?;

        self.on_packet_ready()
    }

    /// Network layer has a packet waiting
    pub fn on_packet_ready(&mut self) -> Result<(), CoreError<E>> {
        if self.ps.asleep {
            debug!("Asleep, packet deferred to next listen window");
            return Ok(())
        }

        self.fill_queues()?;

        if self.state != State::Idle {
            trace!("Packet ready in state {}, contention pending", self.state);
            return Ok(())
        }

        if self.ibss_ps() {
            return self.check_for_outgoing(false)
        }

        if self.acs.select().is_none() {
            return Ok(())
        }

        let status = self.phy.status().map_err(CoreError::Phy)?;
        if status != PhyStatus::Idle {
            let slots = self.set_backoff_if_zero();
            debug!("Medium {}, backoff {} slots", status, slots);
            return Ok(())
        }

        self.attempt_wait_difs()
    }

    /// Received frame from the PHY (without FCS)
    pub fn on_frame_received(&mut self, data: &[u8]) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                debug!("Receive error {:?} at {} us, deferring with EIFS", e, now);

                inc(&mut self.stats.rx_errors);
                self.use_eifs = true;

                if self.state.awaits_response() {
                    return self.missed_response();
                }
                return Ok(())
            },
        };

        self.use_eifs = false;

        let for_us = frame.receiver == self.config.address;

        trace!("Received {} from {:?} to {:?} in state {}", frame.kind, frame.transmitter, frame.receiver, self.state);

        // Anything other than the expected response means it is not coming
        if self.state.awaits_response() && !(for_us && self.is_expected_response(&frame)) {
            debug!("Received {} while in {}, response missed", frame.kind, self.state);
            self.missed_response()?;
        }

        if !for_us && !frame.is_group() {
            self.update_nav(&frame, now);
            return Ok(())
        }

        match frame.kind {
            FrameType::Cts if self.state == State::WaitForCts => self.handle_cts(),
            FrameType::Ack if self.state == State::WaitForAck => self.handle_ack(),
            FrameType::Ack if self.state == State::WaitForPsPollAck => self.handle_ps_poll_ack(),
            FrameType::Ack if self.state == State::WaitForAtimAck => self.handle_atim_ack(),
            FrameType::Rts => self.handle_rts(&frame, now),
            FrameType::Beacon => self.handle_beacon(&frame),
            FrameType::Atim => self.handle_atim(&frame, now),
            k if k.is_data() || k.is_management() => self.handle_data(&frame),
            k => {
                debug!("Ignoring {} in state {}", k, self.state);
                Ok(())
            },
        }
    }

    /// Medium became busy
    pub fn on_phy_busy(&mut self) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        match self.state {
            State::Backoff => {
                let remaining = self.pause_backoff(now);
                debug!("Medium busy, backoff paused with {} slots", remaining);

                self.exchange_timer.cancel();
                self.set_state(State::Idle);
            },
            State::WaitDifsOrEifs | State::WaitForNav | State::WaitForIbssJitter | State::WaitForData => {
                self.exchange_timer.cancel();
                self.set_state(State::Idle);
            },
            _ => (),
        }

        Ok(())
    }

    /// Medium became idle
    pub fn on_phy_idle(&mut self) -> Result<(), CoreError<E>> {
        if self.ps.asleep {
            return Ok(())
        }

        if self.state != State::Idle {
            return Ok(())
        }

        if self.beacon.due && self.handle_due_beacon()? {
            return Ok(())
        }

        if self.acs.selected().is_some() || self.ps.poll_pending || self.atim.pending.is_some() {
            self.attempt_wait_difs()
        } else {
            self.check_for_outgoing(false)
        }
    }

    /// PHY finished transmitting
    pub fn on_tx_complete(&mut self) -> Result<(), CoreError<E>> {
        match self.state {
            State::TransmittingRts => {
                self.set_state(State::WaitForCts);
                self.arm(self.response_timeout(), TimerPurpose::CtsTimeout);
            },
            State::TransmittingCts => {
                let p = self.config.propagation_delay_us;
                self.set_state(State::WaitForData);
                self.arm(2 * p + self.config.sifs_us + self.config.slot_time_us, TimerPurpose::DataTimeout);
            },
            State::TransmittingUnicastData | State::TransmittingManagement if !self.selected_is_group() => {
                self.set_state(State::WaitForAck);
                self.arm(self.response_timeout(), TimerPurpose::AckTimeout);
            },
            State::TransmittingBroadcastData | State::TransmittingManagement => {
                inc(&mut self.stats.broadcast_sent);

                if let Some(ac) = self.acs.selected() {
                    self.acs.complete(ac, Outcome::Success, &mut self.network);
                }
                self.retries.reset();

                self.set_state(State::Idle);
                self.check_for_outgoing(true)?;
            },
            State::TransmittingAck => {
                self.set_state(State::Idle);
                self.check_for_outgoing(false)?;
            },
            State::TransmittingBeacon => {
                self.beacon_sent()?;
            },
            State::TransmittingPsPoll => {
                self.set_state(State::WaitForPsPollAck);
                self.arm(self.response_timeout(), TimerPurpose::PsPollTimeout);
            },
            State::TransmittingAtim => {
                self.atim_sent()?;
            },
            s => {
                error!("Transmit complete in state {}", s);
                return Err(CoreError::InvalidState(s))
            },
        }

        Ok(())
    }

    /// Timer expiry delivered by the host
    pub fn on_timer(&mut self, handle: TimerHandle) -> Result<(), CoreError<E>> {
        match handle.purpose {
            TimerPurpose::BeaconDue => {
                if !self.beacon.timer.expire(&handle) {
                    trace!("Stale beacon timer {}", handle.seq);
                    return Ok(())
                }
                return self.on_beacon_due()
            },
            TimerPurpose::AtimEnd => {
                if !self.atim.timer.expire(&handle) {
                    trace!("Stale ATIM window timer {}", handle.seq);
                    return Ok(())
                }
                return self.atim_window_elapsed()
            },
            _ => (),
        }

        if !self.exchange_timer.is_current(&handle) {
            trace!("Stale {} timer {} (current {})", handle.purpose, handle.seq, self.exchange_timer.seq());
            return Ok(())
        }

        let valid = matches!((self.state, handle.purpose),
            (State::WaitDifsOrEifs, TimerPurpose::Ifs)
            | (State::Backoff, TimerPurpose::Backoff)
            | (State::WaitForNav, TimerPurpose::Nav)
            | (State::WaitForCts, TimerPurpose::CtsTimeout)
            | (State::WaitForAck, TimerPurpose::AckTimeout)
            | (State::WaitForAtimAck, TimerPurpose::AckTimeout)
            | (State::WaitForPsPollAck, TimerPurpose::PsPollTimeout)
            | (State::WaitForData, TimerPurpose::DataTimeout)
            | (State::WaitForIbssJitter, TimerPurpose::BeaconJitter)
            | (State::Idle, TimerPurpose::Awake));

        if !valid {
            error!("{} timer expired in state {}", handle.purpose, self.state);
            return Err(CoreError::InvalidState(self.state))
        }

        trace!("{} timer {} expired in state {}", handle.purpose, handle.seq, self.state);

        match handle.purpose {
            TimerPurpose::Ifs => self.ifs_elapsed(&handle),
            TimerPurpose::Backoff => self.backoff_elapsed(&handle),
            TimerPurpose::Nav => {
                self.exchange_timer.expire(&handle);
                self.attempt_wait_difs()
            },
            TimerPurpose::CtsTimeout | TimerPurpose::AckTimeout | TimerPurpose::PsPollTimeout => {
                self.exchange_timer.expire(&handle);
                self.missed_response()
            },
            TimerPurpose::DataTimeout => {
                self.exchange_timer.expire(&handle);
                debug!("No data following CTS");

                self.set_state(State::Idle);
                self.check_for_outgoing(false)
            },
            TimerPurpose::BeaconJitter => self.beacon_jitter_elapsed(&handle),
            TimerPurpose::Awake => {
                self.exchange_timer.expire(&handle);
                self.wake()
            },
            TimerPurpose::BeaconDue | TimerPurpose::AtimEnd => Ok(()),
        }
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!("State {} -> {}", self.state, state);
        }
        self.state = state;
    }

    pub(crate) fn arm(&mut self, delay: Ts, purpose: TimerPurpose) -> TimerHandle {
        let h = self.exchange_timer.arm(&mut self.timer, delay, purpose);
        trace!("Armed {} timer {} for {} us", purpose, h.seq, delay);
        h
    }

    pub(crate) fn ps_active(&self) -> bool {
        self.config.power_save.enabled && matches!(self.config.role, Role::Infrastructure{..})
    }

    pub(crate) fn next_seq(&mut self) -> u16 {
        let s = self.seq;
        self.seq = (self.seq + 1) & 0x0fff;
        s
    }

    fn ctrl_time(&self, len: usize) -> Ts {
        self.phy.tx_duration(len, self.config.basic_rate)
    }

    /// Hold for a CTS / ACK, the response follows SIFS at the basic rate
    pub(crate) fn response_timeout(&self) -> Ts {
        let p = self.config.propagation_delay_us;
        p + self.config.sifs_us + self.ctrl_time(ACK_LEN) + p + self.config.slot_time_us
    }

    fn selected_is_group(&self) -> bool {
        self.acs.selected_frame().map(|d| d.is_group()).unwrap_or(false)
    }

    fn is_expected_response(&self, frame: &Frame) -> bool {
        match (self.state, frame.kind) {
            (State::WaitForCts, FrameType::Cts) => true,
            (State::WaitForAck, FrameType::Ack) => true,
            (State::WaitForPsPollAck, FrameType::Ack) => true,
            (State::WaitForAtimAck, FrameType::Ack) => true,
            (State::WaitForPsPollAck, k) => k.is_data(),
            _ => false,
        }
    }

    pub(crate) fn set_backoff_if_zero(&mut self) -> u32 {
        let Self{ acs, ps_backoff, rng, .. } = &mut *self;
        active_backoff(acs, ps_backoff).set_if_zero(rng)
    }

    /// Freeze the running countdown, returning the slots remaining
    pub(crate) fn pause_backoff(&mut self, now: Ts) -> u32 {
        let elapsed = self.backoff_started.take()
            .map(|t| now.saturating_sub(t))
            .unwrap_or(0);
        let slot = self.config.slot_time_us;

        let Self{ acs, ps_backoff, .. } = &mut *self;
        active_backoff(acs, ps_backoff).pause(elapsed, slot)
    }

    /// Pull frames into vacant categories, management frames first
    fn fill_queues(&mut self) -> Result<(), CoreError<E>> {
        let mgmt_ac = match self.config.qos {
            true => AccessCategory::Voice,
            false => AccessCategory::BestEffort,
        };

        let ibss_ps = self.ibss_ps();
        if ibss_ps {
            self.buffer_packets()?;
        }

        let vacant: Vec<AccessCategory, 4> = self.acs.vacant().collect();

        for ac in vacant {
            if ac == mgmt_ac {
                if let Some(frame) = self.mgmt.dequeue() {
                    let next_hop = frame.receiver;
                    let desc = FrameDescriptor::new(frame, next_hop, ac, 7);

                    let _ = self.acs.load(desc);
                    continue;
                }
            }

            // Power-saving IBSS traffic waits for its announcement
            if ibss_ps {
                self.load_announced(ac);
                continue;
            }

            let ac_filter = match self.config.qos {
                true => Some(ac),
                false => None,
            };

            if let Some(o) = self.network.dequeue_next_packet(ac_filter) {
                let desc = self.build_data(o)?;
                if let Err(d) = self.acs.load(desc) {
                    warn!("Network returned a {} packet for {}", d.ac, ac);
                    self.network.notify_packet_drop(&d.next_hop, &d.frame);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn build_data(&mut self, o: Outgoing) -> Result<FrameDescriptor, CoreError<E>> {
        let address = self.config.address;
        let bssid = self.config.role.bssid();
        let ac = self.acs.category(o.priority);

        let mut frame = match self.config.qos {
            true => Frame::qos_data(o.next_hop, address, bssid, o.priority, &o.payload)?,
            false => Frame::data(o.next_hop, address, bssid, &o.payload)?,
        };

        frame.seq = self.next_seq();
        if self.config.power_save.enabled {
            frame.flags.insert(FrameFlags::PWR_MGT);
        }

        Ok(FrameDescriptor::new(frame, o.next_hop, ac, o.priority))
    }

    /// Begin deferring: NAV first, then DIFS / AIFS (or EIFS)
    pub(crate) fn attempt_wait_difs(&mut self) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        let status = self.phy.status().map_err(CoreError::Phy)?;
        if status != PhyStatus::Idle {
            trace!("Medium {}, waiting for idle", status);

            self.exchange_timer.cancel();
            self.set_state(State::Idle);
            return Ok(())
        }

        if self.nav > now {
            self.set_state(State::WaitForNav);
            self.arm(self.nav - now, TimerPurpose::Nav);
            return Ok(())
        }

        let ac = self.acs.selected().unwrap_or(AccessCategory::BestEffort);
        let ifs = self.config.ifs_us(ac, self.use_eifs);

        self.set_state(State::WaitDifsOrEifs);
        self.arm(ifs, TimerPurpose::Ifs);

        Ok(())
    }

    fn ifs_elapsed(&mut self, handle: &TimerHandle) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();
        let slots = self.backoff_slots();

        if slots == 0 {
            self.transmit_frame()?;
            self.exchange_timer.expire(handle);
        } else {
            self.set_state(State::Backoff);
            self.backoff_started = Some(now);
            self.arm(slots as Ts * self.config.slot_time_us, TimerPurpose::Backoff);
        }

        self.use_eifs = false;
        Ok(())
    }

    fn backoff_elapsed(&mut self, handle: &TimerHandle) -> Result<(), CoreError<E>> {
        self.transmit_frame()?;
        self.exchange_timer.expire(handle);

        self.backoff_started = None;
        let Self{ acs, ps_backoff, .. } = &mut *self;
        active_backoff(acs, ps_backoff).clear();

        Ok(())
    }

    /// Send the frame holding the contention, or a pending PS-Poll.
    ///
    /// Fails with the state unchanged if the medium is not idle.
    fn transmit_frame(&mut self) -> Result<(), CoreError<E>> {
        let status = self.phy.status().map_err(CoreError::Phy)?;
        if status != PhyStatus::Idle {
            error!("Transmit attempted in state {} with medium {}", self.state, status);
            return Err(CoreError::PhyBusy(status))
        }

        let ac = match self.acs.selected() {
            Some(ac) => ac,
            None if self.ps.poll_pending => return self.transmit_ps_poll(),
            None => match self.atim.pending {
                Some(to) => return self.transmit_atim(to),
                None => {
                    error!("Transmit attempted with no frame");
                    return Err(CoreError::NoFrame)
                },
            },
        };

        let (group, len, receiver) = match self.acs.selected_frame() {
            Some(d) => (d.is_group(), d.len(), d.next_hop),
            None => return Err(CoreError::NoFrame),
        };

        if !group && len > self.config.rts_threshold {
            let sifs = self.config.sifs_us;
            let data = self.phy.tx_duration(len, self.config.data_rate);
            let duration = 3 * sifs + self.ctrl_time(CTS_LEN) + data + self.ctrl_time(ACK_LEN);

            let rts = Frame::rts(receiver, self.config.address, duration_field(duration));

            debug!("Sending RTS to {:?} for {} byte {} frame", receiver, len, ac);
            inc(&mut self.stats.rts_sent);

            return self.send(&rts, State::TransmittingRts, self.config.basic_rate, 0)
        }

        self.transmit_selected(0)
    }

    /// Send the selected frame `delay` after now
    fn transmit_selected(&mut self, delay: Ts) -> Result<(), CoreError<E>> {
        let ac = self.acs.selected().ok_or(CoreError::NoFrame)?;

        let duration = duration_field(self.config.sifs_us + self.ctrl_time(ACK_LEN));

        let desc = self.acs.frame_mut(ac).ok_or(CoreError::NoFrame)?;
        let group = desc.is_group();
        let management = desc.frame.kind.is_management();
        let retransmit = desc.attempts > 0;

        desc.attempts = desc.attempts.saturating_add(1);
        desc.frame.duration_id = if group { 0 } else { duration };
        desc.frame.flags.set(FrameFlags::RETRY, retransmit && !group);

        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = desc.frame.encode(&mut buff)?;
        let kind = desc.frame.kind;

        let state = match (group, management) {
            (_, true) => State::TransmittingManagement,
            (true, false) => State::TransmittingBroadcastData,
            (false, false) => State::TransmittingUnicastData,
        };

        debug!("Sending {} ({} bytes) from {}, retry: {}", kind, n, ac, retransmit);

        self.transmit(kind, &buff[..n], state, self.config.data_rate, delay)
    }

    fn transmit_ps_poll(&mut self) -> Result<(), CoreError<E>> {
        let aid = match self.config.role {
            Role::Infrastructure{ aid, .. } => aid,
            Role::Ibss{ .. } => return Err(CoreError::NoFrame),
        };

        let poll = Frame::ps_poll(self.config.role.bssid(), self.config.address, aid);

        debug!("Sending PS-Poll for AID {}", aid);
        inc(&mut self.stats.ps_polls_sent);

        self.send(&poll, State::TransmittingPsPoll, self.config.basic_rate, 0)
    }

    pub(crate) fn send(&mut self, frame: &Frame, state: State, rate: DataRate, delay: Ts) -> Result<(), CoreError<E>> {
        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = frame.encode(&mut buff)?;

        self.transmit(frame.kind, &buff[..n], state, rate, delay)
    }

    fn transmit(&mut self, kind: FrameType, data: &[u8], state: State, rate: DataRate, delay: Ts) -> Result<(), CoreError<E>> {
        self.phy.set_tx_rate(rate).map_err(CoreError::Phy)?;
        self.phy.start_transmit(kind, data, delay).map_err(CoreError::Phy)?;

        self.set_state(state);

        Ok(())
    }

    /// Account for a missing CTS / ACK, retransmitting or dropping
    fn missed_response(&mut self) -> Result<(), CoreError<E>> {
        let state = self.state;
        self.exchange_timer.cancel();

        let limits = RetryLimits{
            short: self.config.short_retry_limit,
            long: self.config.long_retry_limit,
        };

        // PS-Poll and ATIM frames are owned by no category
        let signalling = matches!(state, State::WaitForPsPollAck | State::WaitForAtimAck);
        let awaiting_cts = state == State::WaitForCts;

        match (awaiting_cts, signalling) {
            (true, _) => inc(&mut self.stats.rts_retries),
            (false, false) => inc(&mut self.stats.data_retries),
            _ => (),
        }

        let (class, decision) = match self.acs.selected() {
            Some(ac) if !signalling => {
                let len = self.acs.selected_frame().map(|d| d.len()).unwrap_or(0);
                let class = RetryClass::classify(len, self.config.rts_threshold, awaiting_cts);
                let qos = self.config.qos;

                let Self{ acs, retries, rng, .. } = &mut *self;
                let (contention, ac_retries) = acs.contention_mut(ac);
                let per_ac = if qos { Some(ac_retries) } else { None };

                (class, backoff::on_missed_response(class, &limits, retries, per_ac, contention, rng))
            },
            _ => {
                let Self{ ps_retries, ps_backoff, rng, .. } = &mut *self;
                let class = RetryClass::Short;

                (class, backoff::on_missed_response(class, &limits, ps_retries, None, ps_backoff, rng))
            },
        };

        match decision {
            RetryDecision::Retry{ attempt } => {
                debug!("No response in {}, retry {}", state, attempt);

                if !signalling {
                    if let Some(ac) = self.acs.selected() {
                        self.acs.complete(ac, Outcome::Retry, &mut self.network);
                    }
                }

                // Data retransmissions wait for the next announcement, ATIMs
                // stop once the window has closed
                if self.ibss_ps() && self.atim.active && (!signalling || self.atim.end_pending) {
                    self.set_state(State::Idle);
                    return self.check_for_outgoing(false)
                }

                self.attempt_wait_difs()
            },
            RetryDecision::Exhausted => {
                match class {
                    RetryClass::Short => inc(&mut self.stats.dropped_short),
                    RetryClass::Long => inc(&mut self.stats.dropped_long),
                }

                match state {
                    State::WaitForPsPollAck => {
                        warn!("PS-Poll retry limit reached");
                        self.ps.poll_pending = false;
                        self.ps.ap_unicast = false;
                        self.ps_retries.reset();
                    },
                    State::WaitForAtimAck => {
                        self.atim_concluded(false);
                    },
                    _ => {
                        if let Some(ac) = self.acs.selected() {
                            self.acs.complete(ac, Outcome::Exhausted, &mut self.network);
                        }
                        self.retries.reset();
                    },
                }

                self.set_state(State::Idle);
                self.check_for_outgoing(true)
            },
        }
    }

    /// Start the next contention from idle, or sleep when nothing is left
    pub(crate) fn check_for_outgoing(&mut self, post_backoff: bool) -> Result<(), CoreError<E>> {
        if self.ps.asleep || self.state != State::Idle {
            return Ok(())
        }

        if self.atim.end_pending {
            return self.finish_atim_window()
        }

        if self.beacon.due && self.handle_due_beacon()? {
            return Ok(())
        }

        self.fill_queues()?;

        if self.ibss_ps() && self.atim.active {
            return self.announce_traffic()
        }

        if self.acs.select().is_some() {
            if post_backoff {
                self.set_backoff_if_zero();
            }
            return self.attempt_wait_difs()
        }

        if self.ibss_ps() {
            return self.sleep_until_beacon()
        }

        if !self.ps_active() {
            if post_backoff {
                // Post-transmission backoff runs even without a frame
                self.set_backoff_if_zero();
            }
            return Ok(())
        }

        if self.ps.ap_unicast && !self.ps.ap_broadcast && !self.ps.poll_acked {
            self.ps.poll_pending = true;
            if post_backoff {
                self.set_backoff_if_zero();
            }
            return self.attempt_wait_difs()
        }

        self.sleep_if_no_data()
    }

    /// Work remaining that keeps the station awake
    pub(crate) fn has_pending_work(&self) -> bool {
        self.acs.has_frames() || !self.mgmt.is_empty()
    }

    fn update_nav(&mut self, frame: &Frame, now: Ts) {
        // PS-Poll carries an AID, values above 32767 are not durations
        if frame.kind == FrameType::PsPoll || frame.duration_id & 0x8000 != 0 {
            return
        }

        let until = now + frame.duration_id as Ts;
        if until > self.nav {
            trace!("NAV set to {} us by {} from {:?}", until, frame.kind, frame.transmitter);
            self.nav = until;
        }
    }

    /// Leave deferral for a SIFS response, keeping the remaining backoff
    pub(crate) fn suspend_contention(&mut self, now: Ts) {
        if self.state == State::Backoff {
            self.pause_backoff(now);
        }

        if self.state.is_contending() {
            self.exchange_timer.cancel();
            self.set_state(State::Idle);
        }
    }

    pub(crate) fn can_respond(&self) -> bool {
        self.state == State::Idle || self.state.is_contending()
    }

    fn handle_cts(&mut self) -> Result<(), CoreError<E>> {
        self.exchange_timer.cancel();
        debug!("CTS received, sending data after SIFS");

        self.transmit_selected(self.config.sifs_us)
    }

    fn handle_ack(&mut self) -> Result<(), CoreError<E>> {
        self.exchange_timer.cancel();

        if let Some(ac) = self.acs.selected() {
            if let Some(d) = self.acs.complete(ac, Outcome::Success, &mut self.network) {
                debug!("ACK received for {} frame to {:?}", d.frame.kind, d.next_hop);
            }
        }

        inc(&mut self.stats.unicast_sent);
        self.retries.reset();

        self.set_state(State::Idle);
        self.check_for_outgoing(true)
    }

    fn handle_ps_poll_ack(&mut self) -> Result<(), CoreError<E>> {
        self.exchange_timer.cancel();
        debug!("PS-Poll acknowledged, awaiting delivery");

        self.ps.poll_pending = false;
        self.ps.poll_acked = true;
        self.ps_retries.reset();
        self.ps_backoff.reset();

        self.set_state(State::Idle);
        self.check_for_outgoing(false)
    }

    fn handle_rts(&mut self, frame: &Frame, now: Ts) -> Result<(), CoreError<E>> {
        let source = match frame.transmitter {
            Some(a) => a,
            None => return Ok(()),
        };

        if !self.can_respond() || self.nav > now || self.state == State::WaitForNav {
            debug!("Not answering RTS from {:?} in state {}", source, self.state);
            return Ok(())
        }

        self.suspend_contention(now);

        let sifs = self.config.sifs_us;
        let duration = (frame.duration_id as Ts).saturating_sub(sifs + self.ctrl_time(CTS_LEN));
        let cts = Frame::cts(source, duration_field(duration));

        debug!("Answering RTS from {:?}", source);
        inc(&mut self.stats.cts_sent);

        self.send(&cts, State::TransmittingCts, self.config.basic_rate, sifs)
    }

    fn handle_data(&mut self, frame: &Frame) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();
        let source = frame.transmitter.unwrap_or_default();
        let deliverable = !matches!(frame.kind, FrameType::Null | FrameType::QosNull);

        if frame.is_group() {
            inc(&mut self.stats.broadcast_received);
            if deliverable {
                self.network.deliver_received_frame(frame, &source);
            }

            if !frame.flags.contains(FrameFlags::MORE_DATA) {
                if self.ps_active() {
                    self.ps.ap_broadcast = false;
                }
                if self.ibss_ps() {
                    self.atim.broadcast_received = false;
                }
            }
            return Ok(())
        }

        match self.state {
            State::WaitForData | State::WaitForPsPollAck => self.exchange_timer.cancel(),
            _ if self.can_respond() => self.suspend_contention(now),
            s => {
                debug!("Ignoring {} from {:?} in state {}", frame.kind, source, s);
                return Ok(())
            },
        }

        if self.state == State::WaitForPsPollAck {
            self.ps.poll_pending = false;
            self.ps_retries.reset();
            self.ps_backoff.reset();
        }

        if self.ps_active() {
            self.ps.poll_acked = false;
            self.ps.ap_unicast = frame.flags.contains(FrameFlags::MORE_DATA);
        }

        if self.ibss_ps() && !frame.flags.contains(FrameFlags::MORE_DATA) {
            self.atim.received_from.retain(|a| a != &source);
        }

        if self.is_duplicate(&source, frame) {
            debug!("Duplicate {} seq {} from {:?}", frame.kind, frame.seq, source);
            inc(&mut self.stats.duplicates);
        } else {
            inc(&mut self.stats.unicast_received);
            if deliverable {
                self.network.deliver_received_frame(frame, &source);
            }
        }

        let ack = Frame::ack(source, 0);
        inc(&mut self.stats.ack_sent);

        self.send(&ack, State::TransmittingAck, self.config.basic_rate, self.config.sifs_us)
    }

    /// Check and record the sequence number of a unicast frame
    fn is_duplicate(&mut self, source: &Address, frame: &Frame) -> bool {
        if let Some(entry) = self.rx_cache.iter_mut().find(|(a, _)| a == source) {
            let dup = frame.flags.contains(FrameFlags::RETRY) && entry.1 == frame.seq;
            entry.1 = frame.seq;
            return dup;
        }

        if self.rx_cache.is_full() {
            self.rx_cache.swap_remove(0);
        }
        let _ = self.rx_cache.push((*source, frame.seq));

        false
    }
}
