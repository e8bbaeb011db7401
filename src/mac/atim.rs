//! IBSS power save
//!
//! Members of a power-saving IBSS stay awake for an ATIM window after each
//! beacon. Traffic for peers is held back and announced with ATIM frames
//! during the window, once it closes only announced traffic is sent. A
//! station with nothing announced in either direction sleeps until the
//! next beacon.
//
// https://github.com/rust-iot/dot11-mac
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use heapless::Vec;
use log::{trace, debug, info, warn};
use rand_core::RngCore;

use crate::Ts;
use crate::error::CoreError;
use crate::frame::{Address, Frame, FrameFlags, FrameType, ACK_LEN};
use crate::phy::Phy;
use crate::timer::{SelfTimer, Timer, TimerPurpose};

use super::config::Role;
use super::queue::{AccessCategory, FrameDescriptor};
use super::station::{Station, State};
use super::stats::inc;
use super::Network;

/// Packets taken from the network layer to await announcement
pub const IBSS_PS_BUFFER_LEN: usize = 4;

/// Peers tracked per ATIM window
const ATIM_PEERS: usize = 8;

/// ATIM window and announcement state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AtimState {
    pub(crate) timer: SelfTimer,
    /// Window open, only ATIM frames may be sent
    pub(crate) active: bool,
    /// Window closed during an exchange, finished once it concludes
    pub(crate) end_pending: bool,

    /// Held frames, room is left for the contents of every category slot
    pub(crate) buffer: Vec<FrameDescriptor, { IBSS_PS_BUFFER_LEN + 4 }>,

    /// Destinations announced this window and whether they acknowledged
    pub(crate) announced: Vec<(Address, bool), ATIM_PEERS>,
    pub(crate) broadcast_announced: bool,

    /// Peers that announced traffic for us
    pub(crate) received_from: Vec<Address, ATIM_PEERS>,
    pub(crate) broadcast_received: bool,

    /// ATIM contending for the medium
    pub(crate) pending: Option<Address>,
    pending_seq: u16,
}

impl AtimState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Frames held for announcement
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Destination `to` acknowledged our ATIM this window
    pub fn is_acked(&self, to: &Address) -> bool {
        self.announced.iter().any(|(a, acked)| a == to && *acked)
    }

    /// A peer announced traffic for us this window
    pub fn expects_from(&self, from: &Address) -> bool {
        self.received_from.iter().any(|a| a == from)
    }

    pub fn broadcast_received(&self) -> bool {
        self.broadcast_received
    }

    pub fn pending(&self) -> Option<Address> {
        self.pending
    }

    fn is_cleared(&self, d: &FrameDescriptor) -> bool {
        match d.is_group() {
            true => self.broadcast_announced,
            false => self.is_acked(&d.next_hop),
        }
    }

    fn is_announced(&self, to: &Address) -> bool {
        self.announced.iter().any(|(a, _)| a == to)
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
    pub fn atim(&self) -> &AtimState {
        &self.atim
    }

    pub(crate) fn ibss_ps(&self) -> bool {
        self.config.power_save.enabled && matches!(self.config.role, Role::Ibss{ .. })
    }

    /// Open the ATIM window following a beacon sent or heard
    pub(crate) fn start_atim_window(&mut self) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        if self.state.is_contending() && self.state != State::WaitForIbssJitter {
            self.suspend_contention(now);
        }

        let a = &mut self.atim;
        a.active = true;
        a.end_pending = false;
        a.announced.clear();
        a.broadcast_announced = false;
        a.received_from.clear();
        a.broadcast_received = false;
        a.pending = None;
        self.ps_retries.reset();

        let window = self.config.atim_window_us();
        let h = self.atim.timer.arm(&mut self.timer, window, TimerPurpose::AtimEnd);

        debug!("ATIM window open until {} us (timer {})", now + window, h.seq);

        self.check_for_outgoing(false)
    }

    /// Announce the next unannounced destination, broadcast first
    pub(crate) fn announce_traffic(&mut self) -> Result<(), CoreError<E>> {
        self.hold_for_announcement();

        if self.atim.pending.is_none() {
            let to = self.next_atim_target();
            if to.is_some() {
                self.atim.pending_seq = self.next_seq();
            }
            self.atim.pending = to;
        }

        let to = match self.atim.pending {
            Some(to) => to,
            None => {
                trace!("Nothing to announce");
                return Ok(())
            },
        };

        debug!("Announcing traffic for {:?}", to);

        self.set_backoff_if_zero();
        self.attempt_wait_difs()
    }

    fn next_atim_target(&self) -> Option<Address> {
        let a = &self.atim;

        if !a.broadcast_announced && a.buffer.iter().any(|d| d.is_group()) {
            return Some(Address::BROADCAST)
        }

        a.buffer.iter()
            .filter(|d| !d.is_group())
            .map(|d| d.next_hop)
            .find(|to| !a.is_announced(to))
    }

    /// Return data frames waiting in category slots to the buffer, they
    /// are sent only once announced
    fn hold_for_announcement(&mut self) {
        let selected = self.acs.selected();

        let held: Vec<AccessCategory, 4> = self.acs.categories()
            .filter(|ac| self.acs.queue(*ac).frame().map_or(false, |d| d.frame.kind.is_data()))
            .collect();

        for ac in held {
            let d = match self.acs.unload(ac) {
                Some(d) => d,
                None => continue,
            };

            if selected == Some(ac) {
                self.retries.reset();
            }

            trace!("Holding {} frame to {:?} for announcement", d.frame.kind, d.next_hop);

            if let Err(d) = self.atim.buffer.push(d) {
                warn!("Announcement buffer full, dropping frame to {:?}", d.next_hop);
                self.network.notify_packet_drop(&d.next_hop, &d.frame);
            }
        }

        self.acs.deselect();
    }

    /// Take packets from the network layer into the announcement buffer
    pub(crate) fn buffer_packets(&mut self) -> Result<(), CoreError<E>> {
        while self.atim.buffer.len() < IBSS_PS_BUFFER_LEN {
            let o = match self.network.dequeue_next_packet(None) {
                Some(o) => o,
                None => break,
            };

            let d = self.build_data(o)?;
            if let Err(d) = self.atim.buffer.push(d) {
                self.network.notify_packet_drop(&d.next_hop, &d.frame);
            }
        }

        Ok(())
    }

    /// Move an announced frame for `ac` into its slot, flagging more data
    /// when further frames for the same destination remain
    pub(crate) fn load_announced(&mut self, ac: AccessCategory) {
        if self.atim.active {
            return
        }

        let idx = match self.atim.buffer.iter().position(|d| d.ac == ac && self.atim.is_cleared(d)) {
            Some(i) => i,
            None => return,
        };

        let mut d = self.atim.buffer.remove(idx);
        let more = self.atim.buffer.iter().any(|b| b.next_hop == d.next_hop);
        d.frame.flags.set(FrameFlags::MORE_DATA, more);

        if let Err(d) = self.acs.load(d) {
            warn!("Slot for {} taken, dropping frame to {:?}", d.ac, d.next_hop);
            self.network.notify_packet_drop(&d.next_hop, &d.frame);
        }
    }

    pub(crate) fn transmit_atim(&mut self, to: Address) -> Result<(), CoreError<E>> {
        let mut frame = Frame::management(FrameType::Atim, to, self.config.address, self.config.role.bssid(), &[])?;

        frame.seq = self.atim.pending_seq;
        frame.flags.insert(FrameFlags::PWR_MGT);
        frame.flags.set(FrameFlags::RETRY, !self.ps_retries.is_zero());

        if !frame.is_group() {
            let d = self.config.sifs_us + self.phy.tx_duration(ACK_LEN, self.config.basic_rate);
            frame.duration_id = d.min(0x7fff) as u16;
        }

        debug!("Sending ATIM to {:?}", to);
        inc(&mut self.stats.atims_sent);

        self.send(&frame, State::TransmittingAtim, self.config.basic_rate, 0)
    }

    /// ATIM on air, group announcements need no acknowledgement
    pub(crate) fn atim_sent(&mut self) -> Result<(), CoreError<E>> {
        match self.atim.pending {
            Some(to) if to.is_group() => {
                self.atim.broadcast_announced = true;
                self.atim.pending = None;
                self.ps_retries.reset();

                self.set_state(State::Idle);
                self.check_for_outgoing(true)
            },
            _ => {
                self.set_state(State::WaitForAtimAck);
                let timeout = self.response_timeout();
                self.arm(timeout, TimerPurpose::AckTimeout);
                Ok(())
            },
        }
    }

    pub(crate) fn handle_atim_ack(&mut self) -> Result<(), CoreError<E>> {
        self.exchange_timer.cancel();
        self.atim_concluded(true);

        self.set_state(State::Idle);
        self.check_for_outgoing(true)
    }

    /// Record the outcome for the pending ATIM, it is not repeated this window
    pub(crate) fn atim_concluded(&mut self, acked: bool) {
        let to = match self.atim.pending.take() {
            Some(to) => to,
            None => return,
        };

        debug!("ATIM to {:?} {}", to, if acked { "acknowledged" } else { "unanswered" });

        if self.atim.announced.push((to, acked)).is_err() {
            warn!("ATIM peer table full");
        }

        self.ps_retries.reset();
        self.ps_backoff.reset();
    }

    pub(crate) fn handle_atim(&mut self, frame: &Frame, now: Ts) -> Result<(), CoreError<E>> {
        let source = match frame.transmitter {
            Some(a) => a,
            None => return Ok(()),
        };

        if !self.ibss_ps() || !self.atim.active {
            debug!("Ignoring ATIM from {:?} outside the window", source);
            return Ok(())
        }

        inc(&mut self.stats.atims_received);

        if frame.is_group() {
            debug!("Broadcast traffic announced by {:?}", source);
            self.atim.broadcast_received = true;
            return Ok(())
        }

        if !self.atim.expects_from(&source) && self.atim.received_from.push(source).is_err() {
            warn!("ATIM peer table full, {:?} not tracked", source);
        }

        if !self.can_respond() {
            debug!("Not acknowledging ATIM from {:?} in state {}", source, self.state);
            return Ok(())
        }

        self.suspend_contention(now);

        debug!("Traffic announced by {:?}", source);

        let ack = Frame::ack(source, 0);
        inc(&mut self.stats.ack_sent);

        self.send(&ack, State::TransmittingAck, self.config.basic_rate, self.config.sifs_us)
    }

    pub(crate) fn atim_window_elapsed(&mut self) -> Result<(), CoreError<E>> {
        if self.state != State::Idle && !self.state.is_contending() {
            debug!("ATIM window over in state {}, closing after the exchange", self.state);
            self.atim.end_pending = true;
            return Ok(())
        }

        self.finish_atim_window()
    }

    /// Close the window, dropping an unsent ATIM, then sleep unless
    /// traffic was announced in either direction
    pub(crate) fn finish_atim_window(&mut self) -> Result<(), CoreError<E>> {
        let now = self.timer.ticks_us();

        self.atim.active = false;
        self.atim.end_pending = false;

        if self.state.is_contending() && self.state != State::WaitForIbssJitter {
            self.suspend_contention(now);
        }

        if let Some(to) = self.atim.pending.take() {
            debug!("ATIM to {:?} not sent within the window", to);
            self.ps_retries.reset();
        }

        debug!("ATIM window closed at {} us", now);

        self.check_for_outgoing(false)
    }

    /// Traffic announced in either direction, or work of our own
    fn expects_exchange(&self) -> bool {
        let a = &self.atim;

        a.broadcast_received
            || !a.received_from.is_empty()
            || a.buffer.iter().any(|d| a.is_cleared(d))
            || self.has_pending_work()
            || self.beacon.due
    }

    /// Sleep until the next beacon once nothing remains to exchange
    pub(crate) fn sleep_until_beacon(&mut self) -> Result<(), CoreError<E>> {
        if !self.ibss_ps() || self.ps.asleep || self.atim.active || self.state != State::Idle {
            return Ok(())
        }

        if self.expects_exchange() {
            trace!("IBSS traffic pending, staying awake");
            return Ok(())
        }

        self.exchange_timer.cancel();
        self.phy.sleep().map_err(CoreError::Phy)?;

        self.ps.asleep = true;
        self.ps.next_awake = self.beacon.timer.expiry();
        inc(&mut self.stats.sleeps);

        info!("Sleeping until the next beacon ({} frames held)", self.atim.buffer.len());

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::frame::{Beacon, Tim};
    use crate::mac::config::{Config, PowerSaveConfig};
    use crate::mac::station::test::*;
    use crate::mac::beacon::CAPABILITY_IBSS;
    use crate::phy::PhyStatus;

    use super::*;

    fn ibss_ps() -> Config {
        Config {
            role: Role::Ibss{ bssid: addr(BSSID) },
            power_save: PowerSaveConfig{ enabled: true, ..Default::default() },
            ..config()
        }
    }

    /// Peer beacon opening the ATIM window
    fn peer_beacon(h: &mut Harness) {
        let b = Beacon{ timestamp: 0, interval_tu: 100, capability: CAPABILITY_IBSS, tim: Some(Tim::new(0, 1, false, &[])) };
        let f = Frame::beacon(addr(PEER), addr(BSSID), &b).unwrap();
        h.receive(&f);
    }

    fn atim_from(from: u64, to: Address) -> Frame {
        Frame::management(FrameType::Atim, to, addr(from), addr(BSSID), &[]).unwrap()
    }

    #[test]
    fn sleeps_without_announcements() {
        let mut h = setup(ibss_ps(), 0);

        peer_beacon(&mut h);
        assert!(h.mac.atim().is_active());
        assert_eq!(h.mac.state(), State::Idle);

        let (at, _) = h.timer.last(TimerPurpose::AtimEnd).unwrap();
        assert_eq!(at, 1_000 + 10 * 1024);

        h.fire(TimerPurpose::AtimEnd);
        assert!(!h.mac.atim().is_active());
        assert!(h.mac.is_asleep());
        assert_eq!(h.phy.sleeps(), 1);

        let (due, _) = h.timer.last(TimerPurpose::BeaconDue).unwrap();
        assert_eq!(h.mac.power_save().next_awake(), Some(due));

        // Woken for the next beacon
        h.fire(TimerPurpose::BeaconDue);
        assert!(!h.mac.is_asleep());
        assert_eq!(h.mac.state(), State::WaitForIbssJitter);
    }

    #[test]
    fn announces_then_sends_unicast() {
        let mut h = setup(ibss_ps(), 0);

        peer_beacon(&mut h);

        // Held during the window, announced instead
        h.network.push(addr(PEER), 0, &[1, 2, 3]);
        h.network.push(addr(PEER), 0, &[4, 5, 6]);
        h.mac.on_packet_ready().unwrap();
        assert_eq!(h.network.pending(), 0);
        assert_eq!(h.mac.atim().buffered(), 2);
        assert_eq!(h.mac.atim().pending(), Some(addr(PEER)));
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);

        h.fire(TimerPurpose::Ifs);
        assert_eq!(h.mac.state(), State::TransmittingAtim);

        let atim = h.phy.last_sent().unwrap().frame();
        assert_eq!(atim.kind, FrameType::Atim);
        assert_eq!(atim.receiver, addr(PEER));
        assert!(atim.flags.contains(FrameFlags::PWR_MGT));

        h.tx_done();
        assert_eq!(h.mac.state(), State::WaitForAtimAck);

        h.receive(&Frame::ack(addr(STA), 0));
        assert!(h.mac.atim().is_acked(&addr(PEER)));
        assert_eq!(h.mac.state(), State::Idle);
        assert_eq!(h.mac.stats().atims_sent, 1);

        // Nothing is sent until the window closes
        assert!(h.mac.queues().selected().is_none());

        h.fire(TimerPurpose::AtimEnd);
        assert!(!h.mac.is_asleep());
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);

        h.fire(TimerPurpose::Ifs);
        let first = h.phy.last_sent().unwrap().frame();
        assert_eq!(first.kind, FrameType::Data);
        assert_eq!(first.body(), &[1, 2, 3]);
        assert!(first.flags.contains(FrameFlags::MORE_DATA));

        h.tx_done();
        h.receive(&Frame::ack(addr(STA), 0));
        h.fire(TimerPurpose::Ifs);

        let second = h.phy.last_sent().unwrap().frame();
        assert_eq!(second.body(), &[4, 5, 6]);
        assert!(!second.flags.contains(FrameFlags::MORE_DATA));

        // Everything delivered, back to sleep
        h.tx_done();
        h.receive(&Frame::ack(addr(STA), 0));
        assert!(h.mac.is_asleep());
        assert_eq!(h.mac.stats().unicast_sent, 2);
    }

    #[test]
    fn unanswered_atim_keeps_frames() {
        let mut h = setup(Config{ short_retry_limit: 2, ..ibss_ps() }, 0);

        peer_beacon(&mut h);
        h.network.push(addr(PEER), 0, &[1]);
        h.mac.on_packet_ready().unwrap();

        for _ in 0..2 {
            h.fire(TimerPurpose::Ifs);
            assert_eq!(h.mac.state(), State::TransmittingAtim);
            h.tx_done();
            h.fire(TimerPurpose::AckTimeout);
        }

        // Not repeated within the window, data stays with the station
        assert_eq!(h.mac.state(), State::Idle);
        assert_eq!(h.mac.atim().pending(), None);
        assert!(!h.mac.atim().is_acked(&addr(PEER)));
        assert!(h.mac.retries().is_zero());
        assert!(h.mac.ps_retries().is_zero());
        assert!(h.network.drops().is_empty());
        assert!(h.network.management_drops().is_empty());

        h.fire(TimerPurpose::AtimEnd);
        assert!(h.mac.is_asleep());
        assert_eq!(h.mac.atim().buffered(), 1);
    }

    #[test]
    fn broadcast_announced_without_ack() {
        let mut h = setup(ibss_ps(), 0);

        peer_beacon(&mut h);
        h.network.push(Address::BROADCAST, 0, &[9]);
        h.mac.on_packet_ready().unwrap();
        assert_eq!(h.mac.atim().pending(), Some(Address::BROADCAST));

        h.fire(TimerPurpose::Ifs);
        assert_eq!(h.phy.last_sent().unwrap().frame().receiver, Address::BROADCAST);

        h.tx_done();
        assert_eq!(h.mac.state(), State::Idle);

        h.fire(TimerPurpose::AtimEnd);
        h.fire(TimerPurpose::Ifs);
        assert_eq!(h.mac.state(), State::TransmittingBroadcastData);

        h.tx_done();
        assert!(h.mac.is_asleep());
        assert_eq!(h.mac.stats().broadcast_sent, 1);
    }

    #[test]
    fn stays_awake_for_announced_traffic() {
        let mut h = setup(ibss_ps(), 0);

        peer_beacon(&mut h);

        h.receive(&atim_from(PEER, addr(STA)));
        assert_eq!(h.mac.state(), State::TransmittingAck);
        assert!(h.mac.atim().expects_from(&addr(PEER)));
        assert_eq!(h.mac.stats().atims_received, 1);

        h.tx_done();
        h.fire(TimerPurpose::AtimEnd);
        assert!(!h.mac.is_asleep());

        // Last frame from the peer releases us
        let mut data = Frame::data(addr(STA), addr(PEER), addr(BSSID), &[1]).unwrap();
        data.flags.insert(FrameFlags::MORE_DATA);
        h.receive(&data);
        h.tx_done();
        assert!(!h.mac.is_asleep());

        let mut data = Frame::data(addr(STA), addr(PEER), addr(BSSID), &[2]).unwrap();
        data.seq = 1;
        h.receive(&data);
        h.tx_done();

        assert!(h.mac.is_asleep());
        assert_eq!(h.network.delivered().len(), 2);
    }

    #[test]
    fn window_ends_after_exchange() {
        let mut h = setup(ibss_ps(), 0);

        peer_beacon(&mut h);
        h.network.push(addr(PEER), 0, &[1]);
        h.mac.on_packet_ready().unwrap();
        h.fire(TimerPurpose::Ifs);
        h.tx_done();
        assert_eq!(h.mac.state(), State::WaitForAtimAck);

        // Window closes while the ACK is outstanding
        let (_, end) = h.timer.last(TimerPurpose::AtimEnd).unwrap();
        h.mac.on_timer(end).unwrap();
        assert!(h.mac.atim().is_active());
        assert_eq!(h.mac.state(), State::WaitForAtimAck);

        h.receive(&Frame::ack(addr(STA), 0));
        assert!(!h.mac.atim().is_active());
        assert_eq!(h.mac.state(), State::WaitDifsOrEifs);
        assert!(h.mac.queues().selected().is_some());
    }

    #[test]
    fn atims_ignored_outside_window() {
        let mut h = setup(ibss_ps(), 0);

        h.receive(&atim_from(PEER, addr(STA)));
        assert_eq!(h.mac.state(), State::Idle);
        assert!(h.phy.sent().is_empty());
        assert_eq!(h.mac.stats().atims_received, 0);
    }

    #[test]
    fn unsent_frames_reannounced_next_window() {
        let mut h = setup(ibss_ps(), 0);

        peer_beacon(&mut h);
        h.network.push(addr(PEER), 0, &[1]);
        h.mac.on_packet_ready().unwrap();
        h.fire(TimerPurpose::Ifs);
        h.tx_done();
        h.receive(&Frame::ack(addr(STA), 0));
        h.fire(TimerPurpose::AtimEnd);

        // Medium busy until the next beacon
        h.phy.set_status(PhyStatus::Busy);
        h.mac.on_phy_busy().unwrap();
        assert!(h.mac.queues().has_frames());

        h.phy.set_status(PhyStatus::Idle);
        peer_beacon(&mut h);

        assert!(!h.mac.queues().has_frames());
        assert_eq!(h.mac.atim().buffered(), 1);
        assert_eq!(h.mac.atim().pending(), Some(addr(PEER)));
    }
}
