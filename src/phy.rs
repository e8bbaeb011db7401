//! PHY collaborator interface
//
// The station drives the PHY through the `Phy` trait and is told about
// PHY state changes through its event handlers. `RadioPhy` adapts a
// `radio` HAL device to this interface.

use core::fmt::Debug;

use log::{debug, trace};

use radio::{State, Transmit, Receive, Rssi, RadioState};

use crate::frame::{FrameType, MAX_FRAME_LEN};
use crate::Ts;

/// Physical layer status as seen by the MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhyStatus {
    /// Medium sensed idle
    Idle,
    /// Energy detected on the medium
    Busy,
    Transmitting,
    Receiving,
    /// Radio is off for power save
    Sleep,
}

/// Data rate in kbit/s
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataRate(pub u32);

impl DataRate {
    pub const MBPS_1: DataRate = DataRate(1_000);
    pub const MBPS_2: DataRate = DataRate(2_000);
    pub const MBPS_5_5: DataRate = DataRate(5_500);
    pub const MBPS_11: DataRate = DataRate(11_000);
}

/// DSSS long preamble and PLCP header
pub const LONG_PREAMBLE_US: Ts = 192;

/// Airtime of `len` bytes at `rate` following a `preamble_us` preamble
pub fn airtime(len: usize, rate: DataRate, preamble_us: Ts) -> Ts {
    let bits = len as Ts * 8 * 1000;
    let rate = (rate.0 as Ts).max(1);

    preamble_us + (bits + rate - 1) / rate
}

/// Frame / PHY collaborator consumed by the station
pub trait Phy {
    type Error: Debug;

    /// Current medium / radio status
    fn status(&mut self) -> Result<PhyStatus, Self::Error>;

    /// Time to transmit `len` bytes (FCS included) at `rate`
    fn tx_duration(&self, len: usize, rate: DataRate) -> Ts;

    /// Select the rate for subsequent transmissions
    fn set_tx_rate(&mut self, rate: DataRate) -> Result<(), Self::Error>;

    /// Start transmitting an encoded frame once `delay` has elapsed,
    /// completion is signalled through `Station::on_tx_complete`
    fn start_transmit(&mut self, kind: FrameType, data: &[u8], delay: Ts) -> Result<(), Self::Error>;

    /// Stop listening to the channel
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Resume listening to the channel
    fn listen(&mut self) -> Result<(), Self::Error>;
}

/// Events reported by [`RadioPhy::tick`] for the host to forward to the station
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhyEvent {
    /// Transmission finished, forward to `on_tx_complete`
    TxComplete,
    /// Frame of the given length received, see [`RadioPhy::received`]
    Received(usize),
    /// Channel became busy, forward to `on_phy_busy`
    Busy,
    /// Channel became idle, forward to `on_phy_idle`
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RadioPhyError<E> {
    /// Wrapper for underlying radio errors
    Radio(E),
    /// A transmission is already in progress or pending
    Busy,
    /// Frame exceeds the transmit buffer
    TooLong,
}

/// Configuration for the `radio` adapter
#[derive(Debug, Clone, PartialEq)]
pub struct RadioPhyConfig {
    /// RSSI threshold above which the channel is considered busy
    pub channel_clear_threshold: i16,
    /// Preamble / PLCP overhead per frame in microseconds
    pub preamble_us: Ts,
}

impl Default for RadioPhyConfig {
    fn default() -> Self {
        Self {
            channel_clear_threshold: -82,
            preamble_us: LONG_PREAMBLE_US,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadioPhyState {
    Listening,
    Transmitting,
    Sleeping,
}

/// [`Phy`] implementation over `radio` HAL devices
pub struct RadioPhy<R> {
    radio: R,
    config: RadioPhyConfig,
    state: RadioPhyState,
    rate: DataRate,
    channel_busy: bool,

    now: Ts,
    pending: Option<(Ts, usize)>,

    tx_buff: [u8; MAX_FRAME_LEN],
    rx_buff: [u8; MAX_FRAME_LEN],
    rx_len: usize,
}

impl <R, E> RadioPhy<R>
where
    R: State<Error=E> + Transmit<Error=E> + Receive<Error=E> + Rssi<Error=E>,
    E: Debug,
{
    /// Wrap a radio and start listening
    pub fn new(mut radio: R, config: RadioPhyConfig) -> Result<Self, RadioPhyError<E>> {
        radio.start_receive().map_err(RadioPhyError::Radio)?;

        Ok(Self {
            radio,
            config,
            state: RadioPhyState::Listening,
            rate: DataRate::MBPS_1,
            channel_busy: false,
            now: 0,
            pending: None,
            tx_buff: [0u8; MAX_FRAME_LEN],
            rx_buff: [0u8; MAX_FRAME_LEN],
            rx_len: 0,
        })
    }

    pub fn state(&self) -> RadioPhyState {
        self.state
    }

    /// Most recently received frame
    pub fn received(&self) -> &[u8] {
        &self.rx_buff[..self.rx_len]
    }

    /// Update the radio, starting deferred transmissions and polling for
    /// completion, reception and channel state changes
    pub fn tick(&mut self, now: Ts) -> Result<Option<PhyEvent>, RadioPhyError<E>> {
        self.now = now;

        match self.state {
            RadioPhyState::Sleeping => Ok(None),
            RadioPhyState::Transmitting => {
                if !self.radio.check_transmit().map_err(RadioPhyError::Radio)? {
                    return Ok(None);
                }

                debug!("TX complete at {} us", now);

                self.radio.start_receive().map_err(RadioPhyError::Radio)?;
                self.state = RadioPhyState::Listening;

                Ok(Some(PhyEvent::TxComplete))
            },
            RadioPhyState::Listening => {
                if let Some((at, n)) = self.pending {
                    if now >= at {
                        self.pending = None;
                        self.radio.start_transmit(&self.tx_buff[..n]).map_err(RadioPhyError::Radio)?;
                        self.state = RadioPhyState::Transmitting;

                        debug!("Deferred TX of {} bytes started at {} us", n, now);
                    }
                    return Ok(None);
                }

                if self.radio.check_receive(true).map_err(RadioPhyError::Radio)? {
                    let (n, _info) = self.radio.get_received(&mut self.rx_buff).map_err(RadioPhyError::Radio)?;
                    self.rx_len = n;

                    debug!("RX {} bytes at {} us", n, now);

                    return Ok(Some(PhyEvent::Received(n)));
                }

                let rssi = self.radio.poll_rssi().map_err(RadioPhyError::Radio)?;
                let busy = rssi > self.config.channel_clear_threshold;

                trace!("Channel rssi {} (busy: {})", rssi, busy);

                match (self.channel_busy, busy) {
                    (false, true) => {
                        self.channel_busy = true;
                        Ok(Some(PhyEvent::Busy))
                    },
                    (true, false) => {
                        self.channel_busy = false;
                        Ok(Some(PhyEvent::Idle))
                    },
                    _ => Ok(None),
                }
            }
        }
    }
}

impl <R, E> Phy for RadioPhy<R>
where
    R: State<Error=E> + Transmit<Error=E> + Receive<Error=E> + Rssi<Error=E>,
    E: Debug,
{
    type Error = RadioPhyError<E>;

    fn status(&mut self) -> Result<PhyStatus, Self::Error> {
        let s = match self.state {
            RadioPhyState::Sleeping => PhyStatus::Sleep,
            RadioPhyState::Transmitting => PhyStatus::Transmitting,
            RadioPhyState::Listening if self.pending.is_some() => PhyStatus::Transmitting,
            RadioPhyState::Listening if self.channel_busy => PhyStatus::Busy,
            RadioPhyState::Listening => PhyStatus::Idle,
        };

        Ok(s)
    }

    fn tx_duration(&self, len: usize, rate: DataRate) -> Ts {
        airtime(len, rate, self.config.preamble_us)
    }

    fn set_tx_rate(&mut self, rate: DataRate) -> Result<(), Self::Error> {
        self.rate = rate;
        Ok(())
    }

    fn start_transmit(&mut self, kind: FrameType, data: &[u8], delay: Ts) -> Result<(), Self::Error> {
        if self.state == RadioPhyState::Transmitting || self.pending.is_some() {
            return Err(RadioPhyError::Busy);
        }
        if data.len() > self.tx_buff.len() {
            return Err(RadioPhyError::TooLong);
        }

        self.tx_buff[..data.len()].copy_from_slice(data);

        if delay == 0 {
            debug!("TX {} ({} bytes, {} kbps) at {} us", kind, data.len(), self.rate.0, self.now);

            self.radio.start_transmit(data).map_err(RadioPhyError::Radio)?;
            self.state = RadioPhyState::Transmitting;
        } else {
            debug!("TX {} ({} bytes) deferred to {} us", kind, data.len(), self.now + delay);

            self.pending = Some((self.now + delay, data.len()));
        }

        Ok(())
    }

    fn sleep(&mut self) -> Result<(), Self::Error> {
        self.radio.set_state(<R as State>::State::sleep()).map_err(RadioPhyError::Radio)?;
        self.state = RadioPhyState::Sleeping;
        self.pending = None;
        Ok(())
    }

    fn listen(&mut self) -> Result<(), Self::Error> {
        self.radio.start_receive().map_err(RadioPhyError::Radio)?;
        self.state = RadioPhyState::Listening;
        self.channel_busy = false;
        Ok(())
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;
    use crate::frame::Frame;

    /// Transmission recorded by [`MockPhy`]
    #[derive(Debug, Clone, PartialEq)]
    pub struct Sent {
        pub kind: FrameType,
        pub data: Vec<u8>,
        pub delay: Ts,
        pub rate: DataRate,
    }

    impl Sent {
        pub fn frame(&self) -> Frame {
            Frame::decode(&self.data).unwrap()
        }
    }

    #[derive(Debug)]
    struct Inner {
        status: PhyStatus,
        rate: DataRate,
        sent: Vec<Sent>,
        sleeps: u32,
        listens: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct MockPhyError;

    /// Mock PHY with settable status, records transmissions
    #[derive(Clone, Debug)]
    pub struct MockPhy(Arc<Mutex<Inner>>);

    impl MockPhy {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner{
                status: PhyStatus::Idle,
                rate: DataRate::MBPS_1,
                sent: Vec::new(),
                sleeps: 0,
                listens: 0,
            })))
        }

        pub fn set_status(&mut self, status: PhyStatus) {
            self.0.lock().unwrap().status = status;
        }

        /// Finish the current transmission, leaving the medium idle
        pub fn tx_done(&mut self) {
            self.set_status(PhyStatus::Idle);
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.0.lock().unwrap().sent.clone()
        }

        pub fn last_sent(&self) -> Option<Sent> {
            self.0.lock().unwrap().sent.last().cloned()
        }

        pub fn sleeps(&self) -> u32 {
            self.0.lock().unwrap().sleeps
        }

        pub fn listens(&self) -> u32 {
            self.0.lock().unwrap().listens
        }
    }

    impl Phy for MockPhy {
        type Error = MockPhyError;

        fn status(&mut self) -> Result<PhyStatus, Self::Error> {
            Ok(self.0.lock().unwrap().status)
        }

        fn tx_duration(&self, len: usize, rate: DataRate) -> Ts {
            airtime(len, rate, LONG_PREAMBLE_US)
        }

        fn set_tx_rate(&mut self, rate: DataRate) -> Result<(), Self::Error> {
            self.0.lock().unwrap().rate = rate;
            Ok(())
        }

        fn start_transmit(&mut self, kind: FrameType, data: &[u8], delay: Ts) -> Result<(), Self::Error> {
            let mut inner = self.0.lock().unwrap();
            if inner.status == PhyStatus::Transmitting || inner.status == PhyStatus::Sleep {
                return Err(MockPhyError);
            }

            let rate = inner.rate;
            inner.sent.push(Sent{ kind, data: data.to_vec(), delay, rate });
            inner.status = PhyStatus::Transmitting;
            Ok(())
        }

        fn sleep(&mut self) -> Result<(), Self::Error> {
            let mut inner = self.0.lock().unwrap();
            inner.status = PhyStatus::Sleep;
            inner.sleeps += 1;
            Ok(())
        }

        fn listen(&mut self) -> Result<(), Self::Error> {
            let mut inner = self.0.lock().unwrap();
            inner.status = PhyStatus::Idle;
            inner.listens += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use std::vec;

    use radio::BasicInfo;
    use radio::mock::*;

    use super::*;
    use crate::frame::{Address, Frame};

    #[test]
    fn airtime_long_preamble() {
        // 14 byte ACK at 1 Mbps
        assert_eq!(airtime(14, DataRate::MBPS_1, LONG_PREAMBLE_US), 304);
        // Rounds up partial microseconds
        assert_eq!(airtime(1, DataRate::MBPS_11, 0), 1);
    }

    #[test]
    fn radio_transmit_and_complete() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut radio = MockRadio::new(&[]);

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        let mut phy = RadioPhy::new(radio.clone(), RadioPhyConfig::default()).unwrap();
        radio.done();

        let ack = Frame::ack(Address::from(2), 0);
        let mut buff = [0u8; 32];
        let n = ack.encode(&mut buff).unwrap();

        radio.expect(&[
            Transaction::start_transmit(buff[..n].to_vec(), None),
            Transaction::check_transmit(Ok(false)),
            Transaction::check_transmit(Ok(true)),
            Transaction::start_receive(None),
        ]);

        phy.start_transmit(FrameType::Ack, &buff[..n], 0).unwrap();
        assert_eq!(phy.status().unwrap(), PhyStatus::Transmitting);

        assert_eq!(phy.tick(10).unwrap(), None);
        assert_eq!(phy.tick(20).unwrap(), Some(PhyEvent::TxComplete));
        assert_eq!(phy.state(), RadioPhyState::Listening);

        radio.done();
    }

    #[test]
    fn radio_deferred_transmit() {
        let mut radio = MockRadio::new(&[]);

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        let mut phy = RadioPhy::new(radio.clone(), RadioPhyConfig::default()).unwrap();
        radio.done();

        let data = vec![0xd4, 0x00, 0x00, 0x00, 1, 2, 3, 4, 5, 6];

        radio.expect(&[
            Transaction::start_transmit(data.clone(), None),
        ]);

        phy.start_transmit(FrameType::Ack, &data, 10).unwrap();

        // Not yet due, the radio is left alone
        assert_eq!(phy.tick(5).unwrap(), None);
        assert_eq!(phy.status().unwrap(), PhyStatus::Transmitting);

        // Due, starts transmission
        assert_eq!(phy.tick(10).unwrap(), None);
        assert_eq!(phy.state(), RadioPhyState::Transmitting);

        radio.done();
    }

    #[test]
    fn radio_receive_and_channel_state() {
        let mut radio = MockRadio::new(&[]);

        radio.expect(&[
            Transaction::start_receive(None),
        ]);
        let mut phy = RadioPhy::new(radio.clone(), RadioPhyConfig::default()).unwrap();
        radio.done();

        let data = vec![0xd4, 0x00, 0x00, 0x00, 1, 2, 3, 4, 5, 6];

        radio.expect(&[
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-60i16)),
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-60i16)),
            Transaction::check_receive(true, Ok(true)),
            Transaction::get_received(Ok((data.clone(), BasicInfo::default()))),
            Transaction::check_receive(true, Ok(false)),
            Transaction::poll_rssi(Ok(-95i16)),
        ]);

        assert_eq!(phy.tick(1).unwrap(), Some(PhyEvent::Busy));
        assert_eq!(phy.status().unwrap(), PhyStatus::Busy);
        assert_eq!(phy.tick(2).unwrap(), None);
        assert_eq!(phy.tick(3).unwrap(), Some(PhyEvent::Received(data.len())));
        assert_eq!(phy.received(), &data[..]);
        assert_eq!(phy.tick(4).unwrap(), Some(PhyEvent::Idle));
        assert_eq!(phy.status().unwrap(), PhyStatus::Idle);

        radio.done();
    }

    #[test]
    fn radio_sleep() {
        let mut radio = MockRadio::new(&[]);

        radio.expect(&[
            Transaction::start_receive(None),
            Transaction::set_state(MockState::Sleep, None),
            Transaction::start_receive(None),
        ]);

        let mut phy = RadioPhy::new(radio.clone(), RadioPhyConfig::default()).unwrap();
        phy.sleep().unwrap();
        assert_eq!(phy.status().unwrap(), PhyStatus::Sleep);
        assert_eq!(phy.tick(1).unwrap(), None);

        phy.listen().unwrap();
        assert_eq!(phy.status().unwrap(), PhyStatus::Idle);

        radio.done();
    }
}
