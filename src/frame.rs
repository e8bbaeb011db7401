//! IEEE 802.11 frame model
//!
//! Owned, statically sized frames for the exchanges a station takes part
//! in (RTS / CTS / data / ACK, beacons, PS-Poll and management), with wire
//! encoding and on-air length computation. The FCS is appended by the PHY
//! so it is counted in [`Frame::len`] but never encoded here.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use heapless::Vec;

use crate::Ts;

/// Maximum frame body length (MSDU or management elements)
pub const MAX_BODY_LEN: usize = 2312;

/// Frame check sequence length, appended by the PHY
pub const FCS_LEN: usize = 4;

/// On-air length of an ACK frame
pub const ACK_LEN: usize = 14;
/// On-air length of a CTS frame
pub const CTS_LEN: usize = 14;
/// On-air length of an RTS frame
pub const RTS_LEN: usize = 20;
/// On-air length of a PS-Poll frame
pub const PS_POLL_LEN: usize = 20;

/// Three-address data / management header
pub const DATA_HEADER_LEN: usize = 24;
/// QoS control field carried by QoS data frames
pub const QOS_CONTROL_LEN: usize = 2;

/// Largest encoded frame (excluding FCS)
pub const MAX_FRAME_LEN: usize = DATA_HEADER_LEN + QOS_CONTROL_LEN + MAX_BODY_LEN;

/// 802.11 time unit in microseconds
pub const TIME_UNIT_US: Ts = 1024;

/// Traffic indication map element ID
pub const TIM_ELEMENT_ID: u8 = 5;

/// Maximum partial virtual bitmap length
pub const MAX_TIM_BITMAP_LEN: usize = 251;

/// Largest association ID that fits the virtual bitmap
pub const MAX_AID: u16 = 2007;

/// Fixed beacon fields (timestamp, interval, capability)
const BEACON_FIXED_LEN: usize = 12;

/// Frame encode / decode errors
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Buffer ended before the frame was complete
    NotEnoughBytes,
    /// Unsupported protocol version
    InvalidVersion(u8),
    /// Unknown or unsupported type / subtype combination
    UnknownType(u8, u8),
    /// Body exceeds [`MAX_BODY_LEN`]
    BodyTooLong,
    /// Encode target buffer is too small
    BufferTooSmall,
    /// Malformed information element
    InvalidElement(u8),
}

/// 48-bit IEEE MAC address
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const BROADCAST: Address = Address([0xff; 6]);

    /// Group (multicast or broadcast) addresses have the I/G bit set
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u64> for Address {
    /// Build an address from the low 48 bits of `v`
    fn from(v: u64) -> Self {
        let mut a = [0u8; 6];
        BigEndian::write_uint(&mut a, v & 0xffff_ffff_ffff, 6);
        Address(a)
    }
}

/// Frame type / subtype
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    AssocRequest,
    AssocResponse,
    ProbeRequest,
    ProbeResponse,
    Beacon,
    Atim,
    Disassoc,
    Auth,
    Deauth,
    Action,

    BlockAckReq,
    BlockAck,
    PsPoll,
    Rts,
    Cts,
    Ack,

    Data,
    Null,
    QosData,
    QosNull,
}

const TYPE_MANAGEMENT: u8 = 0;
const TYPE_CONTROL: u8 = 1;
const TYPE_DATA: u8 = 2;

impl FrameType {
    /// Fetch the (type, subtype) pair for the frame control field
    pub fn bits(&self) -> (u8, u8) {
        use FrameType::*;

        match self {
            AssocRequest => (TYPE_MANAGEMENT, 0),
            AssocResponse => (TYPE_MANAGEMENT, 1),
            ProbeRequest => (TYPE_MANAGEMENT, 4),
            ProbeResponse => (TYPE_MANAGEMENT, 5),
            Beacon => (TYPE_MANAGEMENT, 8),
            Atim => (TYPE_MANAGEMENT, 9),
            Disassoc => (TYPE_MANAGEMENT, 10),
            Auth => (TYPE_MANAGEMENT, 11),
            Deauth => (TYPE_MANAGEMENT, 12),
            Action => (TYPE_MANAGEMENT, 13),

            BlockAckReq => (TYPE_CONTROL, 8),
            BlockAck => (TYPE_CONTROL, 9),
            PsPoll => (TYPE_CONTROL, 10),
            Rts => (TYPE_CONTROL, 11),
            Cts => (TYPE_CONTROL, 12),
            Ack => (TYPE_CONTROL, 13),

            Data => (TYPE_DATA, 0),
            Null => (TYPE_DATA, 4),
            QosData => (TYPE_DATA, 8),
            QosNull => (TYPE_DATA, 12),
        }
    }

    pub fn from_bits(ty: u8, subtype: u8) -> Option<Self> {
        use FrameType::*;

        let t = match (ty, subtype) {
            (TYPE_MANAGEMENT, 0) => AssocRequest,
            (TYPE_MANAGEMENT, 1) => AssocResponse,
            (TYPE_MANAGEMENT, 4) => ProbeRequest,
            (TYPE_MANAGEMENT, 5) => ProbeResponse,
            (TYPE_MANAGEMENT, 8) => Beacon,
            (TYPE_MANAGEMENT, 9) => Atim,
            (TYPE_MANAGEMENT, 10) => Disassoc,
            (TYPE_MANAGEMENT, 11) => Auth,
            (TYPE_MANAGEMENT, 12) => Deauth,
            (TYPE_MANAGEMENT, 13) => Action,

            (TYPE_CONTROL, 8) => BlockAckReq,
            (TYPE_CONTROL, 9) => BlockAck,
            (TYPE_CONTROL, 10) => PsPoll,
            (TYPE_CONTROL, 11) => Rts,
            (TYPE_CONTROL, 12) => Cts,
            (TYPE_CONTROL, 13) => Ack,

            (TYPE_DATA, 0) => Data,
            (TYPE_DATA, 4) => Null,
            (TYPE_DATA, 8) => QosData,
            (TYPE_DATA, 12) => QosNull,

            _ => return None,
        };

        Some(t)
    }

    pub fn is_management(&self) -> bool {
        self.bits().0 == TYPE_MANAGEMENT
    }

    pub fn is_control(&self) -> bool {
        self.bits().0 == TYPE_CONTROL
    }

    pub fn is_data(&self) -> bool {
        self.bits().0 == TYPE_DATA
    }

    /// QoS data subtypes carry a QoS control field
    pub fn has_qos(&self) -> bool {
        matches!(self, FrameType::QosData | FrameType::QosNull)
    }

    /// Encoded header length for this frame type
    pub fn header_len(&self) -> usize {
        use FrameType::*;

        match self {
            Cts | Ack => 10,
            Rts | PsPoll | BlockAckReq | BlockAck => 16,
            t if t.has_qos() => DATA_HEADER_LEN + QOS_CONTROL_LEN,
            _ => DATA_HEADER_LEN,
        }
    }
}

bitflags::bitflags! {
    /// Frame control flags (second octet)
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FrameFlags: u8 {
        /// Frame is headed to the distribution system
        const TO_DS     = 0b0000_0001;
        /// Frame is leaving the distribution system
        const FROM_DS   = 0b0000_0010;
        /// More fragments follow
        const MORE_FRAG = 0b0000_0100;
        /// Frame is a retransmission
        const RETRY     = 0b0000_1000;
        /// Transmitter will enter power save after this exchange
        const PWR_MGT   = 0b0001_0000;
        /// AP holds more buffered frames for this station
        const MORE_DATA = 0b0010_0000;
        /// Body is protected
        const PROTECTED = 0b0100_0000;
        /// Strictly ordered
        const ORDER     = 0b1000_0000;
    }
}

/// Owned 802.11 frame
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub kind: FrameType,
    pub flags: FrameFlags,

    /// Duration in microseconds, or `AID | 0xC000` on PS-Poll
    pub duration_id: u16,

    /// Receiver (address 1)
    pub receiver: Address,
    /// Transmitter (address 2), absent on CTS and ACK
    pub transmitter: Option<Address>,
    /// BSSID (address 3) on data and management frames
    pub bssid: Option<Address>,

    /// 12-bit sequence number
    pub seq: u16,
    /// Traffic identifier for QoS data
    pub tid: u8,

    body: Vec<u8, MAX_BODY_LEN>,
}

impl Frame {
    fn new(kind: FrameType, receiver: Address) -> Self {
        Self {
            kind,
            flags: FrameFlags::empty(),
            duration_id: 0,
            receiver,
            transmitter: None,
            bssid: None,
            seq: 0,
            tid: 0,
            body: Vec::new(),
        }
    }

    pub fn rts(receiver: Address, transmitter: Address, duration: u16) -> Self {
        let mut f = Self::new(FrameType::Rts, receiver);
        f.transmitter = Some(transmitter);
        f.duration_id = duration;
        f
    }

    pub fn cts(receiver: Address, duration: u16) -> Self {
        let mut f = Self::new(FrameType::Cts, receiver);
        f.duration_id = duration;
        f
    }

    pub fn ack(receiver: Address, duration: u16) -> Self {
        let mut f = Self::new(FrameType::Ack, receiver);
        f.duration_id = duration;
        f
    }

    /// PS-Poll to the AP, the duration field carries the AID
    pub fn ps_poll(bssid: Address, transmitter: Address, aid: u16) -> Self {
        let mut f = Self::new(FrameType::PsPoll, bssid);
        f.transmitter = Some(transmitter);
        f.duration_id = aid | 0xc000;
        f
    }

    pub fn data(receiver: Address, transmitter: Address, bssid: Address, body: &[u8]) -> Result<Self, FrameError> {
        let mut f = Self::new(FrameType::Data, receiver);
        f.transmitter = Some(transmitter);
        f.bssid = Some(bssid);
        f.set_body(body)?;
        Ok(f)
    }

    pub fn qos_data(receiver: Address, transmitter: Address, bssid: Address, tid: u8, body: &[u8]) -> Result<Self, FrameError> {
        let mut f = Self::data(receiver, transmitter, bssid, body)?;
        f.kind = FrameType::QosData;
        f.tid = tid & 0x0f;
        Ok(f)
    }

    /// Generic management frame with a pre-encoded body
    pub fn management(kind: FrameType, receiver: Address, transmitter: Address, bssid: Address, body: &[u8]) -> Result<Self, FrameError> {
        let mut f = Self::new(kind, receiver);
        f.transmitter = Some(transmitter);
        f.bssid = Some(bssid);
        f.set_body(body)?;
        Ok(f)
    }

    /// Broadcast beacon frame
    pub fn beacon(transmitter: Address, bssid: Address, beacon: &Beacon) -> Result<Self, FrameError> {
        let mut f = Self::new(FrameType::Beacon, Address::BROADCAST);
        f.transmitter = Some(transmitter);
        f.bssid = Some(bssid);

        let mut buff = [0u8; BEACON_FIXED_LEN + 2 + 3 + MAX_TIM_BITMAP_LEN];
        let n = beacon.encode(&mut buff)?;
        f.set_body(&buff[..n])?;

        Ok(f)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: &[u8]) -> Result<(), FrameError> {
        self.body = Vec::from_slice(body).map_err(|_| FrameError::BodyTooLong)?;
        Ok(())
    }

    /// On-air length including the FCS
    pub fn len(&self) -> usize {
        self.kind.header_len() + self.body.len() + FCS_LEN
    }

    /// Frames addressed to a group are never acknowledged
    pub fn is_group(&self) -> bool {
        self.receiver.is_group()
    }

    /// Association ID carried by a PS-Poll
    pub fn aid(&self) -> Option<u16> {
        match self.kind {
            FrameType::PsPoll => Some(self.duration_id & 0x3fff),
            _ => None,
        }
    }

    /// Encode the frame (without FCS) into `buf`, returning the encoded length
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        let n = self.kind.header_len() + self.body.len();
        if buf.len() < n {
            return Err(FrameError::BufferTooSmall);
        }

        let (ty, subtype) = self.kind.bits();
        buf[0] = (ty << 2) | (subtype << 4);
        buf[1] = self.flags.bits();
        LittleEndian::write_u16(&mut buf[2..], self.duration_id);
        buf[4..10].copy_from_slice(&self.receiver.0);

        let mut offset = 10;

        if self.kind.header_len() > 10 {
            let ta = self.transmitter.unwrap_or_default();
            buf[offset..offset + 6].copy_from_slice(&ta.0);
            offset += 6;
        }

        if self.kind.header_len() >= DATA_HEADER_LEN {
            let bssid = self.bssid.unwrap_or_default();
            buf[offset..offset + 6].copy_from_slice(&bssid.0);
            offset += 6;

            LittleEndian::write_u16(&mut buf[offset..], (self.seq & 0x0fff) << 4);
            offset += 2;
        }

        if self.kind.has_qos() {
            LittleEndian::write_u16(&mut buf[offset..], self.tid as u16 & 0x0f);
            offset += QOS_CONTROL_LEN;
        }

        buf[offset..offset + self.body.len()].copy_from_slice(&self.body);
        offset += self.body.len();

        Ok(offset)
    }

    /// Decode a frame (without FCS)
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < 10 {
            return Err(FrameError::NotEnoughBytes);
        }

        let version = buf[0] & 0b11;
        if version != 0 {
            return Err(FrameError::InvalidVersion(version));
        }

        let ty = (buf[0] >> 2) & 0b11;
        let subtype = buf[0] >> 4;
        let kind = FrameType::from_bits(ty, subtype).ok_or(FrameError::UnknownType(ty, subtype))?;

        let header_len = kind.header_len();
        if buf.len() < header_len {
            return Err(FrameError::NotEnoughBytes);
        }

        let mut f = Self::new(kind, read_address(&buf[4..]));
        f.flags = FrameFlags::from_bits_truncate(buf[1]);
        f.duration_id = LittleEndian::read_u16(&buf[2..]);

        if header_len > 10 {
            f.transmitter = Some(read_address(&buf[10..]));
        }

        if header_len >= DATA_HEADER_LEN {
            f.bssid = Some(read_address(&buf[16..]));
            f.seq = LittleEndian::read_u16(&buf[22..]) >> 4;
        }

        if kind.has_qos() {
            f.tid = (LittleEndian::read_u16(&buf[DATA_HEADER_LEN..]) & 0x0f) as u8;
        }

        f.set_body(&buf[header_len..])?;

        Ok(f)
    }
}

fn read_address(buf: &[u8]) -> Address {
    let mut a = [0u8; 6];
    a.copy_from_slice(&buf[..6]);
    Address(a)
}

/// Beacon frame body
#[derive(Clone, Debug, PartialEq)]
pub struct Beacon {
    /// Transmitter TSF timer in microseconds
    pub timestamp: u64,
    /// Beacon interval in time units
    pub interval_tu: u16,
    pub capability: u16,
    /// Traffic indication map, present when the sender buffers for PS stations
    pub tim: Option<Tim>,
}

impl Beacon {
    /// Beacon interval in microseconds
    pub fn interval_us(&self) -> Ts {
        self.interval_tu as Ts * TIME_UNIT_US
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        if buf.len() < BEACON_FIXED_LEN {
            return Err(FrameError::BufferTooSmall);
        }

        LittleEndian::write_u64(&mut buf[0..], self.timestamp);
        LittleEndian::write_u16(&mut buf[8..], self.interval_tu);
        LittleEndian::write_u16(&mut buf[10..], self.capability);

        let mut n = BEACON_FIXED_LEN;
        if let Some(tim) = &self.tim {
            n += tim.encode(&mut buf[n..])?;
        }

        Ok(n)
    }

    /// Decode a beacon body, scanning the elements for a TIM
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < BEACON_FIXED_LEN {
            return Err(FrameError::NotEnoughBytes);
        }

        let mut b = Beacon {
            timestamp: LittleEndian::read_u64(&body[0..]),
            interval_tu: LittleEndian::read_u16(&body[8..]),
            capability: LittleEndian::read_u16(&body[10..]),
            tim: None,
        };

        let mut offset = BEACON_FIXED_LEN;
        while offset + 2 <= body.len() {
            let id = body[offset];
            let len = body[offset + 1] as usize;
            let end = offset + 2 + len;

            if end > body.len() {
                return Err(FrameError::InvalidElement(id));
            }

            if id == TIM_ELEMENT_ID {
                b.tim = Some(Tim::decode(&body[offset + 2..end])?);
                break;
            }

            offset = end;
        }

        Ok(b)
    }
}

/// Traffic indication map element
#[derive(Clone, Debug, PartialEq)]
pub struct Tim {
    /// Beacons until the next DTIM, zero when this beacon is a DTIM
    pub dtim_count: u8,
    pub dtim_period: u8,
    /// Bit 0: group traffic buffered, bits 1..7: bitmap offset (N1 / 2)
    pub bitmap_control: u8,
    /// Partial virtual bitmap, octets N1 through N2
    pub bitmap: Vec<u8, MAX_TIM_BITMAP_LEN>,
}

impl Tim {
    /// Build a TIM indicating buffered unicast traffic for `aids`
    pub fn new(dtim_count: u8, dtim_period: u8, broadcast: bool, aids: &[u16]) -> Self {
        let mut virtual_bitmap = [0u8; MAX_TIM_BITMAP_LEN];
        let mut first: Option<usize> = None;
        let mut last = 0;

        for aid in aids.iter().filter(|a| **a > 0 && **a <= MAX_AID) {
            let octet = *aid as usize / 8;
            virtual_bitmap[octet] |= 1 << (aid % 8);

            first = Some(first.map_or(octet, |f| f.min(octet)));
            last = last.max(octet);
        }

        // N1 is the largest even octet number below the first set bit
        let n1 = first.map_or(0, |f| f & !1);
        let n2 = last.max(n1);

        let mut bitmap = Vec::new();
        for b in &virtual_bitmap[n1..=n2] {
            let _ = bitmap.push(*b);
        }

        let mut bitmap_control = ((n1 / 2) as u8) << 1;
        if broadcast {
            bitmap_control |= 0x01;
        }

        Self {
            dtim_count,
            dtim_period,
            bitmap_control,
            bitmap,
        }
    }

    pub fn is_dtim(&self) -> bool {
        self.dtim_count == 0
    }

    /// Group traffic is only delivered after a DTIM
    pub fn broadcast_buffered(&self) -> bool {
        self.bitmap_control & 0x01 != 0
    }

    /// Check whether the AP holds unicast traffic for `aid`
    pub fn unicast_buffered(&self, aid: u16) -> bool {
        if self.bitmap.is_empty() {
            return false;
        }

        let n1 = (self.bitmap_control >> 1) as usize * 2;
        let n2 = n1 + self.bitmap.len() - 1;
        let octet = aid as usize / 8;

        if octet < n1 || octet > n2 {
            return false;
        }

        (self.bitmap[octet - n1] >> (aid % 8)) & 0x01 != 0
    }

    /// Encode as an information element
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        let n = 2 + 3 + self.bitmap.len();
        if buf.len() < n {
            return Err(FrameError::BufferTooSmall);
        }

        buf[0] = TIM_ELEMENT_ID;
        buf[1] = (3 + self.bitmap.len()) as u8;
        buf[2] = self.dtim_count;
        buf[3] = self.dtim_period;
        buf[4] = self.bitmap_control;
        buf[5..n].copy_from_slice(&self.bitmap);

        Ok(n)
    }

    /// Decode the element payload (after ID and length)
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::InvalidElement(TIM_ELEMENT_ID));
        }

        let bitmap = Vec::from_slice(&data[3..]).map_err(|_| FrameError::InvalidElement(TIM_ELEMENT_ID))?;

        Ok(Self {
            dtim_count: data[0],
            dtim_period: data[1],
            bitmap_control: data[2],
            bitmap,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(v: u64) -> Address {
        Address::from(v)
    }

    #[test]
    fn control_frame_lengths() {
        assert_eq!(Frame::ack(addr(1), 0).len(), ACK_LEN);
        assert_eq!(Frame::cts(addr(1), 0).len(), CTS_LEN);
        assert_eq!(Frame::rts(addr(1), addr(2), 0).len(), RTS_LEN);
        assert_eq!(Frame::ps_poll(addr(1), addr(2), 7).len(), PS_POLL_LEN);

        let d = Frame::data(addr(1), addr(2), addr(3), &[0u8; 100]).unwrap();
        assert_eq!(d.len(), DATA_HEADER_LEN + 100 + FCS_LEN);

        let q = Frame::qos_data(addr(1), addr(2), addr(3), 5, &[0u8; 100]).unwrap();
        assert_eq!(q.len(), DATA_HEADER_LEN + QOS_CONTROL_LEN + 100 + FCS_LEN);
    }

    #[test]
    fn encode_decode_qos_data() {
        let mut f = Frame::qos_data(addr(0x0a), addr(0x0b), addr(0x0c), 6, &[1, 2, 3, 4]).unwrap();
        f.seq = 0x123;
        f.flags = FrameFlags::RETRY | FrameFlags::TO_DS;
        f.duration_id = 44;

        let mut buff = [0u8; 64];
        let n = f.encode(&mut buff).unwrap();
        assert_eq!(n, f.len() - FCS_LEN);
        assert_eq!(buff[0], (2 << 2) | (8 << 4));

        let d = Frame::decode(&buff[..n]).unwrap();
        assert_eq!(d, f);
    }

    #[test]
    fn decode_rejects_truncated_and_unknown() {
        assert_eq!(Frame::decode(&[0xd4, 0, 0]), Err(FrameError::NotEnoughBytes));

        // Control type with reserved subtype 3
        let buff = [(1 << 2) | (3 << 4), 0, 0, 0, 1, 2, 3, 4, 5, 6];
        assert_eq!(Frame::decode(&buff), Err(FrameError::UnknownType(1, 3)));

        // RTS truncated before the transmitter address
        let rts = Frame::rts(addr(1), addr(2), 100);
        let mut buff = [0u8; 32];
        let n = rts.encode(&mut buff).unwrap();
        assert_eq!(Frame::decode(&buff[..n - 1]), Err(FrameError::NotEnoughBytes));
    }

    #[test]
    fn ps_poll_carries_aid() {
        let p = Frame::ps_poll(addr(1), addr(2), 42);
        assert_eq!(p.duration_id, 42 | 0xc000);
        assert_eq!(p.aid(), Some(42));
    }

    #[test]
    fn tim_unicast_bitmap() {
        let tim = Tim::new(0, 3, false, &[17, 40]);

        // First set octet is 2, so N1 = 2 and the bitmap covers octets 2..=5
        assert_eq!(tim.bitmap_control >> 1, 1);
        assert_eq!(tim.bitmap.len(), 4);

        assert!(tim.unicast_buffered(17));
        assert!(tim.unicast_buffered(40));
        assert!(!tim.unicast_buffered(18));
        assert!(!tim.unicast_buffered(3));
        assert!(!tim.unicast_buffered(200));

        assert!(tim.is_dtim());
        assert!(!tim.broadcast_buffered());
    }

    #[test]
    fn tim_empty_and_broadcast() {
        let tim = Tim::new(2, 3, true, &[]);

        assert_eq!(tim.bitmap.len(), 1);
        assert!(tim.broadcast_buffered());
        assert!(!tim.is_dtim());
        assert!(!tim.unicast_buffered(1));
    }

    #[test]
    fn beacon_decode_skips_other_elements() {
        let beacon = Beacon {
            timestamp: 123456,
            interval_tu: 100,
            capability: 0x0001,
            tim: Some(Tim::new(1, 2, false, &[5])),
        };

        let mut buff = [0u8; 64];
        let n = beacon.encode(&mut buff[..]).unwrap();

        // Splice an SSID element ahead of the TIM
        let mut body = [0u8; 80];
        body[..BEACON_FIXED_LEN].copy_from_slice(&buff[..BEACON_FIXED_LEN]);
        body[BEACON_FIXED_LEN..BEACON_FIXED_LEN + 6].copy_from_slice(&[0, 4, b't', b'e', b's', b't']);
        body[BEACON_FIXED_LEN + 6..n + 6].copy_from_slice(&buff[BEACON_FIXED_LEN..n]);

        let decoded = Beacon::decode(&body[..n + 6]).unwrap();
        assert_eq!(decoded, beacon);
        assert_eq!(decoded.interval_us(), 102_400);

        let tim = decoded.tim.unwrap();
        assert!(tim.unicast_buffered(5));
    }

    #[test]
    fn beacon_frame_roundtrip() {
        let beacon = Beacon {
            timestamp: 1,
            interval_tu: 100,
            capability: 0,
            tim: None,
        };
        let f = Frame::beacon(addr(2), addr(2), &beacon).unwrap();
        assert!(f.is_group());

        let mut buff = [0u8; 128];
        let n = f.encode(&mut buff).unwrap();
        let d = Frame::decode(&buff[..n]).unwrap();

        assert_eq!(d.kind, FrameType::Beacon);
        assert_eq!(Beacon::decode(d.body()).unwrap(), beacon);
    }
}
