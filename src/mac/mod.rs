//! Medium Access Control (MAC) layer module.
//! Contains the station channel-access engine and its collaborators.

use heapless::Vec;

use crate::frame::{Address, Frame, MAX_BODY_LEN};

pub mod config;
pub use config::{Config, Role, AcParams, BeaconConfig, PowerSaveConfig};

pub mod queue;
pub use queue::{AccessCategory, AcSet, FrameDescriptor, Outcome, SelectionPolicy};

pub mod backoff;

pub mod stats;
pub use stats::MacStats;

pub mod station;
pub use station::{Station, State};

pub mod beacon;

pub mod atim;
pub use atim::AtimState;

/// Packet handed down by the network layer
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub next_hop: Address,
    /// 802.1D user priority (0..7)
    pub priority: u8,
    pub payload: Vec<u8, MAX_BODY_LEN>,
}

impl Outgoing {
    pub fn new(next_hop: Address, priority: u8, payload: &[u8]) -> Option<Self> {
        Some(Self {
            next_hop,
            priority,
            payload: Vec::from_slice(payload).ok()?,
        })
    }
}

/// Network (upper) layer collaborator
pub trait Network {
    /// Take the next packet for transmission, restricted to `ac` when
    /// the station runs EDCA
    fn dequeue_next_packet(&mut self, ac: Option<AccessCategory>) -> Option<Outgoing>;

    /// A packet could not be delivered to `next_hop`
    fn notify_packet_drop(&mut self, next_hop: &Address, frame: &Frame);

    /// A frame queued with `Station::enqueue_management` reached its
    /// retry limit
    fn notify_management_drop(&mut self, frame: &Frame);

    /// Hand off a received frame
    fn deliver_received_frame(&mut self, frame: &Frame, source: &Address);

    /// Association is stale after repeated missed beacons, the management
    /// layer should rescan and reassociate
    fn reassociate(&mut self);
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;

    #[derive(Debug, Default)]
    struct Inner {
        outgoing: VecDeque<Outgoing>,
        drops: Vec<(Address, Frame)>,
        management_drops: Vec<Frame>,
        delivered: Vec<(Address, Frame)>,
        reassociations: u32,
    }

    /// Mock network layer, a FIFO of outgoing packets plus records of
    /// drops, deliveries and reassociation requests
    #[derive(Clone, Debug)]
    pub struct MockNetwork(Arc<Mutex<Inner>>);

    impl MockNetwork {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner::default())))
        }

        pub fn push(&mut self, next_hop: Address, priority: u8, payload: &[u8]) {
            let o = Outgoing::new(next_hop, priority, payload).unwrap();
            self.0.lock().unwrap().outgoing.push_back(o);
        }

        pub fn pending(&self) -> usize {
            self.0.lock().unwrap().outgoing.len()
        }

        pub fn drops(&self) -> Vec<(Address, Frame)> {
            self.0.lock().unwrap().drops.clone()
        }

        pub fn management_drops(&self) -> Vec<Frame> {
            self.0.lock().unwrap().management_drops.clone()
        }

        pub fn delivered(&self) -> Vec<(Address, Frame)> {
            self.0.lock().unwrap().delivered.clone()
        }

        pub fn reassociations(&self) -> u32 {
            self.0.lock().unwrap().reassociations
        }
    }

    impl Network for MockNetwork {
        fn dequeue_next_packet(&mut self, ac: Option<AccessCategory>) -> Option<Outgoing> {
            let mut inner = self.0.lock().unwrap();

            let idx = inner.outgoing.iter()
                .position(|o| ac.map_or(true, |ac| AccessCategory::from_priority(o.priority) == ac))?;

            inner.outgoing.remove(idx)
        }

        fn notify_packet_drop(&mut self, next_hop: &Address, frame: &Frame) {
            self.0.lock().unwrap().drops.push((*next_hop, frame.clone()));
        }

        fn notify_management_drop(&mut self, frame: &Frame) {
            self.0.lock().unwrap().management_drops.push(frame.clone());
        }

        fn deliver_received_frame(&mut self, frame: &Frame, source: &Address) {
            self.0.lock().unwrap().delivered.push((*source, frame.clone()));
        }

        fn reassociate(&mut self) {
            self.0.lock().unwrap().reassociations += 1;
        }
    }
}
