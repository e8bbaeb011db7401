//! Access category queue set
//!
//! Each category holds at most one frame contending for the medium, with
//! its own contention window and retry counters. At most one category is
//! selected for contention at a time, the others keep their backoff frozen.

use log::{debug, warn};
use strum::IntoEnumIterator;

use crate::frame::{Address, Frame};

use super::backoff::{Backoff, RetryCounters};
use super::config::Config;
use super::Network;

/// EDCA access categories, ordered by priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumIter)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessCategory {
    Background = 0,
    BestEffort = 1,
    Video = 2,
    Voice = 3,
}

impl AccessCategory {
    /// Map an 802.1D user priority to its category
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            0 => AccessCategory::Background,
            1..=2 => AccessCategory::BestEffort,
            3..=5 => AccessCategory::Video,
            _ => AccessCategory::Voice,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Selection order when several categories hold frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionPolicy {
    /// Highest category first
    Priority,
    /// Rotate between categories
    RoundRobin,
}

/// Frame held by a category for transmission
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDescriptor {
    pub frame: Frame,
    pub next_hop: Address,
    pub ac: AccessCategory,
    pub priority: u8,
    /// Transmissions of this MPDU so far
    pub attempts: u8,
}

impl FrameDescriptor {
    pub fn new(frame: Frame, next_hop: Address, ac: AccessCategory, priority: u8) -> Self {
        Self{ frame, next_hop, ac, priority, attempts: 0 }
    }

    /// On-air length used for RTS and retry limit decisions
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_group(&self) -> bool {
        self.frame.is_group()
    }
}

/// How an exchange for a category's frame concluded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// Delivered (acknowledged, or sent if group addressed)
    Success,
    /// Missed response below the retry limit, the frame stays queued
    Retry,
    /// Retry limit reached, the frame is dropped
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcQueue {
    frame: Option<FrameDescriptor>,
    backoff: Backoff,
    retries: RetryCounters,
    dequeued: u32,
    retried: u32,
    dropped: u32,
}

impl AcQueue {
    fn new(cw_min: u16, cw_max: u16) -> Self {
        Self {
            frame: None,
            backoff: Backoff::new(cw_min, cw_max),
            retries: RetryCounters::default(),
            dequeued: 0,
            retried: 0,
            dropped: 0,
        }
    }

    pub fn frame(&self) -> Option<&FrameDescriptor> {
        self.frame.as_ref()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Per-category retry counters (maintained under EDCA only)
    pub fn retries(&self) -> RetryCounters {
        self.retries
    }

    /// Frames taken from the network layer
    pub fn dequeued(&self) -> u32 {
        self.dequeued
    }

    /// Missed responses followed by a retransmission
    pub fn retried(&self) -> u32 {
        self.retried
    }

    /// Frames dropped on retry exhaustion
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    fn reset(&mut self) {
        self.frame = None;
        self.retries.reset();
        self.backoff.reset();
    }
}

/// Per-category frame holders with single selection
#[derive(Debug, Clone, PartialEq)]
pub struct AcSet {
    queues: [AcQueue; 4],
    qos: bool,
    policy: SelectionPolicy,
    selected: Option<AccessCategory>,
    rr_next: usize,
}

impl AcSet {
    pub fn new(config: &Config) -> Self {
        let q = |ac| {
            let (min, max) = config.cw_bounds(ac);
            AcQueue::new(min, max)
        };

        Self {
            queues: [
                q(AccessCategory::Background),
                q(AccessCategory::BestEffort),
                q(AccessCategory::Video),
                q(AccessCategory::Voice),
            ],
            qos: config.qos,
            policy: config.selection,
            selected: None,
            rr_next: 0,
        }
    }

    /// Category used for a priority, legacy operation has a single queue
    pub fn category(&self, priority: u8) -> AccessCategory {
        match self.qos {
            true => AccessCategory::from_priority(priority),
            false => AccessCategory::BestEffort,
        }
    }

    /// Categories in use, highest priority first
    pub fn categories(&self) -> impl Iterator<Item=AccessCategory> {
        let qos = self.qos;
        AccessCategory::iter()
            .rev()
            .filter(move |ac| qos || *ac == AccessCategory::BestEffort)
    }

    pub fn queue(&self, ac: AccessCategory) -> &AcQueue {
        &self.queues[ac.index()]
    }

    pub fn is_empty(&self, ac: AccessCategory) -> bool {
        self.queues[ac.index()].frame.is_none()
    }

    /// Categories in use without a frame
    pub fn vacant(&self) -> impl Iterator<Item=AccessCategory> + '_ {
        self.categories().filter(move |ac| self.is_empty(*ac))
    }

    pub fn has_frames(&self) -> bool {
        self.categories().any(|ac| !self.is_empty(ac))
    }

    /// Place a frame in its category's slot, returned if the slot is taken
    pub fn load(&mut self, desc: FrameDescriptor) -> Result<(), FrameDescriptor> {
        let q = &mut self.queues[desc.ac.index()];
        if q.frame.is_some() {
            return Err(desc);
        }

        debug!("Loaded {} frame ({} bytes) to {:?} into {}", desc.frame.kind, desc.len(), desc.next_hop, desc.ac);

        q.dequeued = q.dequeued.saturating_add(1);
        q.frame = Some(desc);

        Ok(())
    }

    /// Select a category for contention if none is selected
    pub fn select(&mut self) -> Option<AccessCategory> {
        if self.selected.is_some() {
            return self.selected;
        }

        let selected = match self.policy {
            SelectionPolicy::Priority => {
                self.categories().find(|ac| !self.is_empty(*ac))
            },
            SelectionPolicy::RoundRobin => {
                let mut found = None;
                for i in 0..self.queues.len() {
                    let idx = (self.rr_next + i) % self.queues.len();
                    let ac = self.categories().find(|ac| ac.index() == idx);

                    if let Some(ac) = ac.filter(|ac| !self.is_empty(*ac)) {
                        self.rr_next = (idx + 1) % self.queues.len();
                        found = Some(ac);
                        break;
                    }
                }
                found
            },
        };

        if let Some(ac) = selected {
            debug!("Selected {} for contention", ac);
        }

        self.selected = selected;
        selected
    }

    pub fn selected(&self) -> Option<AccessCategory> {
        self.selected
    }

    pub fn is_selected(&self, ac: AccessCategory) -> bool {
        self.selected == Some(ac)
    }

    /// Frame held by the selected category
    pub fn selected_frame(&self) -> Option<&FrameDescriptor> {
        self.selected.and_then(|ac| self.queues[ac.index()].frame.as_ref())
    }

    pub fn backoff_mut(&mut self, ac: AccessCategory) -> &mut Backoff {
        &mut self.queues[ac.index()].backoff
    }

    /// Backoff and retry counters for the engine to update together
    pub fn contention_mut(&mut self, ac: AccessCategory) -> (&mut Backoff, &mut RetryCounters) {
        let q = &mut self.queues[ac.index()];
        (&mut q.backoff, &mut q.retries)
    }

    pub fn frame_mut(&mut self, ac: AccessCategory) -> Option<&mut FrameDescriptor> {
        self.queues[ac.index()].frame.as_mut()
    }

    /// Release the selection without concluding the exchange, the frame
    /// and its backoff stay with the category
    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Take back a frame that has not been sent
    pub fn unload(&mut self, ac: AccessCategory) -> Option<FrameDescriptor> {
        if self.selected == Some(ac) {
            self.selected = None;
        }

        let q = &mut self.queues[ac.index()];
        let desc = q.frame.take();
        q.retries.reset();
        desc
    }

    /// Conclude an attempt for a category's frame.
    ///
    /// Success and exhaustion release the frame and the selection,
    /// exhaustion also reports the drop (management frames to the
    /// management layer, others to the network layer). A retry keeps
    /// both.
    pub fn complete<N: Network>(&mut self, ac: AccessCategory, outcome: Outcome, network: &mut N) -> Option<FrameDescriptor> {
        let q = &mut self.queues[ac.index()];

        let released = match outcome {
            Outcome::Retry => {
                q.retried = q.retried.saturating_add(1);
                return None
            },
            Outcome::Success => {
                let desc = q.frame.take();
                q.reset();
                desc
            },
            Outcome::Exhausted => {
                let desc = q.frame.take();
                q.reset();
                q.dropped = q.dropped.saturating_add(1);

                match &desc {
                    Some(d) if d.frame.kind.is_management() => {
                        warn!("Dropping {} management frame to {:?}", d.frame.kind, d.next_hop);
                        network.notify_management_drop(&d.frame);
                    },
                    Some(d) => {
                        warn!("Dropping {} frame to {:?} from {}", d.frame.kind, d.next_hop, ac);
                        network.notify_packet_drop(&d.next_hop, &d.frame);
                    },
                    None => (),
                }
                desc
            },
        };

        if self.selected == Some(ac) {
            self.selected = None;
        }

        released
    }
}
