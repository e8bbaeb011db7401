//! Station MAC crate prelude
//
// https://github.com/rust-iot/dot11-mac
// Copyright 2021 Ryan Kurte

pub use crate::Ts;

pub use crate::error::CoreError;
pub use crate::timer::{Timer as MacTimer, TimerHandle, TimerPurpose};

pub use crate::frame::{Address as MacAddress, Frame, FrameType, FrameFlags};

pub use crate::phy::{Phy, PhyStatus, DataRate, RadioPhy, RadioPhyConfig};

pub use crate::mac::{Station, State as StationState, Config as StationConfig, Role, Network, Outgoing, AccessCategory};
