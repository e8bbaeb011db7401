//! IEEE 802.11 station MAC channel access
//!
//! An event-driven DCF / EDCA engine: carrier sense with binary
//! exponential backoff, the RTS / CTS / DATA / ACK exchange with retry
//! limits, EDCA access categories, IBSS beacon generation and
//! infrastructure power save. The host supplies a [`phy::Phy`], a
//! [`mac::Network`] layer and a [`timer::Timer`], and feeds events into
//! a [`mac::Station`].

#![no_std]

#[cfg(any(test, feature="std"))]
extern crate std;

pub mod frame;

pub mod timer;

pub mod phy;

pub mod mac;

pub mod error;

pub mod prelude;


/// Timestamps are 64-bit in microseconds
pub type Ts = u64;
