
use crate::frame::FrameError;
use crate::mac::State;
use crate::phy::PhyStatus;

/// Station MAC errors
///
/// Protocol timeouts and retry exhaustion are handled inside the station
/// and never surface here, these indicate refused operations.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Wrapper for unhandled / underlying PHY errors
    Phy(E),

    /// Transmission attempted while the PHY is not idle
    PhyBusy(PhyStatus),

    /// Event has no defined transition in the current state
    InvalidState(State),

    /// Transmit opportunity with no frame to send
    NoFrame,

    /// Management queue full
    BufferFull,

    /// Frame encode / decode failed
    Frame(FrameError),

    /// Configuration rejected
    InvalidConfig(&'static str),
}

impl <E> From<FrameError> for CoreError<E> {
    fn from(e: FrameError) -> Self {
        CoreError::Frame(e)
    }
}
