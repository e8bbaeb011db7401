
/// Station MAC statistics
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacStats {
    pub unicast_sent: u32,
    pub broadcast_sent: u32,
    pub unicast_received: u32,
    pub broadcast_received: u32,

    pub rts_sent: u32,
    pub cts_sent: u32,
    pub ack_sent: u32,

    /// RTS retransmissions after a missed CTS
    pub rts_retries: u32,
    /// Data / management retransmissions after a missed ACK
    pub data_retries: u32,

    pub dropped_short: u32,
    pub dropped_long: u32,

    pub beacons_sent: u32,
    pub beacons_received: u32,
    pub beacons_missed: u32,
    /// IBSS beacons abandoned after hearing a peer's beacon
    pub beacons_cancelled: u32,

    pub ps_polls_sent: u32,
    pub atims_sent: u32,
    pub atims_received: u32,
    pub tim_received: u32,
    pub dtim_received: u32,
    pub sleeps: u32,
    pub reassociations: u32,

    pub rx_errors: u32,
    pub duplicates: u32,
}

impl MacStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Saturating increment for statistics counters
pub(crate) fn inc(v: &mut u32) {
    *v = v.saturating_add(1);
}
