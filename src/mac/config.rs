
use crate::Ts;
use crate::frame::{Address, TIME_UNIT_US, ACK_LEN};
use crate::phy::{airtime, DataRate, LONG_PREAMBLE_US};

use super::queue::{AccessCategory, SelectionPolicy};

/// Station role within the network
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// Associated with an access point, follows its beacons
    Infrastructure {
        bssid: Address,
        /// Association ID assigned by the AP
        aid: u16,
    },
    /// Independent BSS member, shares beacon transmission
    Ibss {
        bssid: Address,
    },
}

impl Role {
    pub fn bssid(&self) -> Address {
        match self {
            Role::Infrastructure{ bssid, .. } => *bssid,
            Role::Ibss{ bssid } => *bssid,
        }
    }
}

/// EDCA parameters for one access category
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcParams {
    pub cw_min: u16,
    pub cw_max: u16,
    /// Slots added to SIFS to form AIFS
    pub aifsn: u8,
}

/// Beacon configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconConfig {
    /// Beacon interval in time units, replaced by the interval
    /// advertised in received beacons
    pub interval_tu: u16,
    /// Number of consecutive missed beacons tolerated before reassociation
    pub max_missed: u32,
    /// DTIM period advertised by IBSS beacons
    pub dtim_period: u8,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            interval_tu: 100,
            max_missed: 10,
            dtim_period: 1,
        }
    }
}

/// Power save configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSaveConfig {
    pub enabled: bool,
    /// Beacon intervals between listen windows (infrastructure)
    pub listen_interval: u16,
    /// Wake for DTIM beacons that fall inside the listen interval (infrastructure)
    pub receive_dtim: bool,
    /// ATIM window following each IBSS beacon, in time units
    pub atim_window_tu: u16,
}

impl Default for PowerSaveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_interval: 1,
            receive_dtim: true,
            atim_window_tu: 10,
        }
    }
}

/// Station MAC configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Station MAC address
    pub address: Address,

    pub role: Role,

    /// Frames longer than this (in bytes, FCS included) use RTS / CTS
    pub rts_threshold: usize,

    /// Attempts for frames at or below the RTS threshold
    pub short_retry_limit: u8,
    /// Attempts for frames above the RTS threshold
    pub long_retry_limit: u8,

    /// Slot time in microseconds
    pub slot_time_us: Ts,
    /// Short inter-frame space in microseconds
    pub sifs_us: Ts,
    /// DCF inter-frame space in microseconds
    pub difs_us: Ts,
    /// Extended inter-frame space, used after a corrupted reception
    pub eifs_us: Ts,

    /// Allowance for propagation delay in response timeouts
    pub propagation_delay_us: Ts,

    /// Enable EDCA with per access category contention
    pub qos: bool,

    /// Legacy DCF contention window bounds
    pub cw_min: u16,
    pub cw_max: u16,

    /// EDCA parameters, indexed by [`AccessCategory`]
    pub ac_params: [AcParams; 4],

    /// Access category selection when several hold frames
    pub selection: SelectionPolicy,

    /// Rate for control frames (RTS, CTS, ACK, PS-Poll) and beacons
    pub basic_rate: DataRate,
    /// Rate for data and management frames
    pub data_rate: DataRate,

    pub beacon: BeaconConfig,

    pub power_save: PowerSaveConfig,
}

impl Default for Config {
    fn default() -> Self {
        let sifs_us = 10;
        let difs_us = 50;

        Self {
            address: Address::default(),
            role: Role::Infrastructure{ bssid: Address::default(), aid: 1 },

            rts_threshold: 2346,
            short_retry_limit: 7,
            long_retry_limit: 4,

            slot_time_us: 20,
            sifs_us,
            difs_us,
            eifs_us: sifs_us + airtime(ACK_LEN, DataRate::MBPS_1, LONG_PREAMBLE_US) + difs_us,

            propagation_delay_us: 1,

            qos: false,
            cw_min: 31,
            cw_max: 1023,

            ac_params: [
                AcParams{ cw_min: 31, cw_max: 1023, aifsn: 7 },
                AcParams{ cw_min: 31, cw_max: 1023, aifsn: 3 },
                AcParams{ cw_min: 15, cw_max: 31, aifsn: 2 },
                AcParams{ cw_min: 7, cw_max: 15, aifsn: 2 },
            ],
            selection: SelectionPolicy::Priority,

            basic_rate: DataRate::MBPS_1,
            data_rate: DataRate::MBPS_11,

            beacon: BeaconConfig::default(),
            power_save: PowerSaveConfig::default(),
        }
    }
}

impl Config {
    /// Check the configuration is internally consistent
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.short_retry_limit == 0 || self.long_retry_limit == 0 {
            return Err("retry limits must be non-zero");
        }
        if self.cw_min > self.cw_max {
            return Err("cw_min exceeds cw_max");
        }
        if self.ac_params.iter().any(|p| p.cw_min > p.cw_max) {
            return Err("access category cw_min exceeds cw_max");
        }
        if self.beacon.interval_tu == 0 {
            return Err("beacon interval must be non-zero");
        }
        if self.power_save.enabled && self.power_save.listen_interval == 0 {
            return Err("listen interval must be non-zero");
        }
        if self.slot_time_us == 0 {
            return Err("slot time must be non-zero");
        }
        if self.eifs_us < self.difs_us {
            return Err("eifs shorter than difs");
        }
        if let (Role::Ibss{ .. }, true) = (&self.role, self.power_save.enabled) {
            let window = self.power_save.atim_window_tu;
            if window == 0 || window >= self.beacon.interval_tu {
                return Err("atim window must be non-zero and within the beacon interval");
            }
        }

        Ok(())
    }

    /// Beacon interval in microseconds
    pub fn beacon_interval_us(&self) -> Ts {
        self.beacon.interval_tu as Ts * TIME_UNIT_US
    }

    /// Contention window bounds for a category
    pub fn cw_bounds(&self, ac: AccessCategory) -> (u16, u16) {
        if self.qos {
            let p = &self.ac_params[ac.index()];
            (p.cw_min, p.cw_max)
        } else {
            (self.cw_min, self.cw_max)
        }
    }

    /// ATIM window in microseconds
    pub fn atim_window_us(&self) -> Ts {
        self.power_save.atim_window_tu as Ts * TIME_UNIT_US
    }

    /// Gap the medium must be idle before contention starts
    pub fn ifs_us(&self, ac: AccessCategory, extended: bool) -> Ts {
        let ifs = if self.qos {
            self.sifs_us + self.ac_params[ac.index()].aifsn as Ts * self.slot_time_us
        } else {
            self.difs_us
        };

        match extended {
            true => self.eifs_us.saturating_sub(self.difs_us) + ifs,
            false => ifs,
        }
    }
}
