//! TSCH configuration: capacities, timing template and protocol knobs.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use ieee802154::mac::PanId;

/// Per-neighbour transmit queue depth. Must be a power of two to allow
/// atomic index-ring operation (usable capacity is one less).
pub const TSCH_QUEUE_NUM_PER_NEIGHBOR: usize = 8;

/// Maximum number of neighbour queues, including the broadcast and EB
/// virtual neighbours
pub const TSCH_MAX_NEIGHBORS: usize = 8;

/// Packet descriptors shared across all neighbour queues
pub const TSCH_PACKET_POOL_SIZE: usize = 16;

/// Maximum number of slotframes
pub const TSCH_MAX_SLOTFRAMES: usize = 4;

/// Maximum links per slotframe
pub const TSCH_MAX_LINKS: usize = 32;

/// Incoming packet ring depth, power of two
pub const TSCH_MAX_INCOMING_PACKETS: usize = 4;

/// Dequeued packet ring depth, power of two, at least the packet pool size
pub const TSCH_DEQUEUED_ARRAY_SIZE: usize = 16;

/// Duplicate-detection cache depth
pub const TSCH_MAX_SEQNOS: usize = 8;

/// Slotframe length of the minimal default schedule (17 x 10ms slots)
pub const TSCH_SCHEDULE_DEFAULT_LENGTH: u16 = 17;

/// Default channel hopping sequence, ordered by measured goodness from a
/// testbed experiment rather than the standard default
pub const TSCH_HOPPING_SEQUENCE: &[u8] = &[
    26, 15, 25, 20, 16, 19, 14, 24, 18, 17, 17, 11, 21, 23, 12, 22, 13,
];

/// Slot timing template in hardware-timer ticks.
///
/// Defaults assume a 1MHz timer (one tick per microsecond) and the 10ms
/// 2.4GHz O-QPSK timeslot template.
#[derive(Debug, Clone, PartialEq)]
pub struct TschTimings {
    /// Delay from slot start to transmission
    pub tx_offset: u32,
    /// Long guard time, used by the receiver around expected frame start
    pub long_gt: u32,
    /// Short guard time, used around expected ACK start
    pub short_gt: u32,
    /// Turnaround from end of frame to ACK transmission
    pub tx_ack_delay: u32,
    /// Nominal slot length
    pub slot_duration: u32,
    /// Delay from slot start to CCA sampling
    pub cca_offset: u32,
    /// CCA sampling window
    pub cca: u32,
    /// Radio transmit pipeline compensation
    pub delay_tx: u32,
    /// Radio receive pipeline compensation
    pub delay_rx: u32,
    /// Upper bound on ACK on-air time
    pub ack_max_duration: u32,
    /// Upper bound on data frame on-air time
    pub data_max_duration: u32,
    /// On-air duration per byte
    pub byte_duration: u32,
    /// Minimum headroom required to arm the slot timer
    pub min_delay: u32,
    /// Hardware timer ticks per millisecond
    pub ticks_per_ms: u32,
}

impl Default for TschTimings {
    fn default() -> Self {
        Self {
            tx_offset: 2120,
            long_gt: 1300,
            short_gt: 400,
            tx_ack_delay: 1000,
            slot_duration: 10000,
            cca_offset: 1800,
            cca: 128,
            delay_tx: 0,
            delay_rx: 0,
            ack_max_duration: 2400,
            data_max_duration: 4256,
            byte_duration: 32,
            min_delay: 36,
            ticks_per_ms: 1000,
        }
    }
}

impl TschTimings {
    /// On-air duration of a frame, bounded by the slot template maximum
    pub fn packet_duration(&self, len: usize) -> u32 {
        (len as u32 * self.byte_duration).min(self.data_max_duration)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TschConfig {
    /// Is this node the TSCH coordinator (time source root)?
    pub coordinator: bool,

    pub pan_id: PanId,

    /// Channel hopping sequence
    pub hopping_sequence: &'static [u8],

    /// Minimum CSMA backoff exponent
    pub mac_min_be: u8,
    /// Maximum CSMA backoff exponent
    pub mac_max_be: u8,
    /// Retries after the first transmission attempt
    pub mac_max_frame_retries: u8,

    /// Enhanced Beacon period bounds in ms
    pub min_eb_period_ms: u64,
    pub max_eb_period_ms: u64,

    /// Keepalive period towards the time source in ms
    pub keepalive_timeout_ms: u64,

    /// Slots without a sync event before leaving the network
    pub desync_threshold_slots: u32,

    /// Join priorities at or above this are unacceptable
    pub max_join_priority: u8,

    /// Perform CCA before transmission
    pub cca_enabled: bool,

    /// Prefer TX-option links when slotframes collide on a slot, per the
    /// standard; otherwise lowest slotframe handle wins
    pub prioritize_tx: bool,

    /// Reject EBs whose ASN diverges from our uptime estimate by more than
    /// this many minutes, 0 to disable
    pub check_time_at_association_min: u32,

    /// Install the minimal schedule (one shared advertising link) on init
    pub default_schedule: bool,
}

impl Default for TschConfig {
    fn default() -> Self {
        Self {
            coordinator: false,
            pan_id: PanId(0x0100),

            hopping_sequence: TSCH_HOPPING_SEQUENCE,

            mac_min_be: 1,
            mac_max_be: 7,
            mac_max_frame_retries: 7,

            min_eb_period_ms: 4_000,
            max_eb_period_ms: 60_000,

            keepalive_timeout_ms: 12_000,

            desync_threshold_slots: 4_800,

            max_join_priority: 32,

            cca_enabled: false,
            prioritize_tx: true,
            check_time_at_association_min: 0,

            default_schedule: true,
        }
    }
}
