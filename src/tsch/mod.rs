//! TSCH MAC implementation: context object, association, beacon and
//! keepalive generation, and deferred event processing. The per-slot
//! engine lives in [`slot`].
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use core::array;

use heapless::spsc::Queue;
use heapless::Vec;

use ieee802154::mac::{Address, FrameType, WriteFooter};
use rand_core::RngCore;

use crate::error::{CoreError, QueueError};
use crate::log::{debug, info, trace, warn};
use crate::packet::{self, Packet, BROADCAST_ADDRESS, EB_ADDRESS};
use crate::timer::{self, Timer};
use crate::{Mac, Radio, RxInfo, MAX_PACKET_LEN};

pub mod asn;
pub mod config;
pub mod lock;
pub mod queue;
pub mod ring;
pub mod schedule;
pub mod slot;

use self::asn::{Asn, AsnDivisor};
use self::config::*;
use self::lock::Lock;
use self::queue::{NeighborQueues, SentCallback, TschPacket};
use self::ring::RingIndex;
use self::schedule::{LinkType, Schedule};
use self::slot::{SlotState, SlotVars};

/// Maximum data payload accepted from the upper layer, leaving room for
/// the MAC header within [`MAX_PACKET_LEN`]
pub const MAX_PAYLOAD_LEN: usize = 102;

/// MAC layer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TschStats {
    /// Slots skipped or rescheduled because the timer deadline passed
    pub deadline_misses: u32,
    /// Receptions dropped with the input ring full
    pub input_queue_drops: u32,
    /// Times we lost synchronisation and left the network
    pub desyncs: u32,
    /// Transmissions aborted by CCA
    pub cca_busy: u32,
    /// Packets dropped after exhausting retries
    pub tx_drops: u32,
    /// Received duplicates discarded
    pub dup_drops: u32,
}

/// A received frame captured during an RX slot, awaiting processing
/// outside of interrupt context
pub(crate) struct InputPacket {
    pub payload: [u8; MAX_PACKET_LEN],
    pub len: usize,
    pub rx_asn: Asn,
    pub rssi: i16,
}

impl InputPacket {
    fn new() -> Self {
        Self {
            payload: [0u8; MAX_PACKET_LEN],
            len: 0,
            rx_asn: Asn::new(0, 0),
            rssi: 0,
        }
    }
}

/// Bounded FIFO of (sender, seqno) pairs for duplicate suppression
struct SeqnoCache {
    entries: [Option<(Address, u8)>; TSCH_MAX_SEQNOS],
    cursor: usize,
}

impl SeqnoCache {
    fn new() -> Self {
        Self {
            entries: [None; TSCH_MAX_SEQNOS],
            cursor: 0,
        }
    }

    fn contains(&self, sender: &Address, seqno: u8) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, Some((a, s)) if a == sender && *s == seqno))
    }

    fn insert(&mut self, sender: Address, seqno: u8) {
        self.entries[self.cursor] = Some((sender, seqno));
        self.cursor = (self.cursor + 1) % TSCH_MAX_SEQNOS;
    }
}

/// TSCH MAC context.
///
/// Owns all MAC state: the cooperative side ([`Mac::tick`], schedule and
/// queue mutation) and the interrupt side ([`TschMac::slot_operation`]) are
/// both methods on this object, coordinated through the global lock.
pub struct TschMac<R, T, Rng> {
    /// Our link-layer address
    pub address: Address,

    pub(crate) config: TschConfig,
    pub(crate) timings: TschTimings,

    pub(crate) radio: R,
    pub(crate) timer: T,
    pub(crate) rng: Rng,

    // Network state
    pub(crate) associated: bool,
    pub(crate) join_priority: u8,
    pub(crate) current_asn: Asn,
    pub(crate) last_sync_asn: Asn,
    association_time_s: u64,
    needs_reset: bool,

    // The current TSCH sequence number, used for both data and EBs
    packet_seqno: u8,

    // Slot engine state
    pub(crate) current_link: Option<u16>,
    pub(crate) current_link_start: u32,
    pub(crate) current_channel: Option<u8>,
    pub(crate) drift_correction: i32,
    pub(crate) drift_neighbor: Option<usize>,
    pub(crate) slot_state: SlotState,
    pub(crate) slot: SlotVars,
    next_wakeup: Option<u32>,

    pub(crate) hopping_len: AsnDivisor,

    pub(crate) lock: Lock,
    pub(crate) queues: NeighborQueues,
    pub(crate) schedule: Schedule,

    // Ringbuf for dequeued outgoing packets awaiting their callback
    pub(crate) dequeued_ring: RingIndex<TSCH_DEQUEUED_ARRAY_SIZE>,
    pub(crate) dequeued_array: [usize; TSCH_DEQUEUED_ARRAY_SIZE],

    // Ringbuf for incoming packets
    pub(crate) input_ring: RingIndex<TSCH_MAX_INCOMING_PACKETS>,
    pub(crate) input_array: [InputPacket; TSCH_MAX_INCOMING_PACKETS],

    seqno_cache: SeqnoCache,

    // EB and keepalive timers, ms deadlines polled from tick
    eb_period_ms: u64,
    next_eb_ms: Option<u64>,
    keepalive_ms: Option<u64>,

    // Association scan state
    scan_channel_base: u32,
    scan_channel: Option<u8>,

    // Received data awaiting the upper layer
    rx_buffer: Queue<(RxInfo, Vec<u8, MAX_PACKET_LEN>), 4>,

    pub(crate) stats: TschStats,
}

impl<R, T, Rng> TschMac<R, T, Rng>
where
    R: Radio,
    T: Timer,
    Rng: RngCore,
{
    /// Create a new TSCH MAC over the provided radio, timer and RNG.
    /// Initialisation is one-shot; teardown is not supported.
    pub fn new(
        radio: R,
        timer: T,
        mut rng: Rng,
        address: Address,
        config: TschConfig,
        timings: TschTimings,
    ) -> Self {
        let queues = NeighborQueues::new(&config);
        let hopping_len = AsnDivisor::new(config.hopping_sequence.len() as u16);
        let scan_channel_base = rng.next_u32();

        let mut s = Self {
            address,
            radio,
            timer,
            rng,

            associated: false,
            join_priority: 0xff,
            current_asn: Asn::new(0, 0),
            last_sync_asn: Asn::new(0, 0),
            association_time_s: 0,
            needs_reset: false,

            packet_seqno: 0,

            current_link: None,
            current_link_start: 0,
            current_channel: None,
            drift_correction: 0,
            drift_neighbor: None,
            slot_state: SlotState::Idle,
            slot: SlotVars::new(),
            next_wakeup: None,

            hopping_len,

            lock: Lock::new(),
            queues,
            schedule: Schedule::new(),

            dequeued_ring: RingIndex::new(),
            dequeued_array: [0; TSCH_DEQUEUED_ARRAY_SIZE],
            input_ring: RingIndex::new(),
            input_array: array::from_fn(|_| InputPacket::new()),

            seqno_cache: SeqnoCache::new(),

            eb_period_ms: config.min_eb_period_ms,
            next_eb_ms: None,
            keepalive_ms: None,

            scan_channel_base,
            scan_channel: None,

            rx_buffer: Queue::new(),

            stats: TschStats::default(),

            config,
            timings,
        };

        if s.config.default_schedule {
            let mut current = s.current_link;
            s.schedule
                .create_minimal(&mut s.queues, &s.lock, &mut current);
            s.current_link = current;
        }

        debug!("TSCH MAC init, address {:?}", s.address);

        s
    }

    pub fn is_associated(&self) -> bool {
        self.associated
    }

    pub fn join_priority(&self) -> u8 {
        self.join_priority
    }

    pub fn current_asn(&self) -> Asn {
        self.current_asn
    }

    pub fn stats(&self) -> TschStats {
        self.stats.clone()
    }

    /// Absolute timer value at which the platform must next invoke
    /// [`TschMac::slot_operation`], refreshed by association and by each
    /// slot operation's return value
    pub fn next_wakeup(&self) -> Option<u32> {
        self.next_wakeup
    }

    pub fn queues(&self) -> &NeighborQueues {
        &self.queues
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    // Schedule mutation entry points, wrapping the lock and neighbour
    // counter bookkeeping

    pub fn add_slotframe(&mut self, handle: u16, size: u16) -> bool {
        self.schedule.add_slotframe(handle, size, &self.lock)
    }

    pub fn remove_slotframe(&mut self, handle: u16) -> bool {
        let mut current = self.current_link;
        let r = self
            .schedule
            .remove_slotframe(handle, &mut self.queues, &self.lock, &mut current);
        self.current_link = current;
        r
    }

    pub fn add_link(
        &mut self,
        slotframe_handle: u16,
        link_options: u8,
        link_type: LinkType,
        addr: Address,
        timeslot: u16,
        channel_offset: u16,
    ) -> Option<u16> {
        let mut current = self.current_link;
        let r = self.schedule.add_link(
            slotframe_handle,
            link_options,
            link_type,
            addr,
            timeslot,
            channel_offset,
            &mut self.queues,
            &self.lock,
            &mut current,
        );
        self.current_link = current;
        r
    }

    pub fn remove_link(&mut self, slotframe_handle: u16, link_handle: u16) -> bool {
        let mut current = self.current_link;
        let r = self.schedule.remove_link(
            slotframe_handle,
            link_handle,
            &mut self.queues,
            &self.lock,
            &mut current,
        );
        self.current_link = current;
        r
    }

    /// Fetch and increment the TSCH sequence number, shared between data
    /// frames and EBs. Zero is never used.
    fn next_seqno(&mut self) -> u8 {
        self.packet_seqno = self.packet_seqno.wrapping_add(1);
        if self.packet_seqno == 0 {
            self.packet_seqno = 1;
        }
        self.packet_seqno
    }

    /// Enqueue a data frame for `dest`, with an optional sent-callback.
    /// Broadcasts are never acknowledged.
    pub fn send_packet(
        &mut self,
        dest: Address,
        data: &[u8],
        ack: bool,
        sent: Option<(SentCallback, u32)>,
    ) -> Result<(), CoreError<R::Error>> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(QueueError::PayloadLength.into());
        }

        // Broadcast packets go to the broadcast queue and are not acked
        let (addr, ack) = if dest == BROADCAST_ADDRESS || dest == Address::None {
            (BROADCAST_ADDRESS, false)
        } else {
            (dest, ack)
        };

        let seqno = self.next_seqno();
        let p = Packet::data(addr, self.address, seqno, data, ack)
            .map_err(|_| CoreError::Queue(QueueError::PayloadLength))?;

        let mut buf = [0u8; MAX_PACKET_LEN];
        let len = p.encode(&mut buf, WriteFooter::No);

        let tp = TschPacket::new(&buf[..len], sent).map_err(CoreError::Queue)?;
        self.queues
            .add_packet(&addr, tp, &self.lock)
            .map_err(CoreError::Queue)?;

        debug!(
            "send packet to {:?} seqno {} queued {:?}",
            addr,
            seqno,
            self.queues.packet_count(&addr, &self.lock)
        );

        Ok(())
    }

    /// Cooperative upkeep: association while unassociated, EB / keepalive
    /// generation and pending event processing once associated
    fn tick_inner(&mut self) {
        if !self.associated {
            if self.needs_reset {
                self.process_pending();
                self.reset();
                self.needs_reset = false;
            }
            self.associate_poll();
            return;
        }

        let now_ms = self.timer.ticks_ms();
        self.eb_tick(now_ms);

        if matches!(self.keepalive_ms, Some(t) if now_ms >= t) {
            self.keepalive_ms = None;
            self.keepalive_send();
        }

        self.process_pending();
    }

    /// One association attempt: if we are coordinator, start the network;
    /// otherwise scan for EBs, rotating channel with wall-clock seconds
    fn associate_poll(&mut self) {
        let now_ms = self.timer.ticks_ms();

        if self.config.coordinator {
            self.current_asn = Asn::new(0, 0);
            self.last_sync_asn = self.current_asn;
            self.join_priority = 0;
            self.associated = true;
            self.association_time_s = now_ms / 1000;
            self.eb_period_ms = self.config.min_eb_period_ms;
            // Coordinator sends an EB as soon as possible
            self.next_eb_ms = Some(now_ms);
            // Initial slot needs headroom for the first timer arm
            self.current_link_start = self
                .timer
                .ticks()
                .wrapping_add(20 * self.timings.min_delay);

            info!("starting network, asn {:?}", self.current_asn);

            self.schedule_initial_wakeup();
            return;
        }

        // Hop to a pseudo-random channel, rotating once per second
        let seconds = (now_ms / 1000) as u32;
        let index = self.scan_channel_base.wrapping_add(seconds)
            % self.config.hopping_sequence.len() as u32;
        let channel = self.config.hopping_sequence[index as usize];
        if self.scan_channel != Some(channel) {
            let _ = self.radio.set_channel(channel);
            let _ = self.radio.on();
            self.scan_channel = Some(channel);
            trace!("scanning for EBs on channel {}", channel);
        }

        if !self.radio.pending_packet() {
            return;
        }

        // Frame timestamp, before the read drains the radio
        let t0 = self
            .radio
            .sfd_timestamp()
            .unwrap_or_else(|| self.timer.ticks());

        let mut buf = [0u8; MAX_PACKET_LEN];
        let (len, _rssi) = match self.radio.read(&mut buf) {
            Some(r) => r,
            None => return,
        };

        let (source, sync) = match packet::parse_eb(&buf[..len]) {
            Some(r) => r,
            None => return,
        };

        // Optionally reject EBs whose ASN diverges from our uptime estimate
        if self.config.check_time_at_association_min > 0 {
            let slot_ms = (self.timings.slot_duration / self.timings.ticks_per_ms).max(1) as u64;
            let expected_asn = (now_ms / slot_ms) as i64;
            let threshold = self.config.check_time_at_association_min as i64 * 60_000 / slot_ms as i64;
            if sync.asn.ls4b as i64 - expected_asn > threshold {
                debug!("EB ASN rejected: {:?} expected ~{}", sync.asn, expected_asn);
                return;
            }
        }

        if sync.join_priority >= self.config.max_join_priority {
            debug!("EB JP too high: {}", sync.join_priority);
            return;
        }

        // Adopt the sender as time source and align our clock to the EB
        if self.queues.add_nbr(&source, &self.lock).is_none() {
            return;
        }
        self.queues
            .update_time_source(Some(&source), self.config.coordinator, &self.lock);

        self.current_asn = sync.asn;
        self.last_sync_asn = sync.asn;
        self.join_priority = sync.join_priority + 1;
        // Calculate the slot start from the frame timestamp
        self.current_link_start = t0.wrapping_sub(self.timings.tx_offset);
        self.associated = true;
        self.association_time_s = now_ms / 1000;
        self.eb_period_ms = self.config.min_eb_period_ms;

        let _ = self.radio.off();
        self.scan_channel = None;
        self.current_channel = None;

        info!(
            "association done, asn {:?}, jp {}, time source {:?}",
            self.current_asn, self.join_priority, source
        );

        // Initial EB delay is randomised over a whole period
        let delay = self.rng.next_u32() as u64 % self.eb_period_ms.max(1);
        self.next_eb_ms = Some(now_ms + delay);

        self.schedule_keepalive();
        self.schedule_initial_wakeup();
    }

    /// Find the first schedulable slot and arm for it, skipping slots whose
    /// deadline has already passed
    pub(crate) fn schedule_initial_wakeup(&mut self) {
        loop {
            let next = self.schedule.get_next_active_link(&self.current_asn, &self.lock);
            let diff = match &next {
                Some((_, d)) => *d,
                // No next link: wake at the next timeslot
                None => 1,
            };
            self.current_link = next.map(|(l, _)| l.handle);
            self.current_asn.increment(diff as u32);

            let step = diff as u32 * self.timings.slot_duration;
            let prev = self.current_link_start;
            self.current_link_start = prev.wrapping_add(step);

            if !timer::deadline_missed(
                prev,
                step,
                self.timer.ticks(),
                self.timings.min_delay,
            ) {
                break;
            }
            self.stats.deadline_misses += 1;
        }

        self.slot_state = SlotState::SlotStart;
        self.next_wakeup = Some(self.current_link_start);
    }

    pub(crate) fn set_next_wakeup(&mut self, at: Option<u32>) {
        self.next_wakeup = at;
    }

    /// Update the EB period, clamped to the configured bounds. Stuck to the
    /// minimum during the first minute after association.
    pub fn set_eb_period(&mut self, period_ms: u64) {
        let now_s = self.timer.ticks_ms() / 1000;
        if now_s > self.association_time_s + 60 {
            self.eb_period_ms = period_ms
                .max(self.config.min_eb_period_ms)
                .min(self.config.max_eb_period_ms);
        } else {
            self.eb_period_ms = self.config.min_eb_period_ms;
        }
    }

    /// Enqueue a fresh EB when due, then re-arm with jitter in
    /// [0.9 * period, period)
    fn eb_tick(&mut self, now_ms: u64) {
        match self.next_eb_ms {
            Some(t) if now_ms >= t => (),
            _ => return,
        }

        // Enqueue an EB only if there isn't already one in the queue
        if self.queues.packet_count(&EB_ADDRESS, &self.lock) == Some(0) {
            let seqno = self.next_seqno();
            let p = Packet::eb(self.address, seqno, &self.current_asn, self.join_priority);

            let mut buf = [0u8; MAX_PACKET_LEN];
            let len = p.encode(&mut buf, WriteFooter::No);
            // Offset of the sync IE content within the encoded frame, for
            // restamping at transmit time
            let sync_offset = len - p.payload().len() + p.sync_ie_offset.unwrap();

            match TschPacket::new(&buf[..len], None) {
                Ok(mut tp) => {
                    tp.sync_ie_offset = Some(sync_offset);
                    if self.queues.add_packet(&EB_ADDRESS, tp, &self.lock).is_err() {
                        debug!("could not enqueue EB");
                    } else {
                        trace!("enqueued EB, seqno {}", seqno);
                    }
                }
                Err(_) => (),
            }
        }

        let period = self.eb_period_ms;
        let delay = (period - period / 10) + self.rng.next_u32() as u64 % (period / 10).max(1);
        self.next_eb_ms = Some(now_ms + delay);
    }

    /// Arm the keepalive timer with jitter in [0.9 * T, T). Called on
    /// association and on every successful sync event.
    pub(crate) fn schedule_keepalive(&mut self) {
        if !self.config.coordinator && self.associated {
            let t = self.config.keepalive_timeout_ms;
            let delay = (t - t / 10) + self.rng.next_u32() as u64 % (t / 10).max(1);
            self.keepalive_ms = Some(self.timer.ticks_ms() + delay);
        }
    }

    /// Send an empty unicast to the time source. Completion reschedules the
    /// keepalive timer through the dequeued-packet path.
    fn keepalive_send(&mut self) {
        if !self.associated {
            return;
        }
        let addr = match self
            .queues
            .get_time_source(&self.lock)
            .and_then(|i| self.queues.nbr(i))
        {
            Some(n) => n.addr,
            None => return,
        };

        let seqno = self.next_seqno();
        let p = Packet::keepalive(addr, self.address, seqno);

        let mut buf = [0u8; MAX_PACKET_LEN];
        let len = p.encode(&mut buf, WriteFooter::No);

        match TschPacket::new(&buf[..len], None) {
            Ok(mut tp) => {
                tp.is_keepalive = true;
                if self.queues.add_packet(&addr, tp, &self.lock).is_err() {
                    debug!("could not enqueue keepalive");
                    // Try again next period rather than waiting on a
                    // completion that will never come
                    self.schedule_keepalive();
                } else {
                    trace!("keepalive to {:?}", addr);
                }
            }
            Err(_) => (),
        }
    }

    /// Drain deferred completions and receptions. Polled from tick, after
    /// the slot engine publishes into the rings.
    pub fn process_pending(&mut self) {
        self.tx_process_pending();
        self.rx_process_pending();
    }

    /// Pass sent packets to the upper layer
    fn tx_process_pending(&mut self) {
        while let Some(index) = self.dequeued_ring.peek_get() {
            let pool_index = self.dequeued_array[index];
            if let Some(p) = self.queues.free_packet(pool_index) {
                trace!(
                    "packet sent, status {:?} transmissions {}",
                    p.ret,
                    p.transmissions
                );
                if p.is_keepalive {
                    self.schedule_keepalive();
                } else if let Some((sent, token)) = p.sent {
                    sent(token, p.ret, p.transmissions);
                }
            }
            // Free all unused neighbours
            self.queues.free_unused_neighbors(&self.lock);
            self.dequeued_ring.get();
        }
    }

    /// Process pending input packets
    fn rx_process_pending(&mut self) {
        while let Some(index) = self.input_ring.peek_get() {
            let input = &self.input_array[index];
            let len = input.len;
            let rx_asn = input.rx_asn;
            let rssi = input.rssi;
            let mut buf = [0u8; MAX_PACKET_LEN];
            buf[..len].copy_from_slice(&input.payload[..len]);
            self.input_ring.get();

            let p = match Packet::decode(&buf[..len], false) {
                Ok(p) => p,
                Err(e) => {
                    debug!("failed to parse input: {:?}", e);
                    continue;
                }
            };

            match p.header.frame_type {
                FrameType::Beacon => self.handle_eb_input(&buf[..len], &rx_asn),
                FrameType::Data => {
                    let source = p.header.source;

                    // Duplicate suppression against the recent seqno cache
                    if self.seqno_cache.contains(&source, p.header.seq) {
                        debug!("drop dup from {:?} seqno {}", source, p.header.seq);
                        self.stats.dup_drops += 1;
                        continue;
                    }
                    self.seqno_cache.insert(source, p.header.seq);

                    // Empty data frames are keepalives, not passed up
                    if p.payload().is_empty() {
                        trace!("keepalive from {:?}", source);
                        continue;
                    }

                    debug!("received from {:?} seqno {}", source, p.header.seq);
                    let payload = Vec::from_slice(p.payload()).unwrap();
                    if self
                        .rx_buffer
                        .enqueue((RxInfo { source, rssi }, payload))
                        .is_err()
                    {
                        warn!("rx buffer full, dropping");
                    }
                }
                _ => (),
            }
        }
    }

    /// An EB received in a normal slot: correct ASN drift against our time
    /// source and track its join priority
    fn handle_eb_input(&mut self, frame: &[u8], rx_asn: &Asn) {
        let (source, sync) = match packet::parse_eb(frame) {
            Some(r) => r,
            None => return,
        };

        // Only our time source's EBs drive the clock
        let is_time_source = match self.queues.get_time_source(&self.lock) {
            Some(i) => self.queues.nbr(i).map(|n| n.addr) == Some(source),
            None => false,
        };
        if !is_time_source {
            return;
        }

        let asn_diff = rx_asn.diff(&sync.asn);
        if asn_diff != 0 {
            // Take the lock so no slot operation interferes, and abort the
            // scheduled-next link: it was armed per a drifted ASN
            if self.lock.acquire() {
                self.current_link = None;
            }
            if asn_diff > 0 {
                // Our ASN is too high
                self.current_asn.decrement(asn_diff as u32);
            } else {
                self.current_asn.increment((-asn_diff) as u32);
            }
            self.last_sync_asn = self.current_asn;
            self.lock.release();
            info!("corrected ASN by {}", asn_diff);
        }

        if sync.join_priority < self.config.max_join_priority {
            if self.join_priority != sync.join_priority + 1 {
                info!(
                    "update JP from EB {} -> {}",
                    self.join_priority,
                    sync.join_priority + 1
                );
                self.join_priority = sync.join_priority + 1;
            }
        } else {
            // Join priority unacceptable, leave the network
            warn!("EB JP too high ({}), leaving the network", sync.join_priority);
            self.associated = false;
            self.needs_reset = true;
            self.stats.desyncs += 1;
        }
    }

    /// Return to the unassociated state, ready for re-association
    fn reset(&mut self) {
        self.queues.free_unused_neighbors(&self.lock);
        self.queues
            .update_time_source(None, self.config.coordinator, &self.lock);

        self.join_priority = 0xff;
        self.current_asn = Asn::new(0, 0);
        self.current_link = None;
        self.slot = SlotVars::new();
        self.slot_state = SlotState::Idle;
        self.next_wakeup = None;
        self.next_eb_ms = None;
        self.keepalive_ms = None;
        self.drift_correction = 0;
        self.drift_neighbor = None;

        let _ = self.radio.off();
        self.scan_channel = None;
        self.current_channel = None;

        info!("will re-synchronize");
    }
}

impl<R, T, Rng> Mac<Address> for TschMac<R, T, Rng>
where
    R: Radio,
    T: Timer,
    Rng: RngCore,
{
    type Error = CoreError<R::Error>;

    fn tick(&mut self) -> Result<(), Self::Error> {
        self.tick_inner();
        Ok(())
    }

    fn busy(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.associated || self.lock.in_slot_operation())
    }

    /// Enqueue a packet for TX
    fn transmit(&mut self, dest: Address, data: &[u8], ack: bool) -> Result<(), Self::Error> {
        self.send_packet(dest, data, ack, None)
    }

    /// Check for received packets
    fn receive(&mut self, data: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error> {
        let (info, payload) = match self.rx_buffer.dequeue() {
            Some(rx) => rx,
            None => return Ok(None),
        };

        data[..payload.len()].copy_from_slice(&payload);

        Ok(Some((payload.len(), info)))
    }
}
