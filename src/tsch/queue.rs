//! Per-neighbour packet queues for the TSCH MAC.
//!
//! The neighbour table itself is guarded by the global lock, but each
//! per-neighbour packet ring is lock-free: read-only operations on
//! neighbours and packets are allowed from the slot interrupt and outside
//! of it, other operations outside of the interrupt only.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use core::array;

use heapless::Vec;

use ieee802154::mac::Address;
use rand_core::RngCore;

use crate::error::{QueueError, TxStatus};
use crate::log::{debug, trace};
use crate::packet::{BROADCAST_ADDRESS, EB_ADDRESS};
use crate::MAX_PACKET_LEN;

use super::config::{
    TschConfig, TSCH_MAX_NEIGHBORS, TSCH_PACKET_POOL_SIZE, TSCH_QUEUE_NUM_PER_NEIGHBOR,
};
use super::lock::Lock;
use super::ring::RingIndex;

/// Sent-callback attached to a queued packet: an opaque token plus the
/// final status and number of transmission attempts
pub type SentCallback = fn(token: u32, status: TxStatus, transmissions: u8);

/// A queued outbound packet: the encoded frame plus completion state
#[derive(Debug)]
pub struct TschPacket {
    buf: Vec<u8, MAX_PACKET_LEN>,
    /// Callback and opaque argument for completion reporting
    pub sent: Option<(SentCallback, u32)>,
    /// Transmission attempts performed so far
    pub transmissions: u8,
    /// Latest MAC return status
    pub ret: TxStatus,
    /// Keepalives are generated internally and complete internally
    pub is_keepalive: bool,
    /// For EBs, offset of the sync IE content within the frame
    pub sync_ie_offset: Option<usize>,
}

impl TschPacket {
    pub fn new(frame: &[u8], sent: Option<(SentCallback, u32)>) -> Result<Self, QueueError> {
        let buf = Vec::from_slice(frame).map_err(|_| QueueError::PayloadLength)?;
        Ok(Self {
            buf,
            sent,
            transmissions: 0,
            ret: TxStatus::Deferred,
            is_keepalive: false,
            sync_ie_offset: None,
        })
    }

    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// MAC sequence number, read straight out of the encoded frame
    pub fn seqno(&self) -> u8 {
        self.buf.get(2).copied().unwrap_or(0)
    }
}

/// TSCH neighbour information
#[derive(Debug)]
pub struct Neighbor {
    /// Link-layer address of the neighbour
    pub addr: Address,
    /// Is this a virtual neighbour used for broadcast (data or EBs)?
    pub is_broadcast: bool,
    /// Is this neighbour our time source?
    pub is_time_source: bool,
    /// CSMA backoff exponent
    pub backoff_exponent: u8,
    /// CSMA backoff window (number of shared slots to skip)
    pub backoff_window: u8,
    /// How many links do we have to this neighbour?
    pub tx_links_count: u8,
    /// How many dedicated links do we have to this neighbour?
    pub dedicated_tx_links_count: u8,
    /// Pool indices of queued packets; the ring publishes which entries
    /// are live, so the commit of a put is a single atomic store
    tx_array: [usize; TSCH_QUEUE_NUM_PER_NEIGHBOR],
    ring: RingIndex<TSCH_QUEUE_NUM_PER_NEIGHBOR>,
}

impl Neighbor {
    fn new(addr: Address, min_be: u8) -> Self {
        Self {
            addr,
            is_broadcast: addr == BROADCAST_ADDRESS || addr == EB_ADDRESS,
            is_time_source: false,
            backoff_exponent: min_be,
            backoff_window: 0,
            tx_links_count: 0,
            dedicated_tx_links_count: 0,
            tx_array: [0; TSCH_QUEUE_NUM_PER_NEIGHBOR],
            ring: RingIndex::new(),
        }
    }

    /// May the neighbour transmit over a shared link?
    pub fn backoff_expired(&self) -> bool {
        self.backoff_window == 0
    }

    pub fn queue_len(&self) -> usize {
        self.ring.elements()
    }
}

/// Neighbour table plus the shared packet descriptor pool.
///
/// Two virtual neighbours always exist: the broadcast neighbour and the EB
/// neighbour.
pub struct NeighborQueues {
    neighbors: [Option<Neighbor>; TSCH_MAX_NEIGHBORS],
    pool: [Option<TschPacket>; TSCH_PACKET_POOL_SIZE],
    n_broadcast: usize,
    n_eb: usize,
    min_be: u8,
    max_be: u8,
}

impl NeighborQueues {
    /// Initialise the queue module, creating the virtual EB and broadcast
    /// neighbours. One-shot, called before any interrupt can fire.
    pub fn new(config: &TschConfig) -> Self {
        let mut q = Self {
            neighbors: array::from_fn(|_| None),
            pool: array::from_fn(|_| None),
            n_broadcast: 0,
            n_eb: 0,
            min_be: config.mac_min_be,
            max_be: config.mac_max_be,
        };

        q.neighbors[0] = Some(Neighbor::new(EB_ADDRESS, q.min_be));
        q.neighbors[1] = Some(Neighbor::new(BROADCAST_ADDRESS, q.min_be));
        q.n_eb = 0;
        q.n_broadcast = 1;

        q
    }

    pub fn broadcast_index(&self) -> usize {
        self.n_broadcast
    }

    pub fn eb_index(&self) -> usize {
        self.n_eb
    }

    pub fn nbr(&self, index: usize) -> Option<&Neighbor> {
        self.neighbors.get(index)?.as_ref()
    }

    pub fn nbr_mut(&mut self, index: usize) -> Option<&mut Neighbor> {
        self.neighbors.get_mut(index)?.as_mut()
    }

    pub fn packet(&self, index: usize) -> Option<&TschPacket> {
        self.pool.get(index)?.as_ref()
    }

    pub fn packet_mut(&mut self, index: usize) -> Option<&mut TschPacket> {
        self.pool.get_mut(index)?.as_mut()
    }

    /// Add a TSCH neighbour, or return the existing entry
    pub fn add_nbr(&mut self, addr: &Address, lock: &Lock) -> Option<usize> {
        if let Some(n) = self.get_nbr(addr, lock) {
            return Some(n);
        }

        let mut added = None;
        if lock.acquire() {
            if let Some(free) = self.neighbors.iter().position(|n| n.is_none()) {
                self.neighbors[free] = Some(Neighbor::new(*addr, self.min_be));
                added = Some(free);
            }
            lock.release();
        }

        match added {
            Some(_) => debug!("added nbr {:?}", addr),
            None => debug!("add nbr failed: {:?} locked: {}", addr, lock.is_locked()),
        }

        added
    }

    /// Get a TSCH neighbour, readable from interrupt when the lock is free
    pub fn get_nbr(&self, addr: &Address, lock: &Lock) -> Option<usize> {
        if lock.is_locked() {
            return None;
        }
        self.neighbors
            .iter()
            .position(|n| matches!(n, Some(n) if n.addr == *addr))
    }

    /// Get the TSCH time source (we currently assume there is only one)
    pub fn get_time_source(&self, lock: &Lock) -> Option<usize> {
        if lock.is_locked() {
            return None;
        }
        self.neighbors
            .iter()
            .position(|n| matches!(n, Some(n) if n.is_time_source))
    }

    /// Update the TSCH time source, returning true iff the source changed
    pub fn update_time_source(
        &mut self,
        new_addr: Option<&Address>,
        is_coordinator: bool,
        lock: &Lock,
    ) -> bool {
        if lock.is_locked() || is_coordinator {
            return false;
        }

        let old = self.get_time_source(lock);
        let new = match new_addr {
            Some(addr) => self.add_nbr(addr, lock),
            None => None,
        };

        if new == old {
            return false;
        }

        debug!("update time source: {:?} -> {:?}", old, new);

        if let Some(n) = new.and_then(|i| self.nbr_mut(i)) {
            n.is_time_source = true;
        }
        if let Some(o) = old.and_then(|i| self.nbr_mut(i)) {
            o.is_time_source = false;
        }

        true
    }

    /// Add a packet to a neighbour queue. Same lock-free scheme as the index
    /// ring: the slot is reserved and filled, then the put index is advanced
    /// with a single atomic store.
    pub fn add_packet(
        &mut self,
        addr: &Address,
        packet: TschPacket,
        lock: &Lock,
    ) -> Result<(), QueueError> {
        if lock.is_locked() {
            return Err(QueueError::Locked);
        }

        let n = self.add_nbr(addr, lock).ok_or(QueueError::NoNeighbor)?;

        let pool_index = self
            .pool
            .iter()
            .position(|p| p.is_none())
            .ok_or(QueueError::NoMemory)?;

        let nbr = self.neighbors[n].as_mut().unwrap();
        let put_index = nbr.ring.peek_put().ok_or(QueueError::Full)?;

        self.pool[pool_index] = Some(packet);
        nbr.tx_array[put_index] = pool_index;
        // Commit through the atomic put
        nbr.ring.put();

        trace!("queued packet for {:?} depth {}", addr, nbr.ring.elements());

        Ok(())
    }

    /// The number of packets currently queued for an address
    pub fn packet_count(&self, addr: &Address, lock: &Lock) -> Option<usize> {
        let n = self.get_nbr(addr, lock)?;
        Some(self.neighbors[n].as_ref().unwrap().ring.elements())
    }

    /// Is the neighbour queue empty?
    pub fn is_empty(&self, n: usize, lock: &Lock) -> bool {
        !lock.is_locked()
            && match self.nbr(n) {
                Some(nbr) => nbr.ring.is_empty(),
                None => true,
            }
    }

    /// Remove the first packet from a neighbour queue, committed through an
    /// atomic operation. Returns the pool index for later processing.
    pub fn remove_packet_from_queue(&mut self, n: usize, lock: &Lock) -> Option<usize> {
        if lock.is_locked() {
            return None;
        }
        let nbr = self.neighbors.get_mut(n)?.as_mut()?;
        let get_index = nbr.ring.get()?;
        Some(nbr.tx_array[get_index])
    }

    /// Free a packet descriptor
    pub fn free_packet(&mut self, index: usize) -> Option<TschPacket> {
        self.pool.get_mut(index)?.take()
    }

    /// Return the head packet of a neighbour queue. On a shared link the
    /// backoff must have expired for a packet to be offered.
    pub fn get_packet_for_nbr(&self, n: usize, is_shared_link: bool, lock: &Lock) -> Option<usize> {
        if lock.is_locked() {
            return None;
        }
        let nbr = self.nbr(n)?;
        let get_index = nbr.ring.peek_get()?;
        if is_shared_link && !nbr.backoff_expired() {
            return None;
        }
        Some(nbr.tx_array[get_index])
    }

    /// Return the head packet for a destination address
    pub fn get_packet_for_dest_addr(
        &self,
        addr: &Address,
        is_shared_link: bool,
        lock: &Lock,
    ) -> Option<usize> {
        let n = self.get_nbr(addr, lock)?;
        self.get_packet_for_nbr(n, is_shared_link, lock)
    }

    /// Return the head packet of any neighbour queue we have no dedicated
    /// tx link to, along with the neighbour index
    pub fn get_unicast_packet_for_any(
        &self,
        is_shared_link: bool,
        lock: &Lock,
    ) -> Option<(usize, usize)> {
        if lock.is_locked() {
            return None;
        }
        for (i, n) in self.neighbors.iter().enumerate() {
            let n = match n {
                Some(n) => n,
                None => continue,
            };
            // Only look at non-broadcast neighbours we have no tx link to
            if n.is_broadcast || n.tx_links_count != 0 {
                continue;
            }
            if let Some(p) = self.get_packet_for_nbr(i, is_shared_link, lock) {
                return Some((i, p));
            }
        }
        None
    }

    /// Reset neighbour backoff
    pub fn backoff_reset(&mut self, n: usize) {
        let min_be = self.min_be;
        if let Some(nbr) = self.nbr_mut(n) {
            nbr.backoff_window = 0;
            nbr.backoff_exponent = min_be;
        }
    }

    /// Increment the backoff exponent and pick a new window
    pub fn backoff_inc<Rng: RngCore>(&mut self, n: usize, rng: &mut Rng) {
        let max_be = self.max_be;
        if let Some(nbr) = self.nbr_mut(n) {
            nbr.backoff_exponent = (nbr.backoff_exponent + 1).min(max_be);
            // Pick a window (number of shared slots to skip)
            let window = rng.next_u32() & ((1u32 << nbr.backoff_exponent) - 1);
            // Add one as the window will be decremented at the end of the
            // current slot through update_all_backoff_windows
            nbr.backoff_window = window as u8 + 1;
        }
    }

    /// Decrement the backoff window for all queues able to transmit to
    /// `dest_addr`: every zero-tx-link neighbour on a broadcast slot, or the
    /// matching neighbour on a dedicated slot.
    pub fn update_all_backoff_windows(&mut self, dest_addr: &Address, lock: &Lock) {
        if lock.is_locked() {
            return;
        }
        let is_broadcast = *dest_addr == BROADCAST_ADDRESS;
        for n in self.neighbors.iter_mut().flatten() {
            if n.backoff_window != 0
                && ((n.tx_links_count == 0 && is_broadcast)
                    || (n.tx_links_count > 0 && n.addr == *dest_addr))
            {
                n.backoff_window -= 1;
            }
        }
    }

    /// Flush a neighbour queue, reporting TX_ERR through each callback
    fn flush_nbr_queue(&mut self, n: usize, lock: &Lock) {
        while !self.is_empty(n, lock) {
            if let Some(index) = self.remove_packet_from_queue(n, lock) {
                if let Some(p) = self.free_packet(index) {
                    if let Some((sent, token)) = p.sent {
                        sent(token, TxStatus::Err, p.transmissions);
                    }
                }
            }
        }
    }

    /// Remove a neighbour queue entirely
    fn remove_nbr(&mut self, n: usize, lock: &Lock) {
        if lock.acquire() {
            let removed = self.neighbors.get_mut(n).and_then(|n| n.take());
            lock.release();

            if let Some(nbr) = removed {
                debug!("removing nbr {:?}", nbr.addr);
                // Flush by hand: the entry is already out of the table
                let ring = nbr.ring;
                while let Some(get_index) = ring.get() {
                    let index = nbr.tx_array[get_index];
                    if let Some(p) = self.free_packet(index) {
                        if let Some((sent, token)) = p.sent {
                            sent(token, TxStatus::Err, p.transmissions);
                        }
                    }
                }
            }
        }
    }

    /// Flush all neighbour queues
    pub fn flush_all(&mut self, lock: &Lock) {
        if !lock.is_locked() {
            for n in 0..self.neighbors.len() {
                if self.neighbors[n].is_some() {
                    self.flush_nbr_queue(n, lock);
                }
            }
        }
    }

    /// Deallocate neighbours with an empty queue and no tx links. The time
    /// source and the virtual broadcast neighbours are always kept.
    pub fn free_unused_neighbors(&mut self, lock: &Lock) {
        if lock.is_locked() {
            return;
        }
        for i in 0..self.neighbors.len() {
            let gc = match &self.neighbors[i] {
                Some(n) => {
                    !n.is_broadcast
                        && !n.is_time_source
                        && n.tx_links_count == 0
                        && n.ring.is_empty()
                }
                None => false,
            };
            if gc {
                self.remove_nbr(i, lock);
            }
        }
    }
}
