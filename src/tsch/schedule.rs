//! TSCH MAC schedule manager: slotframes and timeslot-indexed links.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use heapless::Vec;

use ieee802154::mac::Address;

use crate::log::{debug, trace};
use crate::packet::BROADCAST_ADDRESS;

use super::asn::{Asn, AsnDivisor};
use super::config::{TSCH_MAX_LINKS, TSCH_MAX_SLOTFRAMES, TSCH_SCHEDULE_DEFAULT_LENGTH};
use super::lock::Lock;
use super::queue::NeighborQueues;

pub const LINK_OPTION_TX: u8 = 0x01;
pub const LINK_OPTION_RX: u8 = 0x02;
pub const LINK_OPTION_SHARED: u8 = 0x04;
pub const LINK_OPTION_TIME_KEEPING: u8 = 0x08;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkType {
    Normal,
    Advertising,
    AdvertisingOnly,
}

/// An entry in a slotframe's timeslot: TX/RX intent, destination and
/// channel offset
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Link {
    /// Monotonic handle, unique across slotframes
    pub handle: u16,
    /// Handle of the owning slotframe
    pub slotframe_handle: u16,
    /// Destination link-layer address
    pub addr: Address,
    /// Timeslot offset within the slotframe
    pub timeslot: u16,
    /// Offset into the hopping sequence
    pub channel_offset: u16,
    /// LINK_OPTION_* bits
    pub link_options: u8,
    pub link_type: LinkType,
    /// Opaque user data token
    pub data: usize,
}

impl Link {
    pub fn is_tx(&self) -> bool {
        self.link_options & LINK_OPTION_TX != 0
    }

    pub fn is_rx(&self) -> bool {
        self.link_options & LINK_OPTION_RX != 0
    }

    pub fn is_shared(&self) -> bool {
        self.link_options & LINK_OPTION_SHARED != 0
    }
}

/// A repeating cycle of timeslots. At most one link per timeslot.
#[derive(Debug)]
pub struct Slotframe {
    pub handle: u16,
    pub size: AsnDivisor,
    links: Vec<Link, TSCH_MAX_LINKS>,
}

/// The set of slotframes this node runs
pub struct Schedule {
    slotframes: Vec<Slotframe, TSCH_MAX_SLOTFRAMES>,
    next_link_handle: u16,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            slotframes: Vec::new(),
            next_link_handle: 0,
        }
    }

    /// Add a slotframe, failing if the handle is taken or storage exhausted
    pub fn add_slotframe(&mut self, handle: u16, size: u16, lock: &Lock) -> bool {
        if size == 0 || self.get_slotframe(handle).is_some() {
            return false;
        }
        if !lock.acquire() {
            return false;
        }
        let added = self
            .slotframes
            .push(Slotframe {
                handle,
                size: AsnDivisor::new(size),
                links: Vec::new(),
            })
            .is_ok();
        lock.release();

        debug!("add_slotframe {} size {}: {}", handle, size, added);
        added
    }

    /// Remove a slotframe and all of its links
    pub fn remove_slotframe(
        &mut self,
        handle: u16,
        queues: &mut NeighborQueues,
        lock: &Lock,
        current_link: &mut Option<u16>,
    ) -> bool {
        // Remove all links belonging to this slotframe first, so neighbour
        // counters stay in sync
        loop {
            let link = match self.slotframes.iter().find(|sf| sf.handle == handle) {
                Some(sf) => sf.links.first().map(|l| l.handle),
                None => return false,
            };
            match link {
                Some(l) => {
                    if !self.remove_link(handle, l, queues, lock, current_link) {
                        return false;
                    }
                }
                None => break,
            }
        }

        if !lock.acquire() {
            return false;
        }
        let index = self.slotframes.iter().position(|sf| sf.handle == handle);
        if let Some(i) = index {
            self.slotframes.swap_remove(i);
        }
        lock.release();
        index.is_some()
    }

    pub fn get_slotframe(&self, handle: u16) -> Option<&Slotframe> {
        self.slotframes.iter().find(|sf| sf.handle == handle)
    }

    /// Add a link to a slotframe. Any link already installed at the timeslot
    /// is removed first, keeping neighbour state in sync with link options.
    pub fn add_link(
        &mut self,
        slotframe_handle: u16,
        link_options: u8,
        link_type: LinkType,
        addr: Address,
        timeslot: u16,
        channel_offset: u16,
        queues: &mut NeighborQueues,
        lock: &Lock,
        current_link: &mut Option<u16>,
    ) -> Option<u16> {
        self.remove_link_from_timeslot(slotframe_handle, timeslot, queues, lock, current_link);

        if !lock.acquire() {
            debug!("add_link: couldn't take lock");
            return None;
        }

        let handle = self.next_link_handle;
        let link = Link {
            handle,
            slotframe_handle,
            addr,
            timeslot,
            channel_offset,
            link_options,
            link_type,
            data: 0,
        };

        let added = match self
            .slotframes
            .iter_mut()
            .find(|sf| sf.handle == slotframe_handle)
        {
            Some(sf) => {
                if sf.size.val <= timeslot {
                    false
                } else {
                    sf.links.push(link).is_ok()
                }
            }
            None => false,
        };

        // Release before updating the neighbour, which takes the lock itself
        lock.release();

        if !added {
            return None;
        }
        self.next_link_handle = self.next_link_handle.wrapping_add(1);

        trace!(
            "add_link sf {} opt {:02x} ts {} ch {}",
            slotframe_handle,
            link_options,
            timeslot,
            channel_offset
        );

        if link_options & LINK_OPTION_TX != 0 {
            // We have a tx link to this neighbour, update counters
            if let Some(n) = queues.add_nbr(&addr, lock) {
                let nbr = queues.nbr_mut(n).unwrap();
                nbr.tx_links_count += 1;
                if link_options & LINK_OPTION_SHARED == 0 {
                    nbr.dedicated_tx_links_count += 1;
                }
            }
        }

        Some(handle)
    }

    /// Remove a link, decrementing neighbour counters symmetrically. If the
    /// link is scheduled as next, the pointer is cleared so the slot engine
    /// skips it safely.
    pub fn remove_link(
        &mut self,
        slotframe_handle: u16,
        link_handle: u16,
        queues: &mut NeighborQueues,
        lock: &Lock,
        current_link: &mut Option<u16>,
    ) -> bool {
        if !lock.acquire() {
            debug!("remove_link: couldn't take lock");
            return false;
        }

        let removed = match self
            .slotframes
            .iter_mut()
            .find(|sf| sf.handle == slotframe_handle)
        {
            Some(sf) => match sf.links.iter().position(|l| l.handle == link_handle) {
                Some(i) => Some(sf.links.swap_remove(i)),
                None => None,
            },
            None => None,
        };

        if removed.is_some() && *current_link == Some(link_handle) {
            // The link to be removed is scheduled as next: clear it to
            // abort the upcoming slot operation
            *current_link = None;
        }

        lock.release();

        let link = match removed {
            Some(l) => l,
            None => return false,
        };

        trace!(
            "remove_link sf {} opt {:02x} ts {}",
            slotframe_handle,
            link.link_options,
            link.timeslot
        );

        if link.link_options & LINK_OPTION_TX != 0 {
            if let Some(n) = queues.add_nbr(&link.addr, lock) {
                let nbr = queues.nbr_mut(n).unwrap();
                nbr.tx_links_count -= 1;
                if link.link_options & LINK_OPTION_SHARED == 0 {
                    nbr.dedicated_tx_links_count -= 1;
                }
            }
        }

        true
    }

    pub fn remove_link_from_timeslot(
        &mut self,
        slotframe_handle: u16,
        timeslot: u16,
        queues: &mut NeighborQueues,
        lock: &Lock,
        current_link: &mut Option<u16>,
    ) -> bool {
        let handle = match self.get_link_from_timeslot(slotframe_handle, timeslot, lock) {
            Some(l) => l.handle,
            None => return false,
        };
        self.remove_link(slotframe_handle, handle, queues, lock, current_link)
    }

    /// Look within a slotframe for a link at a given timeslot
    pub fn get_link_from_timeslot(
        &self,
        slotframe_handle: u16,
        timeslot: u16,
        lock: &Lock,
    ) -> Option<Link> {
        if lock.is_locked() {
            return None;
        }
        // At most one link per timeslot in a given slotframe
        self.get_slotframe(slotframe_handle)?
            .links
            .iter()
            .find(|l| l.timeslot == timeslot)
            .copied()
    }

    /// Look across slotframes for a link by its handle
    pub fn get_link_from_handle(&self, handle: u16, lock: &Lock) -> Option<Link> {
        if lock.is_locked() {
            return None;
        }
        self.slotframes
            .iter()
            .flat_map(|sf| sf.links.iter())
            .find(|l| l.handle == handle)
            .copied()
    }

    /// Return the link to be used at a given ASN. When several slotframes
    /// fire in the same absolute slot, TX links win if `prioritize_tx` is
    /// set (as the standard stipulates), then the lowest slotframe handle.
    pub fn get_link_from_asn(&self, asn: &Asn, prioritize_tx: bool) -> Option<Link> {
        let mut curr_best: Option<&Link> = None;

        for sf in self.slotframes.iter() {
            let timeslot = asn.modulo(&sf.size);
            let l = match sf.links.iter().find(|l| l.timeslot == timeslot) {
                Some(l) => l,
                None => continue,
            };
            let best = match curr_best {
                None => {
                    curr_best = Some(l);
                    continue;
                }
                Some(b) => b,
            };
            if prioritize_tx {
                if best.is_tx() == l.is_tx() {
                    // Both or neither have TX, lowest handle wins
                    if l.slotframe_handle < best.slotframe_handle {
                        curr_best = Some(l);
                    }
                } else if l.is_tx() {
                    curr_best = Some(l);
                }
            } else if l.slotframe_handle < best.slotframe_handle {
                curr_best = Some(l);
            }
        }

        curr_best.copied()
    }

    /// Return the next active link at or after `asn`, and the slot distance
    /// to it. A link in the current timeslot counts a full cycle away.
    pub fn get_next_active_link(&self, asn: &Asn, lock: &Lock) -> Option<(Link, u16)> {
        if lock.is_locked() {
            return None;
        }

        let mut curr_earliest: u16 = 0;
        let mut curr_link: Option<&Link> = None;

        for sf in self.slotframes.iter() {
            let timeslot = asn.modulo(&sf.size);
            for l in sf.links.iter() {
                let time_to_timeslot = if l.timeslot > timeslot {
                    l.timeslot - timeslot
                } else {
                    sf.size.val + l.timeslot - timeslot
                };
                if curr_earliest == 0 || time_to_timeslot < curr_earliest {
                    curr_earliest = time_to_timeslot;
                    curr_link = Some(l);
                }
            }
        }

        curr_link.map(|l| (*l, curr_earliest))
    }

    /// Build the 6TiSCH minimal schedule: a single slotframe with one
    /// Tx|Rx|Shared advertising link on the broadcast address at (0, 0),
    /// usable for unicast, broadcast and EBs.
    pub fn create_minimal(
        &mut self,
        queues: &mut NeighborQueues,
        lock: &Lock,
        current_link: &mut Option<u16>,
    ) {
        self.add_slotframe(0, TSCH_SCHEDULE_DEFAULT_LENGTH, lock);
        self.add_link(
            0,
            LINK_OPTION_TX | LINK_OPTION_RX | LINK_OPTION_SHARED,
            LinkType::Advertising,
            BROADCAST_ADDRESS,
            0,
            0,
            queues,
            lock,
            current_link,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tsch::config::TschConfig;
    use ieee802154::mac::{PanId, ShortAddress};

    fn node(a: u16) -> Address {
        Address::Short(PanId(0x0100), ShortAddress(a))
    }

    struct Fixture {
        schedule: Schedule,
        queues: NeighborQueues,
        lock: Lock,
        current: Option<u16>,
    }

    fn fixture() -> Fixture {
        Fixture {
            schedule: Schedule::new(),
            queues: NeighborQueues::new(&TschConfig::default()),
            lock: Lock::new(),
            current: None,
        }
    }

    #[test]
    fn slotframe_handles_unique() {
        let mut f = fixture();
        assert!(f.schedule.add_slotframe(20, 5, &f.lock));
        assert!(!f.schedule.add_slotframe(20, 7, &f.lock));
        assert!(f.schedule.add_slotframe(21, 3, &f.lock));
        assert_eq!(f.schedule.get_slotframe(20).unwrap().size.val, 5);
    }

    #[test]
    fn link_counters_track_options() {
        let mut f = fixture();
        f.schedule.add_slotframe(20, 5, &f.lock);

        let dedicated = f
            .schedule
            .add_link(
                20,
                LINK_OPTION_TX,
                LinkType::Normal,
                node(1),
                1,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();
        let shared = f
            .schedule
            .add_link(
                20,
                LINK_OPTION_TX | LINK_OPTION_SHARED,
                LinkType::Normal,
                node(1),
                2,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();

        let n = f.queues.get_nbr(&node(1), &f.lock).unwrap();
        assert_eq!(f.queues.nbr(n).unwrap().tx_links_count, 2);
        assert_eq!(f.queues.nbr(n).unwrap().dedicated_tx_links_count, 1);

        // Remove restores the counters and GC eligibility
        assert!(f
            .schedule
            .remove_link(20, dedicated, &mut f.queues, &f.lock, &mut f.current));
        assert!(f
            .schedule
            .remove_link(20, shared, &mut f.queues, &f.lock, &mut f.current));
        let nbr = f.queues.nbr(n).unwrap();
        assert_eq!(nbr.tx_links_count, 0);
        assert_eq!(nbr.dedicated_tx_links_count, 0);

        f.queues.free_unused_neighbors(&f.lock);
        assert!(f.queues.get_nbr(&node(1), &f.lock).is_none());
    }

    #[test]
    fn one_link_per_timeslot() {
        let mut f = fixture();
        f.schedule.add_slotframe(20, 5, &f.lock);

        f.schedule
            .add_link(
                20,
                LINK_OPTION_TX,
                LinkType::Normal,
                node(1),
                1,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();
        // Same timeslot: the previous link is replaced, counters follow
        f.schedule
            .add_link(
                20,
                LINK_OPTION_RX,
                LinkType::Normal,
                node(2),
                1,
                3,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();

        let l = f.schedule.get_link_from_timeslot(20, 1, &f.lock).unwrap();
        assert_eq!(l.addr, node(2));
        assert_eq!(l.channel_offset, 3);

        let n = f.queues.get_nbr(&node(1), &f.lock).unwrap();
        assert_eq!(f.queues.nbr(n).unwrap().tx_links_count, 0);
    }

    #[test]
    fn removing_scheduled_link_clears_pointer() {
        let mut f = fixture();
        f.schedule.add_slotframe(20, 5, &f.lock);
        let handle = f
            .schedule
            .add_link(
                20,
                LINK_OPTION_TX,
                LinkType::Normal,
                node(1),
                1,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();

        f.current = Some(handle);
        f.schedule
            .remove_link(20, handle, &mut f.queues, &f.lock, &mut f.current);
        assert_eq!(f.current, None);
    }

    #[test]
    fn asn_lookup_prioritizes_tx() {
        let mut f = fixture();
        // Two slotframes, both size 5, links in timeslot 0:
        // handle 20 carries RX, handle 21 carries TX
        f.schedule.add_slotframe(20, 5, &f.lock);
        f.schedule.add_slotframe(21, 5, &f.lock);
        f.schedule
            .add_link(
                20,
                LINK_OPTION_RX,
                LinkType::Normal,
                node(1),
                0,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();
        f.schedule
            .add_link(
                21,
                LINK_OPTION_TX,
                LinkType::Normal,
                node(2),
                0,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();

        // TX prioritisation: the TX link wins regardless of handle order
        let l = f.schedule.get_link_from_asn(&Asn::new(0, 0), true).unwrap();
        assert_eq!(l.slotframe_handle, 21);

        // Without it, the lower handle wins
        let l = f.schedule.get_link_from_asn(&Asn::new(0, 0), false).unwrap();
        assert_eq!(l.slotframe_handle, 20);

        // No link in other slots
        assert_eq!(f.schedule.get_link_from_asn(&Asn::new(0, 3), true), None);
    }

    #[test]
    fn asn_lookup_tx_tie_breaks_on_handle() {
        let mut f = fixture();
        f.schedule.add_slotframe(21, 5, &f.lock);
        f.schedule.add_slotframe(20, 5, &f.lock);
        for &sf in &[21u16, 20] {
            f.schedule
                .add_link(
                    sf,
                    LINK_OPTION_TX,
                    LinkType::Normal,
                    node(sf),
                    0,
                    0,
                    &mut f.queues,
                    &f.lock,
                    &mut f.current,
                )
                .unwrap();
        }
        let l = f.schedule.get_link_from_asn(&Asn::new(0, 0), true).unwrap();
        assert_eq!(l.slotframe_handle, 20);
    }

    #[test]
    fn next_active_link_distances() {
        let mut f = fixture();
        f.schedule.add_slotframe(20, 5, &f.lock);
        f.schedule.add_slotframe(21, 3, &f.lock);
        f.schedule
            .add_link(
                20,
                LINK_OPTION_TX,
                LinkType::Normal,
                node(1),
                1,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();
        f.schedule
            .add_link(
                21,
                LINK_OPTION_RX,
                LinkType::Normal,
                node(2),
                0,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();

        // At ASN 0 (ts 0 in both frames): link at ts 1 is 1 away, the
        // sf-21 link at ts 0 is a full cycle (3) away
        let (l, offset) = f
            .schedule
            .get_next_active_link(&Asn::new(0, 0), &f.lock)
            .unwrap();
        assert_eq!(l.timeslot, 1);
        assert_eq!(offset, 1);

        // At ASN 1, the sf-21 ts-0 link is 2 away, sf-20 ts-1 is 5 away
        let (l, offset) = f
            .schedule
            .get_next_active_link(&Asn::new(0, 1), &f.lock)
            .unwrap();
        assert_eq!(l.slotframe_handle, 21);
        assert_eq!(offset, 2);

        // Empty schedule has no next link
        let empty = Schedule::new();
        assert_eq!(empty.get_next_active_link(&Asn::new(0, 0), &f.lock), None);
    }

    #[test]
    fn remove_slotframe_removes_links() {
        let mut f = fixture();
        f.schedule.add_slotframe(20, 5, &f.lock);
        f.schedule
            .add_link(
                20,
                LINK_OPTION_TX,
                LinkType::Normal,
                node(1),
                1,
                0,
                &mut f.queues,
                &f.lock,
                &mut f.current,
            )
            .unwrap();

        assert!(f
            .schedule
            .remove_slotframe(20, &mut f.queues, &f.lock, &mut f.current));
        assert!(f.schedule.get_slotframe(20).is_none());

        let n = f.queues.get_nbr(&node(1), &f.lock).unwrap();
        assert_eq!(f.queues.nbr(n).unwrap().tx_links_count, 0);

        // Handle may be reused afterwards
        assert!(f.schedule.add_slotframe(20, 7, &f.lock));
    }

    #[test]
    fn minimal_schedule() {
        let mut f = fixture();
        f.schedule
            .create_minimal(&mut f.queues, &f.lock, &mut f.current);

        let l = f.schedule.get_link_from_timeslot(0, 0, &f.lock).unwrap();
        assert_eq!(l.addr, BROADCAST_ADDRESS);
        assert_eq!(l.channel_offset, 0);
        assert_eq!(l.link_type, LinkType::Advertising);
        assert!(l.is_tx() && l.is_rx() && l.is_shared());
        assert_eq!(
            f.schedule.get_slotframe(0).unwrap().size.val,
            TSCH_SCHEDULE_DEFAULT_LENGTH
        );
    }
}
