//! IEEE 802.15.4-2015 information elements used by the MAC: the TSCH
//! synchronisation sub-IE carried in Enhanced Beacons, and the time
//! correction header IE carried in enhanced ACKs.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use crate::tsch::asn::Asn;

/// Header IE element ID: list termination before payload IEs
const HEADER_IE_LIST_TERM_1: u8 = 0x7e;
/// Header IE element ID: ACK/NACK time correction
const HEADER_IE_TIME_CORRECTION: u8 = 0x1e;
/// Payload IE group ID: MLME (nested sub-IEs)
const PAYLOAD_IE_MLME: u16 = 1;
/// MLME short sub-IE ID: TSCH synchronisation (ASN + join priority)
const MLME_SUBIE_TSCH_SYNC: u8 = 0x1a;

/// Synchronisation content carried in an EB
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncIe {
    pub asn: Asn,
    pub join_priority: u8,
}

fn put_u16(buf: &mut [u8], val: u16) {
    buf[0] = val as u8;
    buf[1] = (val >> 8) as u8;
}

fn get_u16(buf: &[u8]) -> u16 {
    buf[0] as u16 | (buf[1] as u16) << 8
}

fn header_ie_descriptor(len: u8, element_id: u8) -> u16 {
    len as u16 | (element_id as u16) << 7
}

/// Write the EB IE block: header IE list terminator, then an MLME payload IE
/// holding the TSCH synchronisation sub-IE. Returns the total length and the
/// offset of the 6-byte synchronisation content, so it can be restamped in
/// place at transmit time.
pub fn write_eb_ies(buf: &mut [u8], asn: &Asn, join_priority: u8) -> Option<(usize, usize)> {
    if buf.len() < 12 {
        return None;
    }

    // Header IE list termination (HT1)
    put_u16(buf, header_ie_descriptor(0, HEADER_IE_LIST_TERM_1));
    // MLME payload IE, 8 bytes of nested content
    put_u16(&mut buf[2..], 8 | PAYLOAD_IE_MLME << 11 | 1 << 15);
    // TSCH synchronisation short sub-IE, 6 content bytes
    put_u16(&mut buf[4..], 6 | (MLME_SUBIE_TSCH_SYNC as u16) << 8);
    write_sync_content(&mut buf[6..], asn, join_priority);

    Some((12, 6))
}

/// Stamp ASN and join priority into a synchronisation content field
pub fn write_sync_content(buf: &mut [u8], asn: &Asn, join_priority: u8) {
    buf[0..4].copy_from_slice(&asn.ls4b.to_le_bytes());
    buf[4] = asn.ms1b;
    buf[5] = join_priority;
}

/// Parse an EB IE block, locating the synchronisation sub-IE
pub fn parse_eb_ies(buf: &[u8]) -> Option<SyncIe> {
    let mut offset = 0;

    // Skip any leading header IEs up to the list terminator
    while buf.len() >= offset + 2 {
        let descriptor = get_u16(&buf[offset..]);
        if descriptor & 0x8000 != 0 {
            // Payload IE reached without a terminator
            break;
        }
        let len = (descriptor & 0x7f) as usize;
        let element_id = (descriptor >> 7) as u8;
        offset += 2 + len;
        if element_id == HEADER_IE_LIST_TERM_1 {
            break;
        }
    }

    // Walk payload IEs looking for the MLME group
    while buf.len() >= offset + 2 {
        let descriptor = get_u16(&buf[offset..]);
        let len = (descriptor & 0x7ff) as usize;
        let group = descriptor >> 11 & 0xf;
        offset += 2;
        if buf.len() < offset + len {
            return None;
        }
        if group == PAYLOAD_IE_MLME {
            return parse_mlme_subies(&buf[offset..offset + len]);
        }
        offset += len;
    }

    None
}

fn parse_mlme_subies(buf: &[u8]) -> Option<SyncIe> {
    let mut offset = 0;
    while buf.len() >= offset + 2 {
        let descriptor = get_u16(&buf[offset..]);
        // Short sub-IE: 8-bit length, 7-bit sub-ID
        let len = (descriptor & 0xff) as usize;
        let sub_id = (descriptor >> 8 & 0x7f) as u8;
        offset += 2;
        if buf.len() < offset + len {
            return None;
        }
        if sub_id == MLME_SUBIE_TSCH_SYNC && len >= 6 {
            let content = &buf[offset..];
            return Some(SyncIe {
                asn: Asn::new(
                    content[4],
                    u32::from_le_bytes([content[0], content[1], content[2], content[3]]),
                ),
                join_priority: content[5],
            });
        }
        offset += len;
    }
    None
}

/// Write an ACK/NACK time correction header IE. The drift is a signed
/// hardware-timer tick count, truncated to the 12-bit field.
pub fn write_time_correction(buf: &mut [u8], drift: i16, nack: bool) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    put_u16(buf, header_ie_descriptor(2, HEADER_IE_TIME_CORRECTION));
    let mut content = drift as u16 & 0x0fff;
    if nack {
        content |= 0x8000;
    }
    put_u16(&mut buf[2..], content);
    Some(4)
}

/// Parse a time correction header IE, returning (drift, nack)
pub fn parse_time_correction(buf: &[u8]) -> Option<(i16, bool)> {
    if buf.len() < 4 {
        return None;
    }
    let descriptor = get_u16(buf);
    if (descriptor >> 7 & 0xff) as u8 != HEADER_IE_TIME_CORRECTION || descriptor & 0x7f != 2 {
        return None;
    }
    let content = get_u16(&buf[2..]);
    // Sign-extend the 12-bit correction
    let drift = ((content & 0x0fff) << 4) as i16 >> 4;
    Some((drift, content & 0x8000 != 0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eb_ies_roundtrip() {
        let mut buf = [0u8; 32];
        let asn = Asn::new(0x12, 0xdead_beef);
        let (len, sync_offset) = write_eb_ies(&mut buf, &asn, 5).unwrap();
        assert_eq!(len, 12);

        let sync = parse_eb_ies(&buf[..len]).unwrap();
        assert_eq!(sync.asn, asn);
        assert_eq!(sync.join_priority, 5);

        // Restamp in place and re-parse
        write_sync_content(&mut buf[sync_offset..], &Asn::new(0, 42), 1);
        let sync = parse_eb_ies(&buf[..len]).unwrap();
        assert_eq!(sync.asn, Asn::new(0, 42));
        assert_eq!(sync.join_priority, 1);
    }

    #[test]
    fn eb_ies_reject_garbage() {
        assert_eq!(parse_eb_ies(&[]), None);
        assert_eq!(parse_eb_ies(&[0xff]), None);
        // Truncated MLME content
        let mut buf = [0u8; 6];
        put_u16(&mut buf, header_ie_descriptor(0, HEADER_IE_LIST_TERM_1));
        put_u16(&mut buf[2..], 8 | PAYLOAD_IE_MLME << 11 | 1 << 15);
        assert_eq!(parse_eb_ies(&buf), None);
    }

    #[test]
    fn time_correction_roundtrip() {
        let mut buf = [0u8; 4];
        for &(drift, nack) in &[(0i16, false), (650, false), (-650, true), (2047, true), (-2048, false)] {
            let len = write_time_correction(&mut buf, drift, nack).unwrap();
            assert_eq!(len, 4);
            assert_eq!(parse_time_correction(&buf), Some((drift, nack)));
        }
    }

    #[test]
    fn time_correction_rejects_other_ies() {
        let mut buf = [0u8; 4];
        put_u16(&mut buf, header_ie_descriptor(2, HEADER_IE_LIST_TERM_1));
        assert_eq!(parse_time_correction(&buf), None);
    }
}
