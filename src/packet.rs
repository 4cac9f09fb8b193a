//! Owned IEEE 802.15.4 frames for the TSCH MAC: data, Enhanced Beacon,
//! keepalive and enhanced ACK construction and parsing.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use ieee802154::mac::*;

use heapless::Vec;

use crate::ie::{self, SyncIe};
use crate::tsch::asn::Asn;
use crate::MAX_PACKET_LEN;

/// 802.15.4 broadcast link-layer address
pub const BROADCAST_ADDRESS: Address =
    Address::Short(PanId(0xffff), ShortAddress(0xffff));

/// Address keying the virtual Enhanced Beacon neighbour queue. Never on air:
/// EBs themselves are sent to the broadcast address.
pub const EB_ADDRESS: Address = Address::Short(PanId(0xffff), ShortAddress(0xfffe));

/// Packet object represents an IEEE 802.15.4 frame with owned storage.
///
/// Based on the ieee802154 frame type, altered for static storage and for
/// 802.15.4-2015 content: EBs and enhanced ACKs carry information element
/// lists in the payload section, which the 2006-era `FrameContent` cannot
/// express, so the payload is kept raw and interpreted per frame type.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub header: Header,

    payload: Vec<u8, MAX_PACKET_LEN>,

    /// For EBs, offset of the synchronisation IE content within the payload,
    /// kept so the slot engine can restamp ASN and join priority in place
    pub sync_ie_offset: Option<usize>,

    pub footer: [u8; 2],
}

impl Packet {
    pub fn data(
        dest: Address,
        source: Address,
        seq: u8,
        data: &[u8],
        ack: bool,
    ) -> Result<Packet, ()> {
        let payload = Vec::from_slice(data)?;

        Ok(Packet {
            header: Header {
                frame_type: FrameType::Data,
                frame_pending: false,
                security: Security::None,
                ack_request: ack,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: dest,
                source,
                seq,
                seq_no_suppress: false,
                ie_present: false,
            },
            payload,
            sync_ie_offset: None,
            footer: [0u8; 2],
        })
    }

    /// An empty acknowledged data frame, used as keepalive to the time source
    pub fn keepalive(dest: Address, source: Address, seq: u8) -> Packet {
        // Unwrap ok, the payload is empty
        Self::data(dest, source, seq, &[], true).unwrap()
    }

    /// An Enhanced Beacon carrying the synchronisation IE
    pub fn eb(source: Address, seq: u8, asn: &Asn, join_priority: u8) -> Packet {
        let mut buf = [0u8; 16];
        // Unwrap ok, the buffer fits the fixed-size IE block
        let (len, sync_offset) = ie::write_eb_ies(&mut buf, asn, join_priority).unwrap();
        let payload = Vec::from_slice(&buf[..len]).unwrap();

        Packet {
            header: Header {
                frame_type: FrameType::Beacon,
                frame_pending: false,
                security: Security::None,
                ack_request: false,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154,
                destination: BROADCAST_ADDRESS,
                source,
                seq,
                seq_no_suppress: false,
                ie_present: true,
            },
            payload,
            sync_ie_offset: Some(sync_offset),
            footer: [0u8; 2],
        }
    }

    /// An enhanced ACK carrying the time correction IE
    pub fn sync_ack(dest: Address, seq: u8, drift: i16, nack: bool) -> Packet {
        let mut buf = [0u8; 4];
        // Unwrap ok, the buffer fits the fixed-size IE
        let len = ie::write_time_correction(&mut buf, drift, nack).unwrap();
        let payload = Vec::from_slice(&buf[..len]).unwrap();

        Packet {
            header: Header {
                frame_type: FrameType::Acknowledgement,
                frame_pending: false,
                security: Security::None,
                ack_request: false,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154,
                destination: dest,
                source: Address::None,
                seq,
                seq_no_suppress: false,
                ie_present: true,
            },
            payload,
            sync_ie_offset: None,
            footer: [0u8; 2],
        }
    }

    pub fn encode(&self, buf: &mut [u8], write_footer: WriteFooter) -> usize {
        let mut len = 0;

        // Write header
        len += self.header.encode(&mut buf[len..]);

        // Write payload
        buf[len..len + self.payload.len()].copy_from_slice(&self.payload);

        len += self.payload.len();

        // Write footer
        match write_footer {
            WriteFooter::No => (),
        }
        len
    }

    pub fn decode(buf: &[u8], contains_footer: bool) -> Result<Self, DecodeError> {
        let mut remaining = buf.len();

        // First decode header
        let (header, header_len) = Header::decode(buf)?;
        remaining -= header_len;

        // If there's a footer, decode this
        let mut footer = [0; 2];
        if contains_footer {
            if remaining < 2 {
                return Err(DecodeError::NotEnoughBytes);
            }

            let footer_pos = buf.len() - 2;
            footer.copy_from_slice(&buf[footer_pos..]);

            remaining -= 2;
        }

        // Copy out the payload
        let payload = Vec::from_slice(&buf[header_len..header_len + remaining])
            .map_err(|_e| DecodeError::NotEnoughBytes)?;

        Ok(Packet {
            header,
            payload,
            sync_ie_offset: None,
            footer,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, body: &[u8]) -> Result<(), ()> {
        self.payload = Vec::from_slice(body)?;

        Ok(())
    }
}

#[cfg(feature = "std")]
impl Into<std::vec::Vec<u8>> for Packet {
    fn into(self) -> std::vec::Vec<u8> {
        let mut buf = [0u8; MAX_PACKET_LEN];
        let n = self.encode(&mut buf, WriteFooter::No);
        buf[..n].to_vec()
    }
}

/// Result of parsing an enhanced ACK
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AckInfo {
    /// Drift reported by the receiver, in hardware-timer ticks
    pub drift: i16,
    pub nack: bool,
    /// Whether the ACK carried a time correction IE
    pub has_sync_ie: bool,
}

/// Parse a received Enhanced Beacon, extracting the sender and sync IE
pub fn parse_eb(buf: &[u8]) -> Option<(Address, SyncIe)> {
    let p = Packet::decode(buf, false).ok()?;
    if p.header.frame_type != FrameType::Beacon {
        return None;
    }
    let sync = ie::parse_eb_ies(p.payload())?;
    Some((p.header.source, sync))
}

/// Parse a received enhanced ACK against the seqno of the frame just sent
pub fn parse_sync_ack(buf: &[u8], seqno: u8) -> Option<AckInfo> {
    let p = Packet::decode(buf, false).ok()?;
    if p.header.frame_type != FrameType::Acknowledgement || p.header.seq != seqno {
        return None;
    }

    match ie::parse_time_correction(p.payload()) {
        Some((drift, nack)) => Some(AckInfo {
            drift,
            nack,
            has_sync_ie: true,
        }),
        None => Some(AckInfo {
            drift: 0,
            nack: false,
            has_sync_ie: false,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(a: u16) -> Address {
        Address::Short(PanId(0x0100), ShortAddress(a))
    }

    #[test]
    fn data_roundtrip() {
        let p = Packet::data(node(2), node(1), 7, &[1, 2, 3, 4], true).unwrap();

        let mut buf = [0u8; MAX_PACKET_LEN];
        let n = p.encode(&mut buf, WriteFooter::No);

        let d = Packet::decode(&buf[..n], false).unwrap();
        assert_eq!(d.header.frame_type, FrameType::Data);
        assert_eq!(d.header.seq, 7);
        assert_eq!(d.header.source, node(1));
        assert_eq!(d.header.destination, node(2));
        assert_eq!(d.header.ack_request, true);
        assert_eq!(d.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn keepalive_is_empty_data() {
        let p = Packet::keepalive(node(2), node(1), 9);
        assert_eq!(p.header.frame_type, FrameType::Data);
        assert_eq!(p.header.ack_request, true);
        assert_eq!(p.payload().len(), 0);
    }

    #[test]
    fn eb_roundtrip() {
        let asn = Asn::new(1, 0x0102_0304);
        let p = Packet::eb(node(1), 3, &asn, 2);

        let mut buf = [0u8; MAX_PACKET_LEN];
        let n = p.encode(&mut buf, WriteFooter::No);

        let (src, sync) = parse_eb(&buf[..n]).unwrap();
        assert_eq!(src, node(1));
        assert_eq!(sync.asn, asn);
        assert_eq!(sync.join_priority, 2);
    }

    #[test]
    fn eb_restamp_in_place() {
        let p = Packet::eb(node(1), 3, &Asn::new(0, 0), 2);
        let payload_offset = p.sync_ie_offset.unwrap();

        let mut buf = [0u8; MAX_PACKET_LEN];
        let n = p.encode(&mut buf, WriteFooter::No);

        // Stamp a new ASN directly into the encoded frame, as the slot
        // engine does at transmit time
        let frame_offset = n - p.payload().len() + payload_offset;
        crate::ie::write_sync_content(&mut buf[frame_offset..], &Asn::new(0, 99), 4);

        let (_src, sync) = parse_eb(&buf[..n]).unwrap();
        assert_eq!(sync.asn, Asn::new(0, 99));
        assert_eq!(sync.join_priority, 4);
    }

    #[test]
    fn sync_ack_roundtrip() {
        let p = Packet::sync_ack(node(1), 0x21, -120, false);

        let mut buf = [0u8; MAX_PACKET_LEN];
        let n = p.encode(&mut buf, WriteFooter::No);

        let ack = parse_sync_ack(&buf[..n], 0x21).unwrap();
        assert_eq!(ack.drift, -120);
        assert_eq!(ack.nack, false);
        assert_eq!(ack.has_sync_ie, true);

        // Wrong seqno is not our ACK
        assert_eq!(parse_sync_ack(&buf[..n], 0x22), None);
    }

    #[test]
    fn non_eb_rejected() {
        let p = Packet::data(node(2), node(1), 7, &[1], false).unwrap();
        let mut buf = [0u8; MAX_PACKET_LEN];
        let n = p.encode(&mut buf, WriteFooter::No);
        assert_eq!(parse_eb(&buf[..n]), None);
    }
}
