//! The minimal header handling the dispatch path needs.
//!
//! Due to packet number encryption, a header cannot be fully decoded without
//! crypto context, and the receive loop never has any. It decodes only the
//! version-invariant prefix: enough to extract the destination CID, and for
//! long-header packets the version and packet type. Everything past that is
//! the owning connection's problem.

use bytes::BufMut;

use crate::cid::ConnectionId;
use crate::coding::{BufExt, BufMutExt};
use crate::{LOC_CID_LEN, MAX_CID_SIZE, VERSION};

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;

/// Long-header packet types of QUIC version 1
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    /// Classify the first byte of a long-header packet
    ///
    /// Only meaningful when the packet's version is a version we speak; the
    /// type bits are unassigned in Version Negotiation packets.
    pub(crate) fn from_first_byte(first: u8) -> Option<Self> {
        if first & LONG_HEADER_FORM == 0 || first & FIXED_BIT == 0 {
            return None;
        }
        Some(match (first >> 4) & 0b11 {
            0b00 => Self::Initial,
            0b01 => Self::ZeroRtt,
            0b10 => Self::Handshake,
            _ => Self::Retry,
        })
    }
}

/// The version-invariant prefix of a long-header packet
#[derive(Debug)]
pub(crate) struct LongHeader {
    pub(crate) first: u8,
    pub(crate) version: u32,
    pub(crate) dst_cid: ConnectionId,
    pub(crate) src_cid: ConnectionId,
}

impl LongHeader {
    pub(crate) fn decode(b: &[u8]) -> Option<Self> {
        let mut buf = b;
        let first = BufExt::get::<u8>(&mut buf).ok()?;
        if first & LONG_HEADER_FORM == 0 {
            return None;
        }
        let version = BufExt::get::<u32>(&mut buf).ok()?;
        let dst_cid = get_cid(&mut buf)?;
        let src_cid = get_cid(&mut buf)?;
        Some(Self {
            first,
            version,
            dst_cid,
            src_cid,
        })
    }

    pub(crate) fn ty(&self) -> Option<LongType> {
        LongType::from_first_byte(self.first)
    }
}

fn get_cid(buf: &mut &[u8]) -> Option<ConnectionId> {
    let len = BufExt::get::<u8>(buf).ok()? as usize;
    if len > MAX_CID_SIZE || buf.len() < len {
        return None;
    }
    let cid = ConnectionId::new(&buf[..len]);
    *buf = &buf[len..];
    Some(cid)
}

/// Destination CID of a datagram's first packet, as the dispatch table keys
/// on it
///
/// Short headers carry no CID length; the receiver relies on every locally
/// issued CID being `LOC_CID_LEN` bytes. Long headers are explicit and may
/// carry a peer-chosen length.
pub(crate) fn dst_cid_for_datagram(b: &[u8]) -> Option<ConnectionId> {
    let first = *b.first()?;
    if first & LONG_HEADER_FORM == 0 {
        if b.len() < 1 + LOC_CID_LEN {
            return None;
        }
        return Some(ConnectionId::new(&b[1..1 + LOC_CID_LEN]));
    }
    if b.len() < 6 {
        return None;
    }
    let mut buf = &b[5..];
    get_cid(&mut buf)
}

/// Token field of an Initial packet, skipped over by the generic parse
pub(crate) fn initial_token(b: &[u8]) -> Option<&[u8]> {
    let mut buf = b;
    let first = BufExt::get::<u8>(&mut buf).ok()?;
    if LongType::from_first_byte(first) != Some(LongType::Initial) {
        return None;
    }
    let _version = BufExt::get::<u32>(&mut buf).ok()?;
    get_cid(&mut buf)?;
    get_cid(&mut buf)?;
    let token_len = buf.get_var().ok()? as usize;
    if buf.len() < token_len {
        return None;
    }
    Some(&buf[..token_len])
}

/// Encode a Version Negotiation packet advertising `VERSION`
///
/// The source and destination CIDs are swapped relative to the provoking
/// packet, and a greased reserved version precedes the real one so clients
/// do not hardcode the list.
pub(crate) fn encode_version_negotiation(
    random: u8,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    buf: &mut Vec<u8>,
) {
    buf.write(LONG_HEADER_FORM | FIXED_BIT | (random & 0x3f));
    buf.write::<u32>(0);
    buf.write(dst_cid.len() as u8);
    buf.put_slice(dst_cid);
    buf.write(src_cid.len() as u8);
    buf.put_slice(src_cid);
    const GREASE: u32 = 0x0a1a_2a3a;
    const GREASE_ALT: u32 = 0x0a1a_2a4a;
    buf.write::<u32>(if VERSION != GREASE { GREASE } else { GREASE_ALT });
    buf.write::<u32>(VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::BufMutExt;
    use hex_literal::hex;

    fn long_packet(first: u8, version: u32, dst: &[u8], src: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.write(first);
        b.write(version);
        b.write(dst.len() as u8);
        b.put_slice(dst);
        b.write(src.len() as u8);
        b.put_slice(src);
        b
    }

    #[test]
    fn short_header_dst_cid() {
        let mut b = vec![0x40];
        b.extend_from_slice(&hex!("0011223344556677 aabb"));
        assert_eq!(
            dst_cid_for_datagram(&b).unwrap(),
            ConnectionId::new(&hex!("0011223344556677"))
        );
        // too short to contain a full CID
        assert_eq!(dst_cid_for_datagram(&b[..7]), None);
    }

    #[test]
    fn long_header_dst_cid() {
        let b = long_packet(0xc0, VERSION, &hex!("0102030405"), &hex!("0a0b"));
        assert_eq!(
            dst_cid_for_datagram(&b).unwrap(),
            ConnectionId::new(&hex!("0102030405"))
        );
        let hdr = LongHeader::decode(&b).unwrap();
        assert_eq!(hdr.version, VERSION);
        assert_eq!(hdr.src_cid, ConnectionId::new(&hex!("0a0b")));
        assert_eq!(hdr.ty(), Some(LongType::Initial));
    }

    #[test]
    fn oversized_cid_rejected() {
        let b = long_packet(0xc0, VERSION, &[0xaa; 21], &[]);
        assert!(LongHeader::decode(&b).is_none());
        assert!(dst_cid_for_datagram(&b).is_none());
    }

    #[test]
    fn initial_token_extraction() {
        let mut b = long_packet(0xc0, VERSION, &hex!("01020304"), &hex!("05060708"));
        b.write_var(3);
        b.put_slice(&hex!("aabbcc"));
        b.write_var(100); // payload length
        assert_eq!(initial_token(&b).unwrap(), hex!("aabbcc"));

        let h = long_packet(0xe0, VERSION, &hex!("01020304"), &hex!("05060708"));
        assert_eq!(initial_token(&h), None); // Handshake packets carry no token
    }

    #[test]
    fn version_negotiation_layout() {
        let mut buf = Vec::new();
        encode_version_negotiation(
            0xff,
            &ConnectionId::new(&hex!("0102")),
            &ConnectionId::new(&hex!("0304")),
            &mut buf,
        );
        assert_ne!(buf[0] & LONG_HEADER_FORM, 0);
        assert_eq!(&buf[1..5], &[0, 0, 0, 0]);
        assert_eq!(&buf[5..8], &hex!("02 0102"));
        assert_eq!(&buf[8..11], &hex!("02 0304"));
        assert!(buf[11..]
            .chunks(4)
            .any(|v| v == VERSION.to_be_bytes()));
    }
}
