use bytes::{Buf, BufMut};

//  +------+--------+-------------+-----------------------+
//  | 2Bit | Length | Usable Bits | Range                 |
//  +------+--------+-------------+-----------------------+
//  | 00   | 1      | 6           | 0-63                  |
//  | 01   | 2      | 14          | 0-16383               |
//  | 10   | 4      | 30          | 0-1073741823          |
//  | 11   | 8      | 62          | 0-4611686018427387903 |
//  +------+--------+-------------+-----------------------+

pub(crate) const MAX_VALUE: u64 = (1 << 62) - 1;

/// Number of bytes the value occupies on the wire
///
/// The value must be representable, i.e. at most [`MAX_VALUE`].
pub(crate) fn size(x: u64) -> usize {
    debug_assert!(x <= MAX_VALUE);
    if x < (1 << 6) {
        1
    } else if x < (1 << 14) {
        2
    } else if x < (1 << 30) {
        4
    } else {
        8
    }
}

pub(crate) fn read<R: Buf>(r: &mut R) -> Option<u64> {
    if !r.has_remaining() {
        return None;
    }
    let tag = r.chunk()[0] >> 6;
    match tag {
        0b00 => Some(u64::from(r.get_u8())),
        0b01 if r.remaining() >= 2 => Some(u64::from(r.get_u16()) & 0x3fff),
        0b10 if r.remaining() >= 4 => Some(u64::from(r.get_u32()) & 0x3fff_ffff),
        0b11 if r.remaining() >= 8 => Some(r.get_u64() & MAX_VALUE),
        _ => None,
    }
}

/// Append the variable-length encoding of `x`
///
/// Values above [`MAX_VALUE`] cannot occur in any of the fields encoded by
/// this crate; they are a logic error, checked in debug builds.
pub(crate) fn write<W: BufMut>(x: u64, w: &mut W) {
    debug_assert!(x <= MAX_VALUE, "oversized varint: {x}");
    if x < (1 << 6) {
        w.put_u8(x as u8);
    } else if x < (1 << 14) {
        w.put_u16(0b01 << 14 | x as u16);
    } else if x < (1 << 30) {
        w.put_u32(0b10 << 30 | x as u32);
    } else {
        w.put_u64(0b11 << 62 | x);
    }
}
