// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Represents an abstract requested read operation, such as a guest `in`.
///
/// Exposes an API with various "write" methods, which fulfill the request.
pub struct ReadOp<'a> {
    buf: &'a mut [u8],
    offset: usize,
    write_offset: usize,
}

impl<'a> ReadOp<'a> {
    /// Initializes a new read operation from a buffer.
    ///
    /// # Arguments
    ///
    /// - `op_offset`: Offset of the access within the emulated resource, for
    /// port I/O the distance from the base of the registered range.
    /// - `buffer`: A buffer which represents the "sink" of the read operation.
    pub fn from_buf(op_offset: usize, buffer: &'a mut [u8]) -> Self {
        Self { buf: buffer, offset: op_offset, write_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Fulfill the read with the low-order bytes of `val`, as many as the
    /// access is wide.
    pub fn write_val(&mut self, val: u32) {
        let bytes = val.to_le_bytes();
        let len = self.avail().min(bytes.len());
        self.write_bytes(&bytes[..len]);
    }
    pub fn write_u32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_bytes(&mut self, data: &[u8]) {
        let copy_len = data.len();
        let wr_off = self.write_offset;
        assert!(copy_len <= self.avail());

        self.buf[wr_off..(wr_off + copy_len)].copy_from_slice(data);
        self.write_offset += copy_len;
    }
    pub fn fill(&mut self, val: u8) {
        for b in self.buf[self.write_offset..].iter_mut() {
            *b = val
        }
        self.write_offset = self.len();
    }
    fn avail(&self) -> usize {
        self.len() - self.write_offset
    }
}

/// Represents an abstract requested write operation, such as a guest `out`.
///
/// Exposes an API with various "read" methods, which fulfill the request.
pub struct WriteOp<'a> {
    buf: &'a [u8],
    offset: usize,
}
impl<'a> WriteOp<'a> {
    /// Initializes a new write operation from a buffer.
    pub fn from_buf(op_offset: usize, buf: &'a [u8]) -> Self {
        Self { buf, offset: op_offset }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The written value, zero-extended from the width of the access. Wider
    /// accesses are truncated to 32 bits.
    pub fn read_val(&self) -> u32 {
        let mut bytes = [0u8; 4];
        let len = self.buf.len().min(bytes.len());
        bytes[..len].copy_from_slice(&self.buf[..len]);
        u32::from_le_bytes(bytes)
    }
    pub fn read_u32(&self) -> u32 {
        assert!(self.buf.len() >= 4);
        self.read_val()
    }
}

pub enum RWOp<'a, 'b> {
    Read(&'a mut ReadOp<'b>),
    Write(&'a mut WriteOp<'b>),
}
impl RWOp<'_, '_> {
    pub fn offset(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.offset,
            RWOp::Write(wo) => wo.offset,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.len(),
            RWOp::Write(wo) => wo.len(),
        }
    }
    pub fn is_read(&self) -> bool {
        matches!(self, RWOp::Read(_))
    }
    pub fn is_write(&self) -> bool {
        matches!(self, RWOp::Write(_))
    }
}

pub const PAGE_SIZE: u64 = 0x1000;

pub fn round_up_p2(val: u64, to: u64) -> u64 {
    assert!(to.is_power_of_two());

    (val + (to - 1)) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readop_widths() {
        let mut buf = [0u8; 4];
        let mut ro8 = ReadOp::from_buf(0, &mut buf[0..1]);
        ro8.write_val(0x1234_5678);
        drop(ro8);
        assert_eq!(buf, [0x78, 0, 0, 0]);

        let mut ro16 = ReadOp::from_buf(0, &mut buf[0..2]);
        ro16.write_val(0xabcd);
        drop(ro16);
        assert_eq!(buf, [0xcd, 0xab, 0, 0]);

        let mut ro32 = ReadOp::from_buf(0, &mut buf);
        ro32.write_u32(0x4000_0000);
        drop(ro32);
        assert_eq!(buf, [0, 0, 0, 0x40]);
    }

    #[test]
    fn writeop_widths() {
        let buf = [0x10, 0x20, 0x30, 0x40];
        assert_eq!(WriteOp::from_buf(0, &buf[0..1]).read_val(), 0x10);
        assert_eq!(WriteOp::from_buf(0, &buf[0..2]).read_val(), 0x2010);
        assert_eq!(WriteOp::from_buf(0, &buf).read_u32(), 0x40302010);
    }

    #[test]
    #[should_panic]
    fn readop_oversize() {
        let mut buf = [0u8];
        let mut ro8 = ReadOp::from_buf(0, &mut buf);
        ro8.write_u32(0x1000);
    }

    #[test]
    fn readop_fill() {
        let mut buf = [0u8; 3];
        let mut ro = ReadOp::from_buf(0, &mut buf);
        ro.write_bytes(&[0x10]);
        ro.fill(0xff);
        drop(ro);
        assert_eq!(buf, [0x10, 0xff, 0xff]);
    }

    #[test]
    fn round_up() {
        assert_eq!(round_up_p2(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(round_up_p2(0x2000, PAGE_SIZE), 0x2000);
        assert_eq!(round_up_p2(0, PAGE_SIZE), 0);
    }
}
