use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::error::DecodeError;

/// Validate the size prefix of `buf` and return its root table.
///
/// Bytes after the declared size are ignored.
pub fn root(buf: &[u8]) -> Result<Table<'_>, DecodeError> {
    if buf.len() < 8 {
        return Err(DecodeError::Truncated);
    }
    let size = LittleEndian::read_u32(&buf[0..4]) as usize;
    if buf.len() - 4 < size {
        return Err(DecodeError::Truncated);
    }
    if size < 4 {
        return Err(DecodeError::InvalidOffset);
    }
    let buf = &buf[..4 + size];
    let root = 4usize.checked_add(LittleEndian::read_u32(&buf[4..8]) as usize).ok_or(DecodeError::InvalidOffset)?;
    Table::at(buf, root)
}

/// A zero-copy view of one table inside an encoded buffer.
///
/// Construction validates the table header and its vtable; every accessor validates the field it
/// reads, so a malformed buffer produces `DecodeError::InvalidOffset` rather than a panic.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
    table_len: usize,
}

impl<'a> Table<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Result<Self, DecodeError> {
        let header = slice(buf, pos, 4)?;
        let soffset = LittleEndian::read_i32(header) as i64;
        let vtable = pos as i64 - soffset;
        if vtable < 0 {
            return Err(DecodeError::InvalidOffset);
        }
        let vtable = vtable as usize;

        let vt_header = slice(buf, vtable, 4)?;
        let vtable_len = LittleEndian::read_u16(&vt_header[0..2]) as usize;
        let table_len = LittleEndian::read_u16(&vt_header[2..4]) as usize;
        if vtable_len < 4 || table_len < 4 {
            return Err(DecodeError::InvalidOffset);
        }
        slice(buf, vtable, vtable_len)?;
        slice(buf, pos, table_len)?;

        Ok(Table {
            buf,
            pos,
            vtable,
            vtable_len,
            table_len,
        })
    }

    /// Position of the field in `slot`, `None` if the writer did not store it.
    fn field(&self, slot: u16) -> Option<usize> {
        let voff = 4 + 2 * slot as usize;
        if voff + 2 > self.vtable_len {
            return None;
        }
        let at = self.vtable + voff;
        let off = LittleEndian::read_u16(&self.buf[at..at + 2]) as usize;
        if off == 0 {
            None
        } else {
            Some(self.pos + off)
        }
    }

    /// `n` bytes of an inline field; it must lie inside this table.
    fn inline(&self, at: usize, n: usize) -> Result<&'a [u8], DecodeError> {
        if at + n > self.pos + self.table_len {
            return Err(DecodeError::InvalidOffset);
        }
        slice(self.buf, at, n)
    }

    pub fn u64(&self, slot: u16, default: u64) -> Result<u64, DecodeError> {
        match self.field(slot) {
            None => Ok(default),
            Some(at) => Ok(LittleEndian::read_u64(self.inline(at, 8)?)),
        }
    }

    pub fn u8(&self, slot: u16, default: u8) -> Result<u8, DecodeError> {
        match self.field(slot) {
            None => Ok(default),
            Some(at) => Ok(self.inline(at, 1)?[0]),
        }
    }

    pub fn bool(&self, slot: u16, default: bool) -> Result<bool, DecodeError> {
        Ok(self.u8(slot, default as u8)? != 0)
    }

    /// Follow the reference stored in `slot`.
    fn indirect(&self, slot: u16) -> Result<Option<usize>, DecodeError> {
        let at = match self.field(slot) {
            None => return Ok(None),
            Some(at) => at,
        };
        let rel = LittleEndian::read_u32(self.inline(at, 4)?) as usize;
        let target = at.checked_add(rel).ok_or(DecodeError::InvalidOffset)?;
        if target >= self.buf.len() {
            return Err(DecodeError::InvalidOffset);
        }
        Ok(Some(target))
    }

    pub fn bytes(&self, slot: u16) -> Result<Option<&'a [u8]>, DecodeError> {
        match self.indirect(slot)? {
            None => Ok(None),
            Some(at) => vector(self.buf, at, 1).map(Some),
        }
    }

    pub fn str(&self, slot: u16) -> Result<Option<&'a str>, DecodeError> {
        match self.bytes(slot)? {
            None => Ok(None),
            Some(b) => std::str::from_utf8(b).map(Some).map_err(|_| DecodeError::InvalidUtf8),
        }
    }

    pub fn table(&self, slot: u16) -> Result<Option<Table<'a>>, DecodeError> {
        match self.indirect(slot)? {
            None => Ok(None),
            Some(at) => Table::at(self.buf, at).map(Some),
        }
    }

    /// A vector of tables; absent reads as empty.
    pub fn tables(&self, slot: u16) -> Result<Vec<Table<'a>>, DecodeError> {
        let at = match self.indirect(slot)? {
            None => return Ok(vec![]),
            Some(at) => at,
        };
        let elems = vector(self.buf, at, 4)?;
        let mut res = Vec::with_capacity(elems.len() / 4);
        for i in 0..elems.len() / 4 {
            let elem_at = at + 4 + 4 * i;
            let rel = LittleEndian::read_u32(&elems[4 * i..4 * i + 4]) as usize;
            let target = elem_at.checked_add(rel).ok_or(DecodeError::InvalidOffset)?;
            res.push(Table::at(self.buf, target)?);
        }
        Ok(res)
    }
}

fn slice(buf: &[u8], at: usize, n: usize) -> Result<&[u8], DecodeError> {
    let end = at.checked_add(n).ok_or(DecodeError::InvalidOffset)?;
    buf.get(at..end).ok_or(DecodeError::InvalidOffset)
}

/// A length-prefixed vector of `elem_size`-byte elements starting at `at`.
fn vector(buf: &[u8], at: usize, elem_size: usize) -> Result<&[u8], DecodeError> {
    let len = LittleEndian::read_u32(slice(buf, at, 4)?) as usize;
    let n = len.checked_mul(elem_size).ok_or(DecodeError::InvalidOffset)?;
    slice(buf, at + 4, n)
}
