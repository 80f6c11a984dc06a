use byteorder::ByteOrder;
use byteorder::LittleEndian;

/// Position of a finished object, counted in bytes from the *end* of the buffer.
///
/// The buffer grows towards its front, so an offset stays valid while more data is prepended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WIPOffset(u32);

/// Writes tables back to front.
///
/// Children (strings, byte vectors, nested tables) are written before the table that refers to
/// them, and the root table is written last, so every reference is a forward `u32` offset
/// relative to where it is stored.
///
/// Buffer layout once finished:
///
/// ```text
/// [u32 size][u32 root offset] ... vtable | table ... children ...
/// ```
///
/// A table starts with an `i32` distance back to its vtable:
/// `[u16 vtable len][u16 table len][u16 field offset; n]`, a field offset of 0 meaning "absent".
#[derive(Debug)]
pub struct Builder {
    buf: Vec<u8>,
    head: usize,
    /// (slot, position of the field) of the table being built.
    fields: Vec<(u16, u32)>,
    table_start: Option<u32>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl Builder {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(16);
        Builder {
            buf: vec![0; cap],
            head: cap,
            fields: Vec::new(),
            table_start: None,
        }
    }

    fn used(&self) -> u32 {
        (self.buf.len() - self.head) as u32
    }

    fn reserve(&mut self, n: usize) {
        if self.head >= n {
            return;
        }
        let used = self.buf.len() - self.head;
        let new_len = (self.buf.len() * 2).max(used + n);
        let mut new_buf = vec![0; new_len];
        new_buf[new_len - used..].copy_from_slice(&self.buf[self.head..]);
        self.head = new_len - used;
        self.buf = new_buf;
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.head -= bytes.len();
        self.buf[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    fn push_u8(&mut self, v: u8) {
        self.push_bytes(&[v]);
    }

    fn push_u16(&mut self, v: u16) {
        let mut b = [0; 2];
        LittleEndian::write_u16(&mut b, v);
        self.push_bytes(&b);
    }

    fn push_u32(&mut self, v: u32) {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, v);
        self.push_bytes(&b);
    }

    fn push_u64(&mut self, v: u64) {
        let mut b = [0; 8];
        LittleEndian::write_u64(&mut b, v);
        self.push_bytes(&b);
    }

    /// Push a reference to `target`, relative to the reference's own position.
    fn push_uoffset(&mut self, target: WIPOffset) {
        let at = self.used() + 4;
        debug_assert!(at > target.0);
        self.push_u32(at - target.0);
    }

    pub fn create_string(&mut self, s: &str) -> WIPOffset {
        debug_assert!(self.table_start.is_none(), "strings must be created outside of a table");
        self.push_u8(0);
        self.push_bytes(s.as_bytes());
        self.push_u32(s.len() as u32);
        WIPOffset(self.used())
    }

    pub fn create_bytes(&mut self, bytes: &[u8]) -> WIPOffset {
        debug_assert!(self.table_start.is_none(), "vectors must be created outside of a table");
        self.push_bytes(bytes);
        self.push_u32(bytes.len() as u32);
        WIPOffset(self.used())
    }

    /// A vector of references to already finished tables.
    pub fn create_vector(&mut self, items: &[WIPOffset]) -> WIPOffset {
        debug_assert!(self.table_start.is_none(), "vectors must be created outside of a table");
        for item in items.iter().rev() {
            self.push_uoffset(*item);
        }
        self.push_u32(items.len() as u32);
        WIPOffset(self.used())
    }

    pub fn start_table(&mut self) {
        debug_assert!(self.table_start.is_none(), "tables can not be nested while building");
        self.fields.clear();
        self.table_start = Some(self.used());
    }

    /// Scalars equal to their default are not written at all; readers get the default back.
    pub fn add_u64(&mut self, slot: u16, v: u64, default: u64) {
        if v == default {
            return;
        }
        self.push_u64(v);
        self.fields.push((slot, self.used()));
    }

    pub fn add_u8(&mut self, slot: u16, v: u8, default: u8) {
        if v == default {
            return;
        }
        self.push_u8(v);
        self.fields.push((slot, self.used()));
    }

    pub fn add_bool(&mut self, slot: u16, v: bool, default: bool) {
        self.add_u8(slot, v as u8, default as u8)
    }

    pub fn add_offset(&mut self, slot: u16, off: WIPOffset) {
        self.push_uoffset(off);
        self.fields.push((slot, self.used()));
    }

    pub fn end_table(&mut self) -> WIPOffset {
        let start = self.table_start.take().unwrap_or_else(|| self.used());

        // Placeholder for the distance to the vtable, patched below.
        self.push_u32(0);
        let table = self.used();

        let n_slots = self.fields.iter().map(|(slot, _)| *slot as usize + 1).max().unwrap_or(0);
        let mut slots = vec![0u16; n_slots];
        for (slot, pos) in self.fields.drain(..) {
            slots[slot as usize] = (table - pos) as u16;
        }

        for off in slots.iter().rev() {
            self.push_u16(*off);
        }
        self.push_u16((table - start) as u16);
        self.push_u16((4 + 2 * n_slots) as u16);
        let vtable = self.used();

        let at = self.buf.len() - table as usize;
        LittleEndian::write_i32(&mut self.buf[at..at + 4], (vtable - table) as i32);

        WIPOffset(table)
    }

    /// Write the root reference and the size prefix, and hand out the finished buffer.
    pub fn finish(mut self, root: WIPOffset) -> Vec<u8> {
        self.push_uoffset(root);
        let size = self.used();
        self.push_u32(size);
        self.buf.split_off(self.head)
    }
}
