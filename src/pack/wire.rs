//! Big-endian primitives and node tags.

use super::PackError;

/// Deepest node nesting either side will handle. Deeper trees fail instead
/// of exhausting the stack.
pub const MAX_DEPTH: u32 = 128;

/// Kind byte at the start of every node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Code = 0x01,
    Exprs = 0x02,

    Literal = 0x10,
    Vector = 0x11,
    Map = 0x12,
    Set = 0x13,
    Symbol = 0x14,
    VarRef = 0x15,
    If = 0x16,
    Do = 0x17,
    Def = 0x18,
    Let = 0x19,
    Loop = 0x1a,
    Recur = 0x1b,
    Fn = 0x1c,
    Call = 0x1d,
    Meta = 0x1e,
    Throw = 0x1f,
    Try = 0x20,

    GlobalVar = 0x30,
    GlobalType = 0x31,
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            0x01 => Tag::Code,
            0x02 => Tag::Exprs,
            0x10 => Tag::Literal,
            0x11 => Tag::Vector,
            0x12 => Tag::Map,
            0x13 => Tag::Set,
            0x14 => Tag::Symbol,
            0x15 => Tag::VarRef,
            0x16 => Tag::If,
            0x17 => Tag::Do,
            0x18 => Tag::Def,
            0x19 => Tag::Let,
            0x1a => Tag::Loop,
            0x1b => Tag::Recur,
            0x1c => Tag::Fn,
            0x1d => Tag::Call,
            0x1e => Tag::Meta,
            0x1f => Tag::Throw,
            0x20 => Tag::Try,
            0x30 => Tag::GlobalVar,
            0x31 => Tag::GlobalType,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
    depth: u32,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Enter a nested node. Pair with [`Writer::ascend`].
    pub fn descend(&mut self) -> Result<(), PackError> {
        if self.depth >= MAX_DEPTH {
            return Err(PackError::TooDeep(self.buf.len()));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn ascend(&mut self) {
        self.depth -= 1;
    }

    pub fn tag(&mut self, tag: Tag) {
        self.buf.push(tag as u8);
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Element count of a collection.
    pub fn count(&mut self, n: usize, what: &'static str) -> Result<(), PackError> {
        let n = u32::try_from(n).map_err(|_| PackError::TooLarge(what))?;
        self.u32(n);
        Ok(())
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// `u32` length followed by the bytes.
    pub fn blob(&mut self, bytes: &[u8], what: &'static str) -> Result<(), PackError> {
        self.count(bytes.len(), what)?;
        self.bytes(bytes);
        Ok(())
    }
}

/// Cursor over a packed buffer. Every read is bounds-checked.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: u32,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0, depth: 0 }
    }

    /// Enter a nested node. Pair with [`Reader::ascend`].
    pub fn descend(&mut self) -> Result<(), PackError> {
        if self.depth >= MAX_DEPTH {
            return Err(PackError::TooDeep(self.pos));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn ascend(&mut self) {
        self.depth -= 1;
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], PackError> {
        if self.remaining() < len {
            return Err(PackError::Truncated(self.buf.len()));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8, PackError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, PackError> {
        let at = self.pos;
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PackError::BadBool { byte: other, at }),
        }
    }

    pub fn u16(&mut self) -> Result<u16, PackError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, PackError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn tag(&mut self) -> Result<Tag, PackError> {
        let at = self.pos;
        let byte = self.u8()?;
        Tag::try_from(byte).map_err(|tag| PackError::UnknownTag { tag, at })
    }

    /// Read a tag and require it to be `expected`.
    pub fn expect(&mut self, expected: Tag) -> Result<(), PackError> {
        let at = self.pos;
        let found = self.tag()?;
        if found != expected {
            return Err(PackError::UnexpectedTag { expected, found, at });
        }
        Ok(())
    }

    /// Element count whose elements each take at least `min_size` bytes.
    /// Counts that cannot fit in the rest of the buffer fail right away.
    pub fn count(&mut self, min_size: usize) -> Result<usize, PackError> {
        let n = self.u32()? as usize;
        if n.saturating_mul(min_size) > self.remaining() {
            return Err(PackError::Truncated(self.buf.len()));
        }
        Ok(n)
    }

    pub fn blob(&mut self) -> Result<&'a [u8], PackError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn finish(&self) -> Result<(), PackError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(PackError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut w = Writer::new();
        w.u16(0x0102);
        w.u32(0x0304_0506);
        w.bool(true);
        assert_eq!(w.into_bytes(), vec![1, 2, 3, 4, 5, 6, 1]);
    }

    #[test]
    fn test_reader_fails_fast_on_short_input() {
        let mut r = Reader::new(&[0x00, 0x01, 0x02]);
        assert_eq!(r.u16().unwrap(), 1);
        assert!(matches!(r.u32(), Err(PackError::Truncated(3))));
    }

    #[test]
    fn test_count_bounded_by_remaining_bytes() {
        let mut r = Reader::new(&[0xff, 0xff, 0xff, 0xff, 0]);
        assert!(matches!(r.count(1), Err(PackError::Truncated(_))));
    }

    #[test]
    fn test_tags() {
        assert_eq!(Tag::try_from(Tag::Try as u8), Ok(Tag::Try));
        assert_eq!(Tag::try_from(0xee), Err(0xee));

        let mut r = Reader::new(&[0x10, 0xee]);
        assert!(matches!(
            r.expect(Tag::Code),
            Err(PackError::UnexpectedTag {
                expected: Tag::Code,
                found: Tag::Literal,
                at: 0
            })
        ));
        assert!(matches!(r.tag(), Err(PackError::UnknownTag { tag: 0xee, at: 1 })));
    }

    #[test]
    fn test_depth_limit() {
        let mut r = Reader::new(&[0; 8]);
        for _ in 0..MAX_DEPTH {
            r.descend().unwrap();
        }
        assert!(matches!(r.descend(), Err(PackError::TooDeep(0))));
        r.ascend();
        r.descend().unwrap();

        let mut w = Writer::new();
        for _ in 0..MAX_DEPTH {
            w.descend().unwrap();
        }
        assert!(matches!(w.descend(), Err(PackError::TooDeep(_))));
    }

    #[test]
    fn test_bad_bool_and_trailing() {
        let mut r = Reader::new(&[2, 9]);
        assert!(matches!(r.bool(), Err(PackError::BadBool { byte: 2, at: 0 })));
        assert!(matches!(r.finish(), Err(PackError::TrailingBytes(1))));
    }
}
