//! Bit-level storage and reading.
//!
//! [`BitBuf`] is an owned, MSB-first bit string. [`BitCursor`] is a seekable reader over a byte
//! source that may be extended lazily through a pull callback, with a stack of end bounds used
//! by sized containers.

use std::fmt;
use thiserror::Error;

/// Callback invoked when the cursor needs more bytes. The argument is the number of bytes
/// wanted; returning an empty vector signals that the source is exhausted.
pub type PullFn = Box<dyn FnMut(usize) -> Vec<u8> + Send>;

const DEFAULT_PULL_CHUNK: usize = 4096;
const MAX_PULL: usize = 1 << 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("needed {needed} bits at position {position} but only {available} remain")]
    InsufficientData {
        position: u64,
        needed: u64,
        available: u64,
    },
    #[error("reading {needed} bits at position {position} would cross the bound at bit {bound}")]
    Bounded { position: u64, needed: u64, bound: u64 },
    #[error("cannot seek to bit {target}, data ends at bit {end}")]
    SeekOutOfRange { target: u64, end: u64 },
    #[error("cannot read {0} bits into a 64-bit integer")]
    TooWide(u64),
}

/// An owned bit string. Bits are stored MSB-first; unused trailing bits of the last byte are
/// always zero.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitBuf {
    bytes: Vec<u8>,
    len: u64,
}

impl BitBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64 * 8;
        Self { bytes, len }
    }

    pub fn zeros(len: u64) -> Self {
        Self {
            bytes: vec![0; len.div_ceil(8) as usize],
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.len % 8 == 0
    }

    pub fn bit(&self, index: u64) -> bool {
        let byte = self.bytes[(index / 8) as usize];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    pub fn push_bit(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> (self.len % 8);
        }
        self.len += 1;
    }

    /// Appends the low `bits` bits of `value`, most significant first.
    pub fn push_uint(&mut self, value: u64, bits: u32) {
        for i in (0..bits).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    pub fn extend_bytes(&mut self, bytes: &[u8]) {
        if self.is_byte_aligned() {
            self.bytes.extend_from_slice(bytes);
            self.len += bytes.len() as u64 * 8;
        } else {
            for b in bytes {
                self.push_uint(u64::from(*b), 8);
            }
        }
    }

    pub fn extend(&mut self, other: &BitBuf) {
        let whole = (other.len / 8) as usize;
        self.extend_bytes(&other.bytes[..whole]);
        for i in (whole as u64 * 8)..other.len {
            self.push_bit(other.bit(i));
        }
    }

    /// Copies `len` bits starting at `start`. Panics if the range is out of bounds.
    pub fn slice(&self, start: u64, len: u64) -> BitBuf {
        assert!(start + len <= self.len, "slice out of range");
        if start % 8 == 0 {
            let first = (start / 8) as usize;
            let mut out = BitBuf::from_bytes(&self.bytes[first..first + (len / 8) as usize]);
            for i in (start + out.len)..(start + len) {
                out.push_bit(self.bit(i));
            }
            return out;
        }
        let mut out = BitBuf::new();
        for i in start..start + len {
            out.push_bit(self.bit(i));
        }
        out
    }

    pub fn truncate(&mut self, len: u64) {
        if len >= self.len {
            return;
        }
        self.len = len;
        self.bytes.truncate(len.div_ceil(8) as usize);
        if len % 8 != 0 {
            let last = self.bytes.len() - 1;
            self.bytes[last] &= 0xffu8 << (8 - len % 8);
        }
    }

    /// Reads `bits` (at most 64) starting at `start` as a big-endian unsigned integer.
    pub fn uint_at(&self, start: u64, bits: u32) -> u64 {
        read_bits_from(&self.bytes, start, bits)
    }

    /// The underlying bytes. A trailing partial byte is zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for BitBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitBuf({} bits: {})", self.len, self.to_hex())
    }
}

impl From<Vec<u8>> for BitBuf {
    fn from(bytes: Vec<u8>) -> Self {
        BitBuf::from_vec(bytes)
    }
}

impl From<&[u8]> for BitBuf {
    fn from(bytes: &[u8]) -> Self {
        BitBuf::from_bytes(bytes)
    }
}

fn read_bits_from(bytes: &[u8], start: u64, bits: u32) -> u64 {
    let mut value = 0u64;
    for i in start..start + u64::from(bits) {
        let byte = bytes[(i / 8) as usize];
        let bit = (byte >> (7 - (i % 8))) & 1;
        value = (value << 1) | u64::from(bit);
    }
    value
}

pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// A bit-addressable reader over a byte source.
///
/// Positions are absolute bit offsets from the start of the stream. Data is pulled from the
/// optional source on demand; bounds pushed with [`BitCursor::push_limit`] cap every read, seek
/// and search until popped.
pub struct BitCursor {
    data: Vec<u8>,
    loaded: u64,
    pos: u64,
    limits: Vec<u64>,
    /// Furthest bit whose contents, or absence, some access has depended on.
    reach: u64,
    pull: Option<PullFn>,
    chunk: usize,
    exhausted: bool,
}

impl BitCursor {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let data = bytes.into();
        let loaded = data.len() as u64 * 8;
        Self {
            data,
            loaded,
            pos: 0,
            limits: Vec::new(),
            reach: 0,
            pull: None,
            chunk: DEFAULT_PULL_CHUNK,
            exhausted: true,
        }
    }

    /// A cursor over an exact bit string, which may end mid-byte.
    pub fn from_bits(bits: &BitBuf) -> Self {
        let mut cursor = Self::new(bits.as_bytes().to_vec());
        cursor.loaded = bits.len();
        cursor
    }

    /// A cursor that starts with `initial` and asks `pull` for more bytes whenever a read,
    /// seek or search runs past the loaded data.
    pub fn streaming(initial: Vec<u8>, pull: PullFn) -> Self {
        let mut cursor = Self::new(initial);
        cursor.pull = Some(pull);
        cursor.exhausted = false;
        cursor
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk = bytes.max(1);
        self
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn bound(&self) -> Option<u64> {
        self.limits.last().copied()
    }

    pub fn loaded_bits(&self) -> u64 {
        self.loaded
    }

    pub fn reach(&self) -> u64 {
        self.reach
    }

    /// Starts a fresh reach measurement at the position and returns the previous mark.
    pub fn reset_reach(&mut self) -> u64 {
        std::mem::replace(&mut self.reach, self.pos)
    }

    /// Folds a saved mark back in after a nested measurement.
    pub fn extend_reach(&mut self, to: u64) {
        self.reach = self.reach.max(to);
    }

    fn touch(&mut self, end: u64) {
        self.reach = self.reach.max(end);
    }

    /// Pulls from the source until `bits` more bits past the position are loaded, the source
    /// runs dry, or the active bound is hit. Returns whether the bits are now readable.
    pub fn request_more(&mut self, bits: u64) -> bool {
        let target = self.pos.saturating_add(bits);
        self.touch(target);
        self.fill(target) && self.bound().is_none_or(|b| target <= b)
    }

    /// Loads data up to bit `target` without recording the access.
    fn fill(&mut self, target: u64) -> bool {
        while self.loaded < target && !self.exhausted {
            let Some(pull) = self.pull.as_mut() else {
                self.exhausted = true;
                break;
            };
            let needed = (target - self.loaded).div_ceil(8);
            let want = usize::try_from(needed)
                .unwrap_or(usize::MAX)
                .clamp(self.chunk, self.chunk.max(MAX_PULL));
            let more = pull(want);
            if more.is_empty() {
                self.exhausted = true;
                break;
            }
            self.loaded += more.len() as u64 * 8;
            self.data.extend_from_slice(&more);
        }
        self.loaded >= target
    }

    fn ensure(&mut self, bits: u64) -> Result<(), CursorError> {
        self.touch(self.pos.saturating_add(bits));
        if let Some(bound) = self.bound() {
            if self.pos.saturating_add(bits) > bound {
                return Err(CursorError::Bounded {
                    position: self.pos,
                    needed: bits,
                    bound,
                });
            }
        }
        if !self.fill(self.pos.saturating_add(bits)) {
            return Err(CursorError::InsufficientData {
                position: self.pos,
                needed: bits,
                available: self.loaded.saturating_sub(self.pos),
            });
        }
        Ok(())
    }

    pub fn peek(&mut self, bits: u64) -> Result<BitBuf, CursorError> {
        self.ensure(bits)?;
        let mut out = BitBuf::new();
        if self.pos % 8 == 0 {
            let first = (self.pos / 8) as usize;
            out.extend_bytes(&self.data[first..first + (bits / 8) as usize]);
            for i in (self.pos + out.len())..(self.pos + bits) {
                out.push_bit(read_bits_from(&self.data, i, 1) == 1);
            }
        } else {
            for i in self.pos..self.pos + bits {
                out.push_bit(read_bits_from(&self.data, i, 1) == 1);
            }
        }
        Ok(out)
    }

    pub fn read(&mut self, bits: u64) -> Result<BitBuf, CursorError> {
        let out = self.peek(bits)?;
        self.pos += bits;
        Ok(out)
    }

    pub fn peek_uint(&mut self, bits: u64) -> Result<u64, CursorError> {
        if bits > 64 {
            return Err(CursorError::TooWide(bits));
        }
        self.ensure(bits)?;
        Ok(read_bits_from(&self.data, self.pos, bits as u32))
    }

    pub fn read_uint(&mut self, bits: u64) -> Result<u64, CursorError> {
        let value = self.peek_uint(bits)?;
        self.pos += bits;
        Ok(value)
    }

    pub fn seek(&mut self, target: u64) -> Result<(), CursorError> {
        self.touch(target);
        if let Some(bound) = self.bound() {
            if target > bound {
                return Err(CursorError::SeekOutOfRange { target, end: bound });
            }
        }
        if target > self.loaded {
            self.fill(target);
            if target > self.loaded {
                return Err(CursorError::SeekOutOfRange {
                    target,
                    end: self.loaded,
                });
            }
        }
        self.pos = target;
        Ok(())
    }

    /// Bits left before the bound or the end of the stream, if that is known without pulling.
    pub fn remaining_bits(&self) -> Option<u64> {
        let settled = self.exhausted || self.pull.is_none();
        match self.bound() {
            Some(bound) if self.loaded >= bound => Some(bound.saturating_sub(self.pos)),
            Some(bound) if settled => Some(bound.min(self.loaded).saturating_sub(self.pos)),
            None if settled => Some(self.loaded.saturating_sub(self.pos)),
            _ => None,
        }
    }

    /// Drains the source (up to the active bound) and returns the bits left.
    pub fn remaining_bits_exact(&mut self) -> u64 {
        match self.bound() {
            Some(bound) => {
                self.touch(bound);
                self.fill(bound);
            }
            None => {
                self.touch(u64::MAX);
                while !self.exhausted && self.pull.is_some() {
                    self.fill(self.loaded + self.chunk as u64 * 8);
                }
            }
        }
        self.remaining_bits().unwrap_or(0)
    }

    pub fn is_at_end(&mut self) -> bool {
        !self.request_more(1)
    }

    /// Restricts all further access to bits before `end`. Nested limits never extend an
    /// outer one.
    pub fn push_limit(&mut self, end: u64) {
        let end = self.bound().map_or(end, |outer| outer.min(end));
        self.limits.push(end);
    }

    pub fn pop_limit(&mut self) -> Option<u64> {
        self.limits.pop()
    }

    pub fn limit_depth(&self) -> usize {
        self.limits.len()
    }

    /// Pops limits until only `depth` remain.
    pub fn truncate_limits(&mut self, depth: usize) {
        self.limits.truncate(depth);
    }

    /// Copies already-loaded bits in `[start, end)`.
    pub fn bits_between(&self, start: u64, end: u64) -> Option<BitBuf> {
        if start > end || end > self.loaded {
            return None;
        }
        let mut out = BitBuf::new();
        for i in start..end {
            out.push_bit(read_bits_from(&self.data, i, 1) == 1);
        }
        Some(out)
    }

    /// Removes every limit, returning them for [`BitCursor::restore_limits`].
    pub fn take_limits(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.limits)
    }

    pub fn restore_limits(&mut self, limits: Vec<u64>) {
        self.limits = limits;
    }

    /// Up to `bytes` bytes starting at the position, pulling as needed. Used as a cheap
    /// fingerprint of the upcoming data, so it does not move the reach mark.
    pub fn window(&mut self, bytes: usize) -> BitBuf {
        let wanted = bytes as u64 * 8;
        self.fill(self.pos.saturating_add(wanted));
        let end = self.bound().map_or(self.loaded, |b| b.min(self.loaded));
        let take = wanted.min(end.saturating_sub(self.pos));
        self.bits_between(self.pos, self.pos + take).unwrap_or_default()
    }

    /// Finds the first occurrence of `pattern` starting at or after bit `from`, pulling more
    /// data until it is found or the stream (or bound) ends. Byte-aligned patterns searched
    /// from a byte boundary only match on byte boundaries.
    pub fn find(&mut self, pattern: &BitBuf, from: u64) -> Option<u64> {
        if pattern.is_empty() {
            return Some(from);
        }
        let step = if from % 8 == 0 && pattern.is_byte_aligned() {
            8
        } else {
            1
        };
        let mut candidate = from;
        loop {
            let end = self.bound().map_or(self.loaded, |b| b.min(self.loaded));
            while candidate + pattern.len() <= end {
                if self.matches_at(pattern, candidate) {
                    self.touch(candidate + pattern.len());
                    return Some(candidate);
                }
                candidate += step;
            }
            let at_bound = self.bound().is_some_and(|b| self.loaded >= b);
            if at_bound || self.exhausted || self.pull.is_none() {
                self.touch(if at_bound { end } else { u64::MAX });
                return None;
            }
            self.fill(self.loaded + self.chunk as u64 * 8);
        }
    }

    fn matches_at(&self, pattern: &BitBuf, at: u64) -> bool {
        if at % 8 == 0 && pattern.is_byte_aligned() {
            let first = (at / 8) as usize;
            return &self.data[first..first + pattern.as_bytes().len()] == pattern.as_bytes();
        }
        (0..pattern.len()).all(|i| (read_bits_from(&self.data, at + i, 1) == 1) == pattern.bit(i))
    }
}

impl fmt::Debug for BitCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitCursor")
            .field("pos", &self.pos)
            .field("loaded", &self.loaded)
            .field("limits", &self.limits)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
