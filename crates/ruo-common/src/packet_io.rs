// packet_io.rs — big-endian framed primitive I/O
//
// PacketWriter builds outbound frames; instances are pooled because packet
// assembly is the hottest allocation site in the server. PacketReader sits
// on a borrowed slice and is deliberately tolerant: a read past the end
// yields a typed zero or an empty string, never a panic, because the peer
// controls the bytes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use parking_lot::Mutex;

// ============================================================
// PacketWriter
// ============================================================

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

pub struct PacketWriter {
    id: u64,
    data: Vec<u8>,
    position: usize,
}

impl PacketWriter {
    pub fn new(capacity: usize) -> PacketWriter {
        PacketWriter {
            id: NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
            data: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// Move the cursor; writing there overwrites existing bytes in place.
    /// Used to back-patch the length word of dynamic-length packets.
    pub fn seek(&mut self, position: usize) {
        debug_assert!(position <= self.data.len());
        self.position = position.min(self.data.len());
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();

        if self.position == self.data.len() {
            self.data.extend_from_slice(bytes);
        } else if end <= self.data.len() {
            self.data[self.position..end].copy_from_slice(bytes);
        } else {
            let overlap = self.data.len() - self.position;
            self.data[self.position..].copy_from_slice(&bytes[..overlap]);
            self.data.extend_from_slice(&bytes[overlap..]);
        }

        self.position = end;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write(&[value as u8]);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write(&[value as u8]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write(&value.to_be_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write(&value.to_be_bytes());
    }

    /// Write `count` zero bytes.
    pub fn fill(&mut self, count: usize) {
        for _ in 0..count {
            self.write_u8(0);
        }
    }

    /// ASCII bytes, no terminator. Non-ASCII code points degrade to '?'.
    pub fn write_ascii(&mut self, text: &str) {
        for ch in text.chars() {
            self.write_u8(if ch.is_ascii() { ch as u8 } else { b'?' });
        }
    }

    /// NUL-terminated ASCII.
    pub fn write_ascii_null(&mut self, text: &str) {
        self.write_ascii(text);
        self.write_u8(0);
    }

    /// Exactly `size` bytes: ASCII truncated or NUL-padded to fit.
    pub fn write_ascii_fixed(&mut self, text: &str, size: usize) {
        let mut written = 0;

        for ch in text.chars().take(size) {
            self.write_u8(if ch.is_ascii() { ch as u8 } else { b'?' });
            written += 1;
        }

        self.fill(size - written);
    }

    /// NUL-terminated UTF-16LE.
    pub fn write_little_uni_null(&mut self, text: &str) {
        for unit in text.encode_utf16() {
            self.write(&unit.to_le_bytes());
        }
        self.write_u16(0);
    }

    /// Exactly `size` UTF-16LE code units, truncated or zero-padded.
    pub fn write_little_uni_fixed(&mut self, text: &str, size: usize) {
        let mut written = 0;

        for unit in text.encode_utf16().take(size) {
            self.write(&unit.to_le_bytes());
            written += 1;
        }

        self.fill((size - written) * 2);
    }

    /// NUL-terminated UTF-16BE.
    pub fn write_big_uni_null(&mut self, text: &str) {
        for unit in text.encode_utf16() {
            self.write(&unit.to_be_bytes());
        }
        self.write_u16(0);
    }

    /// Exactly `size` UTF-16BE code units, truncated or zero-padded.
    pub fn write_big_uni_fixed(&mut self, text: &str, size: usize) {
        let mut written = 0;

        for unit in text.encode_utf16().take(size) {
            self.write(&unit.to_be_bytes());
            written += 1;
        }

        self.fill((size - written) * 2);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn reset(&mut self) {
        self.data.clear();
        self.position = 0;
    }
}

// ============================================================
// Writer pool
// ============================================================

struct WriterPoolInner {
    free: Vec<PacketWriter>,
    pooled_ids: HashSet<u64>,
}

/// Freelist of reset writers. Steady-state packet assembly never allocates.
pub struct PacketWriterPool {
    inner: Mutex<WriterPoolInner>,
}

impl PacketWriterPool {
    pub fn new() -> PacketWriterPool {
        PacketWriterPool {
            inner: Mutex::new(WriterPoolInner {
                free: Vec::new(),
                pooled_ids: HashSet::new(),
            }),
        }
    }

    pub fn create_instance(&self, capacity: usize) -> PacketWriter {
        let mut inner = self.inner.lock();

        if let Some(writer) = inner.free.pop() {
            inner.pooled_ids.remove(&writer.id);
            writer
        } else {
            PacketWriter::new(capacity)
        }
    }

    /// Return a writer. A double release is dropped after one diagnostic
    /// line; pooling the same instance twice would hand one buffer to two
    /// packets.
    pub fn release_instance(&self, mut writer: PacketWriter) {
        let mut inner = self.inner.lock();

        if !inner.pooled_ids.insert(writer.id) {
            error!("PacketWriterPool: double release of writer {} dropped", writer.id);
            return;
        }

        writer.reset();
        inner.free.push(writer);
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl Default for PacketWriterPool {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// PacketReader
// ============================================================

#[inline]
fn is_safe_char(unit: u16) -> bool {
    (0x20..0xFFFE).contains(&unit)
}

pub struct PacketReader<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> PacketReader<'a> {
        PacketReader { data, index: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.index
    }

    pub fn seek(&mut self, position: usize) {
        self.index = position.min(self.data.len());
    }

    pub fn read_u8(&mut self) -> u8 {
        if self.index + 1 > self.data.len() {
            self.index = self.data.len();
            return 0;
        }

        let value = self.data[self.index];
        self.index += 1;
        value
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_u8() != 0
    }

    pub fn read_u16(&mut self) -> u16 {
        if self.index + 2 > self.data.len() {
            self.index = self.data.len();
            return 0;
        }

        let value = u16::from_be_bytes([self.data[self.index], self.data[self.index + 1]]);
        self.index += 2;
        value
    }

    pub fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    pub fn read_u32(&mut self) -> u32 {
        if self.index + 4 > self.data.len() {
            self.index = self.data.len();
            return 0;
        }

        let value = u32::from_be_bytes([
            self.data[self.index],
            self.data[self.index + 1],
            self.data[self.index + 2],
            self.data[self.index + 3],
        ]);
        self.index += 4;
        value
    }

    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    /// Copy out up to `count` bytes, zero-filling past the end.
    pub fn read_bytes(&mut self, count: usize) -> Vec<u8> {
        let available = count.min(self.remaining());
        let mut out = vec![0u8; count];
        out[..available].copy_from_slice(&self.data[self.index..self.index + available]);
        self.index += available;
        out
    }

    /// NUL-terminated ASCII; consumes the terminator.
    pub fn read_ascii_null(&mut self) -> String {
        let mut out = String::new();

        while self.index < self.data.len() {
            let byte = self.data[self.index];
            self.index += 1;

            if byte == 0 {
                break;
            }

            out.push(byte as char);
        }

        out
    }

    /// NUL-terminated ASCII with control characters dropped.
    pub fn read_ascii_null_safe(&mut self) -> String {
        let mut out = String::new();

        while self.index < self.data.len() {
            let byte = self.data[self.index];
            self.index += 1;

            if byte == 0 {
                break;
            }

            if is_safe_char(byte as u16) {
                out.push(byte as char);
            }
        }

        out
    }

    /// Exactly `size` bytes consumed; the string stops at the first NUL.
    pub fn read_ascii_fixed(&mut self, size: usize) -> String {
        let available = size.min(self.remaining());
        let mut out = String::new();

        for i in 0..available {
            let byte = self.data[self.index + i];
            if byte == 0 {
                break;
            }
            out.push(byte as char);
        }

        self.index += available;
        out
    }

    /// Exactly `size` bytes consumed, unsafe characters dropped.
    pub fn read_ascii_fixed_safe(&mut self, size: usize) -> String {
        let available = size.min(self.remaining());
        let mut out = String::new();

        for i in 0..available {
            let byte = self.data[self.index + i];
            if byte == 0 {
                break;
            }
            if is_safe_char(byte as u16) {
                out.push(byte as char);
            }
        }

        self.index += available;
        out
    }

    fn read_utf16_null(&mut self, little_endian: bool, safe: bool) -> String {
        let mut units = Vec::new();

        while self.index + 1 < self.data.len() {
            let pair = [self.data[self.index], self.data[self.index + 1]];
            self.index += 2;

            let unit = if little_endian {
                u16::from_le_bytes(pair)
            } else {
                u16::from_be_bytes(pair)
            };

            if unit == 0 {
                break;
            }

            if !safe || is_safe_char(unit) {
                units.push(unit);
            }
        }

        String::from_utf16_lossy(&units)
    }

    fn read_utf16_fixed(&mut self, size: usize, little_endian: bool, safe: bool) -> String {
        let available = (size * 2).min(self.remaining()) / 2;
        let mut units = Vec::new();
        let mut terminated = false;

        for i in 0..available {
            let offset = self.index + i * 2;
            let pair = [self.data[offset], self.data[offset + 1]];

            let unit = if little_endian {
                u16::from_le_bytes(pair)
            } else {
                u16::from_be_bytes(pair)
            };

            if unit == 0 {
                terminated = true;
            }

            if !terminated && (!safe || is_safe_char(unit)) {
                units.push(unit);
            }
        }

        // The cursor always advances by the declared length, NUL or not.
        self.index = (self.index + size * 2).min(self.data.len());
        String::from_utf16_lossy(&units)
    }

    /// NUL-terminated UTF-16BE.
    pub fn read_unicode_null(&mut self) -> String {
        self.read_utf16_null(false, false)
    }

    pub fn read_unicode_null_safe(&mut self) -> String {
        self.read_utf16_null(false, true)
    }

    /// NUL-terminated UTF-16LE.
    pub fn read_unicode_null_le(&mut self) -> String {
        self.read_utf16_null(true, false)
    }

    pub fn read_unicode_null_le_safe(&mut self) -> String {
        self.read_utf16_null(true, true)
    }

    /// Fixed `size` UTF-16BE code units.
    pub fn read_unicode_fixed(&mut self, size: usize) -> String {
        self.read_utf16_fixed(size, false, false)
    }

    pub fn read_unicode_fixed_safe(&mut self, size: usize) -> String {
        self.read_utf16_fixed(size, false, true)
    }

    pub fn read_unicode_fixed_le(&mut self, size: usize) -> String {
        self.read_utf16_fixed(size, true, false)
    }

    pub fn read_unicode_fixed_le_safe(&mut self, size: usize) -> String {
        self.read_utf16_fixed(size, true, true)
    }
}
