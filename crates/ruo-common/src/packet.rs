// packet.rs — outbound frame assembly and compilation
//
// A Packet owns a pooled writer while it is being built, then compiles
// exactly once into its final wire form (optionally Huffman-compressed).
// Small frames land in a pooled 4 KiB buffer; oversized and static frames
// get their own allocation. Static packets are compiled eagerly, shared
// behind an Arc, and never freed.

use std::sync::Arc;

use bitflags::bitflags;
use log::{error, warn};

use crate::bufpool::BufferPool;
use crate::huffman;
use crate::packet_io::{PacketWriter, PacketWriterPool};

/// Compiled frames at or below this size draw from the buffered pool.
pub const BUFFER_SIZE: usize = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketState: u32 {
        const STATIC = 0x01;
        const ACQUIRED = 0x02;
        const ACCESSED = 0x04;
        const BUFFERED = 0x08;
        const WARNED = 0x10;
    }
}

/// The pools packet assembly draws from. One set per server.
pub struct PacketPools {
    pub writer: PacketWriterPool,
    pub compressor: Arc<BufferPool>,
    pub buffered: Arc<BufferPool>,
}

impl PacketPools {
    pub fn new() -> PacketPools {
        PacketPools {
            writer: PacketWriterPool::new(),
            compressor: BufferPool::new(
                "compressor",
                4,
                huffman::COMPRESSOR_BUFFER_SIZE,
            ),
            buffered: BufferPool::new("compiled", 16, BUFFER_SIZE),
        }
    }
}

impl Default for PacketPools {
    fn default() -> Self {
        Self::new()
    }
}

enum CompiledBuffer {
    /// Backed by the buffered pool; returned there on release.
    Pooled(Box<[u8]>),
    /// Oversized or static; dropped normally.
    Owned(Box<[u8]>),
    /// Compression overflowed; the connection must go away.
    Failed,
}

pub struct Packet {
    packet_id: u8,
    declared_length: usize,
    state: PacketState,
    writer: Option<PacketWriter>,
    compiled: Option<(CompiledBuffer, usize)>,
}

impl Packet {
    /// Start a frame. `length` is the fixed wire length, or 0 for a
    /// dynamic-length packet, which reserves the u16 length word at offset 1
    /// for back-patching at compile time.
    pub fn new(pools: &PacketPools, packet_id: u8, length: usize) -> Packet {
        let capacity = if length > 0 { length } else { 64 };
        let mut writer = pools.writer.create_instance(capacity);

        writer.write_u8(packet_id);
        if length == 0 {
            writer.write_u16(0);
        }

        Packet {
            packet_id,
            declared_length: length,
            state: PacketState::empty(),
            writer: Some(writer),
            compiled: None,
        }
    }

    #[inline]
    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    #[inline]
    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn writer(&mut self) -> &mut PacketWriter {
        self.writer
            .as_mut()
            .expect("packet written to after compile")
    }

    /// Mark as shared: the compiled buffer gets its own allocation and is
    /// kept for the life of the process.
    pub fn set_static(&mut self) {
        self.state |= PacketState::STATIC | PacketState::ACQUIRED;
    }

    pub fn is_static(&self) -> bool {
        self.state.contains(PacketState::STATIC)
    }

    /// Pin the compiled buffer so repeated sends reuse it without warning.
    pub fn acquire(&mut self) {
        self.state |= PacketState::ACQUIRED;
    }

    /// The compiled wire bytes, if compilation already happened.
    pub fn compiled(&self) -> Option<&[u8]> {
        match &self.compiled {
            Some((CompiledBuffer::Pooled(buf), len)) => Some(&buf[..*len]),
            Some((CompiledBuffer::Owned(buf), len)) => Some(&buf[..*len]),
            Some((CompiledBuffer::Failed, _)) => Some(&[]),
            None => None,
        }
    }

    /// Compile into the final wire form. Idempotent: later calls return the
    /// cached buffer (with a one-shot warning when the packet was neither
    /// static nor acquired). An empty slice means compression overflowed.
    pub fn compile(&mut self, compress: bool, pools: &PacketPools) -> &[u8] {
        if self.compiled.is_some() {
            if !self
                .state
                .intersects(PacketState::STATIC | PacketState::ACQUIRED)
                && !self.state.contains(PacketState::WARNED)
            {
                self.state |= PacketState::WARNED;
                warn!(
                    "Packet 0x{:02X}: recompile of a transient packet; acquire() it or rebuild",
                    self.packet_id
                );
            }
            return self.compiled().unwrap_or(&[]);
        }

        let Some(mut writer) = self.writer.take() else {
            error!("Packet 0x{:02X}: compile with no writer", self.packet_id);
            self.compiled = Some((CompiledBuffer::Failed, 0));
            return &[];
        };

        if self.declared_length == 0 {
            let length = writer.length() as u16;
            writer.seek(1);
            writer.write_u16(length);
        } else if writer.length() != self.declared_length {
            warn!(
                "Packet 0x{:02X}: stream length {} != declared {}",
                self.packet_id,
                writer.length(),
                self.declared_length
            );
        }

        let compiled = if compress {
            let mut scratch = pools.compressor.acquire();
            let written = huffman::compress(writer.as_slice(), &mut scratch);

            let result = if written == 0 {
                error!(
                    "Packet 0x{:02X}: compression overflow on {} byte stream",
                    self.packet_id,
                    writer.length()
                );
                (CompiledBuffer::Failed, 0)
            } else {
                (self.store(&scratch[..written], pools), written)
            };

            pools.compressor.release(scratch);
            result
        } else {
            let length = writer.length();
            (self.store(&writer.as_slice()[..length], pools), length)
        };

        pools.writer.release_instance(writer);

        self.state |= PacketState::ACCESSED;
        self.compiled = Some(compiled);
        self.compiled().unwrap_or(&[])
    }

    fn store(&mut self, bytes: &[u8], pools: &PacketPools) -> CompiledBuffer {
        if bytes.len() <= BUFFER_SIZE && !self.is_static() {
            let mut buffer = pools.buffered.acquire();
            buffer[..bytes.len()].copy_from_slice(bytes);
            self.state |= PacketState::BUFFERED;
            CompiledBuffer::Pooled(buffer)
        } else {
            CompiledBuffer::Owned(bytes.to_vec().into_boxed_slice())
        }
    }

    /// Return a pooled compiled buffer. Statics keep theirs until shutdown.
    pub fn release(&mut self, pools: &PacketPools) {
        if self.is_static() {
            return;
        }

        if let Some((CompiledBuffer::Pooled(buffer), _)) = self.compiled.take() {
            pools.buffered.release(buffer);
        }

        if let Some(writer) = self.writer.take() {
            pools.writer.release_instance(writer);
        }
    }
}

/// Build, mark static, and eagerly compile a shared frame.
pub fn make_static(mut packet: Packet, compress: bool, pools: &PacketPools) -> Arc<Packet> {
    packet.set_static();
    packet.compile(compress, pools);
    Arc::new(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_length_backpatch() {
        let pools = PacketPools::new();
        let mut p = Packet::new(&pools, 0xAE, 0);
        p.writer().write_u32(0xDEADBEEF);

        let bytes = p.compile(false, &pools).to_vec();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 0xAE);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 7);
        p.release(&pools);
    }

    #[test]
    fn test_fixed_length_no_length_word() {
        let pools = PacketPools::new();
        let mut p = Packet::new(&pools, 0x73, 2);
        p.writer().write_u8(0x42);

        let bytes = p.compile(false, &pools).to_vec();
        assert_eq!(bytes, vec![0x73, 0x42]);
        p.release(&pools);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let pools = PacketPools::new();
        let mut p = Packet::new(&pools, 0x22, 3);
        p.writer().write_u8(1);
        p.writer().write_u8(0x41);

        let first = p.compile(false, &pools).to_vec();
        let second = p.compile(false, &pools).to_vec();
        assert_eq!(first, second);
        assert!(p.state().contains(PacketState::WARNED));
        p.release(&pools);
    }

    #[test]
    fn test_compressed_compile_roundtrips_header() {
        let pools = PacketPools::new();
        let mut p = Packet::new(&pools, 0x55, 1);

        let bytes = p.compile(true, &pools).to_vec();
        assert!(!bytes.is_empty());
        // Compressed form of a 1-byte frame differs from the raw opcode.
        assert_ne!(bytes, vec![0x55]);
        p.release(&pools);
    }

    #[test]
    fn test_buffered_release_returns_to_pool() {
        let pools = PacketPools::new();
        let baseline = pools.buffered.free_count();

        let mut p = Packet::new(&pools, 0x73, 2);
        p.writer().write_u8(0);
        p.compile(false, &pools);
        assert!(p.state().contains(PacketState::BUFFERED));
        assert_eq!(pools.buffered.free_count(), baseline - 1);

        p.release(&pools);
        assert_eq!(pools.buffered.free_count(), baseline);
    }

    #[test]
    fn test_static_compiles_once_and_keeps_buffer() {
        let pools = PacketPools::new();
        let p = Packet::new(&pools, 0x55, 1);
        let shared = make_static(p, false, &pools);
        assert_eq!(shared.compiled(), Some(&[0x55u8][..]));
        assert!(shared.is_static());
    }

    #[test]
    fn test_oversized_frame_owns_buffer() {
        let pools = PacketPools::new();
        let mut p = Packet::new(&pools, 0xDD, 0);
        for _ in 0..BUFFER_SIZE {
            p.writer().write_u16(0x5A5A);
        }

        let len = p.compile(false, &pools).len();
        assert_eq!(len, BUFFER_SIZE * 2 + 3);
        assert!(!p.state().contains(PacketState::BUFFERED));
        p.release(&pools);
    }
}
