// netstate.rs — per-connection state machine
//
// Sockets are nonblocking; the tick thread polls receives into the byte
// ring and drains the send queue until WouldBlock. The stage ladder runs
// seed → login → server select → game login → character → in-game, driven
// by the first few opcodes. Disposal is two-phase: the connection is torn
// down immediately, then the server's disposed-queue pass detaches world
// references.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info};

use ruo_common::bufpool::BufferPool;
use ruo_common::bytequeue::ByteQueue;
use ruo_common::packet::{Packet, PacketPools};
use ruo_common::sendqueue::{SendQueue, SendQueueError};
use ruo_common::serial::Serial;
use ruo_common::version::{ClientFlags, ClientVersion, ProtocolChanges};

pub type NetStateId = usize;

/// Idle connections are swept after this long without traffic.
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(90);

/// Cadence of the in-game login timer.
pub const LOGIN_TIMER_INTERVAL: Duration = Duration::from_secs(1);

bitflags! {
    /// Receive gating: PENDING while a receive is outstanding, PAUSED while
    /// the whole server has receives suspended.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AsyncState: u32 {
        const PENDING = 0x01;
        const PAUSED = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Accepted,
    Seeded,
    Authenticated,
    ServerListed,
    PreGameLogin,
    GameAuthenticated,
    CharacterSelected,
    InGame,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GumpHandle {
    pub serial: u32,
    pub type_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HuePickerHandle {
    pub serial: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuHandle {
    pub serial: u32,
}

/// Result of the seed ingest on a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedResult {
    NeedMore,
    Accepted,
    ZeroSeed,
}

/// Why an outbound packet could not be queued. Either way the connection
/// is beyond saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Huffman output would not fit the 64 KiB wire cap.
    CompressionOverflow,
    /// The pending gram list passed its byte ceiling.
    QueueCapacity,
}

/// The buffer pools connection I/O draws from.
pub struct NetPools {
    pub recv: Arc<BufferPool>,
    pub gram: Arc<BufferPool>,
}

impl NetPools {
    pub fn new(coalesce_size: usize) -> NetPools {
        NetPools {
            recv: BufferPool::new("receive", 64, 4096),
            gram: BufferPool::new("gram", 64, coalesce_size),
        }
    }
}

pub struct NetState {
    pub id: NetStateId,
    socket: Option<TcpStream>,
    pub address: SocketAddr,

    pub buffer: ByteQueue,
    send_queue: SendQueue,

    pub stage: ConnectionStage,
    pub seed: u32,
    pub auth_id: u32,
    pub version: Option<ClientVersion>,
    pub protocol_changes: ProtocolChanges,
    pub flags: ClientFlags,
    pub account: Option<String>,
    pub mobile: Option<Serial>,
    pub language: String,

    pub seeded: bool,
    pub sent_first_packet: bool,
    pub compression_enabled: bool,
    pub block_all_packets: bool,
    pub running: bool,
    pub disposing: bool,
    async_state: AsyncState,

    pub next_check_activity: Instant,
    /// Movement sequence, modulo 256 skipping zero.
    pub sequence: u8,
    pub next_move_time: Instant,
    /// While set, the login timer fires at this instant.
    pub login_timer: Option<Instant>,

    pub gumps: Vec<GumpHandle>,
    pub hue_pickers: Vec<HuePickerHandle>,
    pub menus: Vec<MenuHandle>,
    pub trades: Vec<u32>,
}

impl NetState {
    pub fn new(id: NetStateId, socket: TcpStream, coalesce_size: usize) -> io::Result<NetState> {
        socket.set_nonblocking(true)?;
        let address = socket.peer_addr()?;

        Ok(NetState {
            id,
            socket: Some(socket),
            address,
            buffer: ByteQueue::new(),
            send_queue: SendQueue::new(coalesce_size),
            stage: ConnectionStage::Accepted,
            seed: 0,
            auth_id: 0,
            version: None,
            protocol_changes: ProtocolChanges::empty(),
            flags: ClientFlags::empty(),
            account: None,
            mobile: None,
            language: String::new(),
            seeded: false,
            sent_first_packet: false,
            compression_enabled: false,
            block_all_packets: false,
            running: false,
            disposing: false,
            async_state: AsyncState::empty(),
            next_check_activity: Instant::now() + ACTIVITY_TIMEOUT,
            sequence: 0,
            next_move_time: Instant::now(),
            login_timer: None,
            gumps: Vec::new(),
            hue_pickers: Vec::new(),
            menus: Vec::new(),
            trades: Vec::new(),
        })
    }

    pub fn start(&mut self) {
        self.running = true;
        self.next_check_activity = Instant::now() + ACTIVITY_TIMEOUT;
        info!("Client: {}: connected", self.address);
    }

    pub fn set_version(&mut self, version: ClientVersion) {
        self.protocol_changes = ProtocolChanges::from(version);
        self.version = Some(version);
    }

    pub fn pause(&mut self) {
        self.async_state |= AsyncState::PAUSED;
    }

    pub fn resume(&mut self) {
        self.async_state -= AsyncState::PAUSED;
    }

    pub fn is_paused(&self) -> bool {
        self.async_state.contains(AsyncState::PAUSED)
    }

    /// Bump the movement sequence: wraps modulo 256 and never lands on 0.
    pub fn advance_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == 0 {
            self.sequence = 1;
        }
    }

    // --------------------------------------------------------
    // Receive path
    // --------------------------------------------------------

    /// Drain the socket into the byte ring. Ok(true) means new bytes
    /// arrived; Err means the peer is gone and the state must be disposed.
    pub fn poll_receive(&mut self, pools: &NetPools) -> io::Result<bool> {
        if self.disposing || self.is_paused() {
            return Ok(false);
        }

        let Some(socket) = self.socket.as_mut() else {
            return Ok(false);
        };

        self.async_state |= AsyncState::PENDING;
        let mut staging = pools.recv.acquire();
        let mut received = false;

        let result = loop {
            match socket.read(&mut staging) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                Ok(count) => {
                    self.buffer.enqueue(&staging[..count]);
                    received = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(received),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        pools.recv.release(staging);
        self.async_state -= AsyncState::PENDING;

        if received {
            self.next_check_activity = Instant::now() + ACTIVITY_TIMEOUT;
        }

        result
    }

    /// Consume the handshake seed. New-style clients lead with the 0xEF
    /// packet carrying seed and version; everything else is a bare 4-byte
    /// seed.
    pub fn ingest_seed(&mut self) -> SeedResult {
        debug_assert!(!self.seeded);

        if self.buffer.peek_packet_id() == 0xEF {
            if self.buffer.len() < 21 {
                return SeedResult::NeedMore;
            }

            let mut raw = [0u8; 21];
            self.buffer.dequeue(&mut raw);

            let seed = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
            if seed == 0 {
                return SeedResult::ZeroSeed;
            }

            let major = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]);
            let minor = u32::from_be_bytes([raw[9], raw[10], raw[11], raw[12]]);
            let revision = u32::from_be_bytes([raw[13], raw[14], raw[15], raw[16]]);
            let patch = u32::from_be_bytes([raw[17], raw[18], raw[19], raw[20]]);

            self.seed = seed;
            self.set_version(ClientVersion::new(major, minor, revision, patch));
        } else {
            if self.buffer.len() < 4 {
                return SeedResult::NeedMore;
            }

            let mut raw = [0u8; 4];
            self.buffer.dequeue(&mut raw);

            let seed = u32::from_be_bytes(raw);
            if seed == 0 {
                return SeedResult::ZeroSeed;
            }

            self.seed = seed;
        }

        self.seeded = true;
        self.stage = ConnectionStage::Seeded;
        SeedResult::Accepted
    }

    // --------------------------------------------------------
    // Send path
    // --------------------------------------------------------

    /// Compile and queue a packet, returning the wire byte count. An empty
    /// compile result means the compressor overflowed; the caller disposes
    /// the connection.
    pub fn send(
        &mut self,
        mut packet: Packet,
        packet_pools: &PacketPools,
        pools: &NetPools,
    ) -> Result<usize, SendError> {
        let compress = self.compression_enabled;
        let result = {
            let bytes = packet.compile(compress, packet_pools);

            if bytes.is_empty() {
                Err(SendError::CompressionOverflow)
            } else {
                self.enqueue_bytes_inner(bytes, pools)
            }
        };
        packet.release(packet_pools);
        result
    }

    /// Queue an already-compiled (static) frame.
    pub fn send_compiled(&mut self, bytes: &[u8], pools: &NetPools) -> Result<usize, SendError> {
        if bytes.is_empty() {
            return Err(SendError::CompressionOverflow);
        }
        self.enqueue_bytes_inner(bytes, pools)
    }

    fn enqueue_bytes_inner(&mut self, bytes: &[u8], pools: &NetPools) -> Result<usize, SendError> {
        // block_all_packets suppresses outbound traffic between character
        // selection and login completion.
        if self.disposing || self.block_all_packets {
            return Ok(0);
        }

        match self.send_queue.enqueue(&pools.gram, bytes) {
            Ok(true) => {
                self.try_write(pools);
            }
            Ok(false) => {}
            Err(SendQueueError::CapacityExceeded) => return Err(SendError::QueueCapacity),
        }

        Ok(bytes.len())
    }

    /// Push queued bytes at the socket until it would block. Returns true
    /// when everything (including the coalescing gram) went out.
    pub fn flush(&mut self, pools: &NetPools) -> bool {
        self.send_queue.check_flush_ready();
        self.try_write(pools)
    }

    fn try_write(&mut self, pools: &NetPools) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return true;
        };

        let mut wrote = false;

        while let Some(head) = self.send_queue.head() {
            match socket.write(head) {
                Ok(0) => break,
                Ok(count) => {
                    wrote = true;
                    self.send_queue.advance(count);

                    if self.send_queue.head_done() {
                        self.send_queue.dequeue(&pools.gram);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        if wrote {
            self.next_check_activity = Instant::now() + ACTIVITY_TIMEOUT;
        }

        self.send_queue.is_empty()
    }

    // --------------------------------------------------------
    // UI resource caps
    // --------------------------------------------------------

    pub fn add_gump(&mut self, handle: GumpHandle, cap: usize) -> bool {
        if self.gumps.len() >= cap {
            return false;
        }
        self.gumps.push(handle);
        true
    }

    pub fn remove_gump(&mut self, serial: u32, type_id: u32) -> Option<GumpHandle> {
        let index = self
            .gumps
            .iter()
            .position(|g| g.serial == serial && g.type_id == type_id)?;
        Some(self.gumps.remove(index))
    }

    pub fn add_hue_picker(&mut self, handle: HuePickerHandle, cap: usize) -> bool {
        if self.hue_pickers.len() >= cap {
            return false;
        }
        self.hue_pickers.push(handle);
        true
    }

    pub fn add_menu(&mut self, handle: MenuHandle, cap: usize) -> bool {
        if self.menus.len() >= cap {
            return false;
        }
        self.menus.push(handle);
        true
    }

    pub fn add_trade(&mut self, trade_id: u32, cap: usize) -> bool {
        if self.trades.len() >= cap {
            return false;
        }
        self.trades.push(trade_id);
        true
    }

    // --------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------

    /// True once the activity deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.next_check_activity
    }

    /// Tear down the connection. Idempotent; the second call is a no-op.
    /// `flush` asks for one best-effort drain first, never a blocking wait.
    pub fn dispose(&mut self, flush: bool, pools: &NetPools) {
        if self.disposing {
            return;
        }
        self.disposing = true;
        self.running = false;

        if flush {
            self.flush(pools);
        }

        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }

        self.send_queue.clear(&pools.gram);
        self.buffer.clear();
        self.stage = ConnectionStage::Disposed;

        debug!("Client: {}: disconnected", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn test_state(server: TcpStream) -> NetState {
        let mut ns = NetState::new(0, server, 512).unwrap();
        ns.start();
        ns
    }

    #[test]
    fn test_new_style_seed() {
        let (mut client, server) = socket_pair();
        let mut ns = test_state(server);
        let pools = NetPools::new(512);

        let mut packet = vec![0xEFu8];
        packet.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        packet.extend_from_slice(&7u32.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes());
        packet.extend_from_slice(&45u32.to_be_bytes());
        packet.extend_from_slice(&65u32.to_be_bytes());
        client.write_all(&packet).unwrap();

        while !ns.poll_receive(&pools).unwrap() {}
        assert_eq!(ns.ingest_seed(), SeedResult::Accepted);
        assert_eq!(ns.seed, 0xDEADBEEF);
        assert_eq!(ns.version, Some(ClientVersion::new(7, 0, 45, 65)));
        assert_eq!(ns.protocol_changes, ProtocolChanges::VERSION_704565);
        assert_eq!(ns.stage, ConnectionStage::Seeded);
    }

    #[test]
    fn test_raw_seed_and_zero_rejection() {
        let (mut client, server) = socket_pair();
        let mut ns = test_state(server);
        let pools = NetPools::new(512);

        client.write_all(&0x12345678u32.to_be_bytes()).unwrap();
        while !ns.poll_receive(&pools).unwrap() {}
        assert_eq!(ns.ingest_seed(), SeedResult::Accepted);
        assert_eq!(ns.seed, 0x12345678);

        // A zero seed on a second connection gets the boot.
        let (mut client2, server2) = socket_pair();
        let mut ns2 = test_state(server2);
        client2.write_all(&0u32.to_be_bytes()).unwrap();
        while !ns2.poll_receive(&pools).unwrap() {}
        assert_eq!(ns2.ingest_seed(), SeedResult::ZeroSeed);
    }

    #[test]
    fn test_partial_seed_waits() {
        let (mut client, server) = socket_pair();
        let mut ns = test_state(server);
        let pools = NetPools::new(512);

        client.write_all(&[0xEF, 0x01]).unwrap();
        while !ns.poll_receive(&pools).unwrap() {}
        assert_eq!(ns.ingest_seed(), SeedResult::NeedMore);
        assert_eq!(ns.buffer.len(), 2);
    }

    #[test]
    fn test_send_path_writes_wire_bytes() {
        let (mut client, server) = socket_pair();
        let mut ns = test_state(server);
        let pools = NetPools::new(512);
        let packet_pools = PacketPools::new();

        let mut packet = Packet::new(&packet_pools, 0x73, 2);
        packet.writer().write_u8(0x42);
        ns.send(packet, &packet_pools, &pools).unwrap();
        assert!(ns.flush(&pools));

        let mut out = [0u8; 2];
        client.read_exact(&mut out).unwrap();
        assert_eq!(out, [0x73, 0x42]);
    }

    #[test]
    fn test_sequence_skips_zero() {
        let (_client, server) = socket_pair();
        let mut ns = test_state(server);

        ns.sequence = 255;
        ns.advance_sequence();
        assert_eq!(ns.sequence, 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (_client, server) = socket_pair();
        let mut ns = test_state(server);
        let pools = NetPools::new(512);

        ns.dispose(true, &pools);
        assert!(ns.disposing);
        assert_eq!(ns.stage, ConnectionStage::Disposed);
        ns.dispose(true, &pools);
        assert_eq!(ns.stage, ConnectionStage::Disposed);
    }

    #[test]
    fn test_paused_state_defers_receive() {
        let (mut client, server) = socket_pair();
        let mut ns = test_state(server);
        let pools = NetPools::new(512);

        client.write_all(&[1, 2, 3, 4]).unwrap();
        ns.pause();
        assert!(!ns.poll_receive(&pools).unwrap());
        assert!(ns.buffer.is_empty());

        ns.resume();
        while !ns.poll_receive(&pools).unwrap() {}
        assert_eq!(ns.buffer.len(), 4);
    }

    #[test]
    fn test_gump_cap() {
        let (_client, server) = socket_pair();
        let mut ns = test_state(server);

        for i in 0..4 {
            assert!(ns.add_gump(GumpHandle { serial: i, type_id: 1 }, 4));
        }
        assert!(!ns.add_gump(GumpHandle { serial: 9, type_id: 1 }, 4));
        assert!(ns.remove_gump(2, 1).is_some());
        assert!(ns.add_gump(GumpHandle { serial: 9, type_id: 1 }, 4));
    }
}
