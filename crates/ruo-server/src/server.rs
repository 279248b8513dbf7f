// server.rs — server context and tick orchestration
//
// Everything process-wide lives on ServerContext and is threaded through
// calls; only main() instantiates one. The tick loop runs the message
// pump, then timers (login, the minutely liveness sweep, the disposed
// queue), then drains every connection's send queue.

use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use parking_lot::Mutex;

use ruo_common::bufpool::BufferPool;
use ruo_common::diagnostics::Diagnostics;
use ruo_common::packet::{Packet, PacketPools};
use ruo_common::packet_io::PacketWriterPool;
use ruo_common::serial::Serial;
use ruo_common::version::ClientVersion;

use crate::config::ServerConfig;
use crate::events::GameEvents;
use crate::incoming;
use crate::netstate::{
    ConnectionStage, NetPools, NetState, NetStateId, LOGIN_TIMER_INTERVAL,
};
use crate::outgoing;
use crate::pump::MessagePump;
use crate::save::{
    new_generation_dir, repoint_current, ManualResetEvent, SaveError, SaveStrategy,
};
use crate::world::World;

/// Disposed connections finalized per pass.
const DISPOSE_BATCH: usize = 200;

/// Cadence of the liveness sweep.
const ALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================
// AuthIdWindow
// ============================================================

pub const AUTH_ID_WINDOW_SIZE: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct AuthIdEntry {
    pub issued_at: Instant,
    pub version: Option<ClientVersion>,
}

/// Bounded window of outstanding login-to-game handoff tokens. All access
/// is take-if-present under one lock; there is no check-then-read window.
pub struct AuthIdWindow {
    entries: Mutex<HashMap<u32, AuthIdEntry>>,
}

impl AuthIdWindow {
    pub fn new() -> AuthIdWindow {
        AuthIdWindow {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh token, evicting the oldest when the window is full.
    pub fn register(&self, version: Option<ClientVersion>) -> u32 {
        let mut entries = self.entries.lock();

        if entries.len() >= AUTH_ID_WINDOW_SIZE {
            if let Some((&oldest, _)) = entries.iter().min_by_key(|(_, e)| e.issued_at) {
                entries.remove(&oldest);
            }
        }

        let mut auth_id = rand::random::<u32>();
        while auth_id == 0 || entries.contains_key(&auth_id) {
            auth_id = rand::random::<u32>();
        }

        entries.insert(
            auth_id,
            AuthIdEntry {
                issued_at: Instant::now(),
                version,
            },
        );

        auth_id
    }

    /// Atomically remove and return the entry for a presented token.
    pub fn take(&self, auth_id: u32) -> Option<AuthIdEntry> {
        self.entries.lock().remove(&auth_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AuthIdWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Secure trades
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct SecureTrade {
    pub container: u32,
    pub parties: [NetStateId; 2],
    pub gold: [u32; 2],
    pub plat: [u32; 2],
    pub accepted: [bool; 2],
}

impl SecureTrade {
    pub fn side_of(&self, id: NetStateId) -> Option<usize> {
        self.parties.iter().position(|&p| p == id)
    }
}

// ============================================================
// ServerContext
// ============================================================

pub struct ServerContext {
    pub config: ServerConfig,
    pub world: World,
    pub netstates: Vec<Option<NetState>>,

    pub handlers: crate::handlers::PacketHandlers,
    pub packet_pools: PacketPools,
    pub net_pools: NetPools,
    pub save_pages: Arc<BufferPool>,
    pub save_writers: PacketWriterPool,

    pub auth_window: AuthIdWindow,
    pub diagnostics: Diagnostics,
    pub trades: HashMap<u32, SecureTrade>,

    pub disposed_queue: VecDeque<NetStateId>,
    pub disk_write_done: Arc<ManualResetEvent>,
    pub paused: bool,

    next_alive_check: Instant,
}

impl ServerContext {
    pub fn new(config: ServerConfig, world: World) -> ServerContext {
        let mut handlers = crate::handlers::PacketHandlers::new();
        incoming::register_defaults(&mut handlers);

        let coalesce = config.coalesce_buffer_size;

        ServerContext {
            config,
            world,
            netstates: Vec::new(),
            handlers,
            packet_pools: PacketPools::new(),
            net_pools: NetPools::new(coalesce),
            save_pages: BufferPool::new("save-pages", 16, crate::filewriter::PAGE_SIZE),
            save_writers: PacketWriterPool::new(),
            auth_window: AuthIdWindow::new(),
            diagnostics: Diagnostics::new(),
            trades: HashMap::new(),
            disposed_queue: VecDeque::new(),
            disk_write_done: Arc::new(ManualResetEvent::new(true)),
            paused: false,
            next_alive_check: Instant::now() + ALIVE_CHECK_INTERVAL,
        }
    }

    // --------------------------------------------------------
    // Connection bookkeeping
    // --------------------------------------------------------

    pub fn state(&self, id: NetStateId) -> Option<&NetState> {
        self.netstates.get(id).and_then(Option::as_ref)
    }

    pub fn state_mut(&mut self, id: NetStateId) -> Option<&mut NetState> {
        self.netstates.get_mut(id).and_then(Option::as_mut)
    }

    /// Wrap an accepted socket in a NetState and start it.
    pub fn attach_socket(&mut self, socket: TcpStream) -> Option<NetStateId> {
        let slot = self.netstates.iter().position(Option::is_none);
        let id = slot.unwrap_or(self.netstates.len());

        let mut ns = match NetState::new(id, socket, self.config.coalesce_buffer_size) {
            Ok(ns) => ns,
            Err(e) => {
                warn!("failed to adopt socket: {}", e);
                return None;
            }
        };

        if self.paused {
            ns.pause();
        }
        ns.start();

        if id == self.netstates.len() {
            self.netstates.push(Some(ns));
        } else {
            self.netstates[id] = Some(ns);
        }

        Some(id)
    }

    /// Tear down a connection and park it for final cleanup.
    pub fn dispose_state(&mut self, id: NetStateId, flush: bool) {
        let Some(ns) = self.netstates.get_mut(id).and_then(Option::as_mut) else {
            return;
        };

        if ns.disposing {
            return;
        }

        ns.dispose(flush, &self.net_pools);
        self.disposed_queue.push_back(id);
    }

    /// Compile-and-queue to one connection; a failed send disposes it.
    pub fn send_to(&mut self, id: NetStateId, packet: Packet) {
        let packet_id = packet.packet_id();
        let started = Instant::now();

        let Some(ns) = self.netstates.get_mut(id).and_then(Option::as_mut) else {
            return;
        };

        match ns.send(packet, &self.packet_pools, &self.net_pools) {
            Ok(length) => {
                self.diagnostics
                    .record_sent(packet_id, started.elapsed(), length);
            }
            Err(e) => {
                error!("Client: {}: {:?}, disconnecting", ns.address, e);
                self.dispose_state(id, false);
            }
        }
    }

    /// Send a shared pre-compiled frame.
    pub fn send_compiled_to(&mut self, id: NetStateId, bytes: &[u8]) {
        let Some(ns) = self.netstates.get_mut(id).and_then(Option::as_mut) else {
            return;
        };

        if let Err(e) = ns.send_compiled(bytes, &self.net_pools) {
            error!("Client: {}: {:?}, disconnecting", ns.address, e);
            self.dispose_state(id, false);
        }
    }

    /// System text to every in-game client, walking states in slot order.
    pub fn broadcast_message(&mut self, hue: u16, text: &str) {
        let mut packet = outgoing::ascii_message(
            &self.packet_pools,
            Serial::MINUS_ONE,
            0xFFFF,
            0,
            hue,
            3,
            "System",
            text,
        );
        packet.acquire();

        let bytes = packet.compile(true, &self.packet_pools).to_vec();
        packet.release(&self.packet_pools);

        if bytes.is_empty() {
            return;
        }

        let targets: Vec<NetStateId> = self
            .netstates
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                slot.as_ref()
                    .filter(|ns| ns.stage == ConnectionStage::InGame)
                    .map(|_| id)
            })
            .collect();

        for id in targets {
            self.send_compiled_to(id, &bytes);
        }
    }

    // --------------------------------------------------------
    // Pause / resume
    // --------------------------------------------------------

    /// Suspend all receive starts until resume().
    pub fn pause(&mut self) {
        self.paused = true;
        for slot in self.netstates.iter_mut().flatten() {
            slot.pause();
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
        for slot in self.netstates.iter_mut().flatten() {
            slot.resume();
        }
    }

    // --------------------------------------------------------
    // Timers
    // --------------------------------------------------------

    pub fn on_tick(&mut self, events: &mut dyn GameEvents) {
        let now = Instant::now();

        self.run_login_timers(events, now);

        if now >= self.next_alive_check {
            self.next_alive_check = now + ALIVE_CHECK_INTERVAL;
            self.check_all_alive(now);
        }

        self.process_disposed_queue(events);
        self.flush_all();
    }

    /// The per-connection 1-second login timer: once the client version is
    /// known, fire DoLogin exactly once and stop.
    fn run_login_timers(&mut self, events: &mut dyn GameEvents, now: Instant) {
        let due: Vec<NetStateId> = self
            .netstates
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let ns = slot.as_ref()?;
                (ns.login_timer.is_some_and(|at| now >= at)).then_some(id)
            })
            .collect();

        for id in due {
            let Some(ns) = self.netstates.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };

            if ns.version.is_some() {
                ns.login_timer = None;
                self.do_login(events, id);
            } else {
                ns.login_timer = Some(now + LOGIN_TIMER_INTERVAL);
            }
        }
    }

    /// Dispose every connection idle past its activity deadline.
    pub fn check_all_alive(&mut self, now: Instant) {
        let expired: Vec<NetStateId> = self
            .netstates
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let ns = slot.as_ref()?;
                (!ns.disposing && ns.is_expired(now)).then_some(id)
            })
            .collect();

        for id in expired {
            self.dispose_state(id, false);
        }
    }

    /// Finalize disposed connections, bounded per pass. Detaches the
    /// mobile, clears UI lists, and frees the slot.
    pub fn process_disposed_queue(&mut self, events: &mut dyn GameEvents) {
        for _ in 0..DISPOSE_BATCH {
            let Some(id) = self.disposed_queue.pop_front() else {
                break;
            };

            let Some(mut ns) = self.netstates.get_mut(id).and_then(Option::take) else {
                continue;
            };

            if let Some(serial) = ns.mobile.take() {
                events.disconnected(&mut self.world, serial);
            }

            ns.gumps.clear();
            ns.hue_pickers.clear();
            ns.menus.clear();
            ns.trades.clear();
            ns.account = None;
        }
    }

    /// Drain every connection's send queue once.
    pub fn flush_all(&mut self) {
        let net_pools = &self.net_pools;
        for slot in self.netstates.iter_mut().flatten() {
            if !slot.disposing {
                slot.flush(net_pools);
            }
        }
    }

    // --------------------------------------------------------
    // Login completion
    // --------------------------------------------------------

    /// Final login push once the client version is known: confirm, state
    /// refresh, the mobile itself, and the completion marker.
    pub fn do_login(&mut self, events: &mut dyn GameEvents, id: NetStateId) {
        let Some(ns) = self.netstates.get(id).and_then(Option::as_ref) else {
            return;
        };
        let Some(serial) = ns.mobile else {
            warn!("Client: {}: login timer with no mobile", ns.address);
            self.dispose_state(id, false);
            return;
        };
        let changes = ns.protocol_changes;

        if let Some(ns) = self.netstates.get_mut(id).and_then(Option::as_mut) {
            ns.block_all_packets = false;
            ns.stage = ConnectionStage::InGame;
        }

        let Some(mobile) = self.world.find_mobile(serial) else {
            self.dispose_state(id, false);
            return;
        };

        let confirm = outgoing::login_confirm(&self.packet_pools, mobile);
        let features = outgoing::supported_features(
            &self.packet_pools,
            changes,
            self.config.supported_features,
        );
        let update = outgoing::mobile_update(&self.packet_pools, mobile);
        let incoming_packet =
            outgoing::mobile_incoming(&self.packet_pools, &self.world, changes, mobile);
        let complete = outgoing::login_complete(&self.packet_pools);

        self.send_to(id, confirm);
        self.send_to(id, features);
        self.send_to(id, update);
        self.send_to(id, incoming_packet);
        if let Some(bytes) = complete.compiled() {
            let bytes = bytes.to_vec();
            self.send_compiled_to(id, &bytes);
        }

        events.login(&mut self.world, serial);
        info!("Client: login complete for {}", serial);
    }

    // --------------------------------------------------------
    // World save
    // --------------------------------------------------------

    pub fn save(&mut self, events: &mut dyn GameEvents) -> Result<(), SaveError> {
        let started = Instant::now();

        self.broadcast_message(0x35, "The world is saving, please wait.");
        // No receives start while the snapshot is taken.
        self.pause();
        self.flush_all();

        events.world_save(&mut self.world);

        let strategy = if self.config.save_parallelism == 0 {
            SaveStrategy {
                background_flush: self.config.background_flush,
                ..SaveStrategy::auto()
            }
        } else {
            SaveStrategy {
                parallelism: self.config.save_parallelism,
                background_flush: self.config.background_flush,
            }
        };

        self.disk_write_done.reset();
        self.world.begin_save();

        let result = new_generation_dir(&self.config.save_root).map_err(SaveError::Io).and_then(|dir| {
            strategy
                .save(
                    &self.world,
                    &dir,
                    &self.save_pages,
                    &self.save_writers,
                    &self.disk_write_done,
                )
                .map(|stats| (dir, stats))
        });

        self.world.end_save();
        self.resume();

        match result {
            Ok((dir, stats)) => {
                if let Err(e) = repoint_current(&self.config.save_root, &dir) {
                    error!("save: failed to repoint current marker: {}", e);
                }

                self.diagnostics.record_timer("world-save", started.elapsed());
                self.broadcast_message(
                    0x35,
                    &format!("World save complete. The entire process took {:.2?}.", stats.elapsed),
                );
                Ok(())
            }
            Err(e) => {
                error!("world save failed: {}", e);
                // The previous generation is untouched; the next attempt
                // may retry.
                self.disk_write_done.set();
                Err(e)
            }
        }
    }
}

/// The assembled server: context, game layer, and pump. Only main builds
/// one.
pub struct Server {
    pub ctx: ServerContext,
    pub events: Box<dyn GameEvents>,
    pub pump: MessagePump,
}

impl Server {
    pub fn new(config: ServerConfig, world: World, events: Box<dyn GameEvents>) -> Server {
        let pump = MessagePump::bind(&config.endpoints);
        Server {
            ctx: ServerContext::new(config, world),
            events,
            pump,
        }
    }

    /// One tick: pump the network, then timers and flushes.
    pub fn run_once(&mut self) {
        self.pump.slice(&mut self.ctx, self.events.as_mut());
        self.ctx.on_tick(self.events.as_mut());
    }
}
