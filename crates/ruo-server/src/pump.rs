// pump.rs — receive dispatcher
//
// One pump owns the listeners and the queue of connections with buffered
// bytes. A slice runs once per tick: adopt accepted sockets, poll every
// socket into its ring, then frame and dispatch until each ring runs dry.
// A handler whose throttle declines is parked and merged back at the end
// of the slice, so it runs strictly one tick later — deferred, not
// dropped.

use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use log::{debug, warn};

use ruo_common::packet_io::PacketReader;
use ruo_common::version::ProtocolChanges;

use crate::events::GameEvents;
use crate::listener::Listener;
use crate::netstate::{NetStateId, SeedResult};
use crate::server::ServerContext;

/// Opcodes accepted before the first packet of a session is honored;
/// anything else this early is an encrypted or corrupt client.
const PRE_LOGIN_ALLOWED: [u8; 7] = [0xF0, 0xF1, 0xCF, 0x80, 0x91, 0xA4, 0xEF];

pub struct MessagePump {
    listeners: Vec<Listener>,
    queue: Vec<NetStateId>,
    throttled: Vec<NetStateId>,
}

impl MessagePump {
    pub fn bind(endpoints: &[SocketAddr]) -> MessagePump {
        let listeners = endpoints
            .iter()
            .filter_map(|&endpoint| Listener::bind(endpoint))
            .collect();

        MessagePump {
            listeners,
            queue: Vec::new(),
            throttled: Vec::new(),
        }
    }

    pub fn with_listeners(listeners: Vec<Listener>) -> MessagePump {
        MessagePump {
            listeners,
            queue: Vec::new(),
            throttled: Vec::new(),
        }
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// One tick of network intake.
    pub fn slice(&mut self, ctx: &mut ServerContext, events: &mut dyn GameEvents) {
        self.check_listeners(ctx, events);

        if !ctx.paused {
            self.poll_receives(ctx);
        }

        let work = std::mem::take(&mut self.queue);
        for id in work {
            self.handle_receive(ctx, events, id);
        }

        // Throttled states run strictly next tick.
        let throttled = std::mem::take(&mut self.throttled);
        for id in throttled {
            if !self.queue.contains(&id) {
                self.queue.push(id);
            }
        }
    }

    fn check_listeners(&mut self, ctx: &mut ServerContext, events: &mut dyn GameEvents) {
        for listener in &self.listeners {
            for socket in listener.slice() {
                let allowed = socket
                    .peer_addr()
                    .map(|addr| events.socket_connect(addr))
                    .unwrap_or(false);

                if !allowed {
                    let _ = socket.shutdown(Shutdown::Both);
                    continue;
                }

                ctx.attach_socket(socket);
            }
        }
    }

    fn poll_receives(&mut self, ctx: &mut ServerContext) {
        for id in 0..ctx.netstates.len() {
            let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };

            if !ns.running || ns.disposing {
                continue;
            }

            match ns.poll_receive(&ctx.net_pools) {
                Ok(_) => {
                    if !ns.buffer.is_empty() && !self.queue.contains(&id) {
                        self.queue.push(id);
                    }
                }
                Err(e) => {
                    debug!("Client: {}: read failed ({})", ns.address, e);
                    ctx.dispose_state(id, false);
                }
            }
        }
    }

    /// Frame and dispatch everything buffered on one connection.
    fn handle_receive(
        &mut self,
        ctx: &mut ServerContext,
        events: &mut dyn GameEvents,
        id: NetStateId,
    ) {
        loop {
            let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
                return;
            };

            if ns.disposing || !ns.running {
                return;
            }

            if !ns.seeded {
                match ns.ingest_seed() {
                    SeedResult::NeedMore => return,
                    SeedResult::Accepted => continue,
                    SeedResult::ZeroSeed => {
                        warn!("Client: {}: zero login seed, disconnecting", ns.address);
                        ctx.dispose_state(id, false);
                        return;
                    }
                }
            }

            if ns.buffer.is_empty() {
                return;
            }

            let packet_id = ns.buffer.peek_packet_id();

            if !ns.sent_first_packet && !PRE_LOGIN_ALLOWED.contains(&packet_id) {
                warn!(
                    "Client: {}: encrypted client detected (0x{:02X}), disconnecting",
                    ns.address, packet_id
                );
                ctx.dispose_state(id, false);
                return;
            }

            let grid_lines = ns
                .protocol_changes
                .contains(ProtocolChanges::CONTAINER_GRID_LINES);

            let Some(handler) = ctx.handlers.get(packet_id, grid_lines).copied() else {
                debug!(
                    "Client: {}: unhandled packet 0x{:02X}, dropping {} buffered bytes",
                    ns.address,
                    packet_id,
                    ns.buffer.len()
                );
                ns.buffer.clear();
                return;
            };

            let packet_length = if handler.length > 0 {
                handler.length
            } else {
                if ns.buffer.len() < 3 {
                    return;
                }

                let framed = ns.buffer.peek_body_length() as usize;
                if framed < 3 {
                    warn!(
                        "Client: {}: framed length {} on 0x{:02X}, disconnecting",
                        ns.address, framed, packet_id
                    );
                    ctx.dispose_state(id, false);
                    return;
                }
                framed
            };

            if ns.buffer.len() < packet_length {
                return;
            }

            if handler.ingame {
                let live = ns
                    .mobile
                    .map(|serial| ctx.world.find_mobile(serial).is_some())
                    .unwrap_or(false);

                if !live {
                    warn!(
                        "Client: {}: in-game packet 0x{:02X} with no mobile, disconnecting",
                        ns.address, packet_id
                    );
                    ctx.dispose_state(id, false);
                    return;
                }
            }

            if let Some(throttle) = handler.throttle {
                if !throttle(ns) {
                    self.throttled.push(id);
                    return;
                }
            }

            // Set before dispatch so a handler (play-server) can reset it.
            ns.sent_first_packet = true;

            let (mut storage, from_pool) = if packet_length <= ctx.net_pools.recv.buffer_size() {
                (ctx.net_pools.recv.acquire(), true)
            } else {
                (vec![0u8; packet_length].into_boxed_slice(), false)
            };

            ns.buffer.dequeue(&mut storage[..packet_length]);

            let started = Instant::now();
            {
                let mut reader = PacketReader::new(&storage[..packet_length]);
                reader.seek(if handler.length > 0 { 1 } else { 3 });
                (handler.callback)(ctx, events, id, &mut reader);
            }
            ctx.diagnostics
                .record_received(packet_id, started.elapsed(), packet_length);

            if from_pool {
                ctx.net_pools.recv.release(storage);
            }
        }
    }
}
