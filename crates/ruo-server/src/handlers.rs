// handlers.rs — opcode dispatch tables
//
// Four tables: the base u8 opcode table, the post-6017 override table
// (container-grid-lines clients), and the extended/encoded sub-opcode
// tables tunnelled through 0xBF and 0xD7. Sub-opcodes below 0x100 sit in a
// flat array, the rest in a sparse map. Fixed lengths live on the base
// entries only; the outer packet's framing is authoritative for the
// tunnelled forms.

use std::collections::HashMap;

use ruo_common::packet_io::PacketReader;

use crate::events::GameEvents;
use crate::netstate::{NetState, NetStateId};
use crate::server::ServerContext;

pub type OnPacketReceive =
    fn(&mut ServerContext, &mut dyn GameEvents, NetStateId, &mut PacketReader);

/// False defers the packet to the next tick.
pub type ThrottleCallback = fn(&mut NetState) -> bool;

#[derive(Clone, Copy)]
pub struct PacketHandler {
    pub packet_id: u8,
    /// Wire length including the opcode; 0 means a framed u16 at offset 1.
    pub length: usize,
    /// Requires an attached, live mobile.
    pub ingame: bool,
    pub callback: OnPacketReceive,
    pub throttle: Option<ThrottleCallback>,
}

#[derive(Clone, Copy)]
pub struct SubPacketHandler {
    pub sub_id: u16,
    pub ingame: bool,
    pub callback: OnPacketReceive,
}

pub struct SubHandlerTable {
    low: [Option<SubPacketHandler>; 0x100],
    high: HashMap<u16, SubPacketHandler>,
}

impl SubHandlerTable {
    fn new() -> SubHandlerTable {
        SubHandlerTable {
            low: [None; 0x100],
            high: HashMap::new(),
        }
    }

    pub fn register(&mut self, sub_id: u16, ingame: bool, callback: OnPacketReceive) {
        let handler = SubPacketHandler {
            sub_id,
            ingame,
            callback,
        };

        if sub_id < 0x100 {
            self.low[sub_id as usize] = Some(handler);
        } else {
            self.high.insert(sub_id, handler);
        }
    }

    pub fn get(&self, sub_id: u16) -> Option<&SubPacketHandler> {
        if sub_id < 0x100 {
            self.low[sub_id as usize].as_ref()
        } else {
            self.high.get(&sub_id)
        }
    }
}

pub struct PacketHandlers {
    base: [Option<PacketHandler>; 0x100],
    post_6017: [Option<PacketHandler>; 0x100],
    extended: SubHandlerTable,
    encoded: SubHandlerTable,
}

impl PacketHandlers {
    pub fn new() -> PacketHandlers {
        PacketHandlers {
            base: [None; 0x100],
            post_6017: [None; 0x100],
            extended: SubHandlerTable::new(),
            encoded: SubHandlerTable::new(),
        }
    }

    /// Register in the base table; the 6017 table inherits the entry unless
    /// it already carries an override.
    pub fn register(
        &mut self,
        packet_id: u8,
        length: usize,
        ingame: bool,
        callback: OnPacketReceive,
    ) {
        let handler = PacketHandler {
            packet_id,
            length,
            ingame,
            callback,
            throttle: None,
        };

        self.base[packet_id as usize] = Some(handler);

        if self.post_6017[packet_id as usize].is_none() {
            self.post_6017[packet_id as usize] = Some(handler);
        }
    }

    /// Override an opcode for container-grid-lines clients only.
    pub fn register_6017(
        &mut self,
        packet_id: u8,
        length: usize,
        ingame: bool,
        callback: OnPacketReceive,
    ) {
        self.post_6017[packet_id as usize] = Some(PacketHandler {
            packet_id,
            length,
            ingame,
            callback,
            throttle: None,
        });
    }

    pub fn register_extended(&mut self, sub_id: u16, ingame: bool, callback: OnPacketReceive) {
        self.extended.register(sub_id, ingame, callback);
    }

    pub fn register_encoded(&mut self, sub_id: u16, ingame: bool, callback: OnPacketReceive) {
        self.encoded.register(sub_id, ingame, callback);
    }

    /// Attach a throttle to an opcode in both tables.
    pub fn register_throttle(&mut self, packet_id: u8, throttle: ThrottleCallback) {
        if let Some(handler) = self.base[packet_id as usize].as_mut() {
            handler.throttle = Some(throttle);
        }
        if let Some(handler) = self.post_6017[packet_id as usize].as_mut() {
            handler.throttle = Some(throttle);
        }
    }

    pub fn get(&self, packet_id: u8, grid_lines: bool) -> Option<&PacketHandler> {
        if grid_lines {
            self.post_6017[packet_id as usize].as_ref()
        } else {
            self.base[packet_id as usize].as_ref()
        }
    }

    pub fn get_extended(&self, sub_id: u16) -> Option<&SubPacketHandler> {
        self.extended.get(sub_id)
    }

    pub fn get_encoded(&self, sub_id: u16) -> Option<&SubPacketHandler> {
        self.encoded.get(sub_id)
    }
}

impl Default for PacketHandlers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
        _ctx: &mut ServerContext,
        _events: &mut dyn GameEvents,
        _id: NetStateId,
        _reader: &mut PacketReader,
    ) {
    }

    fn other(
        _ctx: &mut ServerContext,
        _events: &mut dyn GameEvents,
        _id: NetStateId,
        _reader: &mut PacketReader,
    ) {
    }

    #[test]
    fn test_base_registration_mirrors_into_6017() {
        let mut handlers = PacketHandlers::new();
        handlers.register(0x73, 2, false, noop);

        assert_eq!(handlers.get(0x73, false).unwrap().length, 2);
        assert_eq!(handlers.get(0x73, true).unwrap().length, 2);
        assert!(handlers.get(0x74, false).is_none());
    }

    #[test]
    fn test_6017_override_wins_for_grid_clients() {
        let mut handlers = PacketHandlers::new();
        handlers.register(0x08, 14, true, noop);
        handlers.register_6017(0x08, 15, true, other);

        assert_eq!(handlers.get(0x08, false).unwrap().length, 14);
        assert_eq!(handlers.get(0x08, true).unwrap().length, 15);
    }

    #[test]
    fn test_sub_tables_split_low_and_high() {
        let mut handlers = PacketHandlers::new();
        handlers.register_extended(0x0B, false, noop);
        handlers.register_extended(0x0102, true, noop);

        assert!(handlers.get_extended(0x0B).is_some());
        assert!(handlers.get_extended(0x0102).unwrap().ingame);
        assert!(handlers.get_extended(0x0C).is_none());
        assert!(handlers.get_extended(0x0101).is_none());
    }

    #[test]
    fn test_throttle_attaches_to_both_tables() {
        fn throttle(_ns: &mut NetState) -> bool {
            false
        }

        let mut handlers = PacketHandlers::new();
        handlers.register(0x02, 7, true, noop);
        handlers.register_throttle(0x02, throttle);

        assert!(handlers.get(0x02, false).unwrap().throttle.is_some());
        assert!(handlers.get(0x02, true).unwrap().throttle.is_some());
    }
}
