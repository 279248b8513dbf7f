// outgoing.rs — server-to-client frame builders
//
// Plain functions keyed by opcode; each fills a Packet and hands it back
// for the caller to send. Byte layouts here are wire-exact and must not
// drift. Frames that never change are compiled once and shared.

use std::sync::{Arc, OnceLock};

use ruo_common::packet::{make_static, Packet, PacketPools};
use ruo_common::serial::Serial;
use ruo_common::version::ProtocolChanges;
use ruo_common::zlib;

use crate::config::GameServerInfo;
use crate::entity::{ItemEntity, MobileEntity};
use crate::events::{CharacterEntry, CityInfo, LoginRejection};
use crate::world::World;

// ============================================================
// Login sequence
// ============================================================

/// 0x82 — account login rejected (2 bytes).
pub fn login_rejected(pools: &PacketPools, reason: LoginRejection) -> Packet {
    let mut p = Packet::new(pools, 0x82, 2);
    p.writer().write_u8(reason as u8);
    p
}

/// 0xA8 — account login accepted: the game server list, 40 bytes per entry.
pub fn account_login_ack(pools: &PacketPools, servers: &[GameServerInfo]) -> Packet {
    let mut p = Packet::new(pools, 0xA8, 0);
    let w = p.writer();

    w.write_u8(0x5D); // system-info flag
    w.write_u16(servers.len() as u16);

    for (index, server) in servers.iter().enumerate() {
        w.write_u16(index as u16);
        w.write_ascii_fixed(&server.name, 32);
        w.write_u8(server.full_percent);
        w.write_u8(server.timezone);
        // The client expects the address in reversed octet order.
        let octets = server.address.octets();
        w.write_u8(octets[3]);
        w.write_u8(octets[2]);
        w.write_u8(octets[1]);
        w.write_u8(octets[0]);
    }

    p
}

/// 0x8C — play-server ack carrying the handoff auth id (11 bytes).
pub fn play_server_ack(pools: &PacketPools, server: &GameServerInfo, auth_id: u32) -> Packet {
    let mut p = Packet::new(pools, 0x8C, 11);
    let w = p.writer();

    w.write(&server.address.octets());
    w.write_u16(server.port);
    w.write_u32(auth_id);
    p
}

/// 0xB9 — supported features: 5 bytes once the extended bit is live,
/// 3 before it.
pub fn supported_features(pools: &PacketPools, changes: ProtocolChanges, features: u32) -> Packet {
    if changes.contains(ProtocolChanges::EXTENDED_SUPPORTED_FEATURES) {
        let mut p = Packet::new(pools, 0xB9, 5);
        p.writer().write_u32(features);
        p
    } else {
        let mut p = Packet::new(pools, 0xB9, 3);
        p.writer().write_u16(features as u16);
        p
    }
}

/// 0xA9 — character list; the new-format variant carries the widened city
/// records and the trailing marker.
pub fn character_list(
    pools: &PacketPools,
    characters: &[CharacterEntry],
    cities: &[CityInfo],
    changes: ProtocolChanges,
    flags: u32,
) -> Packet {
    let new_format = changes.contains(ProtocolChanges::NEW_CHARACTER_LIST);
    let slots = characters.len().max(5);

    let mut p = Packet::new(pools, 0xA9, 0);
    let w = p.writer();

    w.write_u8(slots as u8);
    for i in 0..slots {
        match characters.get(i) {
            Some(entry) => {
                w.write_ascii_fixed(&entry.name, 30);
                w.fill(30);
            }
            None => w.fill(60),
        }
    }

    w.write_u8(cities.len() as u8);

    for city in cities {
        w.write_u8(city.index);

        if new_format {
            w.write_ascii_fixed(&city.city, 32);
            w.write_ascii_fixed(&city.building, 32);
            w.write_i32(0); // x
            w.write_i32(0); // y
            w.write_i32(0); // z
            w.write_i32(0); // map
            w.write_i32(0); // description cliloc
            w.write_i32(0);
        } else {
            w.write_ascii_fixed(&city.city, 31);
            w.write_ascii_fixed(&city.building, 31);
        }
    }

    w.write_u32(flags);

    if new_format {
        w.write_i16(-1);
    }

    p
}

/// 0x1B — login confirm (37 bytes).
pub fn login_confirm(pools: &PacketPools, mobile: &dyn MobileEntity) -> Packet {
    let location = mobile.location();

    let mut p = Packet::new(pools, 0x1B, 37);
    let w = p.writer();

    w.write_u32(mobile.serial().value());
    w.write_u32(0);
    w.write_u16(mobile.body());
    w.write_i16(location.x);
    w.write_i16(location.y);
    w.write_i16(location.z as i16);
    w.write_u8(mobile.direction());
    w.write_u8(0);
    w.write_i32(-1);
    w.write_i32(0);
    w.write_i32(0);
    w.write_u16(0x1800); // map width
    w.write_u16(0x1000); // map height
    w.fill(2);
    p
}

/// 0x55 — login complete (1 byte), shared.
pub fn login_complete(pools: &PacketPools) -> Arc<Packet> {
    static CACHE: OnceLock<Arc<Packet>> = OnceLock::new();
    Arc::clone(CACHE.get_or_init(|| make_static(Packet::new(pools, 0x55, 1), true, pools)))
}

/// 0x73 — ping ack (2 bytes).
pub fn ping_ack(pools: &PacketPools, value: u8) -> Packet {
    let mut p = Packet::new(pools, 0x73, 2);
    p.writer().write_u8(value);
    p
}

// ============================================================
// Movement
// ============================================================

/// 0x22 — movement ack (3 bytes).
pub fn movement_ack(pools: &PacketPools, sequence: u8, notoriety: u8) -> Packet {
    let mut p = Packet::new(pools, 0x22, 3);
    let w = p.writer();
    w.write_u8(sequence);
    w.write_u8(notoriety);
    p
}

/// 0x21 — movement reject, resynchronizing the client (8 bytes).
pub fn movement_rej(pools: &PacketPools, sequence: u8, mobile: &dyn MobileEntity) -> Packet {
    let location = mobile.location();

    let mut p = Packet::new(pools, 0x21, 8);
    let w = p.writer();
    w.write_u8(sequence);
    w.write_u16(location.x as u16);
    w.write_u16(location.y as u16);
    w.write_u8(mobile.direction());
    w.write_i8(location.z);
    p
}

// ============================================================
// Mobiles and items
// ============================================================

/// 0x20 — mobile update (19 bytes).
pub fn mobile_update(pools: &PacketPools, mobile: &dyn MobileEntity) -> Packet {
    let location = mobile.location();

    let mut p = Packet::new(pools, 0x20, 19);
    let w = p.writer();

    w.write_u32(mobile.serial().value());
    w.write_u16(mobile.body());
    w.write_u8(0);
    w.write_u16(mobile.hue());
    w.write_u8(0); // flags
    w.write_u16(location.x as u16);
    w.write_u16(location.y as u16);
    w.write_u16(0);
    w.write_u8(mobile.direction());
    w.write_i8(location.z);
    p
}

/// 0x78 — mobile incoming with equipment. Layers are deduped through a
/// local seen-array handed down the emission, one slot per layer value.
pub fn mobile_incoming(
    pools: &PacketPools,
    world: &World,
    changes: ProtocolChanges,
    mobile: &dyn MobileEntity,
) -> Packet {
    let new_format = changes.contains(ProtocolChanges::NEW_MOBILE_INCOMING);
    let location = mobile.location();
    let mut seen_layers = [false; 0x100];

    let mut p = Packet::new(pools, 0x78, 0);
    let w = p.writer();

    w.write_u32(mobile.serial().value());
    w.write_u16(mobile.body());
    w.write_u16(location.x as u16);
    w.write_u16(location.y as u16);
    w.write_i8(location.z);
    w.write_u8(mobile.direction());
    w.write_u16(mobile.hue());
    w.write_u8(0); // flags
    w.write_u8(mobile.notoriety());

    for serial in mobile.items() {
        let Some(item) = world.find_item(*serial) else {
            continue;
        };

        let layer = item.layer();
        if seen_layers[layer as usize] {
            continue;
        }
        seen_layers[layer as usize] = true;

        let hue = item.hue();

        if new_format {
            w.write_u32(item.serial().value());
            w.write_u16(item.item_id());
            w.write_u8(layer);
            w.write_u16(hue);
        } else if hue == 0 {
            w.write_u32(item.serial().value());
            w.write_u16(item.item_id());
            w.write_u8(layer);
        } else {
            w.write_u32(item.serial().value());
            w.write_u16(item.item_id() | 0x8000);
            w.write_u8(layer);
            w.write_u16(hue);
        }
    }

    w.write_u32(0); // terminator
    p
}

/// 0x2E — equip update (15 bytes).
pub fn equip_update(pools: &PacketPools, item: &dyn ItemEntity) -> Packet {
    let mut p = Packet::new(pools, 0x2E, 15);
    let w = p.writer();

    w.write_u32(item.serial().value());
    w.write_u16(item.item_id());
    w.write_u8(0);
    w.write_u8(item.layer());
    w.write_u32(item.parent().value());
    w.write_u16(item.hue());
    p
}

/// 0x3C — container content; grid-lines clients get the slot byte.
pub fn container_content(
    pools: &PacketPools,
    world: &World,
    container: Serial,
    grid_lines: bool,
) -> Packet {
    let children: Vec<&dyn ItemEntity> = world
        .items()
        .values()
        .filter(|item| item.parent() == container)
        .map(|item| item.as_ref())
        .collect();

    let mut p = Packet::new(pools, 0x3C, 0);
    let w = p.writer();

    w.write_u16(children.len() as u16);

    for item in children {
        let location = item.location();

        w.write_u32(item.serial().value());
        w.write_u16(item.item_id());
        w.write_u8(0);
        w.write_u16(item.amount());
        w.write_u16(location.x as u16);
        w.write_u16(location.y as u16);
        if grid_lines {
            w.write_u8(item.grid_index());
        }
        w.write_u32(container.value());
        w.write_u16(item.hue());
    }

    p
}

/// 0xF3 — world item: 24 bytes for Stygian Abyss clients, 26 with the
/// High Seas trailer.
pub fn world_item(pools: &PacketPools, item: &dyn ItemEntity, changes: ProtocolChanges) -> Packet {
    let high_seas = changes.contains(ProtocolChanges::HIGH_SEAS);
    let location = item.location();

    let mut p = Packet::new(pools, 0xF3, if high_seas { 26 } else { 24 });
    let w = p.writer();

    w.write_u16(0x0001);
    w.write_u8(0x00); // data type: item
    w.write_u32(item.serial().value());
    w.write_u16(item.item_id());
    w.write_u8(0); // facing
    w.write_u16(item.amount());
    w.write_u16(item.amount());
    w.write_u16(location.x as u16);
    w.write_u16(location.y as u16);
    w.write_i8(location.z);
    w.write_u8(0); // light level
    w.write_u16(item.hue());
    w.write_u8(0); // flags

    if high_seas {
        w.write_u16(0);
    }

    p
}

// ============================================================
// Messages
// ============================================================

/// 0x1C — ASCII message.
pub fn ascii_message(
    pools: &PacketPools,
    serial: Serial,
    graphic: u16,
    msg_type: u8,
    hue: u16,
    font: u16,
    name: &str,
    text: &str,
) -> Packet {
    let mut p = Packet::new(pools, 0x1C, 0);
    let w = p.writer();

    w.write_u32(serial.value());
    w.write_u16(graphic);
    w.write_u8(msg_type);
    w.write_u16(hue);
    w.write_u16(font);
    w.write_ascii_fixed(name, 30);
    w.write_ascii_null(text);
    p
}

/// 0xAE — unicode message.
pub fn unicode_message(
    pools: &PacketPools,
    serial: Serial,
    graphic: u16,
    msg_type: u8,
    hue: u16,
    font: u16,
    language: &str,
    name: &str,
    text: &str,
) -> Packet {
    let mut p = Packet::new(pools, 0xAE, 0);
    let w = p.writer();

    w.write_u32(serial.value());
    w.write_u16(graphic);
    w.write_u8(msg_type);
    w.write_u16(hue);
    w.write_u16(font);
    w.write_ascii_fixed(language, 4);
    w.write_ascii_fixed(name, 30);
    w.write_big_uni_null(text);
    p
}

/// Damage notification: the dedicated 0x0B once the protocol supports it,
/// the extended 0xBF/0x22 form before that.
pub fn damage(pools: &PacketPools, mobile: Serial, amount: u16, changes: ProtocolChanges) -> Packet {
    if changes.contains(ProtocolChanges::DAMAGE_PACKET) {
        let mut p = Packet::new(pools, 0x0B, 7);
        let w = p.writer();
        w.write_u32(mobile.value());
        w.write_u16(amount);
        p
    } else {
        let mut p = Packet::new(pools, 0xBF, 0);
        let w = p.writer();
        w.write_u16(0x22);
        w.write_u8(1);
        w.write_u32(mobile.value());
        w.write_u8(amount.min(0xFF) as u8);
        p
    }
}

// ============================================================
// Secure trading
// ============================================================

/// 0x6F — secure trade container/update/cancel frame.
pub fn secure_trade(
    pools: &PacketPools,
    action: u8,
    first: u32,
    second: u32,
    third: u32,
    name: Option<&str>,
) -> Packet {
    let mut p = Packet::new(pools, 0x6F, 0);
    let w = p.writer();

    w.write_u8(action);
    w.write_u32(first);
    w.write_u32(second);
    w.write_u32(third);

    match name {
        Some(name) => {
            w.write_bool(true);
            w.write_ascii_fixed(name, 30);
        }
        None => w.write_bool(false),
    }

    p
}

/// 0x6F action 3 — both sides' gold and platinum, after an update.
pub fn update_secure_trade(pools: &PacketPools, container: u32, gold: u32, plat: u32) -> Packet {
    secure_trade(pools, 3, container, gold, plat, None)
}

// ============================================================
// Gumps
// ============================================================

/// 0xB0 — uncompressed gump display.
pub fn display_gump(
    pools: &PacketPools,
    serial: u32,
    type_id: u32,
    x: i32,
    y: i32,
    layout: &str,
    texts: &[String],
) -> Packet {
    let mut p = Packet::new(pools, 0xB0, 0);
    let w = p.writer();

    w.write_u32(serial);
    w.write_u32(type_id);
    w.write_i32(x);
    w.write_i32(y);

    w.write_u16(layout.len() as u16 + 1);
    w.write_ascii_null(layout);

    w.write_u16(texts.len() as u16);
    for text in texts {
        let units: Vec<u16> = text.encode_utf16().collect();
        w.write_u16(units.len() as u16);
        for unit in units {
            w.write_u16(unit);
        }
    }

    p
}

/// 0xDD — packed gump display; layout and text block travel as zlib
/// streams with their unpacked lengths.
pub fn display_gump_packed(
    pools: &PacketPools,
    serial: u32,
    type_id: u32,
    x: i32,
    y: i32,
    layout: &str,
    texts: &[String],
) -> Result<Packet, zlib::ZLibError> {
    let mut p = Packet::new(pools, 0xDD, 0);
    let w = p.writer();

    w.write_u32(serial);
    w.write_u32(type_id);
    w.write_i32(x);
    w.write_i32(y);

    let mut layout_raw = layout.as_bytes().to_vec();
    layout_raw.push(0);
    let packed = zlib::pack(&layout_raw)?;
    w.write_u32(packed.len() as u32 + 4);
    w.write_u32(layout_raw.len() as u32);
    w.write(&packed);

    let mut text_raw = Vec::new();
    for text in texts {
        let units: Vec<u16> = text.encode_utf16().collect();
        text_raw.extend_from_slice(&(units.len() as u16).to_be_bytes());
        for unit in units {
            text_raw.extend_from_slice(&unit.to_be_bytes());
        }
    }

    w.write_u32(texts.len() as u32);
    let packed = zlib::pack(&text_raw)?;
    w.write_u32(packed.len() as u32 + 4);
    w.write_u32(text_raw.len() as u32);
    w.write(&packed);

    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pools() -> PacketPools {
        PacketPools::new()
    }

    fn compiled(mut p: Packet, pools: &PacketPools) -> Vec<u8> {
        let bytes = p.compile(false, pools).to_vec();
        p.release(pools);
        bytes
    }

    fn server_info() -> GameServerInfo {
        GameServerInfo {
            name: "Test Shard".into(),
            address: Ipv4Addr::new(192, 168, 0, 5),
            port: 2593,
            timezone: 0,
            full_percent: 1,
        }
    }

    #[test]
    fn test_login_rejected_layout() {
        let pools = pools();
        let bytes = compiled(login_rejected(&pools, LoginRejection::BadPassword), &pools);
        assert_eq!(bytes, vec![0x82, 0x03]);
    }

    #[test]
    fn test_account_login_ack_record_width() {
        let pools = pools();
        let servers = [server_info(), server_info()];
        let bytes = compiled(account_login_ack(&pools, &servers), &pools);

        // cmd + len + flag + count + 2 records of 40.
        assert_eq!(bytes.len(), 1 + 2 + 1 + 2 + 2 * 40);
        assert_eq!(bytes[0], 0xA8);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, bytes.len());
        // Reversed IP octets at the record tail.
        assert_eq!(&bytes[6 + 36..6 + 40], &[5, 0, 168, 192]);
    }

    #[test]
    fn test_play_server_ack_layout() {
        let pools = pools();
        let bytes = compiled(play_server_ack(&pools, &server_info(), 0xCAFEBABE), &pools);
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[0], 0x8C);
        assert_eq!(&bytes[1..5], &[192, 168, 0, 5]);
        assert_eq!(u16::from_be_bytes([bytes[5], bytes[6]]), 2593);
        assert_eq!(
            u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
            0xCAFEBABE
        );
    }

    #[test]
    fn test_supported_features_variants() {
        let pools = pools();

        let old = compiled(
            supported_features(&pools, ProtocolChanges::VERSION_6000, 0x92DB),
            &pools,
        );
        assert_eq!(old.len(), 3);

        let new = compiled(
            supported_features(&pools, ProtocolChanges::VERSION_60142, 0x92DB),
            &pools,
        );
        assert_eq!(new.len(), 5);
        assert_eq!(new[0], 0xB9);
    }

    #[test]
    fn test_character_list_variants() {
        let pools = pools();
        let characters = [CharacterEntry { name: "Aria".into() }];
        let cities = [CityInfo {
            index: 0,
            city: "Britain".into(),
            building: "Castle".into(),
        }];

        let old = compiled(
            character_list(&pools, &characters, &cities, ProtocolChanges::VERSION_7000, 0),
            &pools,
        );
        // cmd + len + slots(1 + 5*60) + cities(1 + 63) + flags(4)
        assert_eq!(old.len(), 3 + 1 + 300 + 1 + 63 + 4);

        let new = compiled(
            character_list(&pools, &characters, &cities, ProtocolChanges::VERSION_70130, 0),
            &pools,
        );
        // widened city record (89) plus the trailing marker.
        assert_eq!(new.len(), 3 + 1 + 300 + 1 + 89 + 4 + 2);
    }

    #[test]
    fn test_movement_ack_layout() {
        let pools = pools();
        let bytes = compiled(movement_ack(&pools, 5, 1), &pools);
        assert_eq!(bytes, vec![0x22, 5, 1]);
    }

    #[test]
    fn test_world_item_lengths() {
        use crate::entity::Item;
        let pools = pools();
        let mut item = Item::new(Serial(0x4000_0010));
        item.item_id = 0x0EED;
        item.amount = 3;

        let sa = compiled(world_item(&pools, &item, ProtocolChanges::VERSION_7000), &pools);
        assert_eq!(sa.len(), 24);

        let hs = compiled(world_item(&pools, &item, ProtocolChanges::VERSION_7090), &pools);
        assert_eq!(hs.len(), 26);
        assert_eq!(hs[0], 0xF3);
    }

    #[test]
    fn test_mobile_incoming_dedupes_layers() {
        use crate::entity::{Item, Mobile, TypeRegistry};
        use crate::world::World;

        let pools = pools();
        let mut world = World::new(TypeRegistry::with_defaults());

        let mobile_serial = world.next_mobile_serial();
        let mut mobile = Mobile::new(mobile_serial);
        mobile.name = "Dup".into();
        world.add_mobile(Box::new(mobile));

        for hue in [0u16, 5u16] {
            let serial = world.next_item_serial();
            let mut item = Item::new(serial);
            item.item_id = 0x1F03;
            item.layer = 0x16; // same layer twice
            item.hue = hue;
            item.parent = mobile_serial;
            world.add_item(Box::new(item));
            world
                .find_mobile_mut(mobile_serial)
                .unwrap()
                .add_item(serial);
        }

        let mobile = world.find_mobile(mobile_serial).unwrap();
        let bytes = compiled(
            mobile_incoming(&pools, &world, ProtocolChanges::VERSION_704565, mobile),
            &pools,
        );

        // Frame header (3) + mobile header (16) + exactly one equip record
        // (9, new format) + terminator (4).
        assert_eq!(bytes.len(), 3 + 16 + 9 + 4);
    }

    #[test]
    fn test_equip_update_length() {
        use crate::entity::Item;
        let pools = pools();
        let item = Item::new(Serial(0x4000_0099));
        let bytes = compiled(equip_update(&pools, &item), &pools);
        assert_eq!(bytes.len(), 15);
        assert_eq!(bytes[0], 0x2E);
    }

    #[test]
    fn test_damage_variants() {
        let pools = pools();

        let new = compiled(
            damage(&pools, Serial(0x77), 30, ProtocolChanges::VERSION_704565),
            &pools,
        );
        assert_eq!(new.len(), 7);
        assert_eq!(new[0], 0x0B);

        let old = compiled(damage(&pools, Serial(0x77), 30, ProtocolChanges::empty()), &pools);
        assert_eq!(old[0], 0xBF);
        assert_eq!(u16::from_be_bytes([old[3], old[4]]), 0x22);
    }

    #[test]
    fn test_packed_gump_unpacks_to_layout() {
        let pools = pools();
        let layout = "{ page 0 }{ text 10 10 0 0 }";
        let texts = vec!["hello".to_string()];

        let p = display_gump_packed(&pools, 1, 2, 0, 0, layout, &texts).unwrap();
        let bytes = compiled(p, &pools);
        assert_eq!(bytes[0], 0xDD);

        // Unpack the layout block back out of the frame.
        let packed_len = u32::from_be_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]) as usize - 4;
        let unpacked_len = u32::from_be_bytes([bytes[23], bytes[24], bytes[25], bytes[26]]) as usize;
        let unpacked = zlib::unpack(&bytes[27..27 + packed_len], unpacked_len).unwrap();
        assert_eq!(&unpacked[..layout.len()], layout.as_bytes());
    }

    #[test]
    fn test_login_complete_static_is_shared() {
        let pools = pools();
        let a = login_complete(&pools);
        let b = login_complete(&pools);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.compiled().is_some());
    }
}
