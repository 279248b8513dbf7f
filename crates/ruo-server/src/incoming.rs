// incoming.rs — client-to-server packet handlers
//
// Every handler owns the bounds checking for its payload: a malformed
// frame is either dropped silently, logged and dropped, or ends the
// connection — it never reaches the event sink half-parsed. The reader
// arrives positioned past the opcode (and past the length word for
// variable-length packets).

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use ruo_common::packet_io::PacketReader;
use ruo_common::serial::Serial;
use ruo_common::version::{ClientFlags, ClientVersion};

use crate::events::{
    BuyItemRequest, CharacterCreateArgs, GameEvents, GumpResponse, SpeechKind, TargetResult,
};
use crate::handlers::PacketHandlers;
use crate::netstate::{ConnectionStage, NetState, NetStateId, LOGIN_TIMER_INTERVAL};
use crate::outgoing;
use crate::entity::Point3D;
use crate::server::ServerContext;

/// Text entries in a gump response are capped at this many UTF-16 units.
pub const GUMP_TEXT_CAP: usize = 239;

/// A vendor purchase list may not exceed this many rows.
pub const VENDOR_BUY_CAP: usize = 100;

/// Minimum delay between accepted movement requests.
const MOVE_DELAY: Duration = Duration::from_millis(100);

/// Wire every stock opcode into the tables.
pub fn register_defaults(handlers: &mut PacketHandlers) {
    handlers.register(0x00, 104, false, create_character);
    handlers.register(0x01, 5, false, disconnect_notification);
    handlers.register(0x02, 7, true, movement_request);
    handlers.register(0x03, 0, true, ascii_speech);
    handlers.register(0x06, 5, true, use_request);
    handlers.register(0x07, 7, true, lift_request);
    handlers.register(0x08, 14, true, drop_request);
    handlers.register_6017(0x08, 15, true, drop_request_6017);
    handlers.register(0x22, 3, true, resynchronize);
    handlers.register(0x3B, 0, true, vendor_buy_reply);
    handlers.register(0x5D, 73, false, play_character);
    handlers.register(0x6C, 19, true, target_response);
    handlers.register(0x6F, 0, true, secure_trade);
    handlers.register(0x73, 2, false, ping);
    handlers.register(0x80, 62, false, account_login);
    handlers.register(0x83, 39, false, delete_character);
    handlers.register(0x91, 65, false, game_login);
    handlers.register(0xA0, 3, false, play_server);
    handlers.register(0xA4, 149, false, system_info);
    handlers.register(0xAD, 0, true, unicode_speech);
    handlers.register(0xB1, 0, true, gump_response);
    handlers.register(0xBD, 0, false, client_version);
    handlers.register(0xBF, 0, false, extended_command);
    handlers.register(0xCF, 0, false, account_login);
    handlers.register(0xD7, 0, true, encoded_command);
    handlers.register(0xEF, 21, false, login_server_seed);
    handlers.register(0xF0, 0, false, freeshard_poll);
    handlers.register(0xF1, 0, false, freeshard_poll);
    handlers.register(0xF8, 106, false, create_character);

    handlers.register_throttle(0x02, movement_throttle);

    handlers.register_extended(0x05, false, ext_screen_size);
    handlers.register_extended(0x0B, false, ext_client_language);
    handlers.register_encoded(0x28, true, enc_guild_gump_request);
    handlers.register_encoded(0x32, true, enc_quest_gump_request);
}

// ============================================================
// Pre-game: login chain
// ============================================================

pub fn account_login(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let username = reader.read_ascii_fixed_safe(30);
    let password = reader.read_ascii_fixed_safe(30);
    let _next_login_key = reader.read_u8();

    match events.account_login(&username, &password) {
        Ok(()) => {
            let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
                return;
            };
            ns.sent_first_packet = true;
            ns.account = Some(username);
            ns.stage = ConnectionStage::Authenticated;

            let ack = outgoing::account_login_ack(&ctx.packet_pools, &ctx.config.servers);
            ctx.send_to(id, ack);
        }
        Err(reason) => {
            info!("Login: rejected '{}' ({:?})", username, reason);
            let reject = outgoing::login_rejected(&ctx.packet_pools, reason);
            ctx.send_to(id, reject);
            ctx.dispose_state(id, true);
        }
    }
}

pub fn play_server(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let index = reader.read_u16() as usize;

    let Some(server) = ctx.config.servers.get(index).cloned() else {
        warn!("Login: bad server index {}", index);
        ctx.dispose_state(id, false);
        return;
    };

    let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
        return;
    };

    let auth_id = ctx.auth_window.register(ns.version);
    ns.auth_id = auth_id;
    // The client reconnects to the game port, so the next stream restarts
    // the first-packet guard.
    ns.sent_first_packet = false;
    ns.stage = ConnectionStage::ServerListed;

    let ack = outgoing::play_server_ack(&ctx.packet_pools, &server, auth_id);
    ctx.send_to(id, ack);
}

pub fn game_login(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let auth_id = reader.read_u32();
    let username = reader.read_ascii_fixed_safe(30);
    let password = reader.read_ascii_fixed_safe(30);

    let Some(entry) = ctx.auth_window.take(auth_id) else {
        warn!("Login: stale or forged auth id 0x{:08X}", auth_id);
        ctx.dispose_state(id, false);
        return;
    };

    match events.game_login(&username, &password) {
        Ok(result) => {
            let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
                return;
            };
            ns.auth_id = auth_id;
            ns.sent_first_packet = true;
            ns.compression_enabled = true;
            ns.account = Some(username);
            ns.stage = ConnectionStage::GameAuthenticated;

            // The handoff carries the version negotiated at the login
            // stage; the fresh stream has not told us yet.
            if ns.version.is_none() {
                if let Some(version) = entry.version {
                    ns.set_version(version);
                }
            }
            let changes = ns.protocol_changes;

            let features = outgoing::supported_features(
                &ctx.packet_pools,
                changes,
                ctx.config.supported_features,
            );
            let list = outgoing::character_list(
                &ctx.packet_pools,
                &result.characters,
                &result.cities,
                changes,
                ctx.config.character_list_flags,
            );
            ctx.send_to(id, features);
            ctx.send_to(id, list);
        }
        Err(reason) => {
            info!("Login: game login rejected '{}' ({:?})", username, reason);
            ctx.dispose_state(id, false);
        }
    }
}

pub fn login_server_seed(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    // The first 0xEF is consumed by the seed ingest; a repeat can only
    // refresh a version we never learned.
    let _seed = reader.read_u32();
    let major = reader.read_u32();
    let minor = reader.read_u32();
    let revision = reader.read_u32();
    let patch = reader.read_u32();

    if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
        if ns.version.is_none() {
            ns.set_version(ClientVersion::new(major, minor, revision, patch));
        }
    }
}

pub fn client_version(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let text = reader.read_ascii_null_safe();

    if let Ok(version) = text.parse::<ClientVersion>() {
        if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
            if ns.version.is_none() {
                ns.set_version(version);
            }
        }
    }
}

// ============================================================
// Characters
// ============================================================

pub fn create_character(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    reader.read_i32(); // 0xEDEDEDED
    reader.read_i32();
    reader.read_u8();
    let name = reader.read_ascii_fixed_safe(30);
    reader.read_u16();
    let client_flags = reader.read_u32();
    reader.read_u32();
    reader.read_u32();
    let _profession = reader.read_u8();
    reader.read_bytes(15);
    let gender = reader.read_u8();
    let _strength = reader.read_u8();
    let _dexterity = reader.read_u8();
    let _intelligence = reader.read_u8();
    reader.read_bytes(6); // starting skills
    let hue = reader.read_u16();
    reader.read_u32(); // hair
    reader.read_u32(); // beard
    let city_index = reader.read_u8();

    if name.trim().is_empty() {
        warn!("Login: empty character name");
        ctx.dispose_state(id, false);
        return;
    }

    if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
        ns.flags = ClientFlags::from_bits_truncate(client_flags);
    }

    let female = gender & 1 == 1;
    let args = CharacterCreateArgs {
        name,
        female,
        body: if female { 401 } else { 400 },
        hue,
        city_index,
    };

    match events.create_character(&mut ctx.world, &args) {
        Some(serial) => attach_mobile(ctx, id, serial),
        None => {
            info!("Login: character creation refused for '{}'", args.name);
            ctx.dispose_state(id, true);
        }
    }
}

pub fn play_character(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    reader.read_i32(); // 0xEDEDEDED
    let _name = reader.read_ascii_fixed_safe(30);
    reader.read_bytes(2);
    let client_flags = reader.read_u32();
    reader.read_bytes(24);
    let slot = reader.read_u32();
    let _client_ip = reader.read_u32();

    if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
        ns.flags = ClientFlags::from_bits_truncate(client_flags);
    }

    let account = ctx
        .netstates
        .get(id)
        .and_then(Option::as_ref)
        .and_then(|ns| ns.account.clone())
        .unwrap_or_default();

    match events.play_character(&mut ctx.world, &account, slot) {
        Some(serial) => attach_mobile(ctx, id, serial),
        None => {
            info!("Login: character slot {} refused for '{}'", slot, account);
            ctx.dispose_state(id, false);
        }
    }
}

pub fn delete_character(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let _password = reader.read_ascii_fixed_safe(30);
    let index = reader.read_u32();
    let _client_ip = reader.read_u32();

    let account = ctx
        .netstates
        .get(id)
        .and_then(Option::as_ref)
        .and_then(|ns| ns.account.clone())
        .unwrap_or_default();

    if !events.delete_character(&mut ctx.world, &account, index) {
        debug!("Login: delete of slot {} refused for '{}'", index, account);
    }
}

/// Attach the chosen mobile and arm the login timer; DoLogin fires once
/// the client version is known.
fn attach_mobile(ctx: &mut ServerContext, id: NetStateId, serial: Serial) {
    let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
        return;
    };

    ns.mobile = Some(serial);
    ns.block_all_packets = true;
    ns.stage = ConnectionStage::CharacterSelected;
    ns.login_timer = Some(Instant::now() + LOGIN_TIMER_INTERVAL);
}

// ============================================================
// Movement
// ============================================================

pub fn movement_throttle(ns: &mut NetState) -> bool {
    let now = Instant::now();

    if now < ns.next_move_time {
        return false;
    }

    ns.next_move_time = now + MOVE_DELAY;
    true
}

pub fn movement_request(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let direction = reader.read_u8();
    let sequence = reader.read_u8();
    let _fastwalk_key = reader.read_u32();

    let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
        return;
    };
    let Some(serial) = ns.mobile else {
        return;
    };

    let expected = ns.sequence;
    if sequence != expected {
        ns.sequence = 0;
        if let Some(mobile) = ctx.world.find_mobile(serial) {
            let rej = outgoing::movement_rej(&ctx.packet_pools, sequence, mobile);
            ctx.send_to(id, rej);
        }
        return;
    }

    if events.movement(&mut ctx.world, serial, direction) {
        let notoriety = ctx
            .world
            .find_mobile(serial)
            .map(|m| m.notoriety())
            .unwrap_or(1);

        if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
            ns.advance_sequence();
        }

        let ack = outgoing::movement_ack(&ctx.packet_pools, sequence, notoriety);
        ctx.send_to(id, ack);
    } else if let Some(mobile) = ctx.world.find_mobile(serial) {
        let rej = outgoing::movement_rej(&ctx.packet_pools, sequence, mobile);
        if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
            ns.sequence = 0;
        }
        ctx.send_to(id, rej);
    }
}

pub fn resynchronize(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    reader.read_u8(); // echoed sequence
    reader.read_u8();

    let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
        return;
    };
    ns.sequence = 0;

    if let Some(serial) = ns.mobile {
        if let Some(mobile) = ctx.world.find_mobile(serial) {
            let update = outgoing::mobile_update(&ctx.packet_pools, mobile);
            ctx.send_to(id, update);
        }
    }
}

// ============================================================
// Speech
// ============================================================

fn speech_kind(raw: u8) -> SpeechKind {
    match raw & 0x0F {
        0x02 => SpeechKind::Emote,
        0x08 => SpeechKind::Whisper,
        0x09 => SpeechKind::Yell,
        _ => SpeechKind::Regular,
    }
}

pub fn ascii_speech(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let kind = reader.read_u8();
    let hue = reader.read_u16();
    let _font = reader.read_u16();
    let text = reader.read_ascii_null_safe();

    let Some(serial) = ctx.state(id).and_then(|ns| ns.mobile) else {
        return;
    };

    events.speech(&mut ctx.world, serial, speech_kind(kind), hue, &text, &[]);
}

pub fn unicode_speech(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let kind_raw = reader.read_u8();
    let hue = reader.read_u16();
    let _font = reader.read_u16();
    let _language = reader.read_ascii_fixed(4);

    let mut keywords: Vec<u16> = Vec::new();
    let text;

    if kind_raw & 0xC0 != 0 {
        // Keyword list: a 12-bit count, then 12-bit ids packed nibble-tight.
        let value = reader.read_u16();
        let count = ((value & 0xFFF0) >> 4) as usize;
        let mut hold = (value & 0xF) as u32;

        if count > 50 {
            ctx.dispose_state(id, false);
            return;
        }

        for i in 0..count {
            if i & 1 == 0 {
                hold <<= 8;
                hold |= reader.read_u8() as u32;
                keywords.push(hold as u16);
                hold = 0;
            } else {
                let value = reader.read_u16();
                keywords.push(((value & 0xFFF0) >> 4) as u16);
                hold = (value & 0xF) as u32;
            }
        }

        // Keyword speech carries UTF-8 text.
        let mut raw = Vec::new();
        while reader.remaining() > 0 {
            let byte = reader.read_u8();
            if byte == 0 {
                break;
            }
            raw.push(byte);
        }
        text = String::from_utf8_lossy(&raw)
            .chars()
            .filter(|&c| c >= ' ')
            .collect();
    } else {
        text = reader.read_unicode_null_safe();
    }

    let Some(serial) = ctx.state(id).and_then(|ns| ns.mobile) else {
        return;
    };

    events.speech(
        &mut ctx.world,
        serial,
        speech_kind(kind_raw & 0x3F),
        hue,
        &text,
        &keywords,
    );
}

// ============================================================
// Targeting
// ============================================================

pub fn target_response(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let _target_type = reader.read_u8();
    let target_id = reader.read_u32();
    let flags = reader.read_u8();
    let targeted = reader.read_u32();
    let x = reader.read_u16() as i16;
    let y = reader.read_u16() as i16;
    let z = reader.read_i16() as i8;
    let graphic = reader.read_u16();

    let Some(serial) = ctx.state(id).and_then(|ns| ns.mobile) else {
        return;
    };

    // Cancelled cursor.
    if flags == 3 {
        events.target_response(&mut ctx.world, serial, None);
        return;
    }

    let target_serial = Serial(targeted);

    if target_serial.is_valid() {
        let exists = if target_serial.is_item() {
            ctx.world.find_item(target_serial).is_some()
        } else {
            ctx.world.find_mobile(target_serial).is_some()
        };

        if !exists {
            warn!("Client: target of nonexistent entity {}", target_serial);
            ctx.dispose_state(id, false);
            return;
        }
    }

    events.target_response(
        &mut ctx.world,
        serial,
        Some(TargetResult {
            target_id,
            targeted: target_serial,
            location: Point3D::new(x, y, z),
            graphic,
        }),
    );
}

// ============================================================
// Gumps
// ============================================================

pub fn gump_response(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let serial = reader.read_u32();
    let type_id = reader.read_u32();
    let button_id = reader.read_u32();

    let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) else {
        return;
    };

    // A response for a gump we never sent (or already handled) is stale.
    if ns.remove_gump(serial, type_id).is_none() {
        debug!("Client: {}: stale gump response 0x{:08X}", ns.address, serial);
        return;
    }

    let switch_count = reader.read_u32() as usize;
    if switch_count > reader.remaining() / 4 {
        ctx.dispose_state(id, false);
        return;
    }

    let switches: Vec<u32> = (0..switch_count).map(|_| reader.read_u32()).collect();

    let text_count = reader.read_u32() as usize;
    if text_count > reader.remaining() / 4 {
        ctx.dispose_state(id, false);
        return;
    }

    let mut text_entries = Vec::with_capacity(text_count);
    for _ in 0..text_count {
        let entry_id = reader.read_u16();
        let length = reader.read_u16() as usize;

        if length > GUMP_TEXT_CAP {
            warn!("Client: gump text entry of {} units, disconnecting", length);
            ctx.dispose_state(id, false);
            return;
        }

        let text = reader.read_unicode_fixed_safe(length);
        text_entries.push((entry_id, text));
    }

    let Some(mobile) = ctx.state(id).and_then(|ns| ns.mobile) else {
        return;
    };

    events.gump_response(
        &mut ctx.world,
        mobile,
        &GumpResponse {
            serial: Serial(serial),
            type_id,
            button_id,
            switches,
            text_entries,
        },
    );
}

// ============================================================
// Vendor buy
// ============================================================

pub fn vendor_buy_reply(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let vendor = Serial(reader.read_u32());
    let flag = reader.read_u8();

    if flag != 0x02 {
        return; // list cancelled
    }

    let remaining = reader.remaining();
    if remaining % 7 != 0 {
        warn!("Client: vendor buy list with ragged size {}", remaining);
        ctx.dispose_state(id, false);
        return;
    }

    let count = remaining / 7;
    if count > VENDOR_BUY_CAP {
        warn!("Client: vendor buy list of {} entries", count);
        ctx.dispose_state(id, false);
        return;
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let _layer = reader.read_u8();
        let serial = Serial(reader.read_u32());
        let amount = reader.read_u16();
        items.push(BuyItemRequest { serial, amount });
    }

    let Some(buyer) = ctx.state(id).and_then(|ns| ns.mobile) else {
        return;
    };

    if !events.vendor_buy(&mut ctx.world, buyer, vendor, &items) {
        debug!("vendor buy refused for {}", buyer);
    }
}

// ============================================================
// Secure trading
// ============================================================

pub fn secure_trade(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let action = reader.read_u8();
    let container = reader.read_u32();

    let Some(trade) = ctx.trades.get_mut(&container) else {
        debug!("Client: trade action {} on unknown container", action);
        return;
    };
    let Some(side) = trade.side_of(id) else {
        warn!("Client: trade action from a non-party connection");
        ctx.dispose_state(id, false);
        return;
    };

    match action {
        1 => {
            // Cancel tears the trade down for both parties.
            let trade = ctx.trades.remove(&container).unwrap();

            for party in trade.parties {
                if let Some(ns) = ctx.netstates.get_mut(party).and_then(Option::as_mut) {
                    ns.trades.retain(|&t| t != container);
                }

                let cancel = outgoing::secure_trade(&ctx.packet_pools, 1, container, 0, 0, None);
                ctx.send_to(party, cancel);
            }
        }
        2 => {
            let accepted = reader.read_u32() != 0;
            trade.accepted[side] = accepted;
            let parties = trade.parties;

            for party in parties {
                let check =
                    outgoing::secure_trade(&ctx.packet_pools, 2, container, accepted as u32, 0, None);
                ctx.send_to(party, check);
            }
        }
        3 => {
            let gold = reader.read_u32();
            let plat = reader.read_u32();

            // Both sides observe one coherent update.
            trade.gold[side] = gold;
            trade.plat[side] = plat;
            let parties = trade.parties;

            for party in parties {
                let update = outgoing::update_secure_trade(&ctx.packet_pools, container, gold, plat);
                ctx.send_to(party, update);
            }
        }
        _ => {
            debug!("Client: unknown trade action {}", action);
        }
    }
}

// ============================================================
// Extended and encoded dispatch
// ============================================================

pub fn extended_command(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let sub_id = reader.read_u16();

    let Some(handler) = ctx.handlers.get_extended(sub_id).copied() else {
        debug!("Client: unhandled extended 0xBF/0x{:02X}", sub_id);
        return;
    };

    if handler.ingame && !has_live_mobile(ctx, id) {
        ctx.dispose_state(id, false);
        return;
    }

    (handler.callback)(ctx, events, id, reader);
}

pub fn encoded_command(
    ctx: &mut ServerContext,
    events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let _player = reader.read_u32();
    let sub_id = reader.read_u16();

    let Some(handler) = ctx.handlers.get_encoded(sub_id).copied() else {
        debug!("Client: unhandled encoded 0xD7/0x{:02X}", sub_id);
        return;
    };

    if handler.ingame && !has_live_mobile(ctx, id) {
        ctx.dispose_state(id, false);
        return;
    }

    (handler.callback)(ctx, events, id, reader);
}

fn has_live_mobile(ctx: &ServerContext, id: NetStateId) -> bool {
    ctx.state(id)
        .and_then(|ns| ns.mobile)
        .map(|serial| ctx.world.find_mobile(serial).is_some())
        .unwrap_or(false)
}

pub fn ext_screen_size(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    reader: &mut PacketReader,
) {
    reader.read_u16();
    let width = reader.read_u16();
    let height = reader.read_u16();
    debug!("Client: screen size {}x{}", width, height);
}

pub fn ext_client_language(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let language = reader.read_ascii_fixed(3);

    if let Some(ns) = ctx.netstates.get_mut(id).and_then(Option::as_mut) {
        ns.language = language;
    }
}

pub fn enc_guild_gump_request(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    _reader: &mut PacketReader,
) {
    debug!("Client: {}: guild gump request", id);
}

pub fn enc_quest_gump_request(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    _reader: &mut PacketReader,
) {
    debug!("Client: {}: quest gump request", id);
}

// ============================================================
// Miscellaneous
// ============================================================

pub fn ping(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    reader: &mut PacketReader,
) {
    let value = reader.read_u8();
    let ack = outgoing::ping_ack(&ctx.packet_pools, value);
    ctx.send_to(id, ack);
}

pub fn system_info(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    _reader: &mut PacketReader,
) {
    // 149 bytes of hardware survey; nothing the engine wants.
}

pub fn disconnect_notification(
    ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    id: NetStateId,
    _reader: &mut PacketReader,
) {
    ctx.dispose_state(id, true);
}

pub fn freeshard_poll(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    _reader: &mut PacketReader,
) {
    // Assist-tool polling; deliberately ignored.
}

pub fn use_request(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    reader: &mut PacketReader,
) {
    let raw = reader.read_u32();
    let _paperdoll = raw & 0x8000_0000 != 0;
    let _target = Serial(raw & 0x7FFF_FFFF);
}

pub fn lift_request(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    reader: &mut PacketReader,
) {
    let _item = Serial(reader.read_u32());
    let _amount = reader.read_u16();
}

pub fn drop_request(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    reader: &mut PacketReader,
) {
    let _item = Serial(reader.read_u32());
    let _x = reader.read_u16() as i16;
    let _y = reader.read_u16() as i16;
    let _z = reader.read_i8();
    let _container = Serial(reader.read_u32());
}

/// Grid-lines clients insert the container slot before the target.
pub fn drop_request_6017(
    _ctx: &mut ServerContext,
    _events: &mut dyn GameEvents,
    _id: NetStateId,
    reader: &mut PacketReader,
) {
    let _item = Serial(reader.read_u32());
    let _x = reader.read_u16() as i16;
    let _y = reader.read_u16() as i16;
    let _z = reader.read_i8();
    let _grid_index = reader.read_u8();
    let _container = Serial(reader.read_u32());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::entity::{Mobile, TypeRegistry};
    use crate::events::NullEvents;
    use crate::netstate::GumpHandle;
    use crate::server::SecureTrade;
    use crate::world::World;
    use std::io::Write as IoWrite;
    use std::net::{TcpListener, TcpStream};

    fn test_ctx_with_conn() -> (ServerContext, NetStateId, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut ctx = ServerContext::new(
            ServerConfig::default(),
            World::new(TypeRegistry::with_defaults()),
        );
        let id = ctx.attach_socket(server).unwrap();
        (ctx, id, client)
    }

    fn attach_test_mobile(ctx: &mut ServerContext, id: NetStateId) -> Serial {
        let serial = ctx.world.next_mobile_serial();
        ctx.world.add_mobile(Box::new(Mobile::new(serial)));
        ctx.state_mut(id).unwrap().mobile = Some(serial);
        serial
    }

    #[test]
    fn test_gump_text_cap_disconnects() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);
        ctx.state_mut(id)
            .unwrap()
            .add_gump(GumpHandle { serial: 0x10, type_id: 0x99 }, 512);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0x10u32.to_be_bytes()); // gump serial
        payload.extend_from_slice(&0x99u32.to_be_bytes()); // type id
        payload.extend_from_slice(&1u32.to_be_bytes()); // button
        payload.extend_from_slice(&0u32.to_be_bytes()); // switches
        payload.extend_from_slice(&1u32.to_be_bytes()); // one text entry
        payload.extend_from_slice(&0u16.to_be_bytes()); // entry id
        payload.extend_from_slice(&240u16.to_be_bytes()); // 240 > cap
        payload.extend(std::iter::repeat(0u8).take(480));

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        gump_response(&mut ctx, &mut events, id, &mut reader);

        assert!(ctx.state(id).unwrap().disposing);
    }

    #[test]
    fn test_gump_response_within_cap_consumes_handle() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);
        ctx.state_mut(id)
            .unwrap()
            .add_gump(GumpHandle { serial: 0x10, type_id: 0x99 }, 512);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0x10u32.to_be_bytes());
        payload.extend_from_slice(&0x99u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&7u16.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&(b'h' as u16).to_be_bytes());
        payload.extend_from_slice(&(b'i' as u16).to_be_bytes());

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        gump_response(&mut ctx, &mut events, id, &mut reader);

        let ns = ctx.state(id).unwrap();
        assert!(!ns.disposing);
        assert!(ns.gumps.is_empty());
    }

    #[test]
    fn test_vendor_buy_cap() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0x4000_0001u32.to_be_bytes());
        payload.push(0x02);
        for i in 0..101u32 {
            payload.push(0x1A);
            payload.extend_from_slice(&(0x4000_1000 + i).to_be_bytes());
            payload.extend_from_slice(&1u16.to_be_bytes());
        }

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        vendor_buy_reply(&mut ctx, &mut events, id, &mut reader);

        assert!(ctx.state(id).unwrap().disposing);
    }

    #[test]
    fn test_vendor_buy_ragged_size_disconnects() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0x4000_0001u32.to_be_bytes());
        payload.push(0x02);
        payload.extend_from_slice(&[1, 2, 3]); // not a multiple of 7

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        vendor_buy_reply(&mut ctx, &mut events, id, &mut reader);

        assert!(ctx.state(id).unwrap().disposing);
    }

    #[test]
    fn test_secure_trade_gold_update_reaches_both_sides() {
        let (mut ctx, id_a, mut client_a) = test_ctx_with_conn();

        // Second connection in the same context.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client_b = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_b, _) = listener.accept().unwrap();
        let id_b = ctx.attach_socket(server_b).unwrap();

        let container = 0x4000_2000u32;
        ctx.trades.insert(
            container,
            SecureTrade {
                container,
                parties: [id_a, id_b],
                gold: [0, 0],
                plat: [0, 0],
                accepted: [false, false],
            },
        );

        let mut payload = Vec::new();
        payload.push(3);
        payload.extend_from_slice(&container.to_be_bytes());
        payload.extend_from_slice(&500u32.to_be_bytes());
        payload.extend_from_slice(&2u32.to_be_bytes());

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        secure_trade(&mut ctx, &mut events, id_a, &mut reader);

        let trade = ctx.trades.get(&container).unwrap();
        assert_eq!(trade.gold[0], 500);
        assert_eq!(trade.plat[0], 2);

        // Both connections have the update queued.
        assert!(!ctx.state(id_a).unwrap().disposing);
        assert!(!ctx.state(id_b).unwrap().disposing);

        drop(client_a.flush());
        drop(client_b);
    }

    #[test]
    fn test_movement_sequence_mismatch_resyncs() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);
        ctx.state_mut(id).unwrap().sequence = 5;

        let mut payload = Vec::new();
        payload.push(0x01); // direction
        payload.push(9); // wrong sequence
        payload.extend_from_slice(&0u32.to_be_bytes());

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        movement_request(&mut ctx, &mut events, id, &mut reader);

        assert_eq!(ctx.state(id).unwrap().sequence, 0);
    }

    #[test]
    fn test_movement_accepted_advances_sequence() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);

        let mut payload = Vec::new();
        payload.push(0x01);
        payload.push(0); // expected initial sequence
        payload.extend_from_slice(&0u32.to_be_bytes());

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        movement_request(&mut ctx, &mut events, id, &mut reader);

        assert_eq!(ctx.state(id).unwrap().sequence, 1);
    }

    #[test]
    fn test_target_of_missing_entity_disconnects() {
        let (mut ctx, id, _client) = test_ctx_with_conn();
        attach_test_mobile(&mut ctx, id);

        let mut payload = Vec::new();
        payload.push(0); // target type
        payload.extend_from_slice(&1u32.to_be_bytes()); // target id
        payload.push(0); // flags
        payload.extend_from_slice(&0x4000_FFFFu32.to_be_bytes()); // no such item
        payload.extend_from_slice(&[0; 8]);

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        target_response(&mut ctx, &mut events, id, &mut reader);

        assert!(ctx.state(id).unwrap().disposing);
    }

    #[test]
    fn test_auth_mismatch_disconnects() {
        let (mut ctx, id, _client) = test_ctx_with_conn();

        let mut payload = Vec::new();
        payload.extend_from_slice(&0xBADC0DEu32.to_be_bytes());
        payload.extend(std::iter::repeat(0u8).take(60));

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        game_login(&mut ctx, &mut events, id, &mut reader);

        assert!(ctx.state(id).unwrap().disposing);
    }

    #[test]
    fn test_game_login_restores_version_from_window() {
        let (mut ctx, id, _client) = test_ctx_with_conn();

        let version = ClientVersion::new(7, 0, 45, 65);
        let auth_id = ctx.auth_window.register(Some(version));

        let mut payload = Vec::new();
        payload.extend_from_slice(&auth_id.to_be_bytes());
        let mut name = [0u8; 30];
        name[..4].copy_from_slice(b"test");
        payload.extend_from_slice(&name);
        payload.extend_from_slice(&[0u8; 30]);

        let mut events = NullEvents;
        let mut reader = PacketReader::new(&payload);
        game_login(&mut ctx, &mut events, id, &mut reader);

        let ns = ctx.state(id).unwrap();
        assert!(!ns.disposing);
        assert!(ns.compression_enabled);
        assert_eq!(ns.version, Some(version));
        assert_eq!(ns.stage, ConnectionStage::GameAuthenticated);
    }
}
