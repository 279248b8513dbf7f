// entity.rs — serializable world entities and the type registry
//
// Entities serialize to version-tagged binary bodies. The registry maps the
// stable type name stored in the .tdb files to a factory; loading never
// touches reflection, a type that was not registered at startup simply
// fails the lookup and falls under the operator's load-failure policy.

use std::any::Any;
use std::collections::HashMap;

use thiserror::Error;

use ruo_common::packet_io::{PacketReader, PacketWriter};
use ruo_common::serial::Serial;

#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error("{type_name}: unsupported body version {version}")]
    UnsupportedVersion {
        type_name: &'static str,
        version: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point3D {
    pub x: i16,
    pub y: i16,
    pub z: i8,
}

impl Point3D {
    pub const fn new(x: i16, y: i16, z: i8) -> Point3D {
        Point3D { x, y, z }
    }
}

// ============================================================
// Entity traits
// ============================================================

pub trait WorldEntity: Send + Sync {
    fn serial(&self) -> Serial;
    fn type_name(&self) -> &'static str;

    fn is_deleted(&self) -> bool;
    fn mark_deleted(&mut self);

    fn location(&self) -> Point3D;
    fn set_location(&mut self, location: Point3D);

    fn serialize(&self, writer: &mut PacketWriter);
    fn deserialize(&mut self, reader: &mut PacketReader) -> Result<(), DeserializeError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait ItemEntity: WorldEntity {
    fn item_id(&self) -> u16;
    fn hue(&self) -> u16;
    fn amount(&self) -> u16;
    /// Containing entity, or Serial::ZERO when on the ground.
    fn parent(&self) -> Serial;
    fn set_parent(&mut self, parent: Serial);
    fn layer(&self) -> u8;
    fn weight(&self) -> i32;
    /// Grid slot for grid-lines-capable clients.
    fn grid_index(&self) -> u8;
    fn set_grid_index(&mut self, index: u8);
}

pub trait MobileEntity: WorldEntity {
    fn name(&self) -> &str;
    fn body(&self) -> u16;
    fn hue(&self) -> u16;
    fn direction(&self) -> u8;
    fn female(&self) -> bool;
    fn notoriety(&self) -> u8;

    /// Serials of directly held items, rebuilt after load.
    fn items(&self) -> &[Serial];
    fn clear_items(&mut self);
    fn add_item(&mut self, serial: Serial);

    fn set_totals(&mut self, total_items: u32, total_weight: i64);
    /// Drop any cached object-property state; stale after a load.
    fn clear_property_cache(&mut self);
}

// ============================================================
// Item
// ============================================================

const ITEM_VERSION: i32 = 1;

#[derive(Debug, Clone)]
pub struct Item {
    serial: Serial,
    deleted: bool,
    pub item_id: u16,
    pub hue: u16,
    pub amount: u16,
    pub location: Point3D,
    pub parent: Serial,
    pub layer: u8,
    pub weight: i32,
    pub grid_index: u8,
    pub name: String,
}

impl Item {
    pub fn new(serial: Serial) -> Item {
        Item {
            serial,
            deleted: false,
            item_id: 0,
            hue: 0,
            amount: 1,
            location: Point3D::default(),
            parent: Serial::ZERO,
            layer: 0,
            weight: 1,
            grid_index: 0,
            name: String::new(),
        }
    }

    pub const TYPE_NAME: &'static str = "ruo.items.Item";
}

impl WorldEntity for Item {
    fn serial(&self) -> Serial {
        self.serial
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn location(&self) -> Point3D {
        self.location
    }

    fn set_location(&mut self, location: Point3D) {
        self.location = location;
    }

    fn serialize(&self, writer: &mut PacketWriter) {
        writer.write_i32(ITEM_VERSION);
        writer.write_u16(self.item_id);
        writer.write_u16(self.hue);
        writer.write_u16(self.amount);
        writer.write_i16(self.location.x);
        writer.write_i16(self.location.y);
        writer.write_i8(self.location.z);
        writer.write_u32(self.parent.value());
        writer.write_u8(self.layer);
        writer.write_i32(self.weight);
        writer.write_u8(self.grid_index);
        writer.write_ascii_null(&self.name);
    }

    fn deserialize(&mut self, reader: &mut PacketReader) -> Result<(), DeserializeError> {
        let version = reader.read_i32();

        if version != ITEM_VERSION {
            return Err(DeserializeError::UnsupportedVersion {
                type_name: Self::TYPE_NAME,
                version,
            });
        }

        self.item_id = reader.read_u16();
        self.hue = reader.read_u16();
        self.amount = reader.read_u16();
        self.location.x = reader.read_i16();
        self.location.y = reader.read_i16();
        self.location.z = reader.read_i8();
        self.parent = Serial(reader.read_u32());
        self.layer = reader.read_u8();
        self.weight = reader.read_i32();
        self.grid_index = reader.read_u8();
        self.name = reader.read_ascii_null();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ItemEntity for Item {
    fn item_id(&self) -> u16 {
        self.item_id
    }

    fn hue(&self) -> u16 {
        self.hue
    }

    fn amount(&self) -> u16 {
        self.amount
    }

    fn parent(&self) -> Serial {
        self.parent
    }

    fn set_parent(&mut self, parent: Serial) {
        self.parent = parent;
    }

    fn layer(&self) -> u8 {
        self.layer
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    fn grid_index(&self) -> u8 {
        self.grid_index
    }

    fn set_grid_index(&mut self, index: u8) {
        self.grid_index = index;
    }
}

// ============================================================
// Mobile
// ============================================================

const MOBILE_VERSION: i32 = 1;

#[derive(Debug, Clone)]
pub struct Mobile {
    serial: Serial,
    deleted: bool,
    pub name: String,
    pub body: u16,
    pub hue: u16,
    pub location: Point3D,
    pub direction: u8,
    pub female: bool,
    pub notoriety: u8,

    // Runtime state, rebuilt after load rather than persisted.
    items: Vec<Serial>,
    total_items: u32,
    total_weight: i64,
    property_cache_valid: bool,
}

impl Mobile {
    pub fn new(serial: Serial) -> Mobile {
        Mobile {
            serial,
            deleted: false,
            name: String::new(),
            body: 400,
            hue: 0,
            location: Point3D::default(),
            direction: 0,
            female: false,
            notoriety: 1,
            items: Vec::new(),
            total_items: 0,
            total_weight: 0,
            property_cache_valid: false,
        }
    }

    pub const TYPE_NAME: &'static str = "ruo.mobiles.Mobile";

    pub fn total_items(&self) -> u32 {
        self.total_items
    }

    pub fn total_weight(&self) -> i64 {
        self.total_weight
    }
}

impl WorldEntity for Mobile {
    fn serial(&self) -> Serial {
        self.serial
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn location(&self) -> Point3D {
        self.location
    }

    fn set_location(&mut self, location: Point3D) {
        self.location = location;
    }

    fn serialize(&self, writer: &mut PacketWriter) {
        writer.write_i32(MOBILE_VERSION);
        writer.write_ascii_null(&self.name);
        writer.write_u16(self.body);
        writer.write_u16(self.hue);
        writer.write_i16(self.location.x);
        writer.write_i16(self.location.y);
        writer.write_i8(self.location.z);
        writer.write_u8(self.direction);
        writer.write_bool(self.female);
        writer.write_u8(self.notoriety);
    }

    fn deserialize(&mut self, reader: &mut PacketReader) -> Result<(), DeserializeError> {
        let version = reader.read_i32();

        if version != MOBILE_VERSION {
            return Err(DeserializeError::UnsupportedVersion {
                type_name: Self::TYPE_NAME,
                version,
            });
        }

        self.name = reader.read_ascii_null();
        self.body = reader.read_u16();
        self.hue = reader.read_u16();
        self.location.x = reader.read_i16();
        self.location.y = reader.read_i16();
        self.location.z = reader.read_i8();
        self.direction = reader.read_u8();
        self.female = reader.read_bool();
        self.notoriety = reader.read_u8();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl MobileEntity for Mobile {
    fn name(&self) -> &str {
        &self.name
    }

    fn body(&self) -> u16 {
        self.body
    }

    fn hue(&self) -> u16 {
        self.hue
    }

    fn direction(&self) -> u8 {
        self.direction
    }

    fn female(&self) -> bool {
        self.female
    }

    fn notoriety(&self) -> u8 {
        self.notoriety
    }

    fn items(&self) -> &[Serial] {
        &self.items
    }

    fn clear_items(&mut self) {
        self.items.clear();
    }

    fn add_item(&mut self, serial: Serial) {
        self.items.push(serial);
    }

    fn set_totals(&mut self, total_items: u32, total_weight: i64) {
        self.total_items = total_items;
        self.total_weight = total_weight;
    }

    fn clear_property_cache(&mut self) {
        self.property_cache_valid = false;
    }
}

// ============================================================
// Guild
//
// Guilds live in their own id namespace and have no typed dispatch; the
// guild index writes a zero typeId and every body is this one layout.
// ============================================================

const GUILD_VERSION: i32 = 1;

#[derive(Debug, Clone, Default)]
pub struct Guild {
    pub id: u32,
    pub name: String,
    pub abbreviation: String,
    pub leader: Serial,
    pub members: Vec<Serial>,
    disbanded: bool,
}

impl Guild {
    pub fn new(id: u32) -> Guild {
        Guild {
            id,
            ..Default::default()
        }
    }

    pub fn is_disbanded(&self) -> bool {
        self.disbanded
    }

    pub fn disband(&mut self) {
        self.disbanded = true;
    }

    pub fn serialize(&self, writer: &mut PacketWriter) {
        writer.write_i32(GUILD_VERSION);
        writer.write_u32(self.id);
        writer.write_ascii_null(&self.name);
        writer.write_ascii_null(&self.abbreviation);
        writer.write_u32(self.leader.value());
        writer.write_i32(self.members.len() as i32);
        for member in &self.members {
            writer.write_u32(member.value());
        }
    }

    pub fn deserialize(&mut self, reader: &mut PacketReader) -> Result<(), DeserializeError> {
        let version = reader.read_i32();

        if version != GUILD_VERSION {
            return Err(DeserializeError::UnsupportedVersion {
                type_name: "ruo.guilds.Guild",
                version,
            });
        }

        self.id = reader.read_u32();
        self.name = reader.read_ascii_null();
        self.abbreviation = reader.read_ascii_null();
        self.leader = Serial(reader.read_u32());

        let count = reader.read_i32().max(0) as usize;
        self.members = (0..count).map(|_| Serial(reader.read_u32())).collect();
        Ok(())
    }
}

// ============================================================
// Type registry
// ============================================================

pub type ItemFactory = fn(Serial) -> Box<dyn ItemEntity>;
pub type MobileFactory = fn(Serial) -> Box<dyn MobileEntity>;

/// Startup-populated name → constructor tables, one namespace per file
/// family. The dense typeIds of the .idx files resolve through the .tdb
/// name list into this registry.
pub struct TypeRegistry {
    items: HashMap<&'static str, ItemFactory>,
    mobiles: HashMap<&'static str, MobileFactory>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            items: HashMap::new(),
            mobiles: HashMap::new(),
        }
    }

    pub fn register_item(&mut self, type_name: &'static str, factory: ItemFactory) {
        self.items.insert(type_name, factory);
    }

    pub fn register_mobile(&mut self, type_name: &'static str, factory: MobileFactory) {
        self.mobiles.insert(type_name, factory);
    }

    pub fn item_factory(&self, type_name: &str) -> Option<ItemFactory> {
        self.items.get(type_name).copied()
    }

    pub fn mobile_factory(&self, type_name: &str) -> Option<MobileFactory> {
        self.mobiles.get(type_name).copied()
    }

    /// The stock entity types every server carries.
    pub fn with_defaults() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register_item(Item::TYPE_NAME, |serial| Box::new(Item::new(serial)));
        registry.register_mobile(Mobile::TYPE_NAME, |serial| Box::new(Mobile::new(serial)));
        registry
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<E: WorldEntity>(entity: &E, fresh: &mut dyn WorldEntity) -> Vec<u8> {
        let mut writer = PacketWriter::new(128);
        entity.serialize(&mut writer);
        let bytes = writer.as_slice().to_vec();

        let mut reader = PacketReader::new(&bytes);
        fresh.deserialize(&mut reader).unwrap();
        assert_eq!(reader.position(), bytes.len());
        bytes
    }

    #[test]
    fn test_item_serialize_fixed_point() {
        let mut item = Item::new(Serial(0x4000_0001));
        item.item_id = 0x1F03;
        item.hue = 0x21;
        item.amount = 5;
        item.location = Point3D::new(100, -20, 3);
        item.parent = Serial(0x0000_0002);
        item.layer = 0x0B;
        item.name = "a cloak".into();

        let mut fresh = Item::new(Serial(0x4000_0001));
        let first = roundtrip(&item, &mut fresh);

        let mut writer = PacketWriter::new(128);
        fresh.serialize(&mut writer);
        assert_eq!(writer.as_slice(), &first[..]);
        assert_eq!(fresh.item_id, 0x1F03);
        assert_eq!(fresh.parent, Serial(2));
    }

    #[test]
    fn test_mobile_serialize_fixed_point() {
        let mut mobile = Mobile::new(Serial(0x0000_1234));
        mobile.name = "Aria".into();
        mobile.body = 401;
        mobile.female = true;
        mobile.location = Point3D::new(1496, 1628, 10);

        let mut fresh = Mobile::new(Serial(0x0000_1234));
        let first = roundtrip(&mobile, &mut fresh);

        let mut writer = PacketWriter::new(128);
        fresh.serialize(&mut writer);
        assert_eq!(writer.as_slice(), &first[..]);
        assert_eq!(fresh.name, "Aria");
        assert!(fresh.female);
    }

    #[test]
    fn test_guild_roundtrip() {
        let mut guild = Guild::new(7);
        guild.name = "The Syndicate".into();
        guild.abbreviation = "TS".into();
        guild.leader = Serial(0x100);
        guild.members = vec![Serial(0x100), Serial(0x101)];

        let mut writer = PacketWriter::new(128);
        guild.serialize(&mut writer);

        let mut fresh = Guild::new(0);
        let mut reader = PacketReader::new(writer.as_slice());
        fresh.deserialize(&mut reader).unwrap();

        assert_eq!(reader.position(), writer.length());
        assert_eq!(fresh.id, 7);
        assert_eq!(fresh.members.len(), 2);
        assert_eq!(fresh.abbreviation, "TS");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut writer = PacketWriter::new(16);
        writer.write_i32(99);

        let mut item = Item::new(Serial(0x4000_0001));
        let mut reader = PacketReader::new(writer.as_slice());
        assert!(matches!(
            item.deserialize(&mut reader),
            Err(DeserializeError::UnsupportedVersion { version: 99, .. })
        ));
    }

    #[test]
    fn test_registry_resolves_defaults() {
        let registry = TypeRegistry::with_defaults();

        let factory = registry.item_factory(Item::TYPE_NAME).unwrap();
        let item = factory(Serial(0x4000_0005));
        assert_eq!(item.serial(), Serial(0x4000_0005));

        assert!(registry.mobile_factory("ruo.mobiles.Dragon").is_none());
    }
}
