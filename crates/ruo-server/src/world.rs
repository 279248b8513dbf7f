// world.rs — in-memory entity registries and load orchestration
//
// Two serial-keyed maps plus the guild registry. At steady state only the
// tick thread mutates them; while a save is running, mutations funnel into
// the safety queues and are applied after the snapshot is on disk. Loading
// walks the (idx, tdb, bin) triplets in a strict family order and verifies
// every body against its index record.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam::queue::SegQueue;
use log::{info, warn};
use thiserror::Error;

use ruo_common::packet_io::PacketReader;
use ruo_common::serial::{Serial, ITEM_OFFSET};

use crate::entity::{DeserializeError, Guild, ItemEntity, MobileEntity, TypeRegistry};

pub const MOBILES_IDX: &str = "Mobiles.idx";
pub const MOBILES_TDB: &str = "Mobiles.tdb";
pub const MOBILES_BIN: &str = "Mobiles.bin";
pub const ITEMS_IDX: &str = "Items.idx";
pub const ITEMS_TDB: &str = "Items.tdb";
pub const ITEMS_BIN: &str = "Items.bin";
pub const GUILDS_IDX: &str = "Guilds.idx";
pub const GUILDS_BIN: &str = "Guilds.bin";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("world load i/o: {0}")]
    Io(#[from] io::Error),
    #[error("{file}: no registered constructor for type '{type_name}'")]
    MissingType { file: &'static str, type_name: String },
    #[error("{type_name} {serial}: cursor ended at {actual}, index says {expected}")]
    CursorMismatch {
        type_name: String,
        serial: Serial,
        expected: u64,
        actual: u64,
    },
    #[error("{type_name} {serial}: {source}")]
    Deserialize {
        type_name: String,
        serial: Serial,
        source: DeserializeError,
    },
}

/// What to do with a record that fails to load. The delete variants drop
/// the offending record (or its whole type) and rewrite only the index
/// file; bodies on disk are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailurePolicy {
    Abort,
    DeleteRecord,
    DeleteType,
}

// ============================================================
// Index and type-database file formats (little-endian)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub type_id: u32,
    pub serial: u32,
    pub position: i64,
    pub length: u32,
}

pub fn write_index<W: io::Write>(writer: &mut W, records: &[IndexRecord]) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(records.len() as u32)?;

    for record in records {
        writer.write_u32::<LittleEndian>(record.type_id)?;
        writer.write_u32::<LittleEndian>(record.serial)?;
        writer.write_i64::<LittleEndian>(record.position)?;
        writer.write_u32::<LittleEndian>(record.length)?;
    }

    Ok(())
}

pub fn read_index(path: &Path) -> io::Result<Vec<IndexRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let count = reader.read_u32::<LittleEndian>()? as usize;
    let mut records = Vec::with_capacity(count);

    for _ in 0..count {
        records.push(IndexRecord {
            type_id: reader.read_u32::<LittleEndian>()?,
            serial: reader.read_u32::<LittleEndian>()?,
            position: reader.read_i64::<LittleEndian>()?,
            length: reader.read_u32::<LittleEndian>()?,
        });
    }

    Ok(records)
}

pub fn write_type_table<W: io::Write>(writer: &mut W, names: &[String]) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(names.len() as u32)?;

    for name in names {
        let bytes = name.as_bytes();
        writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
        writer.write_all(bytes)?;
    }

    Ok(())
}

pub fn read_type_table(path: &Path) -> io::Result<Vec<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let count = reader.read_u32::<LittleEndian>()? as usize;
    let mut names = Vec::with_capacity(count);

    for _ in 0..count {
        let length = reader.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; length];
        reader.read_exact(&mut bytes)?;
        names.push(String::from_utf8_lossy(&bytes).into_owned());
    }

    Ok(names)
}

// ============================================================
// World
// ============================================================

enum PendingAdd {
    Item(Box<dyn ItemEntity>),
    Mobile(Box<dyn MobileEntity>),
    Guild(Guild),
}

enum PendingDelete {
    Item(Serial),
    Mobile(Serial),
    Guild(u32),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadStats {
    pub mobiles: usize,
    pub items: usize,
    pub guilds: usize,
    pub dropped_records: usize,
}

pub struct World {
    mobiles: HashMap<Serial, Box<dyn MobileEntity>>,
    items: HashMap<Serial, Box<dyn ItemEntity>>,
    guilds: HashMap<u32, Guild>,
    registry: TypeRegistry,

    saving: bool,
    add_queue: SegQueue<PendingAdd>,
    delete_queue: SegQueue<PendingDelete>,

    last_mobile_serial: u32,
    last_item_serial: u32,
    last_guild_id: u32,
}

impl World {
    pub fn new(registry: TypeRegistry) -> World {
        World {
            mobiles: HashMap::new(),
            items: HashMap::new(),
            guilds: HashMap::new(),
            registry,
            saving: false,
            add_queue: SegQueue::new(),
            delete_queue: SegQueue::new(),
            last_mobile_serial: 0,
            last_item_serial: ITEM_OFFSET,
            last_guild_id: 0,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn mobiles(&self) -> &HashMap<Serial, Box<dyn MobileEntity>> {
        &self.mobiles
    }

    pub fn items(&self) -> &HashMap<Serial, Box<dyn ItemEntity>> {
        &self.items
    }

    pub fn guilds(&self) -> &HashMap<u32, Guild> {
        &self.guilds
    }

    pub fn find_mobile(&self, serial: Serial) -> Option<&dyn MobileEntity> {
        self.mobiles.get(&serial).map(|m| m.as_ref())
    }

    pub fn find_mobile_mut(&mut self, serial: Serial) -> Option<&mut (dyn MobileEntity + 'static)> {
        self.mobiles.get_mut(&serial).map(|m| m.as_mut())
    }

    pub fn find_item(&self, serial: Serial) -> Option<&dyn ItemEntity> {
        self.items.get(&serial).map(|i| i.as_ref())
    }

    pub fn find_item_mut(&mut self, serial: Serial) -> Option<&mut (dyn ItemEntity + 'static)> {
        self.items.get_mut(&serial).map(|i| i.as_mut())
    }

    pub fn find_guild(&self, id: u32) -> Option<&Guild> {
        self.guilds.get(&id)
    }

    // --------------------------------------------------------
    // Serial allocation
    // --------------------------------------------------------

    pub fn next_mobile_serial(&mut self) -> Serial {
        loop {
            self.last_mobile_serial += 1;
            if self.last_mobile_serial >= ITEM_OFFSET {
                self.last_mobile_serial = 1;
            }

            let serial = Serial(self.last_mobile_serial);
            if !self.mobiles.contains_key(&serial) {
                return serial;
            }
        }
    }

    pub fn next_item_serial(&mut self) -> Serial {
        loop {
            self.last_item_serial += 1;
            if self.last_item_serial > 0x7FFF_FFFF {
                self.last_item_serial = ITEM_OFFSET;
            }

            let serial = Serial(self.last_item_serial);
            if !self.items.contains_key(&serial) {
                return serial;
            }
        }
    }

    pub fn next_guild_id(&mut self) -> u32 {
        self.last_guild_id += 1;
        while self.guilds.contains_key(&self.last_guild_id) {
            self.last_guild_id += 1;
        }
        self.last_guild_id
    }

    // --------------------------------------------------------
    // Mutation, deferred while saving
    // --------------------------------------------------------

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn add_mobile(&mut self, mobile: Box<dyn MobileEntity>) {
        if self.saving {
            self.add_queue.push(PendingAdd::Mobile(mobile));
        } else {
            self.mobiles.insert(mobile.serial(), mobile);
        }
    }

    pub fn add_item(&mut self, item: Box<dyn ItemEntity>) {
        if self.saving {
            self.add_queue.push(PendingAdd::Item(item));
        } else {
            self.items.insert(item.serial(), item);
        }
    }

    pub fn add_guild(&mut self, guild: Guild) {
        if self.saving {
            self.add_queue.push(PendingAdd::Guild(guild));
        } else {
            self.guilds.insert(guild.id, guild);
        }
    }

    pub fn delete_mobile(&mut self, serial: Serial) {
        if self.saving {
            self.delete_queue.push(PendingDelete::Mobile(serial));
        } else if let Some(mut mobile) = self.mobiles.remove(&serial) {
            mobile.mark_deleted();
        }
    }

    pub fn delete_item(&mut self, serial: Serial) {
        if self.saving {
            self.delete_queue.push(PendingDelete::Item(serial));
        } else if let Some(mut item) = self.items.remove(&serial) {
            item.mark_deleted();
        }
    }

    pub fn disband_guild(&mut self, id: u32) {
        if self.saving {
            self.delete_queue.push(PendingDelete::Guild(id));
        } else if let Some(mut guild) = self.guilds.remove(&id) {
            guild.disband();
        }
    }

    /// Enter save mode: every mutation from here funnels into the safety
    /// queues until end_save.
    pub fn begin_save(&mut self) {
        debug_assert!(!self.saving);
        self.saving = true;
    }

    /// Leave save mode and apply everything that happened meanwhile.
    pub fn end_save(&mut self) {
        self.saving = false;

        while let Some(pending) = self.add_queue.pop() {
            match pending {
                PendingAdd::Item(item) => self.add_item(item),
                PendingAdd::Mobile(mobile) => self.add_mobile(mobile),
                PendingAdd::Guild(guild) => self.add_guild(guild),
            }
        }

        while let Some(pending) = self.delete_queue.pop() {
            match pending {
                PendingDelete::Item(serial) => self.delete_item(serial),
                PendingDelete::Mobile(serial) => self.delete_mobile(serial),
                PendingDelete::Guild(id) => self.disband_guild(id),
            }
        }
    }

    // --------------------------------------------------------
    // Load
    // --------------------------------------------------------

    pub fn load(&mut self, dir: &Path, policy: LoadFailurePolicy) -> Result<LoadStats, LoadError> {
        let mut stats = LoadStats::default();

        if !dir.join(MOBILES_IDX).exists() {
            info!("world: no save found under {}, starting fresh", dir.display());
            return Ok(stats);
        }

        stats.dropped_records += self.load_family(dir, Family::Mobiles, policy)?;
        stats.dropped_records += self.load_family(dir, Family::Items, policy)?;
        stats.dropped_records += self.load_guilds(dir, policy)?;

        self.finish_load();

        stats.mobiles = self.mobiles.len();
        stats.items = self.items.len();
        stats.guilds = self.guilds.len();

        info!(
            "world: loaded {} mobiles, {} items, {} guilds ({} records dropped)",
            stats.mobiles, stats.items, stats.guilds, stats.dropped_records
        );

        Ok(stats)
    }

    fn load_family(
        &mut self,
        dir: &Path,
        family: Family,
        policy: LoadFailurePolicy,
    ) -> Result<usize, LoadError> {
        let (idx_name, tdb_name, bin_name) = family.files();
        let types = read_type_table(&dir.join(tdb_name))?;
        let records = read_index(&dir.join(idx_name))?;

        // Instantiate every record through the registry first; bodies
        // stream in afterwards.
        let mut failed: Vec<usize> = Vec::new();
        let mut failed_types: HashSet<u32> = HashSet::new();

        for (i, record) in records.iter().enumerate() {
            let type_name = types.get(record.type_id as usize).map(String::as_str);

            let constructed = type_name.is_some()
                && match family {
                    Family::Mobiles => {
                        if let Some(factory) = self.registry.mobile_factory(type_name.unwrap()) {
                            let mobile = factory(Serial(record.serial));
                            self.last_mobile_serial = self.last_mobile_serial.max(record.serial);
                            self.mobiles.insert(mobile.serial(), mobile);
                            true
                        } else {
                            false
                        }
                    }
                    Family::Items => {
                        if let Some(factory) = self.registry.item_factory(type_name.unwrap()) {
                            let item = factory(Serial(record.serial));
                            self.last_item_serial = self.last_item_serial.max(record.serial);
                            self.items.insert(item.serial(), item);
                            true
                        } else {
                            false
                        }
                    }
                };

            if !constructed {
                let name = type_name.unwrap_or("<bad typeId>").to_string();

                if policy == LoadFailurePolicy::Abort {
                    return Err(LoadError::MissingType {
                        file: idx_name,
                        type_name: name,
                    });
                }

                warn!("{}: dropping record for unknown type '{}'", idx_name, name);
                failed.push(i);
                if policy == LoadFailurePolicy::DeleteType {
                    failed_types.insert(record.type_id);
                }
            }
        }

        let bin = fs::read(dir.join(bin_name))?;

        for (i, record) in records.iter().enumerate() {
            if failed.contains(&i) || failed_types.contains(&record.type_id) {
                continue;
            }

            let serial = Serial(record.serial);
            let start = record.position as usize;
            let end = start + record.length as usize;
            let type_name = &types[record.type_id as usize];

            let result = if end > bin.len() {
                Err(LoadError::CursorMismatch {
                    type_name: type_name.clone(),
                    serial,
                    expected: end as u64,
                    actual: bin.len() as u64,
                })
            } else {
                let mut reader = PacketReader::new(&bin[start..end]);

                let outcome = match family {
                    Family::Mobiles => self
                        .mobiles
                        .get_mut(&serial)
                        .unwrap()
                        .deserialize(&mut reader),
                    Family::Items => self
                        .items
                        .get_mut(&serial)
                        .unwrap()
                        .deserialize(&mut reader),
                };

                match outcome {
                    Err(source) => Err(LoadError::Deserialize {
                        type_name: type_name.clone(),
                        serial,
                        source,
                    }),
                    Ok(()) if reader.position() != record.length as usize => {
                        Err(LoadError::CursorMismatch {
                            type_name: type_name.clone(),
                            serial,
                            expected: (record.position + record.length as i64) as u64,
                            actual: record.position as u64 + reader.position() as u64,
                        })
                    }
                    Ok(()) => Ok(()),
                }
            };

            if let Err(e) = result {
                if policy == LoadFailurePolicy::Abort {
                    return Err(e);
                }

                warn!("{}: {}", bin_name, e);
                failed.push(i);
                if policy == LoadFailurePolicy::DeleteType {
                    failed_types.insert(record.type_id);
                }
            }
        }

        // Apply the failure policy: remove the casualties and rewrite only
        // the index file.
        if failed.is_empty() && failed_types.is_empty() {
            return Ok(0);
        }

        let mut kept = Vec::with_capacity(records.len());
        let mut dropped = 0usize;

        for (i, record) in records.iter().enumerate() {
            if failed.contains(&i) || failed_types.contains(&record.type_id) {
                let serial = Serial(record.serial);
                match family {
                    Family::Mobiles => {
                        self.mobiles.remove(&serial);
                    }
                    Family::Items => {
                        self.items.remove(&serial);
                    }
                }
                dropped += 1;
            } else {
                kept.push(*record);
            }
        }

        let mut writer = BufWriter::new(File::create(dir.join(idx_name))?);
        write_index(&mut writer, &kept)?;
        writer.flush()?;

        Ok(dropped)
    }

    fn load_guilds(&mut self, dir: &Path, policy: LoadFailurePolicy) -> Result<usize, LoadError> {
        let idx_path = dir.join(GUILDS_IDX);
        if !idx_path.exists() {
            return Ok(0);
        }

        let records = read_index(&idx_path)?;
        let bin = fs::read(dir.join(GUILDS_BIN))?;
        let mut kept = Vec::with_capacity(records.len());
        let mut dropped = 0usize;

        for record in &records {
            let start = record.position as usize;
            let end = start + record.length as usize;

            let result = if end > bin.len() {
                Err(LoadError::CursorMismatch {
                    type_name: "ruo.guilds.Guild".into(),
                    serial: Serial(record.serial),
                    expected: end as u64,
                    actual: bin.len() as u64,
                })
            } else {
                let mut guild = Guild::new(record.serial);
                let mut reader = PacketReader::new(&bin[start..end]);

                match guild.deserialize(&mut reader) {
                    Err(source) => Err(LoadError::Deserialize {
                        type_name: "ruo.guilds.Guild".into(),
                        serial: Serial(record.serial),
                        source,
                    }),
                    Ok(()) if reader.position() != record.length as usize => {
                        Err(LoadError::CursorMismatch {
                            type_name: "ruo.guilds.Guild".into(),
                            serial: Serial(record.serial),
                            expected: (record.position + record.length as i64) as u64,
                            actual: record.position as u64 + reader.position() as u64,
                        })
                    }
                    Ok(()) => {
                        self.last_guild_id = self.last_guild_id.max(guild.id);
                        self.guilds.insert(guild.id, guild);
                        Ok(())
                    }
                }
            };

            match result {
                Ok(()) => kept.push(*record),
                Err(e) if policy == LoadFailurePolicy::Abort => return Err(e),
                Err(e) => {
                    warn!("{}: {}", GUILDS_BIN, e);
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            let mut writer = BufWriter::new(File::create(&idx_path)?);
            write_index(&mut writer, &kept)?;
            writer.flush()?;
        }

        Ok(dropped)
    }

    /// Post-load pass: rebuild each mobile's item list from item parents,
    /// roll up totals, and drop stale property caches.
    fn finish_load(&mut self) {
        let mut held: HashMap<Serial, Vec<(Serial, i32)>> = HashMap::new();

        for item in self.items.values() {
            let parent = item.parent();
            if parent.is_mobile() {
                held.entry(parent)
                    .or_default()
                    .push((item.serial(), item.weight()));
            }
        }

        for (serial, mobile) in self.mobiles.iter_mut() {
            mobile.clear_items();
            mobile.clear_property_cache();

            let mut total_items = 0u32;
            let mut total_weight = 0i64;

            if let Some(children) = held.get(serial) {
                for (child, weight) in children {
                    mobile.add_item(*child);
                    total_items += 1;
                    total_weight += *weight as i64;
                }
            }

            mobile.set_totals(total_items, total_weight);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Mobiles,
    Items,
}

impl Family {
    fn files(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Family::Mobiles => (MOBILES_IDX, MOBILES_TDB, MOBILES_BIN),
            Family::Items => (ITEMS_IDX, ITEMS_TDB, ITEMS_BIN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Item, Mobile, Point3D, WorldEntity};
    use ruo_common::packet_io::PacketWriter;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ruo-world-tests").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_world() -> World {
        World::new(TypeRegistry::with_defaults())
    }

    /// Hand-roll a one-mobile, one-item save the way the save pipeline
    /// lays it out.
    fn write_fixture(dir: &Path, corrupt_item_version: bool) {
        let mut mobile = Mobile::new(Serial(0x10));
        mobile.name = "Keeper".into();
        mobile.location = Point3D::new(5, 6, 7);

        let mut writer = PacketWriter::new(256);
        mobile.serialize(&mut writer);
        let mobile_body = writer.as_slice().to_vec();

        fs::write(dir.join(MOBILES_BIN), &mobile_body).unwrap();
        let mut f = BufWriter::new(File::create(dir.join(MOBILES_IDX)).unwrap());
        write_index(
            &mut f,
            &[IndexRecord {
                type_id: 0,
                serial: 0x10,
                position: 0,
                length: mobile_body.len() as u32,
            }],
        )
        .unwrap();
        drop(f);
        let mut f = BufWriter::new(File::create(dir.join(MOBILES_TDB)).unwrap());
        write_type_table(&mut f, &[Mobile::TYPE_NAME.to_string()]).unwrap();
        drop(f);

        let mut item = Item::new(Serial(0x4000_0002));
        item.item_id = 0x0EED;
        item.parent = Serial(0x10);
        item.weight = 3;

        let mut writer = PacketWriter::new(256);
        if corrupt_item_version {
            writer.write_i32(999);
        } else {
            item.serialize(&mut writer);
        }
        let item_body = writer.as_slice().to_vec();

        fs::write(dir.join(ITEMS_BIN), &item_body).unwrap();
        let mut f = BufWriter::new(File::create(dir.join(ITEMS_IDX)).unwrap());
        write_index(
            &mut f,
            &[IndexRecord {
                type_id: 0,
                serial: 0x4000_0002,
                position: 0,
                length: item_body.len() as u32,
            }],
        )
        .unwrap();
        drop(f);
        let mut f = BufWriter::new(File::create(dir.join(ITEMS_TDB)).unwrap());
        write_type_table(&mut f, &[Item::TYPE_NAME.to_string()]).unwrap();
        drop(f);
    }

    #[test]
    fn test_load_rebuilds_totals() {
        let dir = temp_dir("load-totals");
        write_fixture(&dir, false);

        let mut world = test_world();
        let stats = world.load(&dir, LoadFailurePolicy::Abort).unwrap();
        assert_eq!(stats.mobiles, 1);
        assert_eq!(stats.items, 1);
        assert_eq!(stats.dropped_records, 0);

        let mobile = world.find_mobile(Serial(0x10)).unwrap();
        assert_eq!(mobile.items(), &[Serial(0x4000_0002)]);

        let concrete = mobile.as_any().downcast_ref::<Mobile>().unwrap();
        assert_eq!(concrete.total_items(), 1);
        assert_eq!(concrete.total_weight(), 3);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_bad_record_aborts() {
        let dir = temp_dir("load-abort");
        write_fixture(&dir, true);

        let mut world = test_world();
        assert!(matches!(
            world.load(&dir, LoadFailurePolicy::Abort),
            Err(LoadError::Deserialize { .. })
        ));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_bad_record_deleted_and_index_rewritten() {
        let dir = temp_dir("load-delete");
        write_fixture(&dir, true);

        let mut world = test_world();
        let stats = world.load(&dir, LoadFailurePolicy::DeleteRecord).unwrap();
        assert_eq!(stats.mobiles, 1);
        assert_eq!(stats.items, 0);
        assert_eq!(stats.dropped_records, 1);

        // The items index must have been rewritten without the casualty.
        assert!(read_index(&dir.join(ITEMS_IDX)).unwrap().is_empty());
        assert_eq!(read_index(&dir.join(MOBILES_IDX)).unwrap().len(), 1);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_save_is_fresh_start() {
        let dir = temp_dir("load-fresh");
        let mut world = test_world();
        let stats = world.load(&dir, LoadFailurePolicy::Abort).unwrap();
        assert_eq!(stats.mobiles, 0);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_serial_allocation_skips_live() {
        let mut world = test_world();
        let first = world.next_mobile_serial();
        assert_eq!(first, Serial(1));
        world.add_mobile(Box::new(Mobile::new(first)));

        let item_serial = world.next_item_serial();
        assert!(item_serial.is_item());

        // Simulate the watermark landing on a live serial.
        world.last_mobile_serial = 0;
        let next = world.next_mobile_serial();
        assert_eq!(next, Serial(2));
    }

    #[test]
    fn test_saving_defers_mutations() {
        let mut world = test_world();
        let serial = world.next_mobile_serial();
        world.add_mobile(Box::new(Mobile::new(serial)));

        world.begin_save();
        assert!(world.is_saving());

        // A mobile deleting itself mid-save must not change the registry.
        world.delete_mobile(serial);
        assert_eq!(world.mobiles().len(), 1);

        let late = Serial(0x20);
        world.add_mobile(Box::new(Mobile::new(late)));
        assert_eq!(world.mobiles().len(), 1);

        world.end_save();
        assert!(!world.is_saving());
        assert!(world.find_mobile(serial).is_none());
        assert!(world.find_mobile(late).is_some());
    }
}
