// save.rs — the world save pipeline
//
// One strategy, parameterized. parallelism <= 1 serializes everything on
// the calling thread; above that, entity chunks fan out over the rayon
// pool into pooled memory writers while a single committer drains the
// finished chunks to disk in snapshot order, so the index and body files
// are identical to what the serial path produces for the same snapshot.
// Saves land in a fresh generation directory and the `current` marker is
// repointed only after everything is flushed, so a failed save can never
// corrupt the previous generation.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, WriteBytesExt};
use crossbeam::channel;
use log::info;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use thiserror::Error;

use ruo_common::bufpool::BufferPool;
use ruo_common::packet_io::PacketWriterPool;

use crate::entity::WorldEntity;
use crate::filewriter::SequentialFileWriter;
use crate::world::{
    IndexRecord, World, write_type_table, GUILDS_BIN, GUILDS_IDX, ITEMS_BIN, ITEMS_IDX, ITEMS_TDB,
    MOBILES_BIN, MOBILES_IDX, MOBILES_TDB,
};

/// Entities serialized per parallel work unit.
const CHUNK_SIZE: usize = 128;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("world save i/o: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SaveStats {
    pub mobiles: usize,
    pub items: usize,
    pub guilds: usize,
    pub elapsed: Duration,
}

// ============================================================
// Disk-write barrier
// ============================================================

/// Manual-reset event: save() resets it, the strategy sets it once the
/// sequential writers have drained.
pub struct ManualResetEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new(set: bool) -> ManualResetEvent {
        ManualResetEvent {
            state: Mutex::new(set),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cond.wait(&mut state);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while !*state {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cond.wait_for(&mut state, deadline - now);
        }

        *state
    }
}

// ============================================================
// Generation directories
// ============================================================

/// Create a fresh generation directory under the save root.
pub fn new_generation_dir(root: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("save-{stamp}")
        } else {
            format!("save-{stamp}-{suffix}")
        };

        let dir = root.join(&name);
        if !dir.exists() {
            fs::create_dir(&dir)?;
            return Ok(dir);
        }

        suffix += 1;
    }
}

/// Atomically repoint the `current` marker at a generation directory.
pub fn repoint_current(root: &Path, generation: &Path) -> io::Result<()> {
    let name = generation
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let tmp = root.join("current.tmp");
    fs::write(&tmp, name)?;
    fs::rename(&tmp, root.join("current"))
}

/// The generation directory the `current` marker names, if any.
pub fn resolve_current(root: &Path) -> Option<PathBuf> {
    let name = fs::read_to_string(root.join("current")).ok()?;
    let dir = root.join(name.trim());
    dir.is_dir().then_some(dir)
}

// ============================================================
// Strategy
// ============================================================

/// Dense type table, assigned in commit order at first serialization.
struct TypeTable {
    names: Vec<String>,
    ids: std::collections::HashMap<&'static str, u32>,
}

impl TypeTable {
    fn new() -> TypeTable {
        TypeTable {
            names: Vec::new(),
            ids: std::collections::HashMap::new(),
        }
    }

    fn get_or_assign(&mut self, name: &'static str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }

        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name, id);
        id
    }
}

/// One serialized chunk: concatenated bodies plus per-entity framing.
struct ChunkOut {
    entries: Vec<(u32, &'static str, usize, usize)>, // serial, type, offset, length
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct SaveStrategy {
    pub parallelism: usize,
    pub background_flush: bool,
}

impl SaveStrategy {
    /// Single-threaded on a uniprocessor, fan-out everywhere else.
    pub fn auto() -> SaveStrategy {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        SaveStrategy {
            parallelism: if processors == 1 {
                1
            } else {
                (processors - 1).max(2)
            },
            background_flush: true,
        }
    }

    fn writer_concurrency(&self) -> usize {
        if self.background_flush {
            1
        } else {
            0
        }
    }

    /// Serialize the whole world into `dir` and fire `disk_event` once the
    /// writers have drained. The caller owns begin_save/end_save.
    pub fn save(
        &self,
        world: &World,
        dir: &Path,
        page_pool: &Arc<BufferPool>,
        writer_pool: &PacketWriterPool,
        disk_event: &ManualResetEvent,
    ) -> Result<SaveStats, SaveError> {
        let started = Instant::now();
        fs::create_dir_all(dir)?;

        let mobiles: Vec<&dyn WorldEntity> = world
            .mobiles()
            .values()
            .map(|m| m.as_ref() as &dyn WorldEntity)
            .collect();
        let items: Vec<&dyn WorldEntity> = world
            .items()
            .values()
            .map(|i| i.as_ref() as &dyn WorldEntity)
            .collect();

        self.save_family(
            &mobiles,
            dir,
            (MOBILES_IDX, MOBILES_TDB, MOBILES_BIN),
            page_pool,
            writer_pool,
        )?;
        self.save_family(
            &items,
            dir,
            (ITEMS_IDX, ITEMS_TDB, ITEMS_BIN),
            page_pool,
            writer_pool,
        )?;
        self.save_guilds(world, dir, page_pool, writer_pool)?;

        disk_event.set();

        let stats = SaveStats {
            mobiles: mobiles.len(),
            items: items.len(),
            guilds: world.guilds().len(),
            elapsed: started.elapsed(),
        };

        info!(
            "world: saved {} mobiles, {} items, {} guilds in {:.2?}",
            stats.mobiles, stats.items, stats.guilds, stats.elapsed
        );

        Ok(stats)
    }

    fn save_family(
        &self,
        entities: &[&dyn WorldEntity],
        dir: &Path,
        files: (&str, &str, &str),
        page_pool: &Arc<BufferPool>,
        writer_pool: &PacketWriterPool,
    ) -> Result<(), SaveError> {
        let (idx_name, tdb_name, bin_name) = files;

        let mut bin =
            SequentialFileWriter::new(&dir.join(bin_name), Arc::clone(page_pool), self.writer_concurrency())?;
        let mut idx =
            SequentialFileWriter::new(&dir.join(idx_name), Arc::clone(page_pool), self.writer_concurrency())?;

        idx.write_u32::<LittleEndian>(entities.len() as u32)?;

        let mut table = TypeTable::new();

        if self.parallelism <= 1 || entities.len() <= CHUNK_SIZE {
            for entity in entities {
                let chunk = serialize_one(entity, writer_pool);
                commit_chunk(&chunk, &mut table, &mut bin, &mut idx)?;
            }
        } else {
            self.fan_out(entities, writer_pool, &mut table, &mut bin, &mut idx)?;
        }

        let mut tdb = BufWriter::new(File::create(dir.join(tdb_name))?);
        write_type_table(&mut tdb, &table.names)?;
        tdb.flush()?;

        bin.close()?;
        idx.close()?;
        Ok(())
    }

    /// Workers serialize chunks out of order; the committer writes them in
    /// snapshot order, holding early arrivals until their turn.
    fn fan_out(
        &self,
        entities: &[&dyn WorldEntity],
        writer_pool: &PacketWriterPool,
        table: &mut TypeTable,
        bin: &mut SequentialFileWriter,
        idx: &mut SequentialFileWriter,
    ) -> Result<(), SaveError> {
        let (tx, rx) = channel::unbounded::<(usize, ChunkOut)>();
        let mut result = Ok(());

        rayon::scope(|scope| {
            scope.spawn(|_| {
                entities
                    .par_chunks(CHUNK_SIZE)
                    .enumerate()
                    .for_each_with(tx, |tx, (index, chunk)| {
                        let mut out = ChunkOut {
                            entries: Vec::with_capacity(chunk.len()),
                            data: Vec::with_capacity(chunk.len() * 64),
                        };

                        for entity in chunk {
                            let single = serialize_one(entity, writer_pool);
                            let (serial, type_name, _, length) = single.entries[0];
                            out.entries.push((serial, type_name, out.data.len(), length));
                            out.data.extend_from_slice(&single.data);
                        }

                        // The committer may already be gone on an i/o error;
                        // dropping the chunk is fine then.
                        let _ = tx.send((index, out));
                    });
            });

            let mut next = 0usize;
            let mut parked: BTreeMap<usize, ChunkOut> = BTreeMap::new();

            for (index, chunk) in rx.iter() {
                parked.insert(index, chunk);

                while let Some(chunk) = parked.remove(&next) {
                    if result.is_ok() {
                        result = commit_chunk(&chunk, table, bin, idx);
                    }
                    next += 1;
                }

                if result.is_err() {
                    // Keep draining so the workers can finish and drop tx.
                    parked.clear();
                }
            }
        });

        result
    }

    fn save_guilds(
        &self,
        world: &World,
        dir: &Path,
        page_pool: &Arc<BufferPool>,
        writer_pool: &PacketWriterPool,
    ) -> Result<(), SaveError> {
        let mut bin =
            SequentialFileWriter::new(&dir.join(GUILDS_BIN), Arc::clone(page_pool), self.writer_concurrency())?;
        let mut idx =
            SequentialFileWriter::new(&dir.join(GUILDS_IDX), Arc::clone(page_pool), self.writer_concurrency())?;

        idx.write_u32::<LittleEndian>(world.guilds().len() as u32)?;

        for guild in world.guilds().values() {
            let mut writer = writer_pool.create_instance(256);
            guild.serialize(&mut writer);

            let record = IndexRecord {
                type_id: 0,
                serial: guild.id,
                position: bin.position() as i64,
                length: writer.length() as u32,
            };

            bin.write_all(writer.as_slice())?;
            write_record(&mut idx, &record)?;
            writer_pool.release_instance(writer);
        }

        bin.close()?;
        idx.close()?;
        Ok(())
    }
}

fn serialize_one(entity: &&dyn WorldEntity, writer_pool: &PacketWriterPool) -> ChunkOut {
    let mut writer = writer_pool.create_instance(512);
    entity.serialize(&mut writer);

    let out = ChunkOut {
        entries: vec![(
            entity.serial().value(),
            entity.type_name(),
            0,
            writer.length(),
        )],
        data: writer.as_slice().to_vec(),
    };

    writer_pool.release_instance(writer);
    out
}

fn write_record(idx: &mut SequentialFileWriter, record: &IndexRecord) -> Result<(), SaveError> {
    idx.write_u32::<LittleEndian>(record.type_id)?;
    idx.write_u32::<LittleEndian>(record.serial)?;
    idx.write_i64::<LittleEndian>(record.position)?;
    idx.write_u32::<LittleEndian>(record.length)?;
    Ok(())
}

fn commit_chunk(
    chunk: &ChunkOut,
    table: &mut TypeTable,
    bin: &mut SequentialFileWriter,
    idx: &mut SequentialFileWriter,
) -> Result<(), SaveError> {
    let base = bin.position();

    for &(serial, type_name, offset, length) in &chunk.entries {
        let record = IndexRecord {
            type_id: table.get_or_assign(type_name),
            serial,
            position: (base + offset as u64) as i64,
            length: length as u32,
        };
        write_record(idx, &record)?;
    }

    bin.write_all(&chunk.data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Guild, Item, Mobile, Point3D, TypeRegistry, WorldEntity};
    use crate::world::LoadFailurePolicy;
    use ruo_common::packet_io::PacketWriter;
    use ruo_common::serial::Serial;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ruo-save-tests").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn page_pool() -> Arc<BufferPool> {
        BufferPool::new("test-save-pages", 4, crate::filewriter::PAGE_SIZE)
    }

    fn populated_world(mobiles: usize, items: usize) -> World {
        let mut world = World::new(TypeRegistry::with_defaults());

        for i in 0..mobiles {
            let serial = world.next_mobile_serial();
            let mut mobile = Mobile::new(serial);
            mobile.name = format!("npc-{i}");
            mobile.body = 400 + (i % 3) as u16;
            mobile.location = Point3D::new(i as i16, (i * 2) as i16, 0);
            world.add_mobile(Box::new(mobile));
        }

        for i in 0..items {
            let serial = world.next_item_serial();
            let mut item = Item::new(serial);
            item.item_id = 0x0E75 + (i % 7) as u16;
            item.amount = 1 + (i % 5) as u16;
            if i % 4 == 0 && mobiles > 0 {
                item.parent = Serial(1 + (i % mobiles) as u32);
            }
            world.add_item(Box::new(item));
        }

        let mut guild = Guild::new(world.next_guild_id());
        guild.name = "Testers".into();
        guild.members = vec![Serial(1)];
        world.add_guild(guild);

        world
    }

    fn body_bytes<E: WorldEntity + ?Sized>(entity: &E) -> Vec<u8> {
        let mut writer = PacketWriter::new(256);
        entity.serialize(&mut writer);
        writer.as_slice().to_vec()
    }

    fn save_load_roundtrip(parallelism: usize, background_flush: bool) {
        let root = temp_root(&format!("rt-{parallelism}-{background_flush}"));
        let world = {
            let mut w = populated_world(300, 700);
            w.begin_save();
            w
        };

        let strategy = SaveStrategy {
            parallelism,
            background_flush,
        };
        let dir = new_generation_dir(&root).unwrap();
        let event = ManualResetEvent::new(false);

        let stats = strategy
            .save(&world, &dir, &page_pool(), &PacketWriterPool::new(), &event)
            .unwrap();
        assert!(event.is_set());
        assert_eq!(stats.mobiles, 300);
        assert_eq!(stats.items, 700);
        assert_eq!(stats.guilds, 1);

        let mut loaded = World::new(TypeRegistry::with_defaults());
        let load_stats = loaded.load(&dir, LoadFailurePolicy::Abort).unwrap();
        assert_eq!(load_stats.mobiles, 300);
        assert_eq!(load_stats.items, 700);
        assert_eq!(load_stats.guilds, 1);

        // Property: every persisted entity re-serializes to identical
        // bytes after the roundtrip.
        for (serial, mobile) in world.mobiles() {
            let reloaded = loaded.find_mobile(*serial).unwrap();
            assert_eq!(body_bytes(reloaded), body_bytes(mobile.as_ref()));
        }
        for (serial, item) in world.items() {
            let reloaded = loaded.find_item(*serial).unwrap();
            assert_eq!(body_bytes(reloaded), body_bytes(item.as_ref()));
        }

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_serial_save_roundtrip() {
        save_load_roundtrip(1, false);
    }

    #[test]
    fn test_parallel_save_roundtrip() {
        save_load_roundtrip(4, true);
    }

    #[test]
    fn test_generation_marker() {
        let root = temp_root("marker");
        let first = new_generation_dir(&root).unwrap();
        repoint_current(&root, &first).unwrap();
        assert_eq!(resolve_current(&root).unwrap(), first);

        let second = new_generation_dir(&root).unwrap();
        assert_ne!(first, second);
        repoint_current(&root, &second).unwrap();
        assert_eq!(resolve_current(&root).unwrap(), second);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_event_barrier() {
        let event = ManualResetEvent::new(false);
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(10)));

        event.set();
        assert!(event.wait_timeout(Duration::from_millis(10)));
        event.wait();

        event.reset();
        assert!(!event.is_set());
    }
}
