//! Exact nearest-neighbour index over enrolled face embeddings.
//!
//! Every slot maps one embedding to one identity key. Slots are never
//! reordered, so equal distances always resolve in insertion order.
//!
//! Mutations (`insert`, `remove_identity`, `remove_slot`, `rebuild`) are
//! serialised by a writer mutex. Searches take the slot table read lock and
//! run concurrently with each other. `rebuild` assembles the compacted table
//! while holding only the read lock and swaps it in under a short write
//! lock, so a search sees either the old table or the new one.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::embedding::{Embedding, Metric};
use crate::error::{Error, Result};

const SNAPSHOT_MAGIC: &[u8; 4] = b"FGIX";
const SNAPSHOT_VERSION: u16 = 1;
const CHECKSUM_LEN: usize = 32;

/// Stable identifier of an index slot. Never reused, survives rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotId(u64);

impl SlotId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dimension: usize,
    pub metric: Metric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: crate::extractor::GRADIENT_HISTOGRAM_DIM,
            metric: Metric::L2,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub slot: SlotId,
    pub identity: String,
    pub distance: f32,
}

struct Slot {
    id: SlotId,
    identity: Arc<str>,
    embedding: Embedding,
    removed: bool,
}

#[derive(Default)]
struct SlotTable {
    slots: Vec<Slot>,
    tombstoned: usize,
}

pub struct SimilarityIndex {
    config: IndexConfig,
    table: RwLock<SlotTable>,
    /// Next slot id. Holding this lock is what makes a caller the writer.
    writer: Mutex<u64>,
}

impl SimilarityIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            table: RwLock::new(SlotTable::default()),
            writer: Mutex::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    /// Live (non-tombstoned) slot count.
    pub fn len(&self) -> usize {
        let table = self.table.read();
        table.slots.len() - table.tombstoned
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots removed but not yet dropped by [`rebuild`](Self::rebuild).
    pub fn tombstoned(&self) -> usize {
        self.table.read().tombstoned
    }

    /// Reject embeddings of the wrong length or with NaN/infinite components.
    pub(crate) fn check_embedding(&self, embedding: &Embedding) -> Result<()> {
        if embedding.dimension() != self.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimension,
                actual: embedding.dimension(),
            });
        }
        if !embedding.is_finite() {
            return Err(Error::NonFiniteEmbedding);
        }
        Ok(())
    }

    pub fn insert(&self, embedding: Embedding, identity: &str) -> Result<SlotId> {
        self.check_embedding(&embedding)?;
        let mut next_id = self.writer.lock();
        let id = SlotId(*next_id);
        *next_id += 1;

        self.table.write().slots.push(Slot {
            id,
            identity: Arc::from(identity),
            embedding,
            removed: false,
        });
        Ok(id)
    }

    /// Up to `k` live slots nearest to `query`, ascending distance, ties in
    /// insertion order.
    pub fn search(&self, query: &Embedding, k: usize) -> Result<Vec<Neighbor>> {
        self.check_embedding(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let table = self.table.read();
        let mut hits = self.ranked(&table, query);
        hits.truncate(k);
        Ok(hits
            .into_iter()
            .map(|(distance, slot)| Neighbor {
                slot: slot.id,
                identity: slot.identity.to_string(),
                distance,
            })
            .collect())
    }

    /// Like [`search`](Self::search), but reports each identity once (its
    /// nearest slot), up to `k` distinct identities.
    pub fn search_identities(&self, query: &Embedding, k: usize) -> Result<Vec<Neighbor>> {
        self.check_embedding(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let table = self.table.read();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(k);
        for (distance, slot) in self.ranked(&table, query) {
            if !seen.insert(&*slot.identity) {
                continue;
            }
            out.push(Neighbor {
                slot: slot.id,
                identity: slot.identity.to_string(),
                distance,
            });
            if out.len() == k {
                break;
            }
        }
        Ok(out)
    }

    fn ranked<'t>(&self, table: &'t SlotTable, query: &Embedding) -> Vec<(f32, &'t Slot)> {
        let metric = self.config.metric;
        let mut hits: Vec<(f32, &Slot)> = table
            .slots
            .iter()
            .filter(|slot| !slot.removed)
            .map(|slot| (metric.distance(query.values(), slot.embedding.values()), slot))
            .collect();
        // Stable sort: equal distances keep slot (insertion) order.
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits
    }

    /// Tombstone every slot of `identity`. Returns how many were live.
    pub fn remove_identity(&self, identity: &str) -> usize {
        let _writer = self.writer.lock();
        let mut table = self.table.write();
        let mut removed = 0;
        for slot in table
            .slots
            .iter_mut()
            .filter(|s| !s.removed && &*s.identity == identity)
        {
            slot.removed = true;
            removed += 1;
        }
        table.tombstoned += removed;
        if removed > 0 {
            tracing::info!(identity, slots = removed, "identity tombstoned");
        }
        removed
    }

    /// Tombstone a single slot. Returns false if it was unknown or already removed.
    pub fn remove_slot(&self, id: SlotId) -> bool {
        let _writer = self.writer.lock();
        let mut table = self.table.write();
        let Some(slot) = table.slots.iter_mut().find(|s| s.id == id && !s.removed) else {
            return false;
        };
        slot.removed = true;
        table.tombstoned += 1;
        true
    }

    /// Drop tombstoned slots: build a compacted table, then swap it in.
    /// Returns the number of live slots.
    pub fn rebuild(&self) -> usize {
        let _writer = self.writer.lock();
        let (fresh, dropped) = {
            let table = self.table.read();
            let slots: Vec<Slot> = table
                .slots
                .iter()
                .filter(|s| !s.removed)
                .map(|s| Slot {
                    id: s.id,
                    identity: Arc::clone(&s.identity),
                    embedding: s.embedding.clone(),
                    removed: false,
                })
                .collect();
            (
                SlotTable {
                    slots,
                    tombstoned: 0,
                },
                table.tombstoned,
            )
        };
        let live = fresh.slots.len();
        *self.table.write() = fresh;
        tracing::info!(live, dropped, "index rebuilt");
        live
    }

    /// Live slots in insertion order.
    pub fn entries(&self) -> Vec<(SlotId, String, Embedding)> {
        self.table
            .read()
            .slots
            .iter()
            .filter(|s| !s.removed)
            .map(|s| (s.id, s.identity.to_string(), s.embedding.clone()))
            .collect()
    }

    /// Write the live slot table to `path`, atomically replacing any previous file.
    pub fn snapshot(&self, path: &Path) -> Result<()> {
        let io_err = |source| Error::Io {
            path: path.to_path_buf(),
            source,
        };
        let bytes = {
            let table = self.table.read();
            encode_snapshot(&self.config, &table)
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        tracing::info!(path = %path.display(), bytes = bytes.len(), "index snapshot written");
        Ok(())
    }

    /// Read a snapshot. The stored dimension and metric must equal `config`'s.
    pub fn load(path: &Path, config: IndexConfig) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let slots = decode_snapshot(&bytes, &config)?;
        let count = slots.len();

        let index = Self::new(config);
        {
            let mut table = index.table.write();
            for (i, (identity, embedding)) in slots.into_iter().enumerate() {
                table.slots.push(Slot {
                    id: SlotId(i as u64),
                    identity: Arc::from(identity.as_str()),
                    embedding,
                    removed: false,
                });
            }
        }
        *index.writer.lock() = count as u64;

        tracing::info!(path = %path.display(), slots = count, "index snapshot loaded");
        Ok(index)
    }
}

// ── Snapshot encoding ─────────────────────────────────────────────────────────

fn encode_snapshot(config: &IndexConfig, table: &SlotTable) -> Vec<u8> {
    let live: Vec<&Slot> = table.slots.iter().filter(|s| !s.removed).collect();

    let mut buf = Vec::with_capacity(32 + live.len() * (8 + config.dimension * 4));
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.push(config.metric.tag());
    buf.extend_from_slice(&(config.dimension as u32).to_le_bytes());
    buf.extend_from_slice(&(live.len() as u64).to_le_bytes());

    for slot in live {
        let key = slot.identity.as_bytes();
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        for v in slot.embedding.values() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(&digest);
    buf
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::CorruptIndex("snapshot truncated".to_string()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

fn decode_snapshot(bytes: &[u8], config: &IndexConfig) -> Result<Vec<(String, Embedding)>> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(Error::CorruptIndex("snapshot truncated".to_string()));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(Error::CorruptIndex("checksum mismatch".to_string()));
    }

    let mut cur = Cursor { buf: body, pos: 0 };
    if cur.take(SNAPSHOT_MAGIC.len())? != SNAPSHOT_MAGIC {
        return Err(Error::CorruptIndex("not an index snapshot".to_string()));
    }
    let version = cur.u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::CorruptIndex(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let metric = Metric::from_tag(cur.u8()?)
        .ok_or_else(|| Error::CorruptIndex("unknown metric tag".to_string()))?;
    if metric != config.metric {
        return Err(Error::CorruptIndex(format!(
            "snapshot metric {metric:?} does not match configured {:?}",
            config.metric
        )));
    }
    let dimension = cur.u32()? as usize;
    if dimension != config.dimension {
        return Err(Error::CorruptIndex(format!(
            "snapshot dimension {dimension} does not match configured {}",
            config.dimension
        )));
    }

    let count = cur.u64()?;
    let mut slots = Vec::new();
    for _ in 0..count {
        let key_len = cur.u32()? as usize;
        let identity = std::str::from_utf8(cur.take(key_len)?)
            .map_err(|_| Error::CorruptIndex("identity key is not UTF-8".to_string()))?
            .to_string();
        let mut values = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            values.push(cur.f32()?);
        }
        slots.push((identity, Embedding::new(values)));
    }
    if cur.pos != body.len() {
        return Err(Error::CorruptIndex("trailing bytes after slots".to_string()));
    }
    Ok(slots)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn config(metric: Metric) -> IndexConfig {
        IndexConfig {
            dimension: DIM,
            metric,
        }
    }

    fn axis(i: usize, scale: f32) -> Embedding {
        let mut v = vec![0.0; DIM];
        v[i] = scale;
        Embedding::new(v)
    }

    fn random(rng: &mut StdRng) -> Embedding {
        Embedding::new((0..DIM).map(|_| rng.gen_range(-1.0..1.0)).collect())
    }

    #[test]
    fn test_insert_rejects_wrong_dimension() {
        let index = SimilarityIndex::new(config(Metric::L2));
        let err = index.insert(Embedding::new(vec![0.0; 3]), "alice").unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: DIM,
                actual: 3
            }
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_non_finite_embeddings_rejected() {
        let index = SimilarityIndex::new(config(Metric::L2));
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let mut v = vec![0.5; DIM];
            v[3] = bad;
            let e = Embedding::new(v);
            assert!(matches!(
                index.insert(e.clone(), "alice"),
                Err(Error::NonFiniteEmbedding)
            ));
            assert!(matches!(index.search(&e, 1), Err(Error::NonFiniteEmbedding)));
        }
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_orders_by_distance_and_caps_k() {
        let index = SimilarityIndex::new(config(Metric::L2));
        let mut rng = StdRng::seed_from_u64(11);
        for i in 0..20 {
            index.insert(random(&mut rng), &format!("id-{i}")).unwrap();
        }
        for k in [0, 1, 5, 20, 50] {
            let hits = index.search(&random(&mut rng), k).unwrap();
            assert_eq!(hits.len(), k.min(20));
            assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let index = SimilarityIndex::new(config(Metric::L2));
        let e = axis(0, 1.0);
        index.insert(e.clone(), "first").unwrap();
        index.insert(e.clone(), "second").unwrap();
        index.insert(e.clone(), "third").unwrap();

        for _ in 0..5 {
            let hits = index.search(&e, 3).unwrap();
            let names: Vec<_> = hits.iter().map(|h| h.identity.as_str()).collect();
            assert_eq!(names, ["first", "second", "third"]);
        }
    }

    #[test]
    fn test_search_empty_index() {
        let index = SimilarityIndex::new(config(Metric::Cosine));
        assert!(index.search(&axis(1, 1.0), 3).unwrap().is_empty());
    }

    #[test]
    fn test_search_identities_dedupes() {
        let index = SimilarityIndex::new(config(Metric::L2));
        index.insert(axis(0, 1.0), "alice").unwrap();
        index.insert(axis(0, 0.9), "alice").unwrap();
        index.insert(axis(0, 0.5), "bob").unwrap();

        let hits = index.search_identities(&axis(0, 1.0), 5).unwrap();
        let names: Vec<_> = hits.iter().map(|h| h.identity.as_str()).collect();
        assert_eq!(names, ["alice", "bob"]);
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_removed_identity_never_returned() {
        let index = SimilarityIndex::new(config(Metric::L2));
        index.insert(axis(0, 1.0), "alice").unwrap();
        index.insert(axis(0, 1.1), "alice").unwrap();
        index.insert(axis(1, 1.0), "bob").unwrap();

        assert_eq!(index.remove_identity("alice"), 2);
        assert_eq!(index.remove_identity("alice"), 0);
        assert_eq!(index.tombstoned(), 2);
        assert!(index
            .search(&axis(0, 1.0), 10)
            .unwrap()
            .iter()
            .all(|h| h.identity != "alice"));

        assert_eq!(index.rebuild(), 1);
        assert_eq!(index.tombstoned(), 0);
        let hits = index.search(&axis(0, 1.0), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity, "bob");
    }

    #[test]
    fn test_slot_ids_survive_rebuild() {
        let index = SimilarityIndex::new(config(Metric::L2));
        let a = index.insert(axis(0, 1.0), "alice").unwrap();
        let b = index.insert(axis(1, 1.0), "bob").unwrap();
        assert!(index.remove_slot(a));
        assert!(!index.remove_slot(a));
        index.rebuild();

        let c = index.insert(axis(2, 1.0), "carol").unwrap();
        assert!(c > b);
        let hits = index.search(&axis(1, 1.0), 1).unwrap();
        assert_eq!(hits[0].slot, b);
    }

    #[test]
    fn test_snapshot_roundtrip_identical_search() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.bin");
        let mut rng = StdRng::seed_from_u64(5);

        let index = SimilarityIndex::new(config(Metric::Cosine));
        for i in 0..12 {
            index.insert(random(&mut rng), &format!("user-{}", i % 4)).unwrap();
        }
        index.remove_identity("user-2");
        index.snapshot(&path).unwrap();

        let loaded = SimilarityIndex::load(&path, config(Metric::Cosine)).unwrap();
        assert_eq!(loaded.len(), index.len());
        for _ in 0..10 {
            let query = random(&mut rng);
            let a: Vec<_> = index
                .search(&query, 5)
                .unwrap()
                .into_iter()
                .map(|h| (h.identity, h.distance.to_bits()))
                .collect();
            let b: Vec<_> = loaded
                .search(&query, 5)
                .unwrap()
                .into_iter()
                .map(|h| (h.identity, h.distance.to_bits()))
                .collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_load_rejects_dimension_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.bin");
        let index = SimilarityIndex::new(config(Metric::L2));
        index.insert(axis(0, 1.0), "alice").unwrap();
        index.snapshot(&path).unwrap();

        let wrong = IndexConfig {
            dimension: DIM * 2,
            metric: Metric::L2,
        };
        let err = SimilarityIndex::load(&path, wrong).err().unwrap();
        assert!(matches!(err, Error::CorruptIndex(_)));

        let err = SimilarityIndex::load(&path, config(Metric::Cosine)).err().unwrap();
        assert!(matches!(err, Error::CorruptIndex(_)));
    }

    #[test]
    fn test_load_rejects_tampered_and_truncated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.bin");
        let index = SimilarityIndex::new(config(Metric::L2));
        index.insert(axis(3, 0.25), "alice").unwrap();
        index.snapshot(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[20] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        let err = SimilarityIndex::load(&path, config(Metric::L2)).err().unwrap();
        assert!(matches!(err, Error::CorruptIndex(_)));

        fs::write(&path, b"FGIX").unwrap();
        let err = SimilarityIndex::load(&path, config(Metric::L2)).err().unwrap();
        assert!(matches!(err, Error::CorruptIndex(_)));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = SimilarityIndex::load(&tmp.path().join("nope.bin"), config(Metric::L2))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_loaded_index_continues_slot_ids() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.bin");
        let index = SimilarityIndex::new(config(Metric::L2));
        index.insert(axis(0, 1.0), "alice").unwrap();
        index.insert(axis(1, 1.0), "bob").unwrap();
        index.snapshot(&path).unwrap();

        let loaded = SimilarityIndex::load(&path, config(Metric::L2)).unwrap();
        let next = loaded.insert(axis(2, 1.0), "carol").unwrap();
        assert_eq!(next.get(), 2);
    }

    #[test]
    fn test_concurrent_search_during_writes() {
        let index = Arc::new(SimilarityIndex::new(config(Metric::L2)));
        for i in 0..DIM {
            index.insert(axis(i, 1.0), "seed").unwrap();
        }

        std::thread::scope(|s| {
            for t in 0..4 {
                let index = Arc::clone(&index);
                s.spawn(move || {
                    for i in 0..50 {
                        index.insert(axis((t + i) % DIM, 0.5), &format!("w{t}")).unwrap();
                        if i % 10 == 0 {
                            index.remove_identity(&format!("w{t}"));
                            index.rebuild();
                        }
                    }
                });
            }
            for _ in 0..4 {
                let index = Arc::clone(&index);
                s.spawn(move || {
                    for i in 0..200 {
                        let hits = index.search(&axis(i % DIM, 1.0), 4).unwrap();
                        assert!(hits.len() <= 4);
                        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
                    }
                });
            }
        });

        // Each writer's last purge is at i = 40, leaving inserts 41..49.
        index.rebuild();
        assert_eq!(index.tombstoned(), 0);
        assert_eq!(index.len(), DIM + 4 * 9);
    }
}
