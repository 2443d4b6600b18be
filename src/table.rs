//! Remote-writable hash tables.
//!
//! Both variants live in one contiguous [`Region`] of fixed-width slots, so
//! every mutation can be described as byte ranges (`Patch`) that transfer
//! verbatim to an identically laid-out peer region. Slots never move; a
//! slot's offset from the region base is its replication identity.

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::region::Region;

pub type Key = u8;
pub type Value = i32;

/// Number of representable keys.
pub const KEY_SPACE: usize = 256;

/// End-of-chain marker for link fields.
pub const NIL: u32 = u32::MAX;

/// Default slot width in bytes. Must hold the three u32-sized fields; the
/// tail is padding, configurable for wider strides.
pub const DEFAULT_SLOT_WIDTH: usize = 16;
const MIN_SLOT_WIDTH: usize = 12;

const KEY_OFF: usize = 0;
const VAL_OFF: usize = 4;
const NEXT_OFF: usize = 8;

// Array-variant field offsets.
const OCC_OFF: usize = 0;
const AKEY_OFF: usize = 4;
const AVAL_OFF: usize = 8;

/// A changed byte range to mirror to every backup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    pub offset: usize,
    pub len: usize,
}

/// Byproduct of a successful put.
///
/// `slot` covers the written element. For an insertion `link` additionally
/// covers the predecessor's next field; it must be pushed only after `slot`
/// has landed, so no reader ever follows a link to half-written bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub update: bool,
    pub slot: Patch,
    pub link: Option<Patch>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored(Mutation),
    Full,
}

/// Capability interface shared by both table variants.
pub trait Table: Send + Sync {
    fn get(&self, key: Key) -> Option<Value>;
    fn put(&self, key: Key, value: Value) -> Result<PutOutcome>;
    /// Contractually defined and intentionally unimplemented; invoking it is
    /// a programming error.
    fn delete(&self, key: Key) -> Result<Mutation>;
    /// Number of live slots.
    fn occupied(&self) -> usize;
    fn region(&self) -> &Region;
}

fn check_geometry(bucket_count: usize, width: usize) -> Result<()> {
    anyhow::ensure!(
        bucket_count > 0 && bucket_count < KEY_SPACE,
        "bucket count {} outside 1..{}",
        bucket_count,
        KEY_SPACE
    );
    anyhow::ensure!(
        width >= MIN_SLOT_WIDTH && width % 4 == 0,
        "slot width {} must be a multiple of 4 and at least {}",
        width,
        MIN_SLOT_WIDTH
    );
    Ok(())
}

/// Chained variant: one dummy head per bucket plus one free-list dummy head,
/// all resident in the region. Links are element indices relative to the
/// region base, never native pointers, so a peer with its own mapping can
/// interpret them.
pub struct LinkedTable {
    region: Arc<Region>,
    bucket_count: usize,
    element_count: usize,
    width: usize,
}

impl LinkedTable {
    pub fn create(bucket_count: usize, element_count: usize) -> Result<Self> {
        Self::create_with_width(bucket_count, element_count, DEFAULT_SLOT_WIDTH)
    }

    pub fn create_with_width(
        bucket_count: usize,
        element_count: usize,
        width: usize,
    ) -> Result<Self> {
        check_geometry(bucket_count, width)?;
        anyhow::ensure!(element_count > 0, "element count must be positive");

        let slots = element_count + bucket_count + 1;
        let region = Arc::new(Region::new(slots * width)?);
        let table = Self {
            region,
            bucket_count,
            element_count,
            width,
        };

        // Thread all data slots onto the free list; bucket heads start empty.
        for i in 0..element_count {
            let next = if i + 1 < element_count {
                (i + 1) as u32
            } else {
                NIL
            };
            table.store_next(i, next);
        }
        for b in 0..bucket_count {
            table.store_next(element_count + b, NIL);
        }
        table.store_next(table.free_head(), 0);

        Ok(table)
    }

    /// Deterministic pre-population: every key in the domain maps to itself.
    /// Patches are discarded; this runs before any channel exists.
    pub fn preload(&self) -> Result<()> {
        for k in 0..KEY_SPACE {
            let _ = self.put(k as Key, k as Value)?;
        }
        Ok(())
    }

    pub fn shared_region(&self) -> Arc<Region> {
        Arc::clone(&self.region)
    }

    fn slot_offset(&self, idx: usize) -> usize {
        idx * self.width
    }

    fn bucket_head(&self, key: Key) -> usize {
        self.element_count + (key as usize % self.bucket_count)
    }

    fn free_head(&self) -> usize {
        self.element_count + self.bucket_count
    }

    /// Re-resolve a link field from region bytes. Backups' link cells are
    /// foreign-written, so this is re-read on every traversal step rather
    /// than cached.
    fn load_next(&self, idx: usize) -> u32 {
        self.region
            .atomic_u32(self.slot_offset(idx) + NEXT_OFF)
            .load(Ordering::Acquire)
    }

    fn store_next(&self, idx: usize, next: u32) {
        self.region
            .atomic_u32(self.slot_offset(idx) + NEXT_OFF)
            .store(next, Ordering::Release);
    }

    fn cas_next(&self, idx: usize, current: u32, new: u32) -> std::result::Result<u32, u32> {
        self.region
            .atomic_u32(self.slot_offset(idx) + NEXT_OFF)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// A link is followable only when it lands inside the data slots. A
    /// mid-patch foreign value reads as end-of-chain instead of a crash.
    fn data_index(&self, link: u32) -> Option<usize> {
        let idx = link as usize;
        (link != NIL && idx < self.element_count).then_some(idx)
    }

    fn read_key(&self, idx: usize) -> u32 {
        self.region.read_u32(self.slot_offset(idx) + KEY_OFF)
    }

    fn read_value(&self, idx: usize) -> Value {
        self.region.read_i32(self.slot_offset(idx) + VAL_OFF)
    }

    /// Pop one element off the free list. CAS keeps concurrent pops for
    /// different keys sound; the list only ever shrinks (no delete), so
    /// there is no ABA window.
    fn alloc(&self) -> Option<usize> {
        loop {
            let top = self.load_next(self.free_head());
            let idx = self.data_index(top)?;
            let next = self.load_next(idx);
            if self.cas_next(self.free_head(), top, next).is_ok() {
                return Some(idx);
            }
        }
    }
}

impl Table for LinkedTable {
    fn get(&self, key: Key) -> Option<Value> {
        let mut cur = self.load_next(self.bucket_head(key));
        let mut steps = 0;
        while let Some(idx) = self.data_index(cur) {
            if self.read_key(idx) == key as u32 {
                return Some(self.read_value(idx));
            }
            cur = self.load_next(idx);
            steps += 1;
            if steps > self.element_count {
                break; // corrupt chain; treat as miss
            }
        }
        None
    }

    fn put(&self, key: Key, value: Value) -> Result<PutOutcome> {
        let head = self.bucket_head(key);

        let mut tail = head;
        let mut cur = self.load_next(head);
        let mut steps = 0;
        while let Some(idx) = self.data_index(cur) {
            if self.read_key(idx) == key as u32 {
                self.region.write_i32(self.slot_offset(idx) + VAL_OFF, value);
                return Ok(PutOutcome::Stored(Mutation {
                    update: true,
                    slot: Patch {
                        offset: self.slot_offset(idx),
                        len: self.width,
                    },
                    link: None,
                }));
            }
            tail = idx;
            cur = self.load_next(idx);
            steps += 1;
            anyhow::ensure!(steps <= self.element_count, "bucket chain exceeds capacity");
        }

        let Some(elem) = self.alloc() else {
            return Ok(PutOutcome::Full);
        };

        // Content first: key, value, cleared link. The element is not yet
        // reachable from the bucket head.
        let eoff = self.slot_offset(elem);
        self.store_next(elem, NIL);
        self.region.write_u32(eoff + KEY_OFF, key as u32);
        self.region.write_i32(eoff + VAL_OFF, value);

        // Splice onto the tail. A concurrent different-key insertion into
        // the same bucket can win the tail; chase the chain and retry.
        let mut splice = tail;
        loop {
            match self.cas_next(splice, NIL, elem as u32) {
                Ok(_) => break,
                Err(actual) => {
                    let mut idx = match self.data_index(actual) {
                        Some(i) => i,
                        None => anyhow::bail!("bucket tail link corrupted"),
                    };
                    while let Some(n) = self.data_index(self.load_next(idx)) {
                        idx = n;
                    }
                    splice = idx;
                }
            }
        }

        Ok(PutOutcome::Stored(Mutation {
            update: false,
            slot: Patch {
                offset: eoff,
                len: self.width,
            },
            link: Some(Patch {
                offset: self.slot_offset(splice) + NEXT_OFF,
                len: 4,
            }),
        }))
    }

    fn delete(&self, key: Key) -> Result<Mutation> {
        anyhow::bail!("delete is not implemented for key {key}: removal is unsupported");
    }

    fn occupied(&self) -> usize {
        let mut count = 0;
        for b in 0..self.bucket_count {
            let mut cur = self.load_next(self.element_count + b);
            let mut steps = 0;
            while let Some(idx) = self.data_index(cur) {
                count += 1;
                cur = self.load_next(idx);
                steps += 1;
                if steps > self.element_count {
                    break;
                }
            }
        }
        count
    }

    fn region(&self) -> &Region {
        &self.region
    }
}

/// Array variant: fixed-size rows, linear scan, first empty column wins.
/// No linked structure and no free list; a put reports exactly one patch.
pub struct ArrayTable {
    region: Arc<Region>,
    bucket_count: usize,
    bucket_capacity: usize,
    width: usize,
}

impl ArrayTable {
    pub fn create(bucket_count: usize, bucket_capacity: usize) -> Result<Self> {
        Self::create_with_width(bucket_count, bucket_capacity, MIN_SLOT_WIDTH)
    }

    pub fn create_with_width(
        bucket_count: usize,
        bucket_capacity: usize,
        width: usize,
    ) -> Result<Self> {
        check_geometry(bucket_count, width)?;
        anyhow::ensure!(bucket_capacity > 0, "bucket capacity must be positive");

        let slots = bucket_count * bucket_capacity;
        let region = Arc::new(Region::new(slots * width)?);
        Ok(Self {
            region,
            bucket_count,
            bucket_capacity,
            width,
        })
    }

    pub fn preload(&self) -> Result<()> {
        for k in 0..KEY_SPACE {
            let _ = self.put(k as Key, k as Value)?;
        }
        Ok(())
    }

    pub fn shared_region(&self) -> Arc<Region> {
        Arc::clone(&self.region)
    }

    fn slot_offset(&self, row: usize, col: usize) -> usize {
        (row * self.bucket_capacity + col) * self.width
    }

    fn row(&self, key: Key) -> usize {
        key as usize % self.bucket_count
    }
}

impl Table for ArrayTable {
    fn get(&self, key: Key) -> Option<Value> {
        let row = self.row(key);
        for col in 0..self.bucket_capacity {
            let off = self.slot_offset(row, col);
            if self.region.read_u32(off + OCC_OFF) == 0 {
                break; // occupancy is a prefix of the row
            }
            if self.region.read_u32(off + AKEY_OFF) == key as u32 {
                return Some(self.region.read_i32(off + AVAL_OFF));
            }
        }
        None
    }

    fn put(&self, key: Key, value: Value) -> Result<PutOutcome> {
        let row = self.row(key);
        for col in 0..self.bucket_capacity {
            let off = self.slot_offset(row, col);
            let occupied = self.region.read_u32(off + OCC_OFF) != 0;
            if occupied {
                if self.region.read_u32(off + AKEY_OFF) == key as u32 {
                    self.region.write_i32(off + AVAL_OFF, value);
                    return Ok(PutOutcome::Stored(Mutation {
                        update: true,
                        slot: Patch {
                            offset: off,
                            len: self.width,
                        },
                        link: None,
                    }));
                }
                continue;
            }
            self.region.write_u32(off + AKEY_OFF, key as u32);
            self.region.write_i32(off + AVAL_OFF, value);
            self.region.write_u32(off + OCC_OFF, 1);
            return Ok(PutOutcome::Stored(Mutation {
                update: false,
                slot: Patch {
                    offset: off,
                    len: self.width,
                },
                link: None,
            }));
        }
        Ok(PutOutcome::Full)
    }

    fn delete(&self, key: Key) -> Result<Mutation> {
        anyhow::bail!("delete is not implemented for key {key}: removal is unsupported");
    }

    fn occupied(&self) -> usize {
        let mut count = 0;
        for row in 0..self.bucket_count {
            for col in 0..self.bucket_capacity {
                if self.region.read_u32(self.slot_offset(row, col) + OCC_OFF) != 0 {
                    count += 1;
                } else {
                    break;
                }
            }
        }
        count
    }

    fn region(&self) -> &Region {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(src: &Region, dst: &Region, patch: Patch) {
        dst.copy_in(patch.offset, &src.copy_out(patch.offset, patch.len));
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(LinkedTable::create(0, 10).is_err());
        assert!(LinkedTable::create(KEY_SPACE, 10).is_err());
        assert!(LinkedTable::create(8, 0).is_err());
        assert!(LinkedTable::create_with_width(8, 10, 8).is_err());
        assert!(LinkedTable::create_with_width(8, 10, 14).is_err());
        assert!(ArrayTable::create(0, 10).is_err());
        assert!(ArrayTable::create(10, 0).is_err());
    }

    #[test]
    fn put_then_get_round_trips() {
        let t = LinkedTable::create(32, 1000).unwrap();
        for k in [0u8, 5, 31, 32, 255] {
            assert_eq!(t.get(k), None);
            let outcome = t.put(k, k as i32 * 3).unwrap();
            assert!(matches!(outcome, PutOutcome::Stored(m) if !m.update));
            assert_eq!(t.get(k), Some(k as i32 * 3));
        }
    }

    #[test]
    fn chained_scenario_patch_counts() {
        // 32 buckets, capacity 1000: first put of a key is an insertion with
        // two patches, the second an update with one, same slot offset.
        let t = LinkedTable::create(32, 1000).unwrap();

        let first = match t.put(5, 10).unwrap() {
            PutOutcome::Stored(m) => m,
            PutOutcome::Full => panic!("empty table reported full"),
        };
        assert!(!first.update);
        assert!(first.link.is_some());

        let second = match t.put(5, 10).unwrap() {
            PutOutcome::Stored(m) => m,
            PutOutcome::Full => panic!("update reported full"),
        };
        assert!(second.update);
        assert!(second.link.is_none());
        assert_eq!(second.slot.offset, first.slot.offset);

        assert_eq!(t.get(5), Some(10));
    }

    #[test]
    fn update_keeps_occupancy_insert_grows_it() {
        let t = LinkedTable::create(8, 64).unwrap();
        t.put(1, 100).unwrap();
        t.put(2, 200).unwrap();
        assert_eq!(t.occupied(), 2);

        t.put(1, 101).unwrap();
        assert_eq!(t.occupied(), 2);
        assert_eq!(t.get(1), Some(101));

        t.put(3, 300).unwrap();
        assert_eq!(t.occupied(), 3);
    }

    #[test]
    fn full_after_capacity_distinct_keys() {
        let t = LinkedTable::create(4, 8).unwrap();
        for k in 0..8u8 {
            assert!(matches!(t.put(k, 1).unwrap(), PutOutcome::Stored(_)));
        }
        assert_eq!(t.put(8, 1).unwrap(), PutOutcome::Full);
        // Updating a present key still succeeds when full.
        assert!(matches!(
            t.put(3, 42).unwrap(),
            PutOutcome::Stored(m) if m.update
        ));
        assert_eq!(t.get(3), Some(42));
        assert_eq!(t.occupied(), 8);
    }

    #[test]
    fn array_scenario_row_fills_before_global_capacity() {
        // 10 buckets x 20 columns: 20 keys congruent mod 10 fill one row;
        // the 21st reports Full although 180 slots remain elsewhere.
        let t = ArrayTable::create(10, 20).unwrap();
        for i in 0..20u32 {
            let key = (3 + 10 * i) as Key;
            assert!(matches!(t.put(key, 1).unwrap(), PutOutcome::Stored(_)));
        }
        assert_eq!(t.occupied(), 20);
        assert_eq!(t.put(203u32 as Key, 1).unwrap(), PutOutcome::Full);
        assert!(matches!(
            t.put(3, 9).unwrap(),
            PutOutcome::Stored(m) if m.update
        ));
        // An unrelated bucket still accepts insertions.
        assert!(matches!(t.put(4, 1).unwrap(), PutOutcome::Stored(m) if !m.update));
    }

    #[test]
    fn array_put_reports_single_slot_patch() {
        let t = ArrayTable::create(10, 4).unwrap();
        let m = match t.put(7, 70).unwrap() {
            PutOutcome::Stored(m) => m,
            PutOutcome::Full => panic!("empty table reported full"),
        };
        assert!(m.link.is_none());
        assert_eq!(m.slot.len, MIN_SLOT_WIDTH);
    }

    #[test]
    fn insertion_patches_apply_in_order_on_a_mirror() {
        let primary = LinkedTable::create(32, 100).unwrap();
        let backup = LinkedTable::create(32, 100).unwrap();
        assert_eq!(
            primary.region().content_hash(),
            backup.region().content_hash()
        );

        let m = match primary.put(5, 10).unwrap() {
            PutOutcome::Stored(m) => m,
            PutOutcome::Full => panic!("empty table reported full"),
        };
        let link = m.link.expect("insertion must carry a link patch");

        // Content alone leaves the element unreachable from any bucket head.
        apply(primary.region(), backup.region(), m.slot);
        assert_eq!(backup.get(5), None);

        apply(primary.region(), backup.region(), link);
        assert_eq!(backup.get(5), Some(10));

        // An update needs only its single patch to converge.
        let m2 = match primary.put(5, 11).unwrap() {
            PutOutcome::Stored(m) => m,
            PutOutcome::Full => panic!("update reported full"),
        };
        apply(primary.region(), backup.region(), m2.slot);
        assert_eq!(backup.get(5), Some(11));
    }

    #[test]
    fn free_head_is_outside_every_patch() {
        let t = LinkedTable::create(8, 16).unwrap();
        let free_head_off = t.slot_offset(t.free_head());
        for k in 0..16u8 {
            if let PutOutcome::Stored(m) = t.put(k, 1).unwrap() {
                for p in std::iter::once(m.slot).chain(m.link) {
                    assert!(
                        p.offset + p.len <= free_head_off,
                        "patch {p:?} covers the free-list head"
                    );
                }
            }
        }
    }

    #[test]
    fn concurrent_distinct_key_inserts_all_land() {
        let t = Arc::new(LinkedTable::create(4, 64).unwrap());
        let a = Arc::clone(&t);
        let b = Arc::clone(&t);
        let ha = std::thread::spawn(move || {
            for k in 0..32u8 {
                a.put(k, k as i32).unwrap();
            }
        });
        let hb = std::thread::spawn(move || {
            for k in 32..64u8 {
                b.put(k, k as i32).unwrap();
            }
        });
        ha.join().unwrap();
        hb.join().unwrap();
        assert_eq!(t.occupied(), 64);
        for k in 0..64u8 {
            assert_eq!(t.get(k), Some(k as i32));
        }
    }

    #[test]
    fn delete_is_a_contract_violation() {
        let t = LinkedTable::create(8, 8).unwrap();
        t.put(1, 1).unwrap();
        assert!(t.delete(1).is_err());
        assert_eq!(t.get(1), Some(1));

        let a = ArrayTable::create(8, 8).unwrap();
        assert!(a.delete(1).is_err());
    }

    #[test]
    fn preload_maps_every_key_to_itself() {
        let t = LinkedTable::create(32, 512).unwrap();
        t.preload().unwrap();
        assert_eq!(t.occupied(), KEY_SPACE);
        assert_eq!(t.get(0), Some(0));
        assert_eq!(t.get(255), Some(255));
    }
}
