use anyhow::Result;
use memmap2::{MmapMut, MmapOptions};
use sha2::{Digest, Sha256};
use std::sync::atomic::AtomicU32;

/// Contiguous anonymously-mapped memory backing a table.
///
/// The mapping never moves for the lifetime of the process, so a byte offset
/// from the base is a stable identity for a slot and transfers directly to a
/// peer holding an identically laid-out region.
pub struct Region {
    mm: MmapMut,
}

impl Region {
    pub fn new(len: usize) -> Result<Self> {
        anyhow::ensure!(len > 0, "region length must be positive");
        let mm = MmapOptions::new().len(len).map_anon()?;
        Ok(Self { mm })
    }

    pub fn len(&self) -> usize {
        self.mm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mm.len() == 0
    }

    /// Base address of the mapping, as exchanged in a channel descriptor.
    pub fn base_addr(&self) -> u64 {
        self.mm.as_ptr() as u64
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.mm.len());
        unsafe { (self.mm.as_ptr() as *mut u8).add(offset) }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.mm.len());
        unsafe { std::ptr::read_volatile(self.ptr(offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, val: u32) {
        assert!(offset + 4 <= self.mm.len());
        unsafe { std::ptr::write_volatile(self.ptr(offset) as *mut u32, val) }
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    pub fn write_i32(&self, offset: usize, val: i32) {
        self.write_u32(offset, val as u32)
    }

    /// View an aligned u32 cell as an atomic. Link fields are read and
    /// written through this so a traversal racing a splice stays defined.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.mm.len());
        assert!(offset % 4 == 0);
        unsafe { &*(self.ptr(offset) as *const AtomicU32) }
    }

    /// Copy foreign bytes into the region, as a remote write lands them.
    pub fn copy_in(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.mm.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(offset), bytes.len());
        }
    }

    pub fn copy_out(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.mm.len());
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(offset), buf.as_mut_ptr(), len);
        }
        buf
    }

    /// SHA-256 over the whole region. Two replicas that have fully applied
    /// the same patches hash identically; a mismatch means divergence.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.mm[..]);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_round_trip() {
        let r = Region::new(64).unwrap();
        r.write_u32(0, 7);
        r.write_i32(4, -3);
        assert_eq!(r.read_u32(0), 7);
        assert_eq!(r.read_i32(4), -3);
    }

    #[test]
    fn copy_in_matches_copy_out() {
        let r = Region::new(32).unwrap();
        r.copy_in(8, &[1, 2, 3, 4]);
        assert_eq!(r.copy_out(8, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn hash_tracks_content() {
        let a = Region::new(128).unwrap();
        let b = Region::new(128).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        a.write_u32(0, 1);
        assert_ne!(a.content_hash(), b.content_hash());
        b.copy_in(0, &a.copy_out(0, 4));
        assert_eq!(a.content_hash(), b.content_hash());
    }
}
