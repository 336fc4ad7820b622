//! Stable 32-bit hash of names
//!
//! Lookup tables are consulted from other processes after the file is
//! mapped, so the hash must not depend on per-process state. `FxHasher`
//! has no random seed. Its output may change between releases of
//! `rustc-hash`, which the build identity check on load already covers.

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Hash of `data` under `seed`, folded to 32 bits. Tables use seed 0.
pub fn stable_hash32(seed: u64, data: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(data);
    hasher.write_usize(data.len());
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_and_seed_dependent() {
        let name = b"java/lang/String.hashCode()I";
        assert_eq!(stable_hash32(0, name), stable_hash32(0, name));
        assert_ne!(stable_hash32(0, name), stable_hash32(1, name));
        assert_ne!(stable_hash32(0, b"java/lang/String.length()I"), stable_hash32(0, name));
    }

    #[test]
    fn test_same_in_every_thread() {
        let name = b"app/Main.run()V";
        let here = stable_hash32(0, name);
        let there = std::thread::spawn(move || stable_hash32(0, name)).join().unwrap();
        assert_eq!(here, there);
    }

    #[test]
    fn test_prefixes_differ() {
        let hashes: Vec<u32> = (0..9).map(|n| stable_hash32(0, &b"abcdefgh"[..n])).collect();
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j], "{} vs {}", i, j);
            }
        }
    }
}
