// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Flow hash functions used by hash routing.

use crate::flow::{FlowKey, FLOW_KEY_BYTES};
use rand_core::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};

/// Maps a salted flow key to a 64-bit value. Routers salt with one of their
/// own addresses so that different switches hash the same flow differently.
pub trait HashFunction {
    fn hash(&mut self, salt: u32, key: &FlowKey) -> u64;

    /// Whether the same input always gives the same output, i.e. whether the
    /// function preserves flow affinity.
    fn is_deterministic(&self) -> bool;
}

/// Selects a hash function in configuration files.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum HashKind {
    /// Deterministic Hsieh "SuperFastHash" over the salt and the flow key.
    Hsieh,
    /// Uniform random value per call; sprays packets of a flow over all
    /// uplinks.
    Random,
}

impl Default for HashKind {
    fn default() -> Self {
        HashKind::Hsieh
    }
}

impl HashKind {
    pub fn build(self, seed: u64) -> Box<dyn HashFunction> {
        match self {
            HashKind::Hsieh => Box::new(HsiehHash),
            HashKind::Random => Box::new(RandomHash::seed_from_u64(seed)),
        }
    }
}

/// Paul Hsieh's SuperFastHash.
pub fn super_fast_hash(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let get16 = |d: &[u8]| -> u32 { (u32::from(d[1]) << 8) + u32::from(d[0]) };
    let mut hash = data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        hash = hash.wrapping_add(get16(&chunk[0..2]));
        let tmp = (get16(&chunk[2..4]) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }
    let rem = chunks.remainder();
    match rem.len() {
        3 => {
            hash = hash.wrapping_add(get16(rem));
            hash ^= hash << 16;
            hash ^= ((rem[2] as i8) as i32 as u32) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(get16(rem));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add((rem[0] as i8) as i32 as u32);
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }
    // Force "avalanching" of final 127 bits.
    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);
    hash
}

#[derive(Copy, Clone, Debug, Default)]
pub struct HsiehHash;

impl HashFunction for HsiehHash {
    fn hash(&mut self, salt: u32, key: &FlowKey) -> u64 {
        let mut data = [0u8; 4 + FLOW_KEY_BYTES];
        data[..4].copy_from_slice(&salt.to_be_bytes());
        data[4..].copy_from_slice(&key.to_bytes());
        u64::from(super_fast_hash(&data))
    }

    fn is_deterministic(&self) -> bool {
        true
    }
}

/// Ignores its input and returns a uniformly random value.
#[derive(Clone, Debug)]
pub struct RandomHash {
    rng: Xoshiro256StarStar,
}

impl RandomHash {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: Xoshiro256StarStar::seed_from_u64(seed),
        }
    }
}

impl HashFunction for RandomHash {
    fn hash(&mut self, _salt: u32, _key: &FlowKey) -> u64 {
        self.rng.next_u64()
    }

    fn is_deterministic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PROTO_UDP;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 2, 4, 3),
            PROTO_UDP,
            port,
            5000,
        )
    }

    #[test]
    fn test_super_fast_hash_vectors() {
        assert_eq!(super_fast_hash(b""), 0);
        assert_eq!(super_fast_hash(b"a"), 0x115E_A782);
        assert_eq!(super_fast_hash(b"ab"), 0x516B_8B44);
        assert_eq!(super_fast_hash(b"abc"), 0xD2BE_198A);
        assert_eq!(super_fast_hash(b"abcd"), 0xDAD8_B8DB);
    }

    #[test]
    fn test_hsieh_is_stable_per_salt() {
        let mut h = HsiehHash;
        let a = h.hash(0x0A00_0201, &key(1));
        assert_eq!(a, h.hash(0x0A00_0201, &key(1)));
        assert!(a <= u64::from(u32::MAX));
        assert_ne!(a, h.hash(0x0A00_0202, &key(1)));
        assert_ne!(a, h.hash(0x0A00_0201, &key(2)));
        assert!(h.is_deterministic());
    }

    #[test]
    fn test_hsieh_spreads_flows() {
        let mut h = HsiehHash;
        let buckets: HashSet<u64> = (0..64).map(|p| h.hash(7, &key(p)) % 4).collect();
        assert_eq!(buckets.len(), 4);
    }

    #[test]
    fn test_random_hash_is_seeded() {
        let mut a = RandomHash::seed_from_u64(42);
        let mut b = RandomHash::seed_from_u64(42);
        let xs: Vec<u64> = (0..8).map(|_| a.hash(1, &key(1))).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.hash(1, &key(1))).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().collect::<HashSet<_>>().len() > 1);
        assert!(!a.is_deterministic());
    }

    #[test]
    fn test_hash_kind_build() {
        assert!(HashKind::Hsieh.build(0).is_deterministic());
        assert!(!HashKind::Random.build(0).is_deterministic());
        assert_eq!(HashKind::default(), HashKind::Hsieh);
    }
}
