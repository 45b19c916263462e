//! Two-party distributed point function over physical row indices
//!
//! A [`QueryPair`] secret-shares the point function that is `payload` at the
//! target row and zero everywhere else. Each key evaluates, per row, to:
//! - a data share; the XOR of both parties' shares is the payload at the
//!   target and all-zero elsewhere
//! - a position tag in [`Fp`]; the sum of both parties' tags is one at the
//!   target and zero elsewhere (this vector is what the audit checks)
//!
//! Keys cover the index domain `[0, domain_size)` fixed at generation time.
//! Indices past the domain evaluate to zero for both parties, so rows added
//! after the client's snapshot are never touched by that write.
//!
//! Key layout:
//! ```text
//! version u8 | party u8 | depth u8 | domain_size u32 | data_size u32 | root [16]
//! depth x (seed_cw [16] | t_cw u8)
//! tag_cw [16] | data_cw [data_size]
//! ```

use rand::RngCore;
use tiny_keccak::{Hasher, Keccak, Shake};

use crate::field::Fp;
use crate::{Error, Result, RowAddress, VirtualKey};

const KEY_VERSION: u8 = 1;

/// Deepest supported tree (the index domain is u32)
pub const MAX_DEPTH: u8 = 32;

const SEED_LEN: usize = 16;
const LEVEL_LEN: usize = SEED_LEN + 1;
const HEADER_LEN: usize = 3 + 4 + 4 + SEED_LEN;

const PRG_DOMAIN: &[u8] = b"mailbox/dpf/prg";
const TAG_DOMAIN: &[u8] = b"mailbox/dpf/tag";
const DATA_DOMAIN: &[u8] = b"mailbox/dpf/data";
const ADDRESS_DOMAIN: &[u8] = b"mailbox/row-address";

type Seed = [u8; SEED_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LevelCorrection {
    pub(crate) seed: Seed,
    t_left: bool,
    t_right: bool,
}

/// One party's DPF key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpfKey {
    party: u8,
    depth: u8,
    domain_size: u32,
    data_size: u32,
    root: Seed,
    pub(crate) levels: Vec<LevelCorrection>,
    pub(crate) tag_correction: Fp,
    data_correction: Vec<u8>,
}

/// Both keys of a write: `a` goes to the leader, `b` to the follower
#[derive(Debug, Clone)]
pub struct QueryPair {
    pub a: DpfKey,
    pub b: DpfKey,
}

/// Output of evaluating a key at one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub tag: Fp,
    pub share: Vec<u8>,
}

/// Tree depth needed to address `domain_size` rows
pub fn depth_for(domain_size: u32) -> u8 {
    let max_index = domain_size.saturating_sub(1);
    ((32 - max_index.leading_zeros()) as u8).max(1)
}

/// Encoded key size for the given depth and payload size
pub fn query_size(depth: u8, data_size: u32) -> usize {
    HEADER_LEN + LEVEL_LEN * depth as usize + Fp::BYTES + data_size as usize
}

/// Derive the 16-byte address of a row from its virtual key
pub fn row_address(key: &VirtualKey) -> RowAddress {
    let mut digest = [0u8; 32];
    let mut hasher = Keccak::v256();
    hasher.update(ADDRESS_DOMAIN);
    hasher.update(key);
    hasher.finalize(&mut digest);

    let mut address = [0u8; 16];
    address.copy_from_slice(&digest[..16]);
    address
}

/// Generate a key pair writing `payload` at `target` in a table of `row_count` rows
///
/// Payloads shorter than `data_size` are zero-extended.
pub fn generate_query_pair<R: RngCore + ?Sized>(
    target: u32,
    payload: &[u8],
    row_count: u32,
    data_size: u32,
    rng: &mut R,
) -> Result<QueryPair> {
    if row_count == 0 || target >= row_count {
        return Err(Error::IndexOutOfBounds {
            index: target as u64,
            max: row_count as u64,
        });
    }
    if payload.len() > data_size as usize {
        return Err(Error::SizeMismatch {
            what: "payload",
            expected: data_size as usize,
            actual: payload.len(),
        });
    }

    let depth = depth_for(row_count);
    let mut root0 = [0u8; SEED_LEN];
    let mut root1 = [0u8; SEED_LEN];
    rng.fill_bytes(&mut root0);
    rng.fill_bytes(&mut root1);

    let (mut s0, mut s1) = (root0, root1);
    let (mut t0, mut t1) = (false, true);
    let mut levels = Vec::with_capacity(depth as usize);

    for level in 0..depth {
        let bit = index_bit(target as u64, depth, level);
        let (l0, tl0, r0, tr0) = expand(&s0);
        let (l1, tl1, r1, tr1) = expand(&s1);

        let (keep0, keep1, lose0, lose1) = if bit {
            (r0, r1, l0, l1)
        } else {
            (l0, l1, r0, r1)
        };

        let correction = LevelCorrection {
            seed: xor_seed(&lose0, &lose1),
            t_left: tl0 ^ tl1 ^ bit ^ true,
            t_right: tr0 ^ tr1 ^ bit,
        };
        let (keep_t0, keep_t1, keep_t_cw) = if bit {
            (tr0, tr1, correction.t_right)
        } else {
            (tl0, tl1, correction.t_left)
        };

        s0 = if t0 { xor_seed(&keep0, &correction.seed) } else { keep0 };
        s1 = if t1 { xor_seed(&keep1, &correction.seed) } else { keep1 };
        t0 = keep_t0 ^ (t0 & keep_t_cw);
        t1 = keep_t1 ^ (t1 & keep_t_cw);

        levels.push(correction);
    }

    // exactly one of t0, t1 is set at the target leaf
    let delta = convert_tag(&s0) - convert_tag(&s1);
    let tag_correction = if t0 { Fp::ONE - delta } else { delta - Fp::ONE };

    let mut data_correction = convert_data(&s0, data_size as usize);
    let other = convert_data(&s1, data_size as usize);
    for (i, byte) in data_correction.iter_mut().enumerate() {
        *byte ^= other[i] ^ payload.get(i).copied().unwrap_or(0);
    }

    let make_key = |party: u8, root: Seed| DpfKey {
        party,
        depth,
        domain_size: row_count,
        data_size,
        root,
        levels: levels.clone(),
        tag_correction,
        data_correction: data_correction.clone(),
    };

    Ok(QueryPair {
        a: make_key(0, root0),
        b: make_key(1, root1),
    })
}

impl DpfKey {
    /// 0 for the leader's key, 1 for the follower's
    pub fn party(&self) -> u8 {
        self.party
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Number of rows this key addresses
    pub fn domain_size(&self) -> u32 {
        self.domain_size
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Encoded size of this key
    pub fn encoded_len(&self) -> usize {
        query_size(self.depth, self.data_size)
    }

    /// Evaluate at `index`, producing a data share of `row_size` bytes
    pub fn evaluate(&self, index: u32, row_size: usize) -> Evaluation {
        if index >= self.domain_size {
            return Evaluation {
                tag: Fp::ZERO,
                share: vec![0u8; row_size],
            };
        }

        let mut seed = self.root;
        let mut t = self.party == 1;
        for (level, correction) in self.levels.iter().enumerate() {
            let bit = index_bit(index as u64, self.depth, level as u8);
            (seed, t) = self.child(&seed, t, bit, correction);
        }

        // bytes past the key's payload width stay zero for both parties
        let mut share = convert_data(&seed, row_size.min(self.data_size as usize));
        if t {
            for (byte, cw) in share.iter_mut().zip(&self.data_correction) {
                *byte ^= cw;
            }
        }
        share.resize(row_size, 0);

        Evaluation {
            tag: self.leaf_tag(&seed, t),
            share,
        }
    }

    /// Position tags for indices `0..count`, via one walk of the tree
    ///
    /// Agrees with [`DpfKey::evaluate`] on every index.
    pub fn expand_tags(&self, count: u32) -> Vec<Fp> {
        let mut tags = Vec::with_capacity(count as usize);
        let wanted = count.min(self.domain_size) as u64;
        if wanted > 0 {
            let mut frontier = vec![(self.root, self.party == 1)];
            for (level, correction) in self.levels.iter().enumerate() {
                let below = u32::from(self.depth) - level as u32 - 1;
                let needed = ((wanted + (1u64 << below) - 1) >> below) as usize;

                let mut next = Vec::with_capacity(needed);
                'nodes: for (seed, t) in &frontier {
                    for bit in [false, true] {
                        if next.len() == needed {
                            break 'nodes;
                        }
                        next.push(self.child(seed, *t, bit, correction));
                    }
                }
                frontier = next;
            }
            tags.extend(frontier.iter().map(|(seed, t)| self.leaf_tag(seed, *t)));
        }
        tags.resize(count as usize, Fp::ZERO);
        tags
    }

    fn child(&self, seed: &Seed, t: bool, bit: bool, correction: &LevelCorrection) -> (Seed, bool) {
        let (left, t_left, right, t_right) = expand(seed);
        let (child, t_child, t_cw) = if bit {
            (right, t_right, correction.t_right)
        } else {
            (left, t_left, correction.t_left)
        };
        if t {
            (xor_seed(&child, &correction.seed), t_child ^ t_cw)
        } else {
            (child, t_child)
        }
    }

    fn leaf_tag(&self, seed: &Seed, t: bool) -> Fp {
        let mut tag = convert_tag(seed);
        if t {
            tag += self.tag_correction;
        }
        if self.party == 1 {
            -tag
        } else {
            tag
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(KEY_VERSION);
        out.push(self.party);
        out.push(self.depth);
        out.extend_from_slice(&self.domain_size.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out.extend_from_slice(&self.root);
        for level in &self.levels {
            out.extend_from_slice(&level.seed);
            out.push(level.t_left as u8 | (level.t_right as u8) << 1);
        }
        out.extend_from_slice(&self.tag_correction.to_bytes());
        out.extend_from_slice(&self.data_correction);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedQuery(format!(
                "truncated key: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != KEY_VERSION {
            return Err(Error::MalformedQuery(format!(
                "unsupported key version {}",
                bytes[0]
            )));
        }
        let party = bytes[1];
        if party > 1 {
            return Err(Error::MalformedQuery(format!("invalid party {}", party)));
        }
        let depth = bytes[2];
        if depth == 0 || depth > MAX_DEPTH {
            return Err(Error::MalformedQuery(format!("invalid depth {}", depth)));
        }
        let domain_size = read_u32(&bytes[3..7]);
        let data_size = read_u32(&bytes[7..11]);
        if domain_size == 0 || domain_size as u64 > 1u64 << depth {
            return Err(Error::MalformedQuery(format!(
                "domain of {} rows does not fit depth {}",
                domain_size, depth
            )));
        }
        let expected = query_size(depth, data_size);
        if bytes.len() != expected {
            return Err(Error::SizeMismatch {
                what: "query",
                expected,
                actual: bytes.len(),
            });
        }

        let mut root = [0u8; SEED_LEN];
        root.copy_from_slice(&bytes[11..HEADER_LEN]);

        let mut offset = HEADER_LEN;
        let mut levels = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            let mut seed = [0u8; SEED_LEN];
            seed.copy_from_slice(&bytes[offset..offset + SEED_LEN]);
            let flags = bytes[offset + SEED_LEN];
            if flags > 3 {
                return Err(Error::MalformedQuery(format!(
                    "invalid correction flags {:#x}",
                    flags
                )));
            }
            levels.push(LevelCorrection {
                seed,
                t_left: flags & 1 == 1,
                t_right: flags & 2 == 2,
            });
            offset += LEVEL_LEN;
        }

        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&bytes[offset..offset + Fp::BYTES]);
        let tag_correction = Fp::from_bytes(&tag_bytes)
            .ok_or_else(|| Error::MalformedQuery("non-canonical tag correction".into()))?;
        offset += Fp::BYTES;

        Ok(Self {
            party,
            depth,
            domain_size,
            data_size,
            root,
            levels,
            tag_correction,
            data_correction: bytes[offset..].to_vec(),
        })
    }
}

#[inline]
fn index_bit(index: u64, depth: u8, level: u8) -> bool {
    (index >> (depth - 1 - level)) & 1 == 1
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn xor_seed(a: &Seed, b: &Seed) -> Seed {
    let mut out = [0u8; SEED_LEN];
    for i in 0..SEED_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Length-doubling PRG: seed -> (left seed, left bit, right seed, right bit)
fn expand(seed: &Seed) -> (Seed, bool, Seed, bool) {
    let mut out = [0u8; 2 * SEED_LEN + 2];
    let mut shake = Shake::v128();
    shake.update(PRG_DOMAIN);
    shake.update(seed);
    shake.finalize(&mut out);

    let mut left = [0u8; SEED_LEN];
    let mut right = [0u8; SEED_LEN];
    left.copy_from_slice(&out[..SEED_LEN]);
    right.copy_from_slice(&out[SEED_LEN + 1..2 * SEED_LEN + 1]);
    (left, out[SEED_LEN] & 1 == 1, right, out[2 * SEED_LEN + 1] & 1 == 1)
}

fn convert_tag(seed: &Seed) -> Fp {
    let mut out = [0u8; 16];
    let mut shake = Shake::v128();
    shake.update(TAG_DOMAIN);
    shake.update(seed);
    shake.finalize(&mut out);
    Fp::from_uniform_bytes(&out)
}

fn convert_data(seed: &Seed, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut shake = Shake::v128();
    shake.update(DATA_DOMAIN);
    shake.update(seed);
    shake.finalize(&mut out);
    out
}
