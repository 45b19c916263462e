//! Secure-sketch audit of a write's position-tag vector
//!
//! After applying their DPF keys, the leader holds tags `vA` and the
//! follower `vB`. For a well-formed write `vA + vB` is the unit vector at
//! the target row. With per-row coefficients `r_i` derived from the audit
//! seed, each server sketches its own vector:
//!
//! ```text
//! m = Σ r_i · v_i        c = Σ r_i² · v_i
//! ```
//!
//! so a unit vector gives `m² = c`, while two or more nonzero rows (or a
//! single row whose tag is not one) break the identity except with
//! probability about 2/p. The servers check `σ·(m² − c) = 0`, where `σ` is a
//! challenge drawn by the leader and never shown to the client. The cross
//! term `2·mA·mB` comes from correlated randomness supplied by the client,
//! so any cheating in that randomness shifts the result by a σ-independent
//! amount and is caught.
//!
//! Message flow per write:
//! 1. both servers: [`setup_proof`] over their local tags
//! 2. client: [`client_audit_shares`] once it has the seed
//! 3. leader: [`compute_leader_answer`] -> `ansA`
//! 4. follower: [`compute_follower_answer`] from `ansA` -> `ansB`
//! 5. both: [`verify_proof`]`(ansA, ansB)`

use rand::RngCore;
use tiny_keccak::{Hasher, Keccak, Shake};

use crate::config::Role;
use crate::constants::{ANSWER_SIZE, AUDIT_SHARE_SIZE, SEED_SIZE, TAG_SIZE};
use crate::dpf::DpfKey;
use crate::field::Fp;
use crate::{Error, Result};

const SKETCH_DOMAIN: &[u8] = b"mailbox/audit/sketch";
const SHARE_DOMAIN: &[u8] = b"mailbox/audit/share";

/// Fresh per-write randomness chosen by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditSeed([u8; SEED_SIZE]);

impl AuditSeed {
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SEED_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }

    /// Sketch coefficient for row `index`
    pub fn coefficient(&self, index: u32) -> Fp {
        let mut out = [0u8; 16];
        let mut shake = Shake::v128();
        shake.update(SKETCH_DOMAIN);
        shake.update(&self.0);
        shake.update(&index.to_le_bytes());
        shake.finalize(&mut out);
        Fp::from_uniform_bytes(&out)
    }

    fn share_digest(&self, role: Role) -> [u8; 32] {
        let mut digest = [0u8; 32];
        let mut hasher = Keccak::v256();
        hasher.update(SHARE_DOMAIN);
        hasher.update(&[role.party()]);
        hasher.update(&self.0);
        hasher.finalize(&mut digest);
        digest
    }
}

/// One server's sketch of its local tag vector; used once, then dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofState {
    pub m_val: Fp,
    pub c_val: Fp,
}

/// Sketch a contiguous tag vector of `row_count` 16-byte tags
pub fn setup_proof(seed: &AuditSeed, row_count: u32, tags: &[u8]) -> Result<ProofState> {
    let expected = row_count as usize * TAG_SIZE;
    if tags.len() != expected {
        return Err(Error::SizeMismatch {
            what: "position tag vector",
            expected,
            actual: tags.len(),
        });
    }

    let mut m_val = Fp::ZERO;
    let mut c_val = Fp::ZERO;
    for (index, chunk) in tags.chunks_exact(TAG_SIZE).enumerate() {
        let mut bytes = [0u8; TAG_SIZE];
        bytes.copy_from_slice(chunk);
        let tag = Fp::from_bytes(&bytes)
            .ok_or_else(|| Error::MalformedQuery(format!("non-canonical tag at row {}", index)))?;
        if tag.is_zero() {
            continue;
        }
        let r = seed.coefficient(index as u32);
        let weighted = r * tag;
        m_val += weighted;
        c_val += r * weighted;
    }

    Ok(ProofState { m_val, c_val })
}

/// A client's audit contribution for one server
///
/// Both servers receive the same 160-byte layout:
/// ```text
/// seed_digest [32] | mask [16] | blind [16] | cross [16] | reserved [80] = 0
/// ```
/// The leader's share carries `mask` and `blind`, the follower's `cross`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditShare {
    seed_digest: [u8; 32],
    mask: Fp,
    blind: Fp,
    cross: Fp,
}

/// Audit shares for both servers, produced by the client after it sees the seed
#[derive(Debug, Clone)]
pub struct ClientAuditShares {
    pub leader: AuditShare,
    pub follower: AuditShare,
}

/// Derive the client's audit shares from the follower's key
///
/// Needs the follower's full sketch `mB`, which the client recomputes by
/// expanding the key over its whole domain.
pub fn client_audit_shares<R: RngCore + ?Sized>(
    seed: &AuditSeed,
    follower_key: &DpfKey,
    rng: &mut R,
) -> ClientAuditShares {
    let m_follower: Fp = follower_key
        .expand_tags(follower_key.domain_size())
        .into_iter()
        .enumerate()
        .filter(|(_, tag)| !tag.is_zero())
        .map(|(index, tag)| seed.coefficient(index as u32) * tag)
        .sum();

    let mask = Fp::random(rng);
    let blind = Fp::random(rng);

    ClientAuditShares {
        leader: AuditShare {
            seed_digest: seed.share_digest(Role::Leader),
            mask,
            blind,
            cross: Fp::ZERO,
        },
        follower: AuditShare {
            seed_digest: seed.share_digest(Role::Follower),
            mask: Fp::ZERO,
            blind: Fp::ZERO,
            cross: mask * m_follower + blind,
        },
    }
}

impl AuditShare {
    fn check_seed(&self, seed: &AuditSeed, role: Role) -> Result<()> {
        if self.seed_digest != seed.share_digest(role) {
            return Err(Error::InvalidAuditShare(format!(
                "share was not computed for this seed ({} role)",
                role
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; AUDIT_SHARE_SIZE] {
        let mut out = [0u8; AUDIT_SHARE_SIZE];
        out[..32].copy_from_slice(&self.seed_digest);
        out[32..48].copy_from_slice(&self.mask.to_bytes());
        out[48..64].copy_from_slice(&self.blind.to_bytes());
        out[64..80].copy_from_slice(&self.cross.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AUDIT_SHARE_SIZE {
            return Err(Error::SizeMismatch {
                what: "audit share",
                expected: AUDIT_SHARE_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[80..].iter().any(|&b| b != 0) {
            return Err(Error::InvalidAuditShare("reserved bytes set".into()));
        }
        let mut seed_digest = [0u8; 32];
        seed_digest.copy_from_slice(&bytes[..32]);
        Ok(Self {
            seed_digest,
            mask: field_at(bytes, 32, "audit share mask")?,
            blind: field_at(bytes, 48, "audit share blind")?,
            cross: field_at(bytes, 64, "audit share cross term")?,
        })
    }
}

/// A server's audit answer
///
/// Layout: `sigma [16] | masked [16] | folded [16] | reserved [48] = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    sigma: Fp,
    masked: Fp,
    folded: Fp,
}

impl Answer {
    pub fn to_bytes(&self) -> [u8; ANSWER_SIZE] {
        let mut out = [0u8; ANSWER_SIZE];
        out[..16].copy_from_slice(&self.sigma.to_bytes());
        out[16..32].copy_from_slice(&self.masked.to_bytes());
        out[32..48].copy_from_slice(&self.folded.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ANSWER_SIZE {
            return Err(Error::SizeMismatch {
                what: "audit answer",
                expected: ANSWER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[48..].iter().any(|&b| b != 0) {
            return Err(Error::MalformedQuery("audit answer reserved bytes set".into()));
        }
        Ok(Self {
            sigma: field_at(bytes, 0, "answer sigma")?,
            masked: field_at(bytes, 16, "answer masked term")?,
            folded: field_at(bytes, 32, "answer folded term")?,
        })
    }
}

/// Leader's answer: draws the challenge and masks its sketch for the follower
pub fn compute_leader_answer<R: RngCore + ?Sized>(
    seed: &AuditSeed,
    state: &ProofState,
    share: &AuditShare,
    rng: &mut R,
) -> Result<Answer> {
    share.check_seed(seed, Role::Leader)?;
    if !share.cross.is_zero() {
        return Err(Error::InvalidAuditShare("leader share carries a cross term".into()));
    }

    let sigma = Fp::random_nonzero(rng);
    let local = state.m_val.square() - state.c_val;
    Ok(Answer {
        sigma,
        masked: sigma * state.m_val + share.mask,
        folded: sigma * local + share.blind.double(),
    })
}

/// Follower's answer: completes the cross term using the leader's answer
pub fn compute_follower_answer(
    seed: &AuditSeed,
    state: &ProofState,
    share: &AuditShare,
    leader: &Answer,
) -> Result<Answer> {
    share.check_seed(seed, Role::Follower)?;
    if !share.mask.is_zero() || !share.blind.is_zero() {
        return Err(Error::InvalidAuditShare("follower share carries leader terms".into()));
    }
    if leader.sigma.is_zero() {
        return Err(Error::MalformedQuery("leader answer has a zero challenge".into()));
    }

    let sigma = leader.sigma;
    let local = state.m_val.square() - state.c_val;
    let cross = leader.masked * state.m_val - share.cross;
    Ok(Answer {
        sigma,
        masked: Fp::ZERO,
        folded: sigma * local + cross.double(),
    })
}

/// Accept iff both answers agree on the challenge and fold to zero
pub fn verify_proof(leader: &Answer, follower: &Answer) -> bool {
    !leader.sigma.is_zero()
        && leader.sigma == follower.sigma
        && follower.masked.is_zero()
        && (leader.folded + follower.folded).is_zero()
}

fn field_at(bytes: &[u8], offset: usize, what: &str) -> Result<Fp> {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[offset..offset + 16]);
    Fp::from_bytes(&raw).ok_or_else(|| Error::MalformedQuery(format!("non-canonical {}", what)))
}
