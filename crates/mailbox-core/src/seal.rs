//! Sealed client-to-follower channel
//!
//! The follower's DPF key and audit share travel through the leader. They are
//! sealed under a key only the client and the follower can derive:
//!
//! ```text
//! shared = X25519(own_secret, peer_public)
//! key    = HKDF-SHA256(salt = min(pk) || max(pk), ikm = shared, info = "mailbox/seal/v1")
//! blob   = nonce [24] | XChaCha20-Poly1305(key, nonce, aad = purpose, plaintext)
//! ```

use std::fs;
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{SEAL_NONCE_SIZE, SEAL_OVERHEAD};
use crate::{Error, Result};

const KDF_INFO: &[u8] = b"mailbox/seal/v1";

/// AAD for the follower's DPF key
pub const PURPOSE_QUERY: &[u8] = b"mailbox/seal/query";

/// AAD for the follower's audit share
pub const PURPOSE_AUDIT: &[u8] = b"mailbox/seal/audit";

/// Symmetric channel between the client and the follower
#[derive(Clone, ZeroizeOnDrop)]
pub struct SealedChannel {
    key: [u8; 32],
}

impl SealedChannel {
    /// Derive the channel from our secret and the peer's public key
    ///
    /// Rejects a low-order peer key, whose shared secret is all zeros.
    pub fn new(secret: &StaticSecret, peer_public: &PublicKey) -> Result<Self> {
        let own_public = PublicKey::from(secret);
        let shared_secret = secret.diffie_hellman(peer_public);
        if !shared_secret.was_contributory() {
            return Err(Error::InvalidKey("peer public key is a low-order point".into()));
        }
        let mut shared = shared_secret.to_bytes();

        let (lo, hi) = if own_public.as_bytes() <= peer_public.as_bytes() {
            (own_public, *peer_public)
        } else {
            (*peer_public, own_public)
        };
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(lo.as_bytes());
        salt[32..].copy_from_slice(hi.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), &shared);
        shared.zeroize();
        let mut key = [0u8; 32];
        hk.expand(KDF_INFO, &mut key)
            .map_err(|e| Error::InvalidKey(format!("channel key derivation failed: {}", e)))?;

        Ok(Self { key })
    }

    pub fn seal<R: RngCore + ?Sized>(
        &self,
        purpose: &[u8],
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0u8; SEAL_NONCE_SIZE];
        rng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: purpose,
                },
            )
            .map_err(|_| Error::Seal)?;

        let mut out = Vec::with_capacity(SEAL_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, purpose: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < SEAL_NONCE_SIZE + SEAL_OVERHEAD {
            return Err(Error::SealOpen);
        }
        let (nonce, ciphertext) = blob.split_at(SEAL_NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: purpose,
                },
            )
            .map_err(|_| Error::SealOpen)
    }
}

impl std::fmt::Debug for SealedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedChannel(..)")
    }
}

/// One party's sealing keys as stored in a JSON keyfile
///
/// ```json
/// { "secret": "<64 hex chars>", "peer_public": "<64 hex chars>" }
/// ```
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SealKeys {
    #[serde(with = "hex_key")]
    secret: [u8; 32],
    #[serde(with = "hex_key")]
    peer_public: [u8; 32],
}

impl SealKeys {
    pub fn new(secret: [u8; 32], peer_public: [u8; 32]) -> Self {
        Self { secret, peer_public }
    }

    /// Fresh keys for a client and a follower that point at each other
    pub fn generate_pair<R: RngCore + ?Sized>(rng: &mut R) -> (SealKeys, SealKeys) {
        let mut client = [0u8; 32];
        let mut follower = [0u8; 32];
        rng.fill_bytes(&mut client);
        rng.fill_bytes(&mut follower);
        let pair = Self::pair_from_secrets(client, follower);
        client.zeroize();
        follower.zeroize();
        pair
    }

    fn pair_from_secrets(client: [u8; 32], follower: [u8; 32]) -> (SealKeys, SealKeys) {
        let client_public = PublicKey::from(&StaticSecret::from(client)).to_bytes();
        let follower_public = PublicKey::from(&StaticSecret::from(follower)).to_bytes();
        (
            SealKeys::new(client, follower_public),
            SealKeys::new(follower, client_public),
        )
    }

    /// Our own public key; the peer's keyfile carries this as `peer_public`
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&StaticSecret::from(self.secret)).to_bytes()
    }

    pub fn channel(&self) -> Result<SealedChannel> {
        let secret = StaticSecret::from(self.secret);
        SealedChannel::new(&secret, &PublicKey::from(self.peer_public))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

impl std::fmt::Debug for SealKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealKeys")
            .field("peer_public", &hex::encode(self.peer_public))
            .finish_non_exhaustive()
    }
}

mod hex_key {
    use serde::{de::Error as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text: String = serde::Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(text.trim_start_matches("0x")).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("expected 32-byte key, got {}", b.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::sealed_len;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    #[test]
    fn test_seal_open_between_parties() {
        let mut rng = StdRng::seed_from_u64(1);
        let (client, follower) = SealKeys::generate_pair(&mut rng);

        let sealed = client.channel().unwrap().seal(PURPOSE_QUERY, b"follower key bytes", &mut rng).unwrap();
        assert_eq!(sealed.len(), sealed_len(18));

        let opened = follower.channel().unwrap().open(PURPOSE_QUERY, &sealed).unwrap();
        assert_eq!(opened, b"follower key bytes");
    }

    #[test]
    fn test_purpose_is_bound() {
        let mut rng = StdRng::seed_from_u64(2);
        let (client, follower) = SealKeys::generate_pair(&mut rng);
        let sealed = client.channel().unwrap().seal(PURPOSE_QUERY, &[7u8; 40], &mut rng).unwrap();
        assert!(matches!(
            follower.channel().unwrap().open(PURPOSE_AUDIT, &sealed),
            Err(Error::SealOpen)
        ));
    }

    #[test]
    fn test_third_party_cannot_open() {
        let mut rng = StdRng::seed_from_u64(3);
        let (client, _) = SealKeys::generate_pair(&mut rng);
        let (_, outsider) = SealKeys::generate_pair(&mut rng);

        let sealed = client.channel().unwrap().seal(PURPOSE_AUDIT, &[1u8; 160], &mut rng).unwrap();
        assert!(outsider.channel().unwrap().open(PURPOSE_AUDIT, &sealed).is_err());
    }

    #[test]
    fn test_tampered_and_truncated_blobs_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        let (client, follower) = SealKeys::generate_pair(&mut rng);
        let mut sealed = client.channel().unwrap().seal(PURPOSE_AUDIT, &[9u8; 32], &mut rng).unwrap();

        assert!(follower.channel().unwrap().open(PURPOSE_AUDIT, &sealed[..30]).is_err());
        sealed[SEAL_NONCE_SIZE] ^= 0x01;
        assert!(follower.channel().unwrap().open(PURPOSE_AUDIT, &sealed).is_err());
    }

    #[test]
    fn test_keyfile_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("follower.json");
        let mut rng = StdRng::seed_from_u64(5);
        let (client, follower) = SealKeys::generate_pair(&mut rng);

        follower.save(&path).unwrap();
        let loaded = SealKeys::load(&path).unwrap();
        assert_eq!(loaded.public_key(), follower.public_key());
        assert_eq!(loaded.peer_public, client.public_key());

        let sealed = client.channel().unwrap().seal(PURPOSE_QUERY, b"hello", &mut rng).unwrap();
        assert_eq!(loaded.channel().unwrap().open(PURPOSE_QUERY, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_low_order_peer_key_rejected() {
        let mut rng = StdRng::seed_from_u64(6);
        let (client, _) = SealKeys::generate_pair(&mut rng);
        let bad = SealKeys::new(client.secret, [0u8; 32]);
        assert!(matches!(bad.channel(), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_keyfile_rejects_short_key() {
        let json = r#"{ "secret": "abcd", "peer_public": "00" }"#;
        assert!(serde_json::from_str::<SealKeys>(json).is_err());
    }
}
