//! Key derivation: the BIP-32 tree `m/1017'/coin_type'/key_family'/0/index`
//! and the keyring capability the minting and transfer actors draw fresh
//! keys from.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::secp256k1::{All, Keypair, Secp256k1, SecretKey};
use bitcoin::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TapError;

/// Purpose level of the asset key tree.
pub const BIP32_PURPOSE: u32 = 1017;

pub const COIN_TYPE_MAINNET: u32 = 0;
pub const COIN_TYPE_TESTNET: u32 = 1;

/// Key families partition the derivation tree by role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyFamily {
    /// Taproot internal keys of genesis outputs (one per batch).
    BatchKey,
    /// Per-asset script keys.
    ScriptKey,
    /// Group keys for re-issuable assets.
    GroupKey,
    /// Taproot internal keys of transfer anchor outputs.
    AnchorInternal,
}

impl KeyFamily {
    pub fn index(self) -> u32 {
        match self {
            KeyFamily::BatchKey => 0,
            KeyFamily::ScriptKey => 1,
            KeyFamily::GroupKey => 2,
            KeyFamily::AnchorInternal => 3,
        }
    }
}

/// `m / 1017' / coin_type' / key_family' / 0 / index`: exactly five
/// elements, first three hardened.
pub fn derivation_path(coin_type: u32, family: KeyFamily, index: u32) -> DerivationPath {
    DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(BIP32_PURPOSE).expect("purpose in hardened range"),
        ChildNumber::from_hardened_idx(coin_type).expect("coin type in hardened range"),
        ChildNumber::from_hardened_idx(family.index()).expect("family in hardened range"),
        ChildNumber::from_normal_idx(0).expect("0 is a normal index"),
        ChildNumber::from_normal_idx(index).expect("index in normal range"),
    ])
}

/// A derived public key together with its position in the key tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub family: KeyFamily,
    pub index: u32,
    pub pub_key: XOnlyPublicKey,
}

/// Capability handed to the actors: derive fresh keys and resolve secret
/// material for signing. Backed by the wallet in production and by
/// [`SoftKeyRing`] in tests.
#[async_trait::async_trait]
pub trait KeyRing: Send + Sync {
    async fn derive_next(&self, family: KeyFamily) -> Result<KeyDescriptor, TapError>;

    /// Secret key material for a previously derived public key, if this
    /// ring owns it.
    async fn keypair(&self, pub_key: &XOnlyPublicKey) -> Result<Option<Keypair>, TapError>;
}

/// Deterministic in-process keyring: children are derived by hashing the
/// seed with the family and index, so a ring rebuilt from the same seed
/// hands out the same keys in the same order.
pub struct SoftKeyRing {
    secp: Secp256k1<All>,
    seed: [u8; 32],
    state: Mutex<SoftKeyRingState>,
}

#[derive(Default)]
struct SoftKeyRingState {
    next_index: HashMap<KeyFamily, u32>,
    keypairs: HashMap<[u8; 32], Keypair>,
}

impl SoftKeyRing {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            secp: Secp256k1::new(),
            seed,
            state: Mutex::new(SoftKeyRingState::default()),
        }
    }

    fn keypair_at(&self, family: KeyFamily, index: u32) -> Keypair {
        // Grind past the (astronomically unlikely) invalid scalars so
        // derivation stays total.
        let mut tweak = 0u32;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(self.seed);
            hasher.update(family.index().to_be_bytes());
            hasher.update(index.to_be_bytes());
            hasher.update(tweak.to_be_bytes());
            let candidate: [u8; 32] = hasher.finalize().into();
            if let Ok(secret) = SecretKey::from_slice(&candidate) {
                return Keypair::from_secret_key(&self.secp, &secret);
            }
            tweak += 1;
        }
    }
}

#[async_trait::async_trait]
impl KeyRing for SoftKeyRing {
    async fn derive_next(&self, family: KeyFamily) -> Result<KeyDescriptor, TapError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TapError::InvalidState("keyring poisoned"))?;
        let index = *state.next_index.get(&family).unwrap_or(&0);
        state.next_index.insert(family, index + 1);
        let keypair = self.keypair_at(family, index);
        let pub_key = keypair.x_only_public_key().0;
        state.keypairs.insert(pub_key.serialize(), keypair);
        Ok(KeyDescriptor {
            family,
            index,
            pub_key,
        })
    }

    async fn keypair(&self, pub_key: &XOnlyPublicKey) -> Result<Option<Keypair>, TapError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TapError::InvalidState("keyring poisoned"))?;
        Ok(state.keypairs.get(&pub_key.serialize()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_path_shape() {
        let path = derivation_path(COIN_TYPE_MAINNET, KeyFamily::ScriptKey, 7);
        let children: &[ChildNumber] = path.as_ref();
        assert_eq!(children.len(), 5);
        assert!(children[0].is_hardened());
        assert!(children[1].is_hardened());
        assert!(children[2].is_hardened());
        assert!(children[3].is_normal());
        assert!(children[4].is_normal());
        assert_eq!(
            children[0],
            ChildNumber::from_hardened_idx(BIP32_PURPOSE).unwrap()
        );
    }

    #[tokio::test]
    async fn soft_ring_is_deterministic_per_seed() {
        let ring_a = SoftKeyRing::new([7u8; 32]);
        let ring_b = SoftKeyRing::new([7u8; 32]);
        let a0 = ring_a.derive_next(KeyFamily::ScriptKey).await.unwrap();
        let b0 = ring_b.derive_next(KeyFamily::ScriptKey).await.unwrap();
        assert_eq!(a0.pub_key, b0.pub_key);
        assert_eq!(a0.index, 0);

        let a1 = ring_a.derive_next(KeyFamily::ScriptKey).await.unwrap();
        assert_ne!(a0.pub_key, a1.pub_key);
        assert_eq!(a1.index, 1);

        // Families are independent branches.
        let g0 = ring_a.derive_next(KeyFamily::GroupKey).await.unwrap();
        assert_eq!(g0.index, 0);
        assert_ne!(g0.pub_key, a0.pub_key);
    }

    #[tokio::test]
    async fn keypair_lookup_returns_derived_material() {
        let ring = SoftKeyRing::new([9u8; 32]);
        let desc = ring.derive_next(KeyFamily::BatchKey).await.unwrap();
        let keypair = ring.keypair(&desc.pub_key).await.unwrap().unwrap();
        assert_eq!(keypair.x_only_public_key().0, desc.pub_key);

        let unknown = SoftKeyRing::new([1u8; 32])
            .derive_next(KeyFamily::BatchKey)
            .await
            .unwrap();
        assert!(ring.keypair(&unknown.pub_key).await.unwrap().is_none());
    }
}
