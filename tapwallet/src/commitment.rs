//! Two-level commitment engine: per-asset MS-SMTs rolled up into one
//! taproot-level MS-SMT, bound on-chain through a tapscript leaf of
//! version 0x0c and the BIP-341 key tweak.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::taproot::{LeafVersion, TapLeafHash, TapNodeHash};
use bitcoin::{ScriptBuf, XOnlyPublicKey};
use state_mssmt::{Leaf, NodeSummary, Proof, Tree};

use crate::asset::{Asset, ByteReader};
use crate::error::TapError;

/// Tapscript leaf version carrying a taproot-asset commitment.
pub const TAPROOT_ASSET_LEAF_VERSION: u8 = 0x0c;

/// Version byte serialized into commitment leaves.
pub const COMMITMENT_VERSION: u8 = 0;

pub fn taproot_asset_leaf_version() -> LeafVersion {
    LeafVersion::from_consensus(TAPROOT_ASSET_LEAF_VERSION).expect("0x0c is a valid leaf version")
}

/// Inner tree: all assets sharing one asset id (or one group key), keyed
/// by `SHA256(asset_id ‖ script_key)` and summed by amount.
#[derive(Clone, Debug)]
pub struct AssetCommitment {
    version: u8,
    commitment_id: [u8; 32],
    tree: Tree,
    assets: BTreeMap<[u8; 32], Asset>,
}

impl AssetCommitment {
    pub fn new<C: Verification>(
        secp: &Secp256k1<C>,
        assets: impl IntoIterator<Item = Asset>,
    ) -> Result<Self, TapError> {
        let mut assets = assets.into_iter();
        let first = assets.next().ok_or(TapError::NoAssets)?;
        first.validate(secp)?;
        let mut commitment = Self {
            version: first.version,
            commitment_id: first.commitment_id(),
            tree: Tree::new(),
            assets: BTreeMap::new(),
        };
        commitment.insert_unchecked(first)?;
        for asset in assets {
            commitment.insert(secp, asset)?;
        }
        Ok(commitment)
    }

    /// Adds `asset`, enforcing the membership invariants: same commitment
    /// id, same asset type, a verifying group signature when grouped, and
    /// no duplicate script keys.
    pub fn insert<C: Verification>(
        &mut self,
        secp: &Secp256k1<C>,
        asset: Asset,
    ) -> Result<(), TapError> {
        asset.validate(secp)?;
        if asset.commitment_id() != self.commitment_id {
            // Distinguish the two mismatch flavors for the caller.
            return Err(match (&asset.group_key, self.is_grouped()) {
                (Some(_), true) | (None, true) | (Some(_), false) => TapError::GroupKeyMismatch,
                (None, false) => TapError::GenesisMismatch,
            });
        }
        if let Some(existing) = self.assets.values().next() {
            if existing.asset_type() != asset.asset_type() {
                return Err(TapError::AssetTypeMismatch);
            }
        }
        if self
            .assets
            .values()
            .any(|member| member.script_key == asset.script_key)
        {
            return Err(TapError::DuplicateScriptKey);
        }
        self.insert_unchecked(asset)
    }

    fn insert_unchecked(&mut self, asset: Asset) -> Result<(), TapError> {
        let key = asset.commitment_key();
        self.tree.insert(&key, asset.leaf())?;
        self.assets.insert(key, asset);
        Ok(())
    }

    fn is_grouped(&self) -> bool {
        self.assets
            .values()
            .next()
            .map(|asset| asset.group_key.is_some())
            .unwrap_or(false)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Outer-tree key this commitment is filed under.
    pub fn commitment_id(&self) -> [u8; 32] {
        self.commitment_id
    }

    pub fn root(&self) -> NodeSummary {
        self.tree.root()
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn get(&self, commitment_key: &[u8; 32]) -> Option<&Asset> {
        self.assets.get(commitment_key)
    }

    /// Leaf stored in the outer tree: `version ‖ root_hash ‖ sum`.
    pub fn leaf(&self) -> Leaf {
        let root = self.root();
        let mut value = Vec::with_capacity(41);
        value.push(self.version);
        value.extend_from_slice(&root.hash);
        value.extend_from_slice(&root.sum.to_be_bytes());
        Leaf::new(value, root.sum)
    }

    pub fn proof(&self, commitment_key: &[u8; 32]) -> Proof {
        self.tree.merkle_proof(commitment_key)
    }
}

/// Outer tree: one entry per asset commitment, keyed by commitment id.
#[derive(Clone, Debug, Default)]
pub struct TapCommitment {
    tree: Tree,
    commitments: BTreeMap<[u8; 32], AssetCommitment>,
}

impl TapCommitment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_commitments(
        commitments: impl IntoIterator<Item = AssetCommitment>,
    ) -> Result<Self, TapError> {
        let mut tap = Self::new();
        for commitment in commitments {
            tap.insert_commitment(commitment)?;
        }
        Ok(tap)
    }

    /// Buckets `assets` by commitment id into inner commitments and rolls
    /// them up into one outer tree.
    pub fn from_assets<C: Verification>(
        secp: &Secp256k1<C>,
        assets: impl IntoIterator<Item = Asset>,
    ) -> Result<Self, TapError> {
        let mut buckets: BTreeMap<[u8; 32], Vec<Asset>> = BTreeMap::new();
        for asset in assets {
            buckets.entry(asset.commitment_id()).or_default().push(asset);
        }
        let mut tap = Self::new();
        for (_, members) in buckets {
            tap.insert_commitment(AssetCommitment::new(secp, members)?)?;
        }
        Ok(tap)
    }

    /// Inserts or replaces the commitment filed under its commitment id.
    pub fn insert_commitment(&mut self, commitment: AssetCommitment) -> Result<(), TapError> {
        let id = commitment.commitment_id();
        self.tree.insert(&id, commitment.leaf())?;
        self.commitments.insert(id, commitment);
        Ok(())
    }

    /// Folds `other` into self; commitments sharing an id merge asset by
    /// asset under the usual membership checks. Used when several virtual
    /// outputs land on one anchor output.
    pub fn merge<C: Verification>(
        &mut self,
        secp: &Secp256k1<C>,
        other: TapCommitment,
    ) -> Result<(), TapError> {
        for (id, incoming) in other.commitments {
            match self.commitments.get_mut(&id) {
                Some(existing) => {
                    for asset in incoming.assets.into_values() {
                        existing.insert(secp, asset)?;
                    }
                    let leaf = existing.leaf();
                    self.tree.insert(&id, leaf)?;
                }
                None => self.insert_commitment(incoming)?,
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.commitments.is_empty()
    }

    pub fn root(&self) -> NodeSummary {
        self.tree.root()
    }

    pub fn commitments(&self) -> impl Iterator<Item = &AssetCommitment> {
        self.commitments.values()
    }

    pub fn get(&self, commitment_id: &[u8; 32]) -> Option<&AssetCommitment> {
        self.commitments.get(commitment_id)
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.commitments.values().flat_map(|c| c.assets())
    }

    /// Script body of the commitment leaf: `OP_RETURN ‖ version ‖
    /// root_hash ‖ sum`.
    pub fn leaf_script(&self) -> ScriptBuf {
        let root = self.root();
        let mut payload = [0u8; 41];
        payload[0] = COMMITMENT_VERSION;
        payload[1..33].copy_from_slice(&root.hash);
        payload[33..41].copy_from_slice(&root.sum.to_be_bytes());
        Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(payload)
            .into_script()
    }

    pub fn tap_leaf(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.leaf_script(), taproot_asset_leaf_version())
    }

    /// Taproot merkle root: the commitment leaf alone, or its branch with
    /// a non-asset tapscript sibling.
    pub fn merkle_root(&self, sibling: Option<TapNodeHash>) -> TapNodeHash {
        let leaf = TapNodeHash::from(self.tap_leaf());
        match sibling {
            Some(sibling) => TapNodeHash::from_node_hashes(leaf, sibling),
            None => leaf,
        }
    }

    /// Tweaked taproot output key `Q = P + H_TapTweak(P ‖ root)·G`.
    pub fn output_key<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        internal_key: XOnlyPublicKey,
        sibling: Option<TapNodeHash>,
    ) -> XOnlyPublicKey {
        let (output_key, _parity) = internal_key.tap_tweak(secp, Some(self.merkle_root(sibling)));
        output_key.to_inner()
    }

    /// Combined inclusion (or non-inclusion) proof for the asset filed
    /// under (`commitment_id`, `commitment_key`).
    pub fn prove(
        &self,
        commitment_id: [u8; 32],
        commitment_key: [u8; 32],
        internal_key: XOnlyPublicKey,
        tapscript_sibling: Option<TapNodeHash>,
    ) -> CommitmentProof {
        let inner = self
            .commitments
            .get(&commitment_id)
            .map(|commitment| InnerProof {
                version: commitment.version(),
                proof: commitment.proof(&commitment_key),
            });
        CommitmentProof {
            commitment_id,
            commitment_key,
            inner,
            outer: self.tree.merkle_proof(&commitment_id),
            internal_key,
            tapscript_sibling,
        }
    }
}

/// Proof chain from an asset leaf to a taproot output key: inner proof,
/// outer proof, optional tapscript sibling and the internal key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentProof {
    pub commitment_id: [u8; 32],
    pub commitment_key: [u8; 32],
    /// Absent when no commitment exists under `commitment_id`; the outer
    /// proof then shows the empty leaf.
    pub inner: Option<InnerProof>,
    pub outer: Proof,
    pub internal_key: XOnlyPublicKey,
    pub tapscript_sibling: Option<TapNodeHash>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InnerProof {
    pub version: u8,
    pub proof: Proof,
}

impl CommitmentProof {
    /// Verifies that `asset` is committed under the taproot output key.
    pub fn verify_inclusion<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        asset: &Asset,
        expected_output_key: XOnlyPublicKey,
    ) -> Result<(), TapError> {
        let inner = self
            .inner
            .as_ref()
            .ok_or(TapError::ProofInvalid("missing inner commitment proof"))?;
        let inner_root = inner.proof.root(&self.commitment_key, &asset.leaf())?;
        let outer_root = self.outer_root(inner.version, inner_root)?;
        self.check_output_key(secp, outer_root, expected_output_key)
    }

    /// Verifies that no asset sits at `commitment_key` (or that the whole
    /// commitment id is absent) under the taproot output key.
    pub fn verify_non_inclusion<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        expected_output_key: XOnlyPublicKey,
    ) -> Result<(), TapError> {
        let outer_root = match &self.inner {
            Some(inner) => {
                let inner_root = inner.proof.root(&self.commitment_key, &Leaf::empty())?;
                self.outer_root(inner.version, inner_root)?
            }
            None => self.outer.root(&self.commitment_id, &Leaf::empty())?,
        };
        self.check_output_key(secp, outer_root, expected_output_key)
    }

    fn outer_root(&self, version: u8, inner_root: NodeSummary) -> Result<NodeSummary, TapError> {
        let mut value = Vec::with_capacity(41);
        value.push(version);
        value.extend_from_slice(&inner_root.hash);
        value.extend_from_slice(&inner_root.sum.to_be_bytes());
        let leaf = Leaf::new(value, inner_root.sum);
        Ok(self.outer.root(&self.commitment_id, &leaf)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.commitment_id);
        out.extend_from_slice(&self.commitment_key);
        match &self.inner {
            Some(inner) => {
                out.push(1);
                out.push(inner.version);
                let proof = inner.proof.to_bytes();
                out.extend_from_slice(&(proof.len() as u32).to_be_bytes());
                out.extend_from_slice(&proof);
            }
            None => out.push(0),
        }
        let outer = self.outer.to_bytes();
        out.extend_from_slice(&(outer.len() as u32).to_be_bytes());
        out.extend_from_slice(&outer);
        out.extend_from_slice(&self.internal_key.serialize());
        match &self.tapscript_sibling {
            Some(sibling) => {
                out.push(1);
                out.extend_from_slice(&sibling.to_byte_array());
            }
            None => out.push(0),
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TapError> {
        let mut reader = ByteReader::new(bytes);
        let commitment_id = reader.read_array::<32>()?;
        let commitment_key = reader.read_array::<32>()?;
        let inner = if reader.read_u8()? == 1 {
            let version = reader.read_u8()?;
            let len = reader.read_u32()? as usize;
            Some(InnerProof {
                version,
                proof: Proof::from_bytes(reader.read_bytes(len)?)?,
            })
        } else {
            None
        };
        let outer_len = reader.read_u32()? as usize;
        let outer = Proof::from_bytes(reader.read_bytes(outer_len)?)?;
        let internal_key = XOnlyPublicKey::from_slice(&reader.read_array::<32>()?)?;
        let tapscript_sibling = if reader.read_u8()? == 1 {
            Some(TapNodeHash::from_byte_array(reader.read_array::<32>()?))
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            commitment_id,
            commitment_key,
            inner,
            outer,
            internal_key,
            tapscript_sibling,
        })
    }

    fn check_output_key<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        outer_root: NodeSummary,
        expected: XOnlyPublicKey,
    ) -> Result<(), TapError> {
        let mut payload = [0u8; 41];
        payload[0] = COMMITMENT_VERSION;
        payload[1..33].copy_from_slice(&outer_root.hash);
        payload[33..41].copy_from_slice(&outer_root.sum.to_be_bytes());
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(payload)
            .into_script();
        let leaf = TapNodeHash::from(TapLeafHash::from_script(
            &script,
            taproot_asset_leaf_version(),
        ));
        let merkle_root = match self.tapscript_sibling {
            Some(sibling) => TapNodeHash::from_node_hashes(leaf, sibling),
            None => leaf,
        };
        let (output_key, _parity) = self.internal_key.tap_tweak(secp, Some(merkle_root));
        if output_key.to_inner() != expected {
            return Err(TapError::ProofInvalid("taproot output key mismatch"));
        }
        Ok(())
    }
}

/// Preimage of a non-asset tapscript sibling: either a raw leaf script or
/// a branch of two node hashes. Carried in addresses and virtual packets
/// so spenders can reconstruct the full taproot merkle root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SiblingPreimage {
    Leaf(Vec<u8>),
    Branch([u8; 32], [u8; 32]),
}

impl SiblingPreimage {
    pub fn tap_hash(&self) -> TapNodeHash {
        match self {
            SiblingPreimage::Leaf(script) => TapNodeHash::from(TapLeafHash::from_script(
                ScriptBuf::from_bytes(script.clone()).as_script(),
                LeafVersion::TapScript,
            )),
            SiblingPreimage::Branch(left, right) => TapNodeHash::from_node_hashes(
                TapNodeHash::from_byte_array(*left),
                TapNodeHash::from_byte_array(*right),
            ),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SiblingPreimage::Leaf(script) => {
                let mut out = Vec::with_capacity(1 + script.len());
                out.push(0);
                out.extend_from_slice(script);
                out
            }
            SiblingPreimage::Branch(left, right) => {
                let mut out = Vec::with_capacity(65);
                out.push(1);
                out.extend_from_slice(left);
                out.extend_from_slice(right);
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TapError> {
        let mut reader = ByteReader::new(bytes);
        match reader.read_u8()? {
            0 => Ok(SiblingPreimage::Leaf(
                reader.read_bytes(reader.remaining())?.to_vec(),
            )),
            1 => {
                let left = reader.read_array::<32>()?;
                let right = reader.read_array::<32>()?;
                reader.finish()?;
                Ok(SiblingPreimage::Branch(left, right))
            }
            other => Err(TapError::Serialization(format!(
                "unknown sibling preimage tag {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::{test_outpoint, test_script_key};
    use crate::asset::{Asset, AssetType, Genesis, GroupKey};

    fn normal_asset(tag: &str, amount: u64, key_seed: u64) -> Asset {
        let (_, script_key) = test_script_key(key_seed);
        let genesis = Genesis::new(test_outpoint(1), tag, b"", 0, AssetType::Normal);
        Asset::new_genesis(genesis, amount, script_key, None)
    }

    #[test]
    fn empty_commitment_rejected() {
        let secp = Secp256k1::new();
        assert!(matches!(
            AssetCommitment::new(&secp, Vec::new()),
            Err(TapError::NoAssets)
        ));
    }

    #[test]
    fn mixed_genesis_rejected() {
        let secp = Secp256k1::new();
        let a = normal_asset("a", 10, 1);
        let b = normal_asset("b", 10, 2);
        assert!(matches!(
            AssetCommitment::new(&secp, [a, b]),
            Err(TapError::GenesisMismatch)
        ));
    }

    #[test]
    fn duplicate_script_key_rejected() {
        let secp = Secp256k1::new();
        let a = normal_asset("a", 10, 3);
        let mut b = normal_asset("a", 20, 3);
        b.script_key = a.script_key;
        assert!(matches!(
            AssetCommitment::new(&secp, [a, b]),
            Err(TapError::DuplicateScriptKey)
        ));
    }

    #[test]
    fn grouped_assets_share_commitment() {
        let secp = Secp256k1::new();
        let (group_pair, _) = test_script_key(40);
        let mut members = Vec::new();
        for (i, tag) in ["g", "g-tranche-1", "g-tranche-2"].iter().enumerate() {
            let (_, script_key) = test_script_key(50 + i as u64);
            let genesis = Genesis::new(test_outpoint(2), *tag, b"", 0, AssetType::Normal);
            let group = GroupKey::sign(&secp, &group_pair, genesis.asset_id());
            members.push(Asset::new_genesis(
                genesis,
                [100, 50, 25][i],
                script_key,
                Some(group),
            ));
        }
        let commitment = AssetCommitment::new(&secp, members).unwrap();
        assert_eq!(commitment.root().sum, 175);
    }

    #[test]
    fn commitment_sum_and_determinism() {
        let secp = Secp256k1::new();
        let a = normal_asset("gold", 600, 4);
        let b = normal_asset("gold", 400, 5);

        let forward = AssetCommitment::new(&secp, [a.clone(), b.clone()]).unwrap();
        let reversed = AssetCommitment::new(&secp, [b, a]).unwrap();
        assert_eq!(forward.root(), reversed.root());
        assert_eq!(forward.root().sum, 1000);

        let tap_a = TapCommitment::from_commitments([forward]).unwrap();
        let tap_b = TapCommitment::from_commitments([reversed]).unwrap();
        assert_eq!(tap_a.root(), tap_b.root());
        assert_eq!(
            tap_a.leaf_script().as_bytes(),
            tap_b.leaf_script().as_bytes()
        );
        let (_, internal) = test_script_key(6);
        assert_eq!(
            tap_a.output_key(&secp, internal.pub_key, None),
            tap_b.output_key(&secp, internal.pub_key, None)
        );
    }

    #[test]
    fn leaf_script_layout() {
        let secp = Secp256k1::new();
        let commitment = AssetCommitment::new(&secp, [normal_asset("x", 7, 7)]).unwrap();
        let root = commitment.root();
        let tap = TapCommitment::from_commitments([commitment]).unwrap();
        let script = tap.leaf_script();
        let bytes = script.as_bytes();
        // OP_RETURN, push-41, version, root hash, sum.
        assert_eq!(bytes[0], 0x6a);
        assert_eq!(bytes[1], 41);
        assert_eq!(bytes[2], COMMITMENT_VERSION);
        assert_eq!(u64::from_be_bytes(bytes[35..43].try_into().unwrap()), 7);
        // The outer root's sum equals the inner commitment's sum.
        assert_eq!(tap.root().sum, root.sum);
    }

    #[test]
    fn inclusion_and_non_inclusion_proofs() {
        let secp = Secp256k1::new();
        let asset = normal_asset("pearl", 250, 8);
        let commitment_id = asset.commitment_id();
        let commitment_key = asset.commitment_key();
        let commitment = AssetCommitment::new(&secp, [asset.clone()]).unwrap();
        let tap = TapCommitment::from_commitments([commitment]).unwrap();
        let (_, internal) = test_script_key(9);
        let output_key = tap.output_key(&secp, internal.pub_key, None);

        let proof = tap.prove(commitment_id, commitment_key, internal.pub_key, None);
        proof
            .verify_inclusion(&secp, &asset, output_key)
            .unwrap();

        // A different asset under the same proof must fail.
        let other = normal_asset("pearl", 251, 8);
        assert!(proof.verify_inclusion(&secp, &other, output_key).is_err());

        // Absent script key in the same commitment: non-inclusion.
        let (_, absent_key) = test_script_key(10);
        let mut absent = asset.clone();
        absent.script_key = absent_key;
        let proof = tap.prove(
            commitment_id,
            absent.commitment_key(),
            internal.pub_key,
            None,
        );
        proof.verify_non_inclusion(&secp, output_key).unwrap();

        // Absent commitment id entirely.
        let proof = tap.prove([0xee; 32], [0xdd; 32], internal.pub_key, None);
        proof.verify_non_inclusion(&secp, output_key).unwrap();
    }

    #[test]
    fn sibling_changes_output_key() {
        let secp = Secp256k1::new();
        let commitment = AssetCommitment::new(&secp, [normal_asset("y", 5, 11)]).unwrap();
        let tap = TapCommitment::from_commitments([commitment]).unwrap();
        let (_, internal) = test_script_key(12);
        let sibling = SiblingPreimage::Leaf(vec![0x51]).tap_hash();
        let plain = tap.output_key(&secp, internal.pub_key, None);
        let with_sibling = tap.output_key(&secp, internal.pub_key, Some(sibling));
        assert_ne!(plain, with_sibling);
    }

    #[test]
    fn sibling_preimage_round_trip() {
        let leaf = SiblingPreimage::Leaf(vec![0x51, 0x52]);
        assert_eq!(
            SiblingPreimage::from_bytes(&leaf.to_bytes()).unwrap(),
            leaf
        );
        let branch = SiblingPreimage::Branch([1; 32], [2; 32]);
        assert_eq!(
            SiblingPreimage::from_bytes(&branch.to_bytes()).unwrap(),
            branch
        );
    }
}
