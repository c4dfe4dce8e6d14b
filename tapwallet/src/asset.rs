//! Asset leaves, genesis descriptors, group keys and transfer witnesses,
//! plus the canonical byte encoding used for MS-SMT leaf payloads and
//! PSBT blobs.

use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{schnorr, Keypair, Message, Secp256k1, Signing, Verification};
use bitcoin::{OutPoint, Txid, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use state_mssmt::{Leaf, NodeSummary, Proof};

use crate::error::TapError;

/// Current asset serialization version.
pub const ASSET_VERSION_V0: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Normal,
    Collectible,
}

impl AssetType {
    pub fn to_byte(self) -> u8 {
        match self {
            AssetType::Normal => 0,
            AssetType::Collectible => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, TapError> {
        match byte {
            0 => Ok(AssetType::Normal),
            1 => Ok(AssetType::Collectible),
            _ => Err(TapError::Serialization(format!(
                "unknown asset type {byte}"
            ))),
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetType::Normal => write!(f, "normal"),
            AssetType::Collectible => write!(f, "collectible"),
        }
    }
}

/// 32-byte identifier binding an asset to its genesis context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId(pub [u8; 32]);

impl AssetId {
    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl AsRef<[u8]> for AssetId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", hex::encode(self.0))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Genesis context an asset was minted under. The outpoint is the first
/// input of the genesis transaction, shared by every asset in a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Genesis {
    pub first_prev_out: OutPoint,
    pub tag: String,
    pub meta_hash: [u8; 32],
    pub output_index: u32,
    pub asset_type: AssetType,
}

impl Genesis {
    pub fn new(
        first_prev_out: OutPoint,
        tag: impl Into<String>,
        meta: &[u8],
        output_index: u32,
        asset_type: AssetType,
    ) -> Self {
        Self {
            first_prev_out,
            tag: tag.into(),
            meta_hash: Sha256::digest(meta).into(),
            output_index,
            asset_type,
        }
    }

    /// `asset_id = SHA256(outpoint ‖ tag ‖ meta_hash ‖ output_index ‖ type)`.
    pub fn asset_id(&self) -> AssetId {
        let mut hasher = Sha256::new();
        hasher.update(self.first_prev_out.txid.to_byte_array());
        hasher.update(self.first_prev_out.vout.to_be_bytes());
        hasher.update(self.tag.as_bytes());
        hasher.update(self.meta_hash);
        hasher.update(self.output_index.to_be_bytes());
        hasher.update([self.asset_type.to_byte()]);
        AssetId(hasher.finalize().into())
    }
}

/// Taproot key controlling transfer authority over an asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub pub_key: XOnlyPublicKey,
}

impl ScriptKey {
    pub fn new(pub_key: XOnlyPublicKey) -> Self {
        Self { pub_key }
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.pub_key.serialize()
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, TapError> {
        Ok(Self {
            pub_key: XOnlyPublicKey::from_slice(bytes)?,
        })
    }
}

/// Optional re-issuance key. Membership of an asset in the group is proved
/// by a schnorr signature over its asset id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupKey {
    pub pub_key: XOnlyPublicKey,
    pub sig: schnorr::Signature,
}

impl GroupKey {
    /// Signs `asset_id` with the group keypair, binding the asset into
    /// the group.
    pub fn sign<C: Signing>(secp: &Secp256k1<C>, keypair: &Keypair, asset_id: AssetId) -> Self {
        let msg = Message::from_digest(asset_id.0);
        Self {
            pub_key: keypair.x_only_public_key().0,
            sig: secp.sign_schnorr(&msg, keypair),
        }
    }

    pub fn verify<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        asset_id: AssetId,
    ) -> Result<(), TapError> {
        let msg = Message::from_digest(asset_id.0);
        secp.verify_schnorr(&self.sig, &msg, &self.pub_key)
            .map_err(|_| TapError::InvalidGenesisSignature)
    }

    /// Outer-tree commitment id for grouped assets.
    pub fn group_id(&self) -> [u8; 32] {
        Sha256::digest(self.pub_key.serialize()).into()
    }
}

/// Reference to the asset consumed by a witness. Genesis witnesses carry
/// the all-zero prev id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrevId {
    pub out_point: OutPoint,
    pub asset_id: AssetId,
    pub script_key: [u8; 32],
}

impl PrevId {
    pub fn zero() -> Self {
        Self {
            out_point: OutPoint::null(),
            asset_id: AssetId([0u8; 32]),
            script_key: [0u8; 32],
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    pub fn new(out_point: OutPoint, asset_id: AssetId, script_key: ScriptKey) -> Self {
        Self {
            out_point,
            asset_id,
            script_key: script_key.to_bytes(),
        }
    }
}

/// Witness over a previous asset: either a transaction witness (schnorr
/// signature stack produced by the virtual VM) or a split-commitment
/// witness pointing into the root output's split tree, never both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Witness {
    pub prev_id: PrevId,
    pub tx_witness: Vec<Vec<u8>>,
    pub split_commitment: Option<Box<SplitCommitmentWitness>>,
}

impl Witness {
    pub fn genesis() -> Self {
        Self {
            prev_id: PrevId::zero(),
            tx_witness: Vec::new(),
            split_commitment: None,
        }
    }
}

/// Binds a split output back to its split root: the proof locates the
/// split leaf inside the root asset's split commitment tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitCommitmentWitness {
    pub proof: Proof,
    pub root_asset: Asset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset {
    pub version: u8,
    pub genesis: Genesis,
    pub amount: u64,
    pub script_key: ScriptKey,
    pub group_key: Option<GroupKey>,
    pub prev_witnesses: Vec<Witness>,
    pub split_commitment_root: Option<NodeSummary>,
}

impl Asset {
    /// A freshly minted asset carrying the zero prev id genesis witness.
    pub fn new_genesis(
        genesis: Genesis,
        amount: u64,
        script_key: ScriptKey,
        group_key: Option<GroupKey>,
    ) -> Self {
        Self {
            version: ASSET_VERSION_V0,
            genesis,
            amount,
            script_key,
            group_key,
            prev_witnesses: vec![Witness::genesis()],
            split_commitment_root: None,
        }
    }

    pub fn id(&self) -> AssetId {
        self.genesis.asset_id()
    }

    pub fn asset_type(&self) -> AssetType {
        self.genesis.asset_type
    }

    /// Inner-tree key: `SHA256(asset_id ‖ script_key)`.
    pub fn commitment_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.id().0);
        hasher.update(self.script_key.to_bytes());
        hasher.finalize().into()
    }

    /// Outer-tree key: the asset id for ungrouped assets, the hashed
    /// group key otherwise.
    pub fn commitment_id(&self) -> [u8; 32] {
        match &self.group_key {
            Some(group) => group.group_id(),
            None => self.id().0,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_witnesses.len() == 1 && self.prev_witnesses[0].prev_id.is_zero()
    }

    pub fn has_split_commitment_witness(&self) -> bool {
        self.prev_witnesses
            .iter()
            .any(|w| w.split_commitment.is_some())
    }

    /// Zero-amount split root left behind by a non-interactive
    /// full-value send.
    pub fn is_tombstone(&self) -> bool {
        self.amount == 0 && self.split_commitment_root.is_some()
    }

    /// MS-SMT leaf: canonical bytes, summed by amount.
    pub fn leaf(&self) -> Leaf {
        Leaf::new(self.to_bytes(), self.amount)
    }

    pub fn validate<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<(), TapError> {
        if self.version != ASSET_VERSION_V0 {
            return Err(TapError::Serialization(format!(
                "unsupported asset version {}",
                self.version
            )));
        }
        match self.asset_type() {
            AssetType::Collectible => {
                if self.amount != 1 {
                    return Err(TapError::InvalidArgument("collectible amount must be 1"));
                }
                if self.split_commitment_root.is_some() || self.has_split_commitment_witness() {
                    return Err(TapError::InvalidArgument("collectibles cannot be split"));
                }
            }
            AssetType::Normal => {
                if self.amount == 0 && self.split_commitment_root.is_none() {
                    return Err(TapError::InvalidArgument(
                        "zero amount only valid for split root tombstones",
                    ));
                }
            }
        }
        if let Some(group) = &self.group_key {
            group.verify(secp, self.id())?;
        }
        for witness in &self.prev_witnesses {
            if witness.split_commitment.is_some() && !witness.tx_witness.is_empty() {
                return Err(TapError::InvalidArgument(
                    "witness carries both signature stack and split commitment",
                ));
            }
        }
        if self.has_split_commitment_witness() && self.prev_witnesses.len() != 1 {
            return Err(TapError::InvalidArgument(
                "split asset must carry exactly one witness",
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.push(self.version);
        write_genesis(&mut out, &self.genesis);
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.script_key.to_bytes());
        match &self.group_key {
            Some(group) => {
                out.push(1);
                out.extend_from_slice(&group.pub_key.serialize());
                out.extend_from_slice(&group.sig.serialize());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.prev_witnesses.len() as u16).to_be_bytes());
        for witness in &self.prev_witnesses {
            write_witness(&mut out, witness);
        }
        match &self.split_commitment_root {
            Some(root) => {
                out.push(1);
                out.extend_from_slice(&root.hash);
                out.extend_from_slice(&root.sum.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TapError> {
        let mut reader = ByteReader::new(bytes);
        let asset = read_asset(&mut reader)?;
        reader.finish()?;
        Ok(asset)
    }
}

fn write_genesis(out: &mut Vec<u8>, genesis: &Genesis) {
    out.extend_from_slice(&genesis.first_prev_out.txid.to_byte_array());
    out.extend_from_slice(&genesis.first_prev_out.vout.to_be_bytes());
    out.extend_from_slice(&(genesis.tag.len() as u16).to_be_bytes());
    out.extend_from_slice(genesis.tag.as_bytes());
    out.extend_from_slice(&genesis.meta_hash);
    out.extend_from_slice(&genesis.output_index.to_be_bytes());
    out.push(genesis.asset_type.to_byte());
}

fn write_witness(out: &mut Vec<u8>, witness: &Witness) {
    out.extend_from_slice(&witness.prev_id.out_point.txid.to_byte_array());
    out.extend_from_slice(&witness.prev_id.out_point.vout.to_be_bytes());
    out.extend_from_slice(&witness.prev_id.asset_id.0);
    out.extend_from_slice(&witness.prev_id.script_key);
    out.extend_from_slice(&(witness.tx_witness.len() as u16).to_be_bytes());
    for item in &witness.tx_witness {
        out.extend_from_slice(&(item.len() as u16).to_be_bytes());
        out.extend_from_slice(item);
    }
    match &witness.split_commitment {
        Some(split) => {
            out.push(1);
            let proof = split.proof.to_bytes();
            out.extend_from_slice(&(proof.len() as u32).to_be_bytes());
            out.extend_from_slice(&proof);
            let root = split.root_asset.to_bytes();
            out.extend_from_slice(&(root.len() as u32).to_be_bytes());
            out.extend_from_slice(&root);
        }
        None => out.push(0),
    }
}

fn read_asset(reader: &mut ByteReader<'_>) -> Result<Asset, TapError> {
    let version = reader.read_u8()?;
    let genesis = read_genesis(reader)?;
    let amount = reader.read_u64()?;
    let script_key = ScriptKey::from_bytes(&reader.read_array::<32>()?)?;
    let group_key = if reader.read_u8()? == 1 {
        let pub_key = XOnlyPublicKey::from_slice(&reader.read_array::<32>()?)?;
        let sig = schnorr::Signature::from_slice(&reader.read_array::<64>()?)?;
        Some(GroupKey { pub_key, sig })
    } else {
        None
    };
    let witness_count = reader.read_u16()? as usize;
    let mut prev_witnesses = Vec::with_capacity(witness_count);
    for _ in 0..witness_count {
        prev_witnesses.push(read_witness(reader)?);
    }
    let split_commitment_root = if reader.read_u8()? == 1 {
        let hash = reader.read_array::<32>()?;
        let sum = reader.read_u64()?;
        Some(NodeSummary { hash, sum })
    } else {
        None
    };
    Ok(Asset {
        version,
        genesis,
        amount,
        script_key,
        group_key,
        prev_witnesses,
        split_commitment_root,
    })
}

fn read_genesis(reader: &mut ByteReader<'_>) -> Result<Genesis, TapError> {
    let txid = Txid::from_byte_array(reader.read_array::<32>()?);
    let vout = reader.read_u32()?;
    let tag_len = reader.read_u16()? as usize;
    let tag = String::from_utf8(reader.read_bytes(tag_len)?.to_vec())
        .map_err(|_| TapError::Serialization("genesis tag is not utf-8".into()))?;
    let meta_hash = reader.read_array::<32>()?;
    let output_index = reader.read_u32()?;
    let asset_type = AssetType::from_byte(reader.read_u8()?)?;
    Ok(Genesis {
        first_prev_out: OutPoint { txid, vout },
        tag,
        meta_hash,
        output_index,
        asset_type,
    })
}

fn read_witness(reader: &mut ByteReader<'_>) -> Result<Witness, TapError> {
    let txid = Txid::from_byte_array(reader.read_array::<32>()?);
    let vout = reader.read_u32()?;
    let asset_id = AssetId(reader.read_array::<32>()?);
    let script_key = reader.read_array::<32>()?;
    let item_count = reader.read_u16()? as usize;
    let mut tx_witness = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        let len = reader.read_u16()? as usize;
        tx_witness.push(reader.read_bytes(len)?.to_vec());
    }
    let split_commitment = if reader.read_u8()? == 1 {
        let proof_len = reader.read_u32()? as usize;
        let proof = Proof::from_bytes(reader.read_bytes(proof_len)?)?;
        let asset_len = reader.read_u32()? as usize;
        let root_asset = Asset::from_bytes(reader.read_bytes(asset_len)?)?;
        Some(Box::new(SplitCommitmentWitness { proof, root_asset }))
    } else {
        None
    };
    Ok(Witness {
        prev_id: PrevId {
            out_point: OutPoint { txid, vout },
            asset_id,
            script_key,
        },
        tx_witness,
        split_commitment,
    })
}

/// Cursor over a byte slice shared by the hand-rolled decoders.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], TapError> {
        if self.bytes.len() < len {
            return Err(TapError::Serialization("unexpected end of input".into()));
        }
        let (taken, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(taken)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N], TapError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, TapError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, TapError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, TapError> {
        Ok(u32::from_be_bytes(self.read_array::<4>()?))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, TapError> {
        Ok(u64::from_be_bytes(self.read_array::<8>()?))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn finish(&self) -> Result<(), TapError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(TapError::Serialization("trailing bytes after decode".into()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;
    use rand::{rngs::StdRng, SeedableRng};

    pub(crate) fn test_outpoint(byte: u8) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([byte; 32]),
            vout: u32::from(byte),
        }
    }

    pub(crate) fn test_script_key(seed: u64) -> (Keypair, ScriptKey) {
        let secp = Secp256k1::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let keypair = Keypair::new(&secp, &mut rng);
        (keypair, ScriptKey::new(keypair.x_only_public_key().0))
    }

    #[test]
    fn asset_id_binds_every_genesis_field() {
        let base = Genesis::new(test_outpoint(1), "gold", &[0u8], 0, AssetType::Normal);
        let mut tweaked = base.clone();
        tweaked.tag = "g0ld".into();
        assert_ne!(base.asset_id(), tweaked.asset_id());

        let mut tweaked = base.clone();
        tweaked.output_index = 1;
        assert_ne!(base.asset_id(), tweaked.asset_id());

        let collectible = Genesis::new(test_outpoint(1), "gold", &[0u8], 0, AssetType::Collectible);
        assert_ne!(base.asset_id(), collectible.asset_id());
    }

    #[test]
    fn asset_id_matches_manual_hash() {
        let genesis = Genesis::new(test_outpoint(9), "a", &[0x00], 0, AssetType::Normal);
        let mut hasher = Sha256::new();
        hasher.update([9u8; 32]);
        hasher.update(9u32.to_be_bytes());
        hasher.update(b"a");
        hasher.update(Sha256::digest([0x00]));
        hasher.update(0u32.to_be_bytes());
        hasher.update([0u8]);
        assert_eq!(genesis.asset_id().0, <[u8; 32]>::from(hasher.finalize()));
    }

    #[test]
    fn encode_decode_round_trip() {
        let secp = Secp256k1::new();
        let (group_pair, _) = test_script_key(1);
        let (_, script_key) = test_script_key(2);
        let genesis = Genesis::new(test_outpoint(3), "silver", b"meta", 0, AssetType::Normal);
        let group = GroupKey::sign(&secp, &group_pair, genesis.asset_id());
        let asset = Asset::new_genesis(genesis, 550, script_key, Some(group));

        let decoded = Asset::from_bytes(&asset.to_bytes()).unwrap();
        assert_eq!(asset, decoded);
        decoded.validate(&secp).unwrap();
    }

    #[test]
    fn group_signature_over_wrong_id_fails_validation() {
        let secp = Secp256k1::new();
        let (group_pair, _) = test_script_key(4);
        let (_, script_key) = test_script_key(5);
        let genesis = Genesis::new(test_outpoint(6), "iron", b"", 0, AssetType::Normal);
        let other = Genesis::new(test_outpoint(7), "tin", b"", 0, AssetType::Normal);
        // Sign the wrong asset id.
        let group = GroupKey::sign(&secp, &group_pair, other.asset_id());
        let asset = Asset::new_genesis(genesis, 10, script_key, Some(group));
        assert!(matches!(
            asset.validate(&secp),
            Err(TapError::InvalidGenesisSignature)
        ));
    }

    #[test]
    fn collectible_amount_must_be_one() {
        let secp = Secp256k1::new();
        let (_, script_key) = test_script_key(8);
        let genesis = Genesis::new(test_outpoint(9), "card", b"", 0, AssetType::Collectible);
        let mut asset = Asset::new_genesis(genesis, 1, script_key, None);
        asset.validate(&secp).unwrap();
        asset.amount = 2;
        assert!(asset.validate(&secp).is_err());
    }

    #[test]
    fn truncated_bytes_rejected() {
        let (_, script_key) = test_script_key(10);
        let genesis = Genesis::new(test_outpoint(11), "x", b"", 0, AssetType::Normal);
        let asset = Asset::new_genesis(genesis, 5, script_key, None);
        let mut bytes = asset.to_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(Asset::from_bytes(&bytes).is_err());
    }
}
