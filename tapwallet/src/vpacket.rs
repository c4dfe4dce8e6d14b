//! Virtual asset transactions: an asset-layer transaction whose inputs
//! and outputs reference asset leaves rather than bitcoin outputs. One
//! packet carries exactly one asset id.

use bitcoin::taproot::TapNodeHash;
use bitcoin::{ScriptBuf, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use state_mssmt::{Leaf, Tree};

use crate::address::Chain;
use crate::asset::{Asset, AssetId, AssetType, PrevId, ScriptKey, SplitCommitmentWitness, Witness};
use crate::error::TapError;

pub const VPACKET_VERSION: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VOutputType {
    /// Plain transfer output; carries a split-commitment witness when it
    /// is part of a split.
    Simple,
    /// Change output holding the split commitment root; the zero-amount
    /// variant is the tombstone of a non-interactive full-value send.
    SplitRoot,
    /// Re-anchored passive asset.
    PassiveAssetsOnly,
    /// Re-anchored passive asset that itself carries a split root.
    PassiveSplitRoot,
}

impl VOutputType {
    pub fn to_byte(self) -> u8 {
        match self {
            VOutputType::Simple => 0,
            VOutputType::SplitRoot => 1,
            VOutputType::PassiveAssetsOnly => 2,
            VOutputType::PassiveSplitRoot => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, TapError> {
        match byte {
            0 => Ok(VOutputType::Simple),
            1 => Ok(VOutputType::SplitRoot),
            2 => Ok(VOutputType::PassiveAssetsOnly),
            3 => Ok(VOutputType::PassiveSplitRoot),
            _ => Err(TapError::Serialization(format!(
                "unknown virtual output type {byte}"
            ))),
        }
    }

    pub fn is_split_root(self) -> bool {
        matches!(self, VOutputType::SplitRoot | VOutputType::PassiveSplitRoot)
    }

    pub fn is_passive(self) -> bool {
        matches!(
            self,
            VOutputType::PassiveAssetsOnly | VOutputType::PassiveSplitRoot
        )
    }
}

/// On-chain context of the bitcoin output a virtual input spends from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Anchor {
    pub value: u64,
    pub pk_script: ScriptBuf,
    pub internal_key: XOnlyPublicKey,
    pub merkle_root: Option<TapNodeHash>,
    pub tapscript_sibling: Option<crate::commitment::SiblingPreimage>,
    pub sighash_type: u8,
}

#[derive(Clone, Debug)]
pub struct VInput {
    pub prev_id: PrevId,
    pub anchor: Anchor,
    pub asset: Asset,
    /// Raw provenance proof for the input asset, passed through to the
    /// recipient's proof file.
    pub proof: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct VOutput {
    pub amount: u64,
    pub output_type: VOutputType,
    pub interactive: bool,
    pub anchor_output_index: u32,
    pub anchor_internal_key: XOnlyPublicKey,
    pub anchor_sibling: Option<crate::commitment::SiblingPreimage>,
    pub script_key: ScriptKey,
    pub asset: Option<Asset>,
}

impl VOutput {
    pub fn asset(&self) -> Result<&Asset, TapError> {
        self.asset
            .as_ref()
            .ok_or(TapError::InvalidState("virtual output not yet populated"))
    }
}

#[derive(Clone, Debug)]
pub struct VPacket {
    pub version: u8,
    pub chain: Chain,
    pub inputs: Vec<VInput>,
    pub outputs: Vec<VOutput>,
}

impl VPacket {
    /// The single asset id this packet moves. Mixed ids are rejected;
    /// merging distinct asset ids into one virtual transaction is not
    /// supported.
    pub fn asset_id(&self) -> Result<AssetId, TapError> {
        let mut ids = self
            .inputs
            .iter()
            .map(|input| input.asset.id())
            .chain(self.outputs.iter().filter_map(|output| {
                output.asset.as_ref().map(|asset| asset.id())
            }));
        let first = ids
            .next()
            .ok_or(TapError::InvalidState("virtual packet has no inputs"))?;
        if ids.any(|id| id != first) {
            return Err(TapError::InvalidArgument(
                "virtual packet carries more than one asset id",
            ));
        }
        Ok(first)
    }

    pub fn input_sum(&self) -> u64 {
        self.inputs.iter().map(|input| input.asset.amount).sum()
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    /// Index of the output carrying the transaction witness: the split
    /// root when splitting, the sole simple output otherwise.
    pub fn root_output_index(&self) -> Result<usize, TapError> {
        if let Some(index) = self
            .outputs
            .iter()
            .position(|output| output.output_type == VOutputType::SplitRoot)
        {
            return Ok(index);
        }
        if self.outputs.len() == 1 && self.outputs[0].output_type == VOutputType::Simple {
            return Ok(0);
        }
        Err(TapError::InvalidState("virtual packet has no root output"))
    }

    /// Σ(outputs) must equal Σ(inputs); tombstones contribute zero.
    pub fn validate_balance(&self) -> Result<(), TapError> {
        if self.input_sum() != self.output_sum() {
            return Err(TapError::InvalidArgument(
                "virtual transaction does not balance",
            ));
        }
        Ok(())
    }

    /// Highest referenced anchor output index, for allocating the bitcoin
    /// transaction outputs.
    pub fn max_anchor_index(&self) -> u32 {
        self.outputs
            .iter()
            .map(|output| output.anchor_output_index)
            .max()
            .unwrap_or(0)
    }
}

/// `SplitLocator = SHA256(output_index ‖ asset_id ‖ script_key)`.
pub fn split_locator(output_index: u32, asset_id: AssetId, script_key: ScriptKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(output_index.to_be_bytes());
    hasher.update(asset_id.0);
    hasher.update(script_key.to_bytes());
    hasher.finalize().into()
}

/// Builds the virtual packet for a send of `amount` units out of
/// `inputs`. An interactive full-value send produces a single simple
/// output; every other shape produces a split root (zero-amount tombstone
/// for the non-interactive full-value case) plus one simple split output.
pub fn build_send_packet(
    chain: Chain,
    inputs: Vec<VInput>,
    recipient_script_key: ScriptKey,
    recipient_internal_key: XOnlyPublicKey,
    amount: u64,
    interactive: bool,
    change_script_key: ScriptKey,
    change_internal_key: XOnlyPublicKey,
) -> Result<VPacket, TapError> {
    if inputs.is_empty() {
        return Err(TapError::InvalidArgument("send requires at least one input"));
    }
    let asset_id = inputs[0].asset.id();
    if inputs.iter().any(|input| input.asset.id() != asset_id) {
        return Err(TapError::InvalidArgument(
            "virtual packet carries more than one asset id",
        ));
    }
    let total: u64 = inputs.iter().map(|input| input.asset.amount).sum();
    if amount > total {
        return Err(TapError::InvalidArgument("send exceeds selected inputs"));
    }
    let asset_type = inputs[0].asset.asset_type();
    if asset_type == AssetType::Collectible && amount != total {
        return Err(TapError::InvalidArgument("collectibles cannot be split"));
    }

    let mut packet = VPacket {
        version: VPACKET_VERSION,
        chain,
        inputs,
        outputs: Vec::new(),
    };

    if interactive && amount == total {
        // Full-value send to an aware recipient: no split required.
        packet.outputs.push(VOutput {
            amount,
            output_type: VOutputType::Simple,
            interactive: true,
            anchor_output_index: 0,
            anchor_internal_key: recipient_internal_key,
            anchor_sibling: None,
            script_key: recipient_script_key,
            asset: None,
        });
    } else {
        packet.outputs.push(VOutput {
            amount: total - amount,
            output_type: VOutputType::SplitRoot,
            interactive: false,
            anchor_output_index: 0,
            anchor_internal_key: change_internal_key,
            anchor_sibling: None,
            script_key: change_script_key,
            asset: None,
        });
        packet.outputs.push(VOutput {
            amount,
            output_type: VOutputType::Simple,
            interactive,
            anchor_output_index: 1,
            anchor_internal_key: recipient_internal_key,
            anchor_sibling: None,
            script_key: recipient_script_key,
            asset: None,
        });
    }

    populate_output_assets(&mut packet)?;
    Ok(packet)
}

/// Constructs the output assets: the root asset with one (unsigned)
/// witness per input, and for split shapes the split commitment tree with
/// a proof-carrying split asset per simple output.
fn populate_output_assets(packet: &mut VPacket) -> Result<(), TapError> {
    packet.validate_balance()?;
    let template = &packet.inputs[0].asset;
    let primary_prev_id = packet.inputs[0].prev_id;
    let asset_id = template.id();

    let input_witnesses: Vec<Witness> = packet
        .inputs
        .iter()
        .map(|input| Witness {
            prev_id: input.prev_id,
            tx_witness: Vec::new(),
            split_commitment: None,
        })
        .collect();

    let root_index = packet.root_output_index()?;
    if packet.outputs[root_index].output_type == VOutputType::Simple {
        // Interactive full-value: the sole output carries the whole
        // balance and the transaction witness directly.
        let output = &mut packet.outputs[root_index];
        let mut asset = template.clone();
        asset.amount = output.amount;
        asset.script_key = output.script_key;
        asset.prev_witnesses = input_witnesses;
        asset.split_commitment_root = None;
        output.asset = Some(asset);
        return Ok(());
    }

    // Split shape: every output (root included) gets a locator leaf in
    // the split tree, keyed by its output index and script key.
    let mut tree = Tree::new();
    let mut split_leaves = Vec::with_capacity(packet.outputs.len());
    for (index, output) in packet.outputs.iter().enumerate() {
        let locator = split_locator(index as u32, asset_id, output.script_key);
        if tree.get(&locator).is_some() {
            return Err(TapError::InvalidState("split locator collision"));
        }
        let mut split_asset = template.clone();
        split_asset.amount = output.amount;
        split_asset.script_key = output.script_key;
        split_asset.prev_witnesses = vec![Witness {
            prev_id: primary_prev_id,
            tx_witness: Vec::new(),
            split_commitment: None,
        }];
        split_asset.split_commitment_root = None;
        tree.insert(&locator, Leaf::new(split_asset.to_bytes(), output.amount))?;
        split_leaves.push((locator, split_asset));
    }

    let mut root_asset = template.clone();
    root_asset.amount = packet.outputs[root_index].amount;
    root_asset.script_key = packet.outputs[root_index].script_key;
    root_asset.prev_witnesses = input_witnesses;
    root_asset.split_commitment_root = Some(tree.root());

    for (index, output) in packet.outputs.iter_mut().enumerate() {
        if index == root_index {
            output.asset = Some(root_asset.clone());
            continue;
        }
        let (locator, mut split_asset) = split_leaves[index].clone();
        split_asset.prev_witnesses = vec![Witness {
            prev_id: primary_prev_id,
            tx_witness: Vec::new(),
            split_commitment: Some(Box::new(SplitCommitmentWitness {
                proof: tree.merkle_proof(&locator),
                root_asset: root_asset.clone(),
            })),
        }];
        output.asset = Some(split_asset);
    }
    Ok(())
}

/// Re-embeds the signed root asset into every split output's witness.
/// Called after the virtual VM fills the root's transaction witness.
pub fn update_split_witnesses(packet: &mut VPacket) -> Result<(), TapError> {
    let root_index = packet.root_output_index()?;
    let root_asset = packet.outputs[root_index].asset()?.clone();
    for (index, output) in packet.outputs.iter_mut().enumerate() {
        if index == root_index {
            continue;
        }
        let asset = output
            .asset
            .as_mut()
            .ok_or(TapError::InvalidState("virtual output not yet populated"))?;
        for witness in &mut asset.prev_witnesses {
            if let Some(split) = witness.split_commitment.as_mut() {
                split.root_asset = root_asset.clone();
            }
        }
    }
    Ok(())
}

/// Lightweight re-anchoring packet for an asset co-located in a spent
/// commitment but not itself transferred. The asset is carried over
/// byte-identical; only the anchor context changes.
pub fn passive_packet(
    chain: Chain,
    input: VInput,
    anchor_output_index: u32,
    anchor_internal_key: XOnlyPublicKey,
) -> VPacket {
    let asset = input.asset.clone();
    let output_type = if asset.split_commitment_root.is_some() {
        VOutputType::PassiveSplitRoot
    } else {
        VOutputType::PassiveAssetsOnly
    };
    let output = VOutput {
        amount: asset.amount,
        output_type,
        interactive: true,
        anchor_output_index,
        anchor_internal_key,
        anchor_sibling: None,
        script_key: asset.script_key,
        asset: Some(asset),
    };
    VPacket {
        version: VPACKET_VERSION,
        chain,
        inputs: vec![input],
        outputs: vec![output],
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::asset::tests::{test_outpoint, test_script_key};
    use crate::asset::Genesis;

    pub(crate) fn test_input(amount: u64, key_seed: u64) -> VInput {
        let (_, script_key) = test_script_key(key_seed);
        let (_, internal) = test_script_key(key_seed + 1000);
        let genesis = Genesis::new(test_outpoint(1), "spark", b"m", 0, AssetType::Normal);
        let mut asset = Asset::new_genesis(genesis, amount, script_key, None);
        // Simulate a post-genesis asset living at some anchor outpoint.
        asset.prev_witnesses = vec![Witness::genesis()];
        VInput {
            prev_id: PrevId::new(test_outpoint(30), asset.id(), script_key),
            anchor: Anchor {
                value: 1_000,
                pk_script: ScriptBuf::new(),
                internal_key: internal.pub_key,
                merkle_root: None,
                tapscript_sibling: None,
                sighash_type: 0,
            },
            asset,
            proof: None,
        }
    }

    #[test]
    fn partial_send_splits_with_change() {
        let (_, recipient) = test_script_key(60);
        let (_, recipient_internal) = test_script_key(61);
        let (_, change) = test_script_key(62);
        let (_, change_internal) = test_script_key(63);
        let packet = build_send_packet(
            Chain::Mainnet,
            vec![test_input(1000, 50)],
            recipient,
            recipient_internal.pub_key,
            300,
            false,
            change,
            change_internal.pub_key,
        )
        .unwrap();

        assert_eq!(packet.outputs.len(), 2);
        let root = &packet.outputs[0];
        assert_eq!(root.output_type, VOutputType::SplitRoot);
        assert_eq!(root.amount, 700);
        assert!(root.asset.as_ref().unwrap().split_commitment_root.is_some());

        let simple = &packet.outputs[1];
        assert_eq!(simple.output_type, VOutputType::Simple);
        assert_eq!(simple.amount, 300);
        let witness = &simple.asset.as_ref().unwrap().prev_witnesses[0];
        assert!(witness.split_commitment.is_some());

        assert_eq!(packet.input_sum(), packet.output_sum());
        packet.validate_balance().unwrap();
    }

    #[test]
    fn non_interactive_full_value_leaves_tombstone() {
        let (_, recipient) = test_script_key(70);
        let (_, recipient_internal) = test_script_key(71);
        let (_, change) = test_script_key(72);
        let (_, change_internal) = test_script_key(73);
        let packet = build_send_packet(
            Chain::Mainnet,
            vec![test_input(100, 51)],
            recipient,
            recipient_internal.pub_key,
            100,
            false,
            change,
            change_internal.pub_key,
        )
        .unwrap();

        let root = &packet.outputs[0];
        assert_eq!(root.output_type, VOutputType::SplitRoot);
        assert_eq!(root.amount, 0);
        assert!(root.asset.as_ref().unwrap().is_tombstone());

        let simple = &packet.outputs[1];
        assert_eq!(simple.amount, 100);
        let asset_id = packet.inputs[0].asset.id();
        // Split locator binds the simple output at index 1.
        let locator = split_locator(1, asset_id, simple.script_key);
        let witness = simple.asset.as_ref().unwrap().prev_witnesses[0]
            .split_commitment
            .as_ref()
            .unwrap();
        let root_summary = witness.root_asset.split_commitment_root.unwrap();
        let mut probe = simple.asset.as_ref().unwrap().clone();
        probe.prev_witnesses = vec![Witness {
            prev_id: packet.inputs[0].prev_id,
            tx_witness: Vec::new(),
            split_commitment: None,
        }];
        assert!(witness.proof.verify(
            &locator,
            &state_mssmt::Leaf::new(probe.to_bytes(), probe.amount),
            &root_summary,
        ));
    }

    #[test]
    fn interactive_full_value_has_no_split() {
        let (_, recipient) = test_script_key(80);
        let (_, recipient_internal) = test_script_key(81);
        let (_, change) = test_script_key(82);
        let (_, change_internal) = test_script_key(83);
        let packet = build_send_packet(
            Chain::Mainnet,
            vec![test_input(100, 52)],
            recipient,
            recipient_internal.pub_key,
            100,
            true,
            change,
            change_internal.pub_key,
        )
        .unwrap();
        assert_eq!(packet.outputs.len(), 1);
        assert_eq!(packet.outputs[0].output_type, VOutputType::Simple);
        let asset = packet.outputs[0].asset.as_ref().unwrap();
        assert!(asset.split_commitment_root.is_none());
        assert_eq!(asset.amount, 100);
    }

    #[test]
    fn overspend_rejected() {
        let (_, recipient) = test_script_key(90);
        let (_, recipient_internal) = test_script_key(91);
        let (_, change) = test_script_key(92);
        let (_, change_internal) = test_script_key(93);
        assert!(build_send_packet(
            Chain::Mainnet,
            vec![test_input(10, 53)],
            recipient,
            recipient_internal.pub_key,
            11,
            false,
            change,
            change_internal.pub_key,
        )
        .is_err());
    }

    #[test]
    fn passive_packet_preserves_asset() {
        let input = test_input(40, 54);
        let original = input.asset.clone();
        let (_, internal) = test_script_key(95);
        let packet = passive_packet(Chain::Mainnet, input, 0, internal.pub_key);
        let carried = packet.outputs[0].asset.as_ref().unwrap();
        assert_eq!(*carried, original);
        assert_eq!(packet.outputs[0].output_type, VOutputType::PassiveAssetsOnly);
        assert!(packet.outputs[0].interactive);
    }
}
