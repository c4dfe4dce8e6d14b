//! BIP-174 representation of virtual packets. Anchor context rides in
//! the standard PSBT taproot fields; everything asset-specific is stored
//! under proprietary key-value pairs at base 0x70.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{raw, Psbt, PsbtSighashType};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid};

use crate::address::Chain;
use crate::asset::{Asset, AssetId, ByteReader, PrevId, ScriptKey};
use crate::commitment::SiblingPreimage;
use crate::error::TapError;
use crate::vpacket::{Anchor, VInput, VOutput, VOutputType, VPacket};

const PROPRIETARY_PREFIX: &[u8] = b"tap";

// Global scope.
const GLOBAL_IS_VIRTUAL: u8 = 0x70;
const GLOBAL_CHAIN_HRP: u8 = 0x71;
const GLOBAL_VERSION: u8 = 0x72;

// Per-input scope.
const IN_PREV_ID: u8 = 0x70;
const IN_SIBLING_PREIMAGE: u8 = 0x71;
const IN_ASSET: u8 = 0x72;
const IN_PROOF: u8 = 0x73;

// Per-output scope.
const OUT_TYPE: u8 = 0x70;
const OUT_INTERACTIVE: u8 = 0x71;
const OUT_ANCHOR_INDEX: u8 = 0x72;
const OUT_SCRIPT_KEY: u8 = 0x73;
const OUT_ASSET: u8 = 0x74;
const OUT_SPLIT_ASSET: u8 = 0x75;
const OUT_SIBLING_PREIMAGE: u8 = 0x76;

fn key(subtype: u8) -> raw::ProprietaryKey {
    raw::ProprietaryKey {
        prefix: PROPRIETARY_PREFIX.to_vec(),
        subtype,
        key: Vec::new(),
    }
}

fn get<'a>(
    map: &'a BTreeMap<raw::ProprietaryKey, Vec<u8>>,
    subtype: u8,
) -> Option<&'a [u8]> {
    map.get(&key(subtype)).map(Vec::as_slice)
}

fn require<'a>(
    map: &'a BTreeMap<raw::ProprietaryKey, Vec<u8>>,
    subtype: u8,
    what: &str,
) -> Result<&'a [u8], TapError> {
    get(map, subtype).ok_or_else(|| TapError::Serialization(format!("missing {what} record")))
}

fn encode_prev_id(prev_id: &PrevId) -> Vec<u8> {
    let mut out = Vec::with_capacity(100);
    out.extend_from_slice(&prev_id.out_point.txid.to_byte_array());
    out.extend_from_slice(&prev_id.out_point.vout.to_be_bytes());
    out.extend_from_slice(&prev_id.asset_id.0);
    out.extend_from_slice(&prev_id.script_key);
    out
}

fn decode_prev_id(bytes: &[u8]) -> Result<PrevId, TapError> {
    let mut reader = ByteReader::new(bytes);
    let txid = Txid::from_byte_array(reader.read_array::<32>()?);
    let vout = reader.read_u32()?;
    let asset_id = AssetId(reader.read_array::<32>()?);
    let script_key = reader.read_array::<32>()?;
    reader.finish()?;
    Ok(PrevId {
        out_point: bitcoin::OutPoint { txid, vout },
        asset_id,
        script_key,
    })
}

/// Serializes the packet into a PSBT whose unsigned transaction spends
/// the anchor outpoints and reserves one output slot per anchor index.
pub fn encode_packet(packet: &VPacket) -> Result<Psbt, TapError> {
    let unsigned = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: packet
            .inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.prev_id.out_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::default(),
            })
            .collect(),
        output: (0..=packet.max_anchor_index())
            .map(|_| TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::new(),
            })
            .collect(),
    };
    let mut psbt = Psbt::from_unsigned_tx(unsigned)
        .map_err(|err| TapError::Serialization(err.to_string()))?;

    psbt.proprietary.insert(key(GLOBAL_IS_VIRTUAL), vec![1]);
    psbt.proprietary.insert(
        key(GLOBAL_CHAIN_HRP),
        packet.chain.hrp().as_bytes().to_vec(),
    );
    psbt.proprietary
        .insert(key(GLOBAL_VERSION), vec![packet.version]);

    for (input, psbt_in) in packet.inputs.iter().zip(psbt.inputs.iter_mut()) {
        psbt_in.witness_utxo = Some(TxOut {
            value: Amount::from_sat(input.anchor.value),
            script_pubkey: input.anchor.pk_script.clone(),
        });
        psbt_in.tap_internal_key = Some(input.anchor.internal_key);
        psbt_in.tap_merkle_root = input.anchor.merkle_root;
        if input.anchor.sighash_type != 0 {
            psbt_in.sighash_type = Some(PsbtSighashType::from_u32(u32::from(
                input.anchor.sighash_type,
            )));
        }
        psbt_in
            .proprietary
            .insert(key(IN_PREV_ID), encode_prev_id(&input.prev_id));
        if let Some(sibling) = &input.anchor.tapscript_sibling {
            psbt_in
                .proprietary
                .insert(key(IN_SIBLING_PREIMAGE), sibling.to_bytes());
        }
        psbt_in
            .proprietary
            .insert(key(IN_ASSET), input.asset.to_bytes());
        if let Some(proof) = &input.proof {
            psbt_in.proprietary.insert(key(IN_PROOF), proof.clone());
        }
    }

    for (output, psbt_out) in packet.outputs.iter().zip(psbt.outputs.iter_mut()) {
        psbt_out.tap_internal_key = Some(output.anchor_internal_key);
        psbt_out
            .proprietary
            .insert(key(OUT_TYPE), vec![output.output_type.to_byte()]);
        psbt_out
            .proprietary
            .insert(key(OUT_INTERACTIVE), vec![u8::from(output.interactive)]);
        psbt_out.proprietary.insert(
            key(OUT_ANCHOR_INDEX),
            output.anchor_output_index.to_be_bytes().to_vec(),
        );
        psbt_out
            .proprietary
            .insert(key(OUT_SCRIPT_KEY), output.script_key.to_bytes().to_vec());
        if let Some(asset) = &output.asset {
            let subtype = if asset.has_split_commitment_witness() {
                OUT_SPLIT_ASSET
            } else {
                OUT_ASSET
            };
            psbt_out.proprietary.insert(key(subtype), asset.to_bytes());
        }
        if let Some(sibling) = &output.anchor_sibling {
            psbt_out
                .proprietary
                .insert(key(OUT_SIBLING_PREIMAGE), sibling.to_bytes());
        }
    }

    // The PSBT output list only reserves anchor slots; the virtual output
    // list is authoritative and may be shorter.
    Ok(psbt)
}

pub fn decode_packet(psbt: &Psbt) -> Result<VPacket, TapError> {
    if get(&psbt.proprietary, GLOBAL_IS_VIRTUAL) != Some(&[1][..]) {
        return Err(TapError::Serialization(
            "psbt is not a virtual packet".into(),
        ));
    }
    let hrp_bytes = require(&psbt.proprietary, GLOBAL_CHAIN_HRP, "chain HRP")?;
    let hrp = std::str::from_utf8(hrp_bytes)
        .map_err(|_| TapError::Serialization("chain HRP is not utf-8".into()))?;
    let chain = Chain::from_hrp(hrp)
        .map_err(|_| TapError::Serialization(format!("unknown chain HRP {hrp:?}")))?;
    let version = require(&psbt.proprietary, GLOBAL_VERSION, "packet version")?;
    if version.len() != 1 {
        return Err(TapError::Serialization("malformed packet version".into()));
    }

    let mut inputs = Vec::with_capacity(psbt.inputs.len());
    for psbt_in in &psbt.inputs {
        let prev_id = decode_prev_id(require(&psbt_in.proprietary, IN_PREV_ID, "prev id")?)?;
        let witness_utxo = psbt_in
            .witness_utxo
            .as_ref()
            .ok_or_else(|| TapError::Serialization("missing anchor witness utxo".into()))?;
        let asset = Asset::from_bytes(require(&psbt_in.proprietary, IN_ASSET, "input asset")?)?;
        let sighash_type = psbt_in
            .sighash_type
            .map(|ty| ty.to_u32() as u8)
            .unwrap_or(0);
        inputs.push(VInput {
            prev_id,
            anchor: Anchor {
                value: witness_utxo.value.to_sat(),
                pk_script: witness_utxo.script_pubkey.clone(),
                internal_key: psbt_in
                    .tap_internal_key
                    .ok_or_else(|| {
                        TapError::Serialization("missing anchor internal key".into())
                    })?,
                merkle_root: psbt_in.tap_merkle_root,
                tapscript_sibling: get(&psbt_in.proprietary, IN_SIBLING_PREIMAGE)
                    .map(SiblingPreimage::from_bytes)
                    .transpose()?,
                sighash_type,
            },
            asset,
            proof: get(&psbt_in.proprietary, IN_PROOF).map(<[u8]>::to_vec),
        });
    }

    let mut outputs = Vec::new();
    for psbt_out in &psbt.outputs {
        // Reserved anchor slots with no virtual output carry no type key.
        let Some(type_bytes) = get(&psbt_out.proprietary, OUT_TYPE) else {
            continue;
        };
        if type_bytes.len() != 1 {
            return Err(TapError::Serialization("malformed output type".into()));
        }
        let output_type = VOutputType::from_byte(type_bytes[0])?;
        let interactive = require(&psbt_out.proprietary, OUT_INTERACTIVE, "interactive flag")?;
        let anchor_index = require(&psbt_out.proprietary, OUT_ANCHOR_INDEX, "anchor index")?;
        if anchor_index.len() != 4 {
            return Err(TapError::Serialization("malformed anchor index".into()));
        }
        let script_key_bytes = require(&psbt_out.proprietary, OUT_SCRIPT_KEY, "script key")?;
        if script_key_bytes.len() != 32 {
            return Err(TapError::Serialization("malformed script key".into()));
        }
        let mut script_key = [0u8; 32];
        script_key.copy_from_slice(script_key_bytes);
        let asset = get(&psbt_out.proprietary, OUT_SPLIT_ASSET)
            .or_else(|| get(&psbt_out.proprietary, OUT_ASSET))
            .map(Asset::from_bytes)
            .transpose()?;
        let amount = asset.as_ref().map(|asset| asset.amount).unwrap_or(0);
        outputs.push(VOutput {
            amount,
            output_type,
            interactive: matches!(interactive, [1]),
            anchor_output_index: u32::from_be_bytes(anchor_index.try_into().map_err(|_| {
                TapError::Serialization("malformed anchor index".into())
            })?),
            anchor_internal_key: psbt_out
                .tap_internal_key
                .ok_or_else(|| {
                    TapError::Serialization("missing output internal key".into())
                })?,
            anchor_sibling: get(&psbt_out.proprietary, OUT_SIBLING_PREIMAGE)
                .map(SiblingPreimage::from_bytes)
                .transpose()?,
            script_key: ScriptKey::from_bytes(&script_key)?,
            asset,
        });
    }

    Ok(VPacket {
        version: version[0],
        chain,
        inputs,
        outputs,
    })
}
