//! The virtual machine: signs and validates virtual packets by
//! rebuilding a synthetic one-to-one taproot transaction and running
//! BIP-341 key-spend verification over it with the asset script keys.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{schnorr, Keypair, Message, Secp256k1, Signing, Verification};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid};
use sha2::{Digest, Sha256};

use crate::asset::{ScriptKey, Witness};
use crate::error::TapError;
use crate::vpacket::{split_locator, update_split_witnesses, VPacket};

/// Digest of every input's prev id; becomes the synthetic prevout txid.
fn input_digest(packet: &VPacket) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for input in &packet.inputs {
        hasher.update(input.prev_id.out_point.txid.to_byte_array());
        hasher.update(input.prev_id.out_point.vout.to_be_bytes());
        hasher.update(input.prev_id.asset_id.0);
        hasher.update(input.prev_id.script_key);
    }
    hasher.finalize().into()
}

/// Digest of the output layout: amounts, types, anchor allocation, script
/// keys and split roots. Witness data is deliberately excluded so the
/// digest is stable across signing.
fn outputs_digest(packet: &VPacket) -> Result<[u8; 32], TapError> {
    let mut hasher = Sha256::new();
    for (index, output) in packet.outputs.iter().enumerate() {
        hasher.update((index as u32).to_be_bytes());
        hasher.update(output.amount.to_be_bytes());
        hasher.update([output.output_type.to_byte(), u8::from(output.interactive)]);
        hasher.update(output.anchor_output_index.to_be_bytes());
        hasher.update(output.script_key.to_bytes());
        match output.asset()?.split_commitment_root {
            Some(root) => {
                hasher.update(root.hash);
                hasher.update(root.sum.to_be_bytes());
            }
            None => hasher.update([0u8; 40]),
        }
    }
    Ok(hasher.finalize().into())
}

/// The synthetic bitcoin transaction the sighash is computed over: one
/// input per virtual input and a single OP_RETURN output committing to
/// the virtual output layout.
fn synthetic_tx(packet: &VPacket) -> Result<(Transaction, Vec<TxOut>), TapError> {
    let prev_txid = Txid::from_byte_array(input_digest(packet));
    let inputs: Vec<TxIn> = (0..packet.inputs.len())
        .map(|index| TxIn {
            previous_output: OutPoint {
                txid: prev_txid,
                vout: index as u32,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: bitcoin::Witness::default(),
        })
        .collect();
    let prevouts: Vec<TxOut> = packet
        .inputs
        .iter()
        .map(|input| TxOut {
            value: Amount::from_sat(input.asset.amount),
            script_pubkey: ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(
                input.asset.script_key.pub_key,
            )),
        })
        .collect();
    let digest = outputs_digest(packet)?;
    let output = TxOut {
        value: Amount::from_sat(packet.output_sum()),
        script_pubkey: ScriptBuf::new_op_return(digest),
    };
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: vec![output],
    };
    Ok((tx, prevouts))
}

fn virtual_sighash(packet: &VPacket, input_index: usize) -> Result<Message, TapError> {
    let (tx, prevouts) = synthetic_tx(packet)?;
    let mut cache = SighashCache::new(&tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(
            input_index,
            &Prevouts::All(&prevouts),
            TapSighashType::Default,
        )
        .map_err(|_| TapError::InvalidState("virtual sighash computation failed"))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Signs every input of the packet with the owner script keys resolved by
/// `signer`, writing the signatures into the root output's witnesses and
/// re-embedding the signed root into the split outputs.
pub fn sign_packet<C, F>(
    secp: &Secp256k1<C>,
    packet: &mut VPacket,
    signer: F,
) -> Result<(), TapError>
where
    C: Signing,
    F: Fn(&ScriptKey) -> Option<Keypair>,
{
    let root_index = packet.root_output_index()?;
    let mut witnesses: Vec<Vec<Vec<u8>>> = Vec::with_capacity(packet.inputs.len());
    for (index, input) in packet.inputs.iter().enumerate() {
        let script_key = input.asset.script_key;
        let keypair = signer(&script_key).ok_or_else(|| {
            TapError::WalletUnavailable(format!(
                "no key material for script key {}",
                hex::encode(script_key.to_bytes())
            ))
        })?;
        if keypair.x_only_public_key().0 != script_key.pub_key {
            return Err(TapError::InvalidArgument("signer returned mismatched key"));
        }
        let msg = virtual_sighash(packet, index)?;
        let sig = secp.sign_schnorr(&msg, &keypair);
        witnesses.push(vec![sig.serialize().to_vec()]);
    }

    let root_asset = packet.outputs[root_index]
        .asset
        .as_mut()
        .ok_or(TapError::InvalidState("virtual output not yet populated"))?;
    if root_asset.prev_witnesses.len() != witnesses.len() {
        return Err(TapError::InvalidState(
            "root witness count does not match inputs",
        ));
    }
    for (witness, sig_stack) in root_asset.prev_witnesses.iter_mut().zip(witnesses) {
        witness.tx_witness = sig_stack;
    }
    update_split_witnesses(packet)
}

/// Full packet validation: single asset id, balanced amounts, verifying
/// schnorr witnesses for every input, and a verifying split-commitment
/// proof for every split output. Failure is fatal for the transfer.
pub fn validate_packet<C: Verification>(
    secp: &Secp256k1<C>,
    packet: &VPacket,
) -> Result<(), TapError> {
    let asset_id = packet.asset_id()?;
    packet.validate_balance()?;

    // Passive re-anchors carry their historical witnesses untouched; the
    // only requirement is that the asset is unchanged.
    if packet
        .outputs
        .iter()
        .all(|output| output.output_type.is_passive())
    {
        if packet.inputs.len() != packet.outputs.len() {
            return Err(TapError::ProofInvalid("passive packet shape mismatch"));
        }
        for (input, output) in packet.inputs.iter().zip(&packet.outputs) {
            if *output.asset()? != input.asset {
                return Err(TapError::ProofInvalid("passive asset mutated"));
            }
        }
        return Ok(());
    }

    let root_index = packet.root_output_index()?;
    let root_asset = packet.outputs[root_index].asset()?;
    if root_asset.prev_witnesses.len() != packet.inputs.len() {
        return Err(TapError::ProofInvalid(
            "root witness count does not match inputs",
        ));
    }

    for (index, (input, witness)) in packet
        .inputs
        .iter()
        .zip(&root_asset.prev_witnesses)
        .enumerate()
    {
        if witness.prev_id != input.prev_id {
            return Err(TapError::ProofInvalid("witness prev id mismatch"));
        }
        let sig_bytes = witness
            .tx_witness
            .first()
            .ok_or(TapError::ProofInvalid("missing transaction witness"))?;
        let sig = schnorr::Signature::from_slice(sig_bytes)
            .map_err(|_| TapError::ProofInvalid("malformed schnorr signature"))?;
        let msg = virtual_sighash(packet, index)?;
        secp.verify_schnorr(&sig, &msg, &input.asset.script_key.pub_key)
            .map_err(|_| TapError::ProofInvalid("virtual witness signature invalid"))?;
    }

    let split_root = root_asset.split_commitment_root;
    for (index, output) in packet.outputs.iter().enumerate() {
        if index == root_index {
            continue;
        }
        let asset = output.asset()?;
        let split = asset
            .prev_witnesses
            .first()
            .and_then(|witness| witness.split_commitment.as_ref())
            .ok_or(TapError::ProofInvalid("split output missing split witness"))?;
        if split.root_asset != *root_asset {
            return Err(TapError::ProofInvalid("split witness root asset mismatch"));
        }
        let root_summary =
            split_root.ok_or(TapError::ProofInvalid("root output missing split root"))?;
        let locator = split_locator(index as u32, asset_id, output.script_key);
        // The committed leaf is the split asset before its witness was
        // rewritten to point at the root.
        let mut leaf_asset = asset.clone();
        leaf_asset.prev_witnesses = vec![Witness {
            prev_id: packet.inputs[0].prev_id,
            tx_witness: Vec::new(),
            split_commitment: None,
        }];
        leaf_asset.split_commitment_root = None;
        let leaf = state_mssmt::Leaf::new(leaf_asset.to_bytes(), leaf_asset.amount);
        if !split.proof.verify(&locator, &leaf, &root_summary) {
            return Err(TapError::ProofInvalid("split commitment proof invalid"));
        }
    }
    Ok(())
}

/// Anchor-level check used after allocation: the asset committed at each
/// output must match what the packet promised.
pub fn validate_output_assets<C: Verification>(
    secp: &Secp256k1<C>,
    packet: &VPacket,
) -> Result<(), TapError> {
    for output in &packet.outputs {
        output.asset()?.validate(secp)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Chain;
    use crate::asset::tests::test_script_key;
    use crate::vpacket::tests::test_input;
    use crate::vpacket::build_send_packet;
    use std::collections::HashMap;

    fn signer_for(pairs: &[(ScriptKey, Keypair)]) -> impl Fn(&ScriptKey) -> Option<Keypair> + '_ {
        let map: HashMap<[u8; 32], Keypair> = pairs
            .iter()
            .map(|(key, pair)| (key.to_bytes(), *pair))
            .collect();
        move |key: &ScriptKey| map.get(&key.to_bytes()).copied()
    }

    fn signed_split_packet() -> (Secp256k1<bitcoin::secp256k1::All>, VPacket) {
        let secp = Secp256k1::new();
        let (owner_pair, owner_key) = test_script_key(50);
        let (_, recipient) = test_script_key(101);
        let (_, recipient_internal) = test_script_key(102);
        let (_, change) = test_script_key(103);
        let (_, change_internal) = test_script_key(104);
        let mut input = test_input(1000, 50);
        input.asset.script_key = owner_key;
        let mut packet = build_send_packet(
            Chain::Mainnet,
            vec![input],
            recipient,
            recipient_internal.pub_key,
            300,
            false,
            change,
            change_internal.pub_key,
        )
        .unwrap();
        let pairs = vec![(owner_key, owner_pair)];
        sign_packet(&secp, &mut packet, signer_for(&pairs)).unwrap();
        (secp, packet)
    }

    #[test]
    fn sign_then_validate() {
        let (secp, packet) = signed_split_packet();
        validate_packet(&secp, &packet).unwrap();
    }

    #[test]
    fn tampered_amount_fails_validation() {
        let (secp, mut packet) = signed_split_packet();
        // Inflate the recipient output after signing.
        packet.outputs[1].amount += 1;
        packet.outputs[0].amount -= 1;
        if let Some(asset) = packet.outputs[1].asset.as_mut() {
            asset.amount += 1;
        }
        assert!(validate_packet(&secp, &packet).is_err());
    }

    #[test]
    fn tampered_signature_fails_validation() {
        let (secp, mut packet) = signed_split_packet();
        let root = packet.outputs[0].asset.as_mut().unwrap();
        root.prev_witnesses[0].tx_witness[0][10] ^= 0x01;
        assert!(matches!(
            validate_packet(&secp, &packet),
            Err(TapError::ProofInvalid(_))
        ));
    }

    #[test]
    fn wrong_signer_rejected() {
        let secp = Secp256k1::new();
        let (_, owner_key) = test_script_key(50);
        let (other_pair, _) = test_script_key(51);
        let (_, recipient) = test_script_key(105);
        let (_, recipient_internal) = test_script_key(106);
        let (_, change) = test_script_key(107);
        let (_, change_internal) = test_script_key(108);
        let mut input = test_input(100, 50);
        input.asset.script_key = owner_key;
        let mut packet = build_send_packet(
            Chain::Mainnet,
            vec![input],
            recipient,
            recipient_internal.pub_key,
            40,
            false,
            change,
            change_internal.pub_key,
        )
        .unwrap();
        let result = sign_packet(&secp, &mut packet, |_| Some(other_pair));
        assert!(matches!(result, Err(TapError::InvalidArgument(_))));
    }

    #[test]
    fn passive_packet_validates_without_signatures() {
        let secp = Secp256k1::new();
        let input = test_input(40, 54);
        let (_, internal) = test_script_key(109);
        let packet = crate::vpacket::passive_packet(Chain::Mainnet, input, 0, internal.pub_key);
        validate_packet(&secp, &packet).unwrap();
    }
}
