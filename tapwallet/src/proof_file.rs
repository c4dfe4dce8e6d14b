//! Provenance proof files: an append-only chain of anchor proofs, one
//! entry per on-chain transition, from genesis to the asset's current
//! resting output. Files travel to recipients and to the Universe.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bitcoin::consensus::encode;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::{OutPoint, Transaction, XOnlyPublicKey};

use crate::asset::{Asset, ByteReader};
use crate::commitment::CommitmentProof;
use crate::error::TapError;

const FILE_MAGIC: [u8; 4] = *b"TAPF";
const FILE_VERSION: u8 = 0;

/// One link of the provenance chain: the anchor transaction, the output
/// the asset landed in, and the commitment proof binding the asset into
/// that output's taproot key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofEntry {
    pub anchor_tx: Transaction,
    pub anchor_output_index: u32,
    pub asset: Asset,
    pub inclusion_proof: CommitmentProof,
}

impl ProofEntry {
    pub fn anchor_outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.anchor_tx.compute_txid(),
            vout: self.anchor_output_index,
        }
    }

    /// Taproot output key of the anchor output this entry cites.
    fn anchor_output_key(&self) -> Result<XOnlyPublicKey, TapError> {
        let output = self
            .anchor_tx
            .output
            .get(self.anchor_output_index as usize)
            .ok_or(TapError::ProofInvalid("anchor output index out of range"))?;
        if !output.script_pubkey.is_p2tr() {
            return Err(TapError::ProofInvalid("anchor output is not taproot"));
        }
        let bytes = &output.script_pubkey.as_bytes()[2..34];
        XOnlyPublicKey::from_slice(bytes)
            .map_err(|_| TapError::ProofInvalid("malformed taproot output key"))
    }

    /// Verifies this entry, chained onto `prev` (None for the genesis
    /// entry).
    pub fn verify<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        prev: Option<&ProofEntry>,
    ) -> Result<(), TapError> {
        self.asset.validate(secp)?;
        match prev {
            None => {
                if !self.asset.is_genesis() {
                    return Err(TapError::ProofInvalid("first entry is not a genesis asset"));
                }
                let first_input = self
                    .anchor_tx
                    .input
                    .first()
                    .ok_or(TapError::ProofInvalid("genesis anchor tx has no inputs"))?;
                if self.asset.genesis.first_prev_out != first_input.previous_output {
                    return Err(TapError::ProofInvalid("genesis outpoint mismatch"));
                }
                if self.asset.genesis.output_index != self.anchor_output_index {
                    return Err(TapError::ProofInvalid("genesis output index mismatch"));
                }
            }
            Some(prev) => {
                if self.asset.id() != prev.asset.id() {
                    return Err(TapError::ProofInvalid("asset id changed across entries"));
                }
                let prev_outpoint = prev.anchor_outpoint();
                if !self
                    .anchor_tx
                    .input
                    .iter()
                    .any(|input| input.previous_output == prev_outpoint)
                {
                    return Err(TapError::ProofInvalid(
                        "anchor tx does not spend previous anchor",
                    ));
                }
            }
        }
        let output_key = self.anchor_output_key()?;
        self.inclusion_proof
            .verify_inclusion(secp, &self.asset, output_key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        let tx = encode::serialize(&self.anchor_tx);
        out.extend_from_slice(&(tx.len() as u32).to_be_bytes());
        out.extend_from_slice(&tx);
        out.extend_from_slice(&self.anchor_output_index.to_be_bytes());
        let asset = self.asset.to_bytes();
        out.extend_from_slice(&(asset.len() as u32).to_be_bytes());
        out.extend_from_slice(&asset);
        let proof = self.inclusion_proof.to_bytes();
        out.extend_from_slice(&(proof.len() as u32).to_be_bytes());
        out.extend_from_slice(&proof);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TapError> {
        let mut reader = ByteReader::new(bytes);
        let entry = read_entry(&mut reader)?;
        reader.finish()?;
        Ok(entry)
    }
}

fn read_entry(reader: &mut ByteReader<'_>) -> Result<ProofEntry, TapError> {
    let tx_len = reader.read_u32()? as usize;
    let anchor_tx: Transaction = encode::deserialize(reader.read_bytes(tx_len)?)
        .map_err(|err| TapError::Serialization(err.to_string()))?;
    let anchor_output_index = reader.read_u32()?;
    let asset_len = reader.read_u32()? as usize;
    let asset = Asset::from_bytes(reader.read_bytes(asset_len)?)?;
    let proof_len = reader.read_u32()? as usize;
    let inclusion_proof = CommitmentProof::from_bytes(reader.read_bytes(proof_len)?)?;
    Ok(ProofEntry {
        anchor_tx,
        anchor_output_index,
        asset,
        inclusion_proof,
    })
}

/// The full provenance chain of one asset at one script key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofFile {
    entries: Vec<ProofEntry>,
}

impl ProofFile {
    pub fn new(genesis_entry: ProofEntry) -> Self {
        Self {
            entries: vec![genesis_entry],
        }
    }

    pub fn append(&mut self, entry: ProofEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ProofEntry] {
        &self.entries
    }

    pub fn last(&self) -> &ProofEntry {
        self.entries.last().expect("proof files are never empty")
    }

    /// Walks the whole chain, returning the final entry on success.
    pub fn verify<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
    ) -> Result<&ProofEntry, TapError> {
        let mut prev: Option<&ProofEntry> = None;
        for entry in &self.entries {
            entry.verify(secp, prev)?;
            prev = Some(entry);
        }
        prev.ok_or(TapError::ProofInvalid("proof file is empty"))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024 * self.entries.len());
        out.extend_from_slice(&FILE_MAGIC);
        out.push(FILE_VERSION);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            let bytes = entry.to_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TapError> {
        let mut reader = ByteReader::new(bytes);
        if reader.read_array::<4>()? != FILE_MAGIC {
            return Err(TapError::Serialization("bad proof file magic".into()));
        }
        if reader.read_u8()? != FILE_VERSION {
            return Err(TapError::Serialization(
                "unsupported proof file version".into(),
            ));
        }
        let count = reader.read_u32()? as usize;
        if count == 0 {
            return Err(TapError::Serialization("empty proof file".into()));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let len = reader.read_u32()? as usize;
            entries.push(ProofEntry::from_bytes(reader.read_bytes(len)?)?);
        }
        reader.finish()?;
        Ok(Self { entries })
    }
}

/// Where a proof file rests: the anchor outpoint plus the owning script
/// key (several assets can share one outpoint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProofLocator {
    pub out_point: OutPoint,
    pub script_key: [u8; 32],
}

/// Content-addressed archive of proof files. Append-only: entries are
/// only ever added under fresh locators.
#[async_trait::async_trait]
pub trait ProofArchive: Send + Sync {
    async fn store_proof(&self, locator: ProofLocator, file: ProofFile) -> Result<(), TapError>;

    async fn fetch_proof(&self, locator: &ProofLocator) -> Result<Option<ProofFile>, TapError>;
}

/// In-memory archive used by tests and as the daemon-local cache.
#[derive(Default)]
pub struct MemoryProofArchive {
    files: Mutex<BTreeMap<ProofLocator, ProofFile>>,
}

impl MemoryProofArchive {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.files.lock().expect("proof archive poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn locators(&self) -> Vec<ProofLocator> {
        self.files
            .lock()
            .expect("proof archive poisoned")
            .keys()
            .copied()
            .collect()
    }
}

#[async_trait::async_trait]
impl ProofArchive for MemoryProofArchive {
    async fn store_proof(&self, locator: ProofLocator, file: ProofFile) -> Result<(), TapError> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| TapError::InvalidState("proof archive poisoned"))?;
        if let Some(existing) = files.get(&locator) {
            if *existing != file {
                return Err(TapError::StoreFailure(
                    "conflicting proof for existing locator".into(),
                ));
            }
            return Ok(());
        }
        files.insert(locator, file);
        Ok(())
    }

    async fn fetch_proof(&self, locator: &ProofLocator) -> Result<Option<ProofFile>, TapError> {
        let files = self
            .files
            .lock()
            .map_err(|_| TapError::InvalidState("proof archive poisoned"))?;
        Ok(files.get(locator).cloned())
    }
}
