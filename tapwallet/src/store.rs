//! Persistence contract for the minting and transfer state machines,
//! and the single-file implementation shipped with the daemon. Every
//! mutating call rewrites the store atomically before returning, so a
//! crash can never observe a partial write.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bitcoin::psbt::Psbt;
use bitcoin::{Txid, XOnlyPublicKey};
use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::chain::TxConfirmation;
use crate::error::TapError;
use crate::keys::KeyDescriptor;
use crate::planter::{BatchState, MintingBatch, Seedling};
use crate::porter::OutboundParcel;

/// Durable log of minting batches.
#[async_trait::async_trait]
pub trait MintingStore: Send + Sync {
    /// Every batch not yet in a final state, for replay on startup.
    async fn fetch_non_final_batches(&self) -> Result<Vec<MintingBatch>, TapError>;

    async fn update_batch_state(
        &self,
        batch_key: XOnlyPublicKey,
        state: BatchState,
    ) -> Result<(), TapError>;

    /// First durable write of a batch: seedlings, sprouted assets and
    /// the funded genesis PSBT, all in one transaction.
    async fn commit_batch_sprout(&self, batch: &MintingBatch) -> Result<(), TapError>;

    async fn commit_signed_genesis_psbt(
        &self,
        batch_key: XOnlyPublicKey,
        psbt: &Psbt,
    ) -> Result<(), TapError>;

    async fn mark_batch_confirmed(
        &self,
        batch_key: XOnlyPublicKey,
        confirmation: TxConfirmation,
    ) -> Result<(), TapError>;
}

/// Durable log of outbound transfer parcels.
#[async_trait::async_trait]
pub trait ParcelStore: Send + Sync {
    /// Persisted before broadcast; keyed by the anchor txid.
    async fn log_pending_parcel(&self, parcel: &OutboundParcel) -> Result<(), TapError>;

    /// Parcels logged but not yet confirmed, re-broadcast on startup.
    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>, TapError>;

    /// Finality signal: downstream caches may reclaim resources once a
    /// parcel is confirmed.
    async fn confirm_parcel_delivery(
        &self,
        anchor_txid: Txid,
        confirmation: TxConfirmation,
    ) -> Result<(), TapError>;
}

const FILE_VERSION: u32 = 1;

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    state: StoreState,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    state: &'a StoreState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    batches: BTreeMap<[u8; 32], StoredBatch>,
    parcels: BTreeMap<Txid, OutboundParcel>,
}

/// On-disk form of a batch: PSBTs and assets as canonical bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredBatch {
    batch_key: KeyDescriptor,
    state: BatchState,
    seedlings: BTreeMap<String, Seedling>,
    genesis_psbt: Option<Vec<u8>>,
    signed_psbt: Option<Vec<u8>>,
    assets: Vec<Vec<u8>>,
    height_hint: u32,
    confirmation: Option<TxConfirmation>,
}

impl StoredBatch {
    fn from_batch(batch: &MintingBatch) -> Self {
        Self {
            batch_key: batch.batch_key,
            state: batch.state,
            seedlings: batch.seedlings.clone(),
            genesis_psbt: batch.genesis_psbt.as_ref().map(Psbt::serialize),
            signed_psbt: batch.signed_psbt.as_ref().map(Psbt::serialize),
            assets: batch.assets.iter().map(Asset::to_bytes).collect(),
            height_hint: batch.height_hint,
            confirmation: batch.confirmation,
        }
    }

    fn into_batch(self) -> Result<MintingBatch, TapError> {
        let decode_psbt = |bytes: Vec<u8>| {
            Psbt::deserialize(&bytes).map_err(|err| TapError::Serialization(err.to_string()))
        };
        Ok(MintingBatch {
            batch_key: self.batch_key,
            state: self.state,
            seedlings: self.seedlings,
            genesis_psbt: self.genesis_psbt.map(decode_psbt).transpose()?,
            signed_psbt: self.signed_psbt.map(decode_psbt).transpose()?,
            assets: self
                .assets
                .iter()
                .map(|bytes| Asset::from_bytes(bytes))
                .collect::<Result<_, _>>()?,
            height_hint: self.height_hint,
            confirmation: self.confirmation,
        })
    }
}

/// Bincode-on-disk store behind a mutex, written via temp file and
/// atomic rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TapError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let file: StoreFile = bincode::deserialize(&bytes)?;
            if file.version != FILE_VERSION {
                return Err(TapError::StoreFailure(format!(
                    "unsupported store version {}",
                    file.version
                )));
            }
            file.state
        } else {
            StoreState::default()
        };
        let store = Self {
            path,
            state: Mutex::new(state),
        };
        store.write_locked()?;
        Ok(store)
    }

    fn with_state<F, T>(&self, func: F) -> Result<T, TapError>
    where
        F: FnOnce(&StoreState) -> Result<T, TapError>,
    {
        let state = self
            .state
            .lock()
            .map_err(|_| TapError::StoreFailure("store poisoned".into()))?;
        func(&state)
    }

    fn with_mut<F, T>(&self, func: F) -> Result<T, TapError>
    where
        F: FnOnce(&mut StoreState) -> Result<T, TapError>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TapError::StoreFailure("store poisoned".into()))?;
        let result = func(&mut state)?;
        drop(state);
        self.write_locked()?;
        Ok(result)
    }

    fn write_locked(&self) -> Result<(), TapError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TapError::StoreFailure("store poisoned".into()))?;
        let bytes = bincode::serialize(&StoreFileRef {
            version: FILE_VERSION,
            state: &state,
        })?;
        drop(state);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn batch_mut<'a>(
        state: &'a mut StoreState,
        batch_key: &XOnlyPublicKey,
    ) -> Result<&'a mut StoredBatch, TapError> {
        state
            .batches
            .get_mut(&batch_key.serialize())
            .ok_or_else(|| TapError::StoreFailure("unknown batch key".into()))
    }
}

#[async_trait::async_trait]
impl MintingStore for FileStore {
    async fn fetch_non_final_batches(&self) -> Result<Vec<MintingBatch>, TapError> {
        self.with_state(|state| {
            state
                .batches
                .values()
                .filter(|batch| !batch.state.is_final())
                .cloned()
                .map(StoredBatch::into_batch)
                .collect()
        })
    }

    async fn update_batch_state(
        &self,
        batch_key: XOnlyPublicKey,
        new_state: BatchState,
    ) -> Result<(), TapError> {
        self.with_mut(|state| {
            Self::batch_mut(state, &batch_key)?.state = new_state;
            Ok(())
        })
    }

    async fn commit_batch_sprout(&self, batch: &MintingBatch) -> Result<(), TapError> {
        self.with_mut(|state| {
            state
                .batches
                .insert(batch.batch_key.pub_key.serialize(), StoredBatch::from_batch(batch));
            Ok(())
        })
    }

    async fn commit_signed_genesis_psbt(
        &self,
        batch_key: XOnlyPublicKey,
        psbt: &Psbt,
    ) -> Result<(), TapError> {
        self.with_mut(|state| {
            Self::batch_mut(state, &batch_key)?.signed_psbt = Some(psbt.serialize());
            Ok(())
        })
    }

    async fn mark_batch_confirmed(
        &self,
        batch_key: XOnlyPublicKey,
        confirmation: TxConfirmation,
    ) -> Result<(), TapError> {
        self.with_mut(|state| {
            let batch = Self::batch_mut(state, &batch_key)?;
            batch.confirmation = Some(confirmation);
            batch.state = BatchState::Confirmed;
            Ok(())
        })
    }
}

#[async_trait::async_trait]
impl ParcelStore for FileStore {
    async fn log_pending_parcel(&self, parcel: &OutboundParcel) -> Result<(), TapError> {
        self.with_mut(|state| {
            state
                .parcels
                .insert(parcel.anchor_tx.compute_txid(), parcel.clone());
            Ok(())
        })
    }

    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>, TapError> {
        self.with_state(|state| {
            Ok(state
                .parcels
                .values()
                .filter(|parcel| parcel.confirmation.is_none())
                .cloned()
                .collect())
        })
    }

    async fn confirm_parcel_delivery(
        &self,
        anchor_txid: Txid,
        confirmation: TxConfirmation,
    ) -> Result<(), TapError> {
        self.with_mut(|state| {
            let parcel = state
                .parcels
                .get_mut(&anchor_txid)
                .ok_or_else(|| TapError::StoreFailure("unknown parcel".into()))?;
            parcel.confirmation = Some(confirmation);
            Ok(())
        })
    }
}
