//! The caretaker: a short-lived task walking one frozen batch through
//! funding, sprouting, signing, broadcast, confirmation and proof
//! emission. Every transition is persisted before the next side effect;
//! transient chain/wallet/store failures retry with exponential backoff,
//! fatal errors park the batch in the failed state without discarding
//! durable records.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::key::TweakedPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, XOnlyPublicKey};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::address::Chain;
use crate::asset::{Asset, Genesis, GroupKey, ScriptKey};
use crate::chain::{ChainBackend, WalletAnchor};
use crate::commitment::TapCommitment;
use crate::error::TapError;
use crate::keys::{KeyFamily, KeyRing};
use crate::planter::{BatchState, MintingBatch};
use crate::proof_file::{ProofArchive, ProofEntry, ProofFile, ProofLocator};
use crate::store::MintingStore;

/// Value of the genesis anchor output, just above dust.
const GENESIS_OUTPUT_VALUE: u64 = 1_000;

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Capabilities shared by the planter and its caretakers.
pub struct MintContext<S, C, W, K, R> {
    pub store: Arc<S>,
    pub chain: Arc<C>,
    pub wallet: Arc<W>,
    pub keyring: Arc<K>,
    pub archive: Arc<R>,
    pub secp: Secp256k1<All>,
    pub chain_params: Chain,
}

impl<S, C, W, K, R> Clone for MintContext<S, C, W, K, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chain: self.chain.clone(),
            wallet: self.wallet.clone(),
            keyring: self.keyring.clone(),
            archive: self.archive.clone(),
            secp: self.secp.clone(),
            chain_params: self.chain_params,
        }
    }
}

/// Progress report sent back to the planter after every transition.
#[derive(Clone, Debug)]
pub struct CaretakerEvent {
    pub batch_key: XOnlyPublicKey,
    pub state: BatchState,
    pub error: Option<String>,
}

/// Retries `op` with exponential backoff for as long as it fails
/// transiently; anything else surfaces immediately.
pub(crate) async fn with_backoff<T, F, Fut>(what: &str, mut op: F) -> Result<T, TapError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TapError>>,
{
    let mut delay = BACKOFF_INITIAL;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(operation = what, error = %err, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_MAX);
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn extract_tx(psbt: &Psbt) -> Transaction {
    psbt.clone().extract_tx_unchecked_fee_rate()
}

pub async fn run<S, C, W, K, R>(
    ctx: MintContext<S, C, W, K, R>,
    mut batch: MintingBatch,
    cancel: watch::Receiver<bool>,
    events: mpsc::Sender<CaretakerEvent>,
) where
    S: MintingStore,
    C: ChainBackend,
    W: WalletAnchor,
    K: KeyRing,
    R: ProofArchive,
{
    loop {
        // Cancellation is honored at step boundaries, and only until the
        // genesis transaction hits the network.
        let before_broadcast = matches!(
            batch.state,
            BatchState::Pending | BatchState::Frozen | BatchState::Committed
        );
        if before_broadcast && *cancel.borrow() {
            batch.state = BatchState::SproutCancelled;
            if let Err(err) =
                with_backoff("persist cancel", || ctx.store.commit_batch_sprout(&batch)).await
            {
                error!(batch_key = %batch.batch_key.pub_key, error = %err, "failed to persist cancellation");
            }
            emit(&events, &batch, None).await;
            return;
        }

        if batch.state.is_final() {
            return;
        }

        match advance(&ctx, &mut batch).await {
            Ok(()) => {
                info!(
                    batch_key = %batch.batch_key.pub_key,
                    state = batch.state.name(),
                    "batch advanced"
                );
                emit(&events, &batch, None).await;
            }
            Err(err) => {
                error!(batch_key = %batch.batch_key.pub_key, error = %err, "batch failed");
                batch.state = BatchState::Failed;
                let _ = ctx
                    .store
                    .update_batch_state(batch.batch_key.pub_key, BatchState::Failed)
                    .await;
                emit(&events, &batch, Some(err.to_string())).await;
                return;
            }
        }
    }
}

async fn emit(
    events: &mpsc::Sender<CaretakerEvent>,
    batch: &MintingBatch,
    error: Option<String>,
) {
    let _ = events
        .send(CaretakerEvent {
            batch_key: batch.batch_key.pub_key,
            state: batch.state,
            error,
        })
        .await;
}

/// One state transition of the batch machine.
async fn advance<S, C, W, K, R>(
    ctx: &MintContext<S, C, W, K, R>,
    batch: &mut MintingBatch,
) -> Result<(), TapError>
where
    S: MintingStore,
    C: ChainBackend,
    W: WalletAnchor,
    K: KeyRing,
    R: ProofArchive,
{
    match batch.state {
        BatchState::Pending | BatchState::Frozen => fund_and_sprout(ctx, batch).await,
        BatchState::Committed => sign_and_broadcast(ctx, batch).await,
        BatchState::Broadcast => await_confirmation(ctx, batch).await,
        BatchState::Confirmed => finalize(ctx, batch).await,
        other => Err(TapError::InvalidState(other.name())),
    }
}

/// Frozen → Committed: fund the genesis PSBT, derive the shared genesis
/// outpoint from its first input, sprout every seedling into an asset,
/// commit them into the taproot output key and persist the lot.
async fn fund_and_sprout<S, C, W, K, R>(
    ctx: &MintContext<S, C, W, K, R>,
    batch: &mut MintingBatch,
) -> Result<(), TapError>
where
    S: MintingStore,
    C: ChainBackend,
    W: WalletAnchor,
    K: KeyRing,
    R: ProofArchive,
{
    let fee_rate = with_backoff("fee estimate", || ctx.chain.fee_rate()).await?;
    // The placeholder output pins the funding to this batch; its script
    // is replaced with the real commitment key once the assets exist.
    let placeholder = TxOut {
        value: Amount::from_sat(GENESIS_OUTPUT_VALUE),
        script_pubkey: ScriptBuf::new_op_return(batch.batch_key.pub_key.serialize()),
    };
    let mut psbt = with_backoff("fund genesis", || {
        ctx.wallet
            .fund_psbt(Vec::new(), vec![placeholder.clone()], fee_rate)
    })
    .await?;

    let genesis_outpoint = psbt
        .unsigned_tx
        .input
        .first()
        .ok_or_else(|| TapError::WalletUnavailable("funded genesis psbt has no inputs".into()))?
        .previous_output;

    let assets = sprout(ctx, batch, genesis_outpoint).await?;
    let commitment = TapCommitment::from_assets(&ctx.secp, assets.clone())?;
    let output_key = commitment.output_key(&ctx.secp, batch.batch_key.pub_key, None);
    psbt.unsigned_tx.output[0].script_pubkey =
        ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key));

    batch.genesis_psbt = Some(psbt);
    batch.assets = assets;
    batch.state = BatchState::Committed;
    with_backoff("commit sprout", || ctx.store.commit_batch_sprout(batch)).await
}

/// Derives per-seedling keys and constructs the genesis assets. Group
/// anchors are sprouted first so their members can be signed into the
/// group.
async fn sprout<S, C, W, K, R>(
    ctx: &MintContext<S, C, W, K, R>,
    batch: &MintingBatch,
    genesis_outpoint: OutPoint,
) -> Result<Vec<Asset>, TapError>
where
    K: KeyRing,
{
    let mut assets = Vec::with_capacity(batch.seedlings.len());
    let mut group_keypairs = BTreeMap::new();

    for (name, seedling) in batch
        .seedlings
        .iter()
        .filter(|(_, s)| s.group_anchor.is_none())
    {
        let script = ctx.keyring.derive_next(KeyFamily::ScriptKey).await?;
        let genesis = Genesis::new(
            genesis_outpoint,
            name.clone(),
            &seedling.meta,
            0,
            seedling.asset_type,
        );
        let group_key = if seedling.enable_emission {
            let descriptor = ctx.keyring.derive_next(KeyFamily::GroupKey).await?;
            let keypair = ctx
                .keyring
                .keypair(&descriptor.pub_key)
                .await?
                .ok_or_else(|| {
                    TapError::WalletUnavailable(
                        "keyring cannot sign with derived group key".into(),
                    )
                })?;
            group_keypairs.insert(name.clone(), keypair);
            Some(GroupKey::sign(&ctx.secp, &keypair, genesis.asset_id()))
        } else {
            None
        };
        assets.push(Asset::new_genesis(
            genesis,
            seedling.amount,
            ScriptKey::new(script.pub_key),
            group_key,
        ));
    }

    for (name, seedling) in batch
        .seedlings
        .iter()
        .filter(|(_, s)| s.group_anchor.is_some())
    {
        let anchor_name = seedling.group_anchor.as_ref().expect("filtered on some");
        let keypair = group_keypairs
            .get(anchor_name)
            .ok_or_else(|| TapError::GroupAnchorMissing(anchor_name.clone()))?;
        let script = ctx.keyring.derive_next(KeyFamily::ScriptKey).await?;
        let genesis = Genesis::new(
            genesis_outpoint,
            name.clone(),
            &seedling.meta,
            0,
            seedling.asset_type,
        );
        let group_key = GroupKey::sign(&ctx.secp, keypair, genesis.asset_id());
        assets.push(Asset::new_genesis(
            genesis,
            seedling.amount,
            ScriptKey::new(script.pub_key),
            Some(group_key),
        ));
    }

    Ok(assets)
}

/// Committed → Broadcast: wallet signature over the genesis PSBT
/// (skipped if already persisted), then submission.
async fn sign_and_broadcast<S, C, W, K, R>(
    ctx: &MintContext<S, C, W, K, R>,
    batch: &mut MintingBatch,
) -> Result<(), TapError>
where
    S: MintingStore,
    C: ChainBackend,
    W: WalletAnchor,
{
    let funded = batch
        .genesis_psbt
        .clone()
        .ok_or(TapError::InvalidState("committed batch has no genesis psbt"))?;
    let signed = match batch.signed_psbt.clone() {
        Some(signed) => signed,
        None => {
            let signed = with_backoff("sign genesis", || ctx.wallet.sign_psbt(funded.clone())).await?;
            with_backoff("persist signed psbt", || {
                ctx.store
                    .commit_signed_genesis_psbt(batch.batch_key.pub_key, &signed)
            })
            .await?;
            batch.signed_psbt = Some(signed.clone());
            signed
        }
    };
    let tx = extract_tx(&signed);
    with_backoff("broadcast genesis", || ctx.chain.broadcast(&tx)).await?;
    batch.state = BatchState::Broadcast;
    with_backoff("persist broadcast", || {
        ctx.store
            .update_batch_state(batch.batch_key.pub_key, BatchState::Broadcast)
    })
    .await
}

/// Broadcast → Confirmed: best-effort re-broadcast (idempotent across
/// restarts), then an unbounded confirmation wait registered at the
/// pre-broadcast height hint.
async fn await_confirmation<S, C, W, K, R>(
    ctx: &MintContext<S, C, W, K, R>,
    batch: &mut MintingBatch,
) -> Result<(), TapError>
where
    S: MintingStore,
    C: ChainBackend,
{
    let signed = batch
        .signed_psbt
        .clone()
        .ok_or(TapError::InvalidState("broadcast batch has no signed psbt"))?;
    let tx = extract_tx(&signed);
    with_backoff("rebroadcast genesis", || ctx.chain.broadcast(&tx)).await?;
    let confirmation = ctx
        .chain
        .wait_for_confirmation(tx.compute_txid(), batch.height_hint)
        .await?;
    batch.confirmation = Some(confirmation);
    batch.state = BatchState::Confirmed;
    with_backoff("persist confirmation", || {
        ctx.store
            .mark_batch_confirmed(batch.batch_key.pub_key, confirmation)
    })
    .await
}

/// Confirmed → Finalized: emit one genesis proof file per asset into the
/// proof archive.
async fn finalize<S, C, W, K, R>(
    ctx: &MintContext<S, C, W, K, R>,
    batch: &mut MintingBatch,
) -> Result<(), TapError>
where
    S: MintingStore,
    R: ProofArchive,
{
    let signed = batch
        .signed_psbt
        .clone()
        .ok_or(TapError::InvalidState("confirmed batch has no signed psbt"))?;
    let anchor_tx = extract_tx(&signed);
    let txid = anchor_tx.compute_txid();
    let commitment = TapCommitment::from_assets(&ctx.secp, batch.assets.clone())?;

    for asset in &batch.assets {
        let inclusion_proof = commitment.prove(
            asset.commitment_id(),
            asset.commitment_key(),
            batch.batch_key.pub_key,
            None,
        );
        let entry = ProofEntry {
            anchor_tx: anchor_tx.clone(),
            anchor_output_index: 0,
            asset: asset.clone(),
            inclusion_proof,
        };
        // A proof that does not verify never leaves the caretaker.
        entry.verify(&ctx.secp, None)?;
        let locator = ProofLocator {
            out_point: OutPoint { txid, vout: 0 },
            script_key: asset.script_key.to_bytes(),
        };
        let file = ProofFile::new(entry);
        with_backoff("archive genesis proof", || {
            ctx.archive.store_proof(locator, file.clone())
        })
        .await?;
    }

    batch.state = BatchState::Finalized;
    with_backoff("persist finalized", || {
        ctx.store
            .update_batch_state(batch.batch_key.pub_key, BatchState::Finalized)
    })
    .await
}
