//! End-to-end minting scenarios driven over the mock chain, wallet and
//! keyring: single-asset and grouped batches, cancellation races, and
//! crash-recovery replay of the minting log.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{TxOut, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use tapwallet::caretaker::MintContext;
use tapwallet::chain::{MockChain, MockWallet, WalletAnchor};
use tapwallet::error::TapError;
use tapwallet::planter::{self, BatchState, PlanterConfig, PlanterHandle, Seedling};
use tapwallet::proof_file::{MemoryProofArchive, ProofArchive};
use tapwallet::store::FileStore;
use tapwallet::{AssetType, Chain, SoftKeyRing};

type TestContext<W> = MintContext<FileStore, MockChain, W, SoftKeyRing, MemoryProofArchive>;

struct Harness {
    _dir: TempDir,
    store: Arc<FileStore>,
    chain: Arc<MockChain>,
    keyring: Arc<SoftKeyRing>,
    archive: Arc<MemoryProofArchive>,
}

impl Harness {
    fn new(chain: Arc<MockChain>) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("tap.db")).unwrap());
        Self {
            _dir: dir,
            store,
            chain,
            keyring: Arc::new(SoftKeyRing::new([11u8; 32])),
            archive: MemoryProofArchive::new(),
        }
    }

    fn ctx(&self) -> TestContext<MockWallet> {
        self.ctx_with_wallet(MockWallet::new())
    }

    fn ctx_with_wallet<W>(&self, wallet: Arc<W>) -> TestContext<W> {
        MintContext {
            store: self.store.clone(),
            chain: self.chain.clone(),
            wallet,
            keyring: self.keyring.clone(),
            archive: self.archive.clone(),
            secp: Secp256k1::new(),
            chain_params: Chain::Mainnet,
        }
    }
}

fn seedling(name: &str, amount: u64) -> Seedling {
    Seedling {
        asset_type: AssetType::Normal,
        name: name.into(),
        meta: vec![0x00],
        amount,
        group_anchor: None,
        enable_emission: false,
    }
}

async fn wait_for_state(
    planter: &PlanterHandle,
    batch_key: XOnlyPublicKey,
    target: BatchState,
) -> Vec<Seedling> {
    for _ in 0..500 {
        let batches = planter.list_batches().await.unwrap();
        if let Some(batch) = batches.iter().find(|b| b.batch_key == batch_key) {
            if batch.state == target {
                return batch.seedlings.clone();
            }
            assert_ne!(
                batch.state,
                BatchState::Failed,
                "batch failed: {:?}",
                batch.error
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch never reached {target:?}");
}

#[tokio::test]
async fn single_asset_mint() {
    let harness = Harness::new(MockChain::with_auto_confirm());
    let planter = planter::start(harness.ctx(), PlanterConfig::default())
        .await
        .unwrap();

    planter.queue_seedling(seedling("a", 1000)).await.unwrap();
    let batch_key = planter.finalize_batch().await.unwrap();
    wait_for_state(&planter, batch_key, BatchState::Finalized).await;

    // One tick, one caretaker, one anchor transaction.
    let broadcasts = harness.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let anchor_tx = &broadcasts[0];
    assert!(anchor_tx.output[0].script_pubkey.is_p2tr());

    // One genesis proof, verifying against the anchor output key.
    let locators = harness.archive.locators();
    assert_eq!(locators.len(), 1);
    let file = harness
        .archive
        .fetch_proof(&locators[0])
        .await
        .unwrap()
        .unwrap();
    let secp = Secp256k1::new();
    let entry = file.verify(&secp).unwrap();

    // The asset id binds the shared genesis outpoint, tag, hashed meta,
    // output index and type.
    let genesis_outpoint = anchor_tx.input[0].previous_output;
    let mut hasher = Sha256::new();
    hasher.update(genesis_outpoint.txid.to_byte_array());
    hasher.update(genesis_outpoint.vout.to_be_bytes());
    hasher.update(b"a");
    hasher.update(Sha256::digest([0x00]));
    hasher.update(0u32.to_be_bytes());
    hasher.update([0u8]);
    assert_eq!(entry.asset.id().to_bytes(), <[u8; 32]>::from(hasher.finalize()));
    assert_eq!(entry.asset.amount, 1000);
    planter.shutdown().await;
}

#[tokio::test]
async fn grouped_mint_shares_one_group_key() {
    let harness = Harness::new(MockChain::with_auto_confirm());
    let planter = planter::start(harness.ctx(), PlanterConfig::default())
        .await
        .unwrap();

    let mut anchor = seedling("g", 100);
    anchor.enable_emission = true;
    planter.queue_seedling(anchor).await.unwrap();
    for (name, amount) in [("g-tranche-1", 50u64), ("g-tranche-2", 25)] {
        let mut tranche = seedling(name, amount);
        tranche.group_anchor = Some("g".into());
        planter.queue_seedling(tranche).await.unwrap();
    }
    let batch_key = planter.finalize_batch().await.unwrap();
    wait_for_state(&planter, batch_key, BatchState::Finalized).await;

    let secp = Secp256k1::new();
    let mut group_keys = Vec::new();
    let mut total = 0u64;
    let mut assets = Vec::new();
    for locator in harness.archive.locators() {
        let file = harness.archive.fetch_proof(&locator).await.unwrap().unwrap();
        let entry = file.verify(&secp).unwrap();
        let group = entry.asset.group_key.expect("grouped asset");
        // Each member carries a schnorr signature over its own asset id.
        group.verify(&secp, entry.asset.id()).unwrap();
        group_keys.push(group.pub_key);
        total += entry.asset.amount;
        assets.push(entry.asset.clone());
    }
    assert_eq!(assets.len(), 3);
    assert_eq!(total, 175);
    group_keys.dedup();
    assert_eq!(group_keys.len(), 1, "one group key shared by all members");

    // The grouped members roll up into a single inner commitment.
    let commitment = tapwallet::TapCommitment::from_assets(&secp, assets).unwrap();
    assert_eq!(commitment.commitments().count(), 1);
    assert_eq!(commitment.root().sum, 175);
    planter.shutdown().await;
}

/// Wallet whose funding blocks until the test opens the gate; used to
/// park a caretaker between freeze and broadcast.
struct GatedWallet {
    inner: Arc<MockWallet>,
    gate: Semaphore,
}

impl GatedWallet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MockWallet::new(),
            gate: Semaphore::new(0),
        })
    }

    fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait::async_trait]
impl WalletAnchor for GatedWallet {
    async fn fund_psbt(
        &self,
        inputs: Vec<bitcoin::OutPoint>,
        outputs: Vec<TxOut>,
        fee_rate: u64,
    ) -> Result<Psbt, TapError> {
        let permit = self.gate.acquire().await.map_err(|_| {
            TapError::WalletUnavailable("gate closed".into())
        })?;
        permit.forget();
        self.inner.fund_psbt(inputs, outputs, fee_rate).await
    }

    async fn sign_psbt(&self, psbt: Psbt) -> Result<Psbt, TapError> {
        self.inner.sign_psbt(psbt).await
    }
}

#[tokio::test]
async fn cancellation_before_freeze_keeps_seedlings_queryable() {
    let harness = Harness::new(MockChain::new());
    let planter = planter::start(harness.ctx(), PlanterConfig::default())
        .await
        .unwrap();

    planter.queue_seedling(seedling("early", 10)).await.unwrap();
    let (batch_key, state) = planter.cancel_batch().await.unwrap();
    assert_eq!(state, BatchState::SeedlingCancelled);

    let seedlings = wait_for_state(&planter, batch_key, BatchState::SeedlingCancelled).await;
    assert_eq!(seedlings.len(), 1);
    assert_eq!(seedlings[0].name, "early");

    // Nothing ever reached the chain.
    assert!(harness.chain.broadcasts().is_empty());
    planter.shutdown().await;
}

#[tokio::test]
async fn cancellation_between_freeze_and_broadcast() {
    let harness = Harness::new(MockChain::new());
    let wallet = GatedWallet::new();
    let planter = planter::start(harness.ctx_with_wallet(wallet.clone()), PlanterConfig::default())
        .await
        .unwrap();

    planter.queue_seedling(seedling("stuck", 10)).await.unwrap();
    let batch_key = planter.finalize_batch().await.unwrap();
    wait_for_state(&planter, batch_key, BatchState::Frozen).await;

    // The caretaker is parked inside funding; cancellation lands first.
    let (cancelled_key, state) = planter.cancel_batch().await.unwrap();
    assert_eq!(cancelled_key, batch_key);
    assert!(matches!(state, BatchState::Frozen | BatchState::Committed));

    wallet.open();
    wait_for_state(&planter, batch_key, BatchState::SproutCancelled).await;
    assert!(harness.chain.broadcasts().is_empty());
    planter.shutdown().await;
}

#[tokio::test]
async fn cancellation_after_broadcast_is_ignored() {
    let harness = Harness::new(MockChain::new());
    let planter = planter::start(harness.ctx(), PlanterConfig::default())
        .await
        .unwrap();

    planter.queue_seedling(seedling("launched", 10)).await.unwrap();
    let batch_key = planter.finalize_batch().await.unwrap();
    wait_for_state(&planter, batch_key, BatchState::Broadcast).await;

    let (cancelled_key, state) = planter.cancel_batch().await.unwrap();
    assert_eq!(cancelled_key, batch_key);
    assert_eq!(state, BatchState::Broadcast);

    // Still broadcast, and confirmation completes the batch as usual.
    let batches = planter.list_batches().await.unwrap();
    let batch = batches.iter().find(|b| b.batch_key == batch_key).unwrap();
    assert_eq!(batch.state, BatchState::Broadcast);

    let txid = harness.chain.broadcasts()[0].compute_txid();
    harness.chain.confirm(txid);
    wait_for_state(&planter, batch_key, BatchState::Finalized).await;
    planter.shutdown().await;
}

#[tokio::test]
async fn broadcast_batch_replays_to_finalized_after_restart() {
    let harness = Harness::new(MockChain::new());
    let planter = planter::start(harness.ctx(), PlanterConfig::default())
        .await
        .unwrap();

    planter.queue_seedling(seedling("replay", 77)).await.unwrap();
    let batch_key = planter.finalize_batch().await.unwrap();
    wait_for_state(&planter, batch_key, BatchState::Broadcast).await;
    planter.shutdown().await;

    // A fresh planter over the same durable log resumes the batch at its
    // last state and re-registers the confirmation wait.
    let planter = planter::start(harness.ctx(), PlanterConfig::default())
        .await
        .unwrap();
    let batches = planter.list_batches().await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].batch_key, batch_key);

    // Re-broadcast is idempotent.
    assert_eq!(harness.chain.broadcasts().len(), 1);

    let txid = harness.chain.broadcasts()[0].compute_txid();
    harness.chain.confirm(txid);
    wait_for_state(&planter, batch_key, BatchState::Finalized).await;
    assert_eq!(harness.archive.len(), 1);
    planter.shutdown().await;
}

#[tokio::test]
async fn periodic_ticker_freezes_pending_batch() {
    let harness = Harness::new(MockChain::with_auto_confirm());
    let planter = planter::start(
        harness.ctx(),
        PlanterConfig {
            batch_interval: Some(Duration::from_millis(20)),
        },
    )
    .await
    .unwrap();

    planter.queue_seedling(seedling("ticked", 5)).await.unwrap();
    for _ in 0..500 {
        if harness.archive.len() == 1 {
            planter.shutdown().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ticker never finalized the pending batch");
}
