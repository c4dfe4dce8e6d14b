//! The planter: a long-lived coordinator owning the at-most-one pending
//! minting batch. Seedlings queue into the pending batch; a timer tick or
//! an explicit finalize freezes it and hands it to a dedicated caretaker
//! task. The planter never blocks on its caretakers.

use std::collections::BTreeMap;
use std::time::Duration;

use bitcoin::psbt::Psbt;
use bitcoin::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::asset::{Asset, AssetType};
use crate::caretaker::{self, CaretakerEvent, MintContext};
use crate::chain::{ChainBackend, TxConfirmation, WalletAnchor};
use crate::error::TapError;
use crate::keys::{KeyDescriptor, KeyFamily, KeyRing};
use crate::proof_file::ProofArchive;
use crate::store::MintingStore;

/// A queued minting request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seedling {
    pub asset_type: AssetType,
    pub name: String,
    pub meta: Vec<u8>,
    pub amount: u64,
    /// Name of the batch seedling whose group this one joins.
    pub group_anchor: Option<String>,
    /// Whether this seedling mints a group key allowing re-issuance.
    pub enable_emission: bool,
}

impl Seedling {
    fn validate(&self) -> Result<(), TapError> {
        if self.name.is_empty() {
            return Err(TapError::InvalidArgument("seedling name is empty"));
        }
        match self.asset_type {
            AssetType::Collectible if self.amount != 1 => {
                Err(TapError::InvalidArgument("collectible amount must be 1"))
            }
            AssetType::Normal if self.amount == 0 => {
                Err(TapError::InvalidArgument("seedling amount is zero"))
            }
            _ => Ok(()),
        }
    }
}

/// Strictly monotonic batch lifecycle, except for the two cancellation
/// exits and the terminal failure variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Pending,
    Frozen,
    Committed,
    Broadcast,
    Confirmed,
    Finalized,
    SeedlingCancelled,
    SproutCancelled,
    Failed,
}

impl BatchState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            BatchState::Finalized
                | BatchState::SeedlingCancelled
                | BatchState::SproutCancelled
                | BatchState::Failed
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Frozen => "frozen",
            BatchState::Committed => "committed",
            BatchState::Broadcast => "broadcast",
            BatchState::Confirmed => "confirmed",
            BatchState::Finalized => "finalized",
            BatchState::SeedlingCancelled => "seedling_cancelled",
            BatchState::SproutCancelled => "sprout_cancelled",
            BatchState::Failed => "failed",
        }
    }
}

/// A minting batch: the batch key is the taproot internal key of the
/// genesis output and uniquely identifies the batch.
#[derive(Clone, Debug)]
pub struct MintingBatch {
    pub batch_key: KeyDescriptor,
    pub state: BatchState,
    pub seedlings: BTreeMap<String, Seedling>,
    pub genesis_psbt: Option<Psbt>,
    pub signed_psbt: Option<Psbt>,
    pub assets: Vec<Asset>,
    /// Chain height when the batch was created; confirmations are
    /// requested from this height on.
    pub height_hint: u32,
    pub confirmation: Option<TxConfirmation>,
}

impl MintingBatch {
    pub fn new(batch_key: KeyDescriptor, height_hint: u32) -> Self {
        Self {
            batch_key,
            state: BatchState::Pending,
            seedlings: BTreeMap::new(),
            genesis_psbt: None,
            signed_psbt: None,
            assets: Vec::new(),
            height_hint,
            confirmation: None,
        }
    }

    /// Queues a seedling, enforcing the batch-level validation rules.
    pub fn add_seedling(&mut self, seedling: Seedling) -> Result<(), TapError> {
        seedling.validate()?;
        if self.seedlings.contains_key(&seedling.name) {
            return Err(TapError::SeedlingNameInUse(seedling.name));
        }
        if let Some(anchor_name) = &seedling.group_anchor {
            if self.seedlings.is_empty() {
                return Err(TapError::BatchEmpty(anchor_name.clone()));
            }
            let anchor = self
                .seedlings
                .get(anchor_name)
                .ok_or_else(|| TapError::GroupAnchorMissing(anchor_name.clone()))?;
            if !anchor.enable_emission {
                return Err(TapError::GroupAnchorEmissionDisabled(anchor_name.clone()));
            }
        }
        self.seedlings.insert(seedling.name.clone(), seedling);
        Ok(())
    }

    pub fn anchor_txid(&self) -> Option<bitcoin::Txid> {
        self.signed_psbt
            .as_ref()
            .or(self.genesis_psbt.as_ref())
            .map(|psbt| psbt.unsigned_tx.compute_txid())
    }
}

/// Read-only view of a batch handed out by `list_batches`.
#[derive(Clone, Debug)]
pub struct BatchSnapshot {
    pub batch_key: XOnlyPublicKey,
    pub state: BatchState,
    pub seedlings: Vec<Seedling>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PlanterConfig {
    /// When set, a ticker finalizes the pending batch on this interval.
    pub batch_interval: Option<Duration>,
}

enum Command {
    QueueSeedling {
        seedling: Seedling,
        reply: oneshot::Sender<Result<(), TapError>>,
    },
    FinalizeBatch {
        reply: oneshot::Sender<Result<XOnlyPublicKey, TapError>>,
    },
    CancelBatch {
        reply: oneshot::Sender<Result<(XOnlyPublicKey, BatchState), TapError>>,
    },
    ListBatches {
        reply: oneshot::Sender<Vec<BatchSnapshot>>,
    },
    Shutdown,
}

/// Client handle to the planter actor; every call travels over the
/// bounded command queue with an embedded reply channel.
#[derive(Clone)]
pub struct PlanterHandle {
    commands: mpsc::Sender<Command>,
}

impl PlanterHandle {
    pub async fn queue_seedling(&self, seedling: Seedling) -> Result<(), TapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::QueueSeedling { seedling, reply })
            .await
            .map_err(|_| TapError::ActorShutdown)?;
        rx.await.map_err(|_| TapError::ActorShutdown)?
    }

    /// Freezes the pending batch and spawns its caretaker, returning the
    /// batch key.
    pub async fn finalize_batch(&self) -> Result<XOnlyPublicKey, TapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::FinalizeBatch { reply })
            .await
            .map_err(|_| TapError::ActorShutdown)?;
        rx.await.map_err(|_| TapError::ActorShutdown)?
    }

    /// Requests cancellation of the current batch. Returns the batch key
    /// and the state the cancellation decision was taken in; after
    /// broadcast the state is returned unchanged and the batch proceeds.
    pub async fn cancel_batch(&self) -> Result<(XOnlyPublicKey, BatchState), TapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CancelBatch { reply })
            .await
            .map_err(|_| TapError::ActorShutdown)?;
        rx.await.map_err(|_| TapError::ActorShutdown)?
    }

    pub async fn list_batches(&self) -> Result<Vec<BatchSnapshot>, TapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ListBatches { reply })
            .await
            .map_err(|_| TapError::ActorShutdown)?;
        rx.await.map_err(|_| TapError::ActorShutdown)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct ActiveCaretaker {
    batch_key: XOnlyPublicKey,
    cancel: watch::Sender<bool>,
}

struct Planter<S, C, W, K, R> {
    ctx: MintContext<S, C, W, K, R>,
    config: PlanterConfig,
    pending: Option<MintingBatch>,
    /// Latest known state per batch, fed by caretaker events.
    registry: BTreeMap<XOnlyPublicKey, BatchSnapshot>,
    active: Option<ActiveCaretaker>,
    events_tx: mpsc::Sender<CaretakerEvent>,
}

/// Starts the planter actor, replaying every non-final batch from the
/// minting log and resuming a caretaker for each.
pub async fn start<S, C, W, K, R>(
    ctx: MintContext<S, C, W, K, R>,
    config: PlanterConfig,
) -> Result<PlanterHandle, TapError>
where
    S: MintingStore + 'static,
    C: ChainBackend + 'static,
    W: WalletAnchor + 'static,
    K: KeyRing + 'static,
    R: ProofArchive + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    let mut planter = Planter {
        ctx,
        config,
        pending: None,
        registry: BTreeMap::new(),
        active: None,
        events_tx,
    };
    planter.replay().await?;
    tokio::spawn(planter.run(commands_rx, events_rx));
    Ok(PlanterHandle {
        commands: commands_tx,
    })
}

impl<S, C, W, K, R> Planter<S, C, W, K, R>
where
    S: MintingStore + 'static,
    C: ChainBackend + 'static,
    W: WalletAnchor + 'static,
    K: KeyRing + 'static,
    R: ProofArchive + 'static,
{
    /// Crash recovery: every non-final batch in the store resumes at its
    /// last durable state.
    async fn replay(&mut self) -> Result<(), TapError> {
        let batches = self.ctx.store.fetch_non_final_batches().await?;
        for batch in batches {
            info!(
                batch_key = %batch.batch_key.pub_key,
                state = batch.state.name(),
                "resuming minting batch"
            );
            self.spawn_caretaker(batch);
        }
        Ok(())
    }

    fn spawn_caretaker(&mut self, batch: MintingBatch) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let batch_key = batch.batch_key.pub_key;
        self.registry.insert(
            batch_key,
            BatchSnapshot {
                batch_key,
                state: batch.state,
                seedlings: batch.seedlings.values().cloned().collect(),
                error: None,
            },
        );
        self.active = Some(ActiveCaretaker {
            batch_key,
            cancel: cancel_tx,
        });
        tokio::spawn(caretaker::run(
            self.ctx.clone(),
            batch,
            cancel_rx,
            self.events_tx.clone(),
        ));
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<CaretakerEvent>,
    ) {
        let mut ticker = self.config.batch_interval.map(tokio::time::interval);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                _ = tick(&mut ticker) => {
                    if self.pending.as_ref().is_some_and(|batch| !batch.seedlings.is_empty()) {
                        if let Err(err) = self.finalize().await {
                            warn!(error = %err, "periodic batch finalize failed");
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: CaretakerEvent) {
        if let Some(snapshot) = self.registry.get_mut(&event.batch_key) {
            snapshot.state = event.state;
            snapshot.error = event.error;
        }
        if event.state.is_final() {
            if let Some(active) = &self.active {
                if active.batch_key == event.batch_key {
                    self.active = None;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::QueueSeedling { seedling, reply } => {
                let _ = reply.send(self.queue_seedling(seedling).await);
            }
            Command::FinalizeBatch { reply } => {
                let _ = reply.send(self.finalize().await);
            }
            Command::CancelBatch { reply } => {
                let _ = reply.send(self.cancel());
            }
            Command::ListBatches { reply } => {
                let mut batches: Vec<BatchSnapshot> = self.registry.values().cloned().collect();
                if let Some(pending) = &self.pending {
                    batches.push(BatchSnapshot {
                        batch_key: pending.batch_key.pub_key,
                        state: pending.state,
                        seedlings: pending.seedlings.values().cloned().collect(),
                        error: None,
                    });
                }
                let _ = reply.send(batches);
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn queue_seedling(&mut self, seedling: Seedling) -> Result<(), TapError> {
        if self.pending.is_none() {
            let batch_key = self.ctx.keyring.derive_next(KeyFamily::BatchKey).await?;
            let height_hint = self.ctx.chain.best_height().await?;
            self.pending = Some(MintingBatch::new(batch_key, height_hint));
        }
        let batch = self.pending.as_mut().expect("pending batch just ensured");
        batch.add_seedling(seedling)
    }

    async fn finalize(&mut self) -> Result<XOnlyPublicKey, TapError> {
        let mut batch = self
            .pending
            .take()
            .ok_or(TapError::InvalidState("no pending batch"))?;
        if batch.seedlings.is_empty() {
            self.pending = Some(batch);
            return Err(TapError::InvalidState("pending batch is empty"));
        }
        batch.state = BatchState::Frozen;
        let batch_key = batch.batch_key.pub_key;
        info!(batch_key = %batch_key, seedlings = batch.seedlings.len(), "freezing batch");
        self.spawn_caretaker(batch);
        Ok(batch_key)
    }

    fn cancel(&mut self) -> Result<(XOnlyPublicKey, BatchState), TapError> {
        // A pending batch cancels in place; its seedlings stay queryable.
        if let Some(mut batch) = self.pending.take() {
            batch.state = BatchState::SeedlingCancelled;
            let key = batch.batch_key.pub_key;
            self.registry.insert(
                key,
                BatchSnapshot {
                    batch_key: key,
                    state: BatchState::SeedlingCancelled,
                    seedlings: batch.seedlings.values().cloned().collect(),
                    error: None,
                },
            );
            return Ok((key, BatchState::SeedlingCancelled));
        }

        let active = self
            .active
            .as_ref()
            .ok_or(TapError::BatchNotCancellable("no batch"))?;
        let state = self
            .registry
            .get(&active.batch_key)
            .map(|snapshot| snapshot.state)
            .unwrap_or(BatchState::Frozen);
        match state {
            // Sprouting but not yet on-chain: the caretaker honors the
            // cancel flag at its next step boundary.
            BatchState::Frozen | BatchState::Committed => {
                let _ = active.cancel.send(true);
                Ok((active.batch_key, state))
            }
            // Already broadcast: log the attempt, return the batch key,
            // leave the batch untouched.
            BatchState::Broadcast | BatchState::Confirmed => {
                warn!(batch_key = %active.batch_key, "cancellation after broadcast ignored");
                Ok((active.batch_key, state))
            }
            other => Err(TapError::BatchNotCancellable(other.name())),
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seedling(name: &str) -> Seedling {
        Seedling {
            asset_type: AssetType::Normal,
            name: name.into(),
            meta: vec![0x00],
            amount: 100,
            group_anchor: None,
            enable_emission: false,
        }
    }

    #[test]
    fn duplicate_seedling_name_rejected() {
        let key = test_batch_key();
        let mut batch = MintingBatch::new(key, 0);
        batch.add_seedling(seedling("a")).unwrap();
        assert!(matches!(
            batch.add_seedling(seedling("a")),
            Err(TapError::SeedlingNameInUse(name)) if name == "a"
        ));
    }

    #[test]
    fn group_anchor_validation() {
        let key = test_batch_key();
        let mut batch = MintingBatch::new(key, 0);

        // Anchoring into an empty batch.
        let mut tranche = seedling("t1");
        tranche.group_anchor = Some("g".into());
        assert!(matches!(
            batch.add_seedling(tranche.clone()),
            Err(TapError::BatchEmpty(name)) if name == "g"
        ));

        // Anchor not present.
        batch.add_seedling(seedling("other")).unwrap();
        assert!(matches!(
            batch.add_seedling(tranche.clone()),
            Err(TapError::GroupAnchorMissing(name)) if name == "g"
        ));

        // Anchor present but emission disabled.
        batch.add_seedling(seedling("g")).unwrap();
        assert!(matches!(
            batch.add_seedling(tranche.clone()),
            Err(TapError::GroupAnchorEmissionDisabled(name)) if name == "g"
        ));

        // Emission-enabled anchor accepts members.
        let mut anchor = seedling("g2");
        anchor.enable_emission = true;
        batch.add_seedling(anchor).unwrap();
        tranche.group_anchor = Some("g2".into());
        batch.add_seedling(tranche).unwrap();
    }

    #[test]
    fn state_finality() {
        assert!(!BatchState::Pending.is_final());
        assert!(!BatchState::Broadcast.is_final());
        assert!(BatchState::Finalized.is_final());
        assert!(BatchState::SeedlingCancelled.is_final());
        assert!(BatchState::SproutCancelled.is_final());
        assert!(BatchState::Failed.is_final());
    }

    fn test_batch_key() -> KeyDescriptor {
        let (_, script_key) = crate::asset::tests::test_script_key(300);
        KeyDescriptor {
            family: KeyFamily::BatchKey,
            index: 0,
            pub_key: script_key.pub_key,
        }
    }
}
