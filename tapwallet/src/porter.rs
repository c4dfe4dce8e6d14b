//! The chain porter: a single-threaded actor advancing one outbound
//! parcel at a time from coin selection through virtual signing, anchor
//! construction, broadcast, confirmation and proof delivery. Passive
//! assets sharing a spent commitment are re-anchored alongside.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{All, Keypair, Secp256k1};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::address::{Chain, TapAddress};
use crate::asset::{Asset, PrevId, ScriptKey};
use crate::caretaker::{extract_tx, with_backoff};
use crate::chain::{ChainBackend, TxConfirmation, WalletAnchor};
use crate::coins::{select_commitments, AnchoredCommitment, CoinLister, CommitmentConstraints};
use crate::commitment::TapCommitment;
use crate::error::TapError;
use crate::keys::{KeyFamily, KeyRing};
use crate::proof_file::{ProofArchive, ProofEntry, ProofLocator};
use crate::store::ParcelStore;
use crate::vpacket::{build_send_packet, passive_packet, Anchor, VInput, VOutputType, VPacket};
use crate::vm;

/// Value of every asset anchor output, just above dust.
const ANCHOR_OUTPUT_VALUE: u64 = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParcelState {
    Requested,
    InputsSelected,
    VirtualSigned,
    AnchorFunded,
    AnchorSigned,
    Broadcast,
    Confirmed,
    ProofsDelivered,
}

/// Durable record of a transfer: the signed anchor transaction, consumed
/// inputs, produced outputs with their proof suffixes, and re-anchored
/// passive assets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundParcel {
    pub state: ParcelState,
    pub anchor_tx: Transaction,
    pub height_hint: u32,
    pub inputs: Vec<ParcelInput>,
    pub outputs: Vec<ParcelOutput>,
    pub passives: Vec<PassiveReAnchor>,
    pub confirmation: Option<TxConfirmation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParcelInput {
    pub anchor_point: OutPoint,
    pub asset_id: [u8; 32],
    pub script_key: [u8; 32],
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParcelOutput {
    pub anchor_point: OutPoint,
    pub anchor_internal_key: XOnlyPublicKey,
    pub script_key: [u8; 32],
    pub amount: u64,
    /// Local script keys become owned assets on confirmation; remote
    /// ones become outbound records.
    pub local: bool,
    /// Canonical bytes of the output asset.
    pub asset: Vec<u8>,
    /// Proof entry extending the input's provenance chain.
    pub proof_suffix: Vec<u8>,
    /// Provenance chain this suffix extends.
    pub prev_anchor_point: OutPoint,
    pub prev_script_key: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassiveReAnchor {
    pub prev_anchor_point: OutPoint,
    pub anchor_point: OutPoint,
    pub anchor_internal_key: XOnlyPublicKey,
    pub script_key: [u8; 32],
    pub asset: Vec<u8>,
    pub proof_suffix: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ShipmentRequest {
    pub address: TapAddress,
    /// Whether the recipient is aware of the transfer; a full-value send
    /// to an aware recipient skips the split.
    pub interactive: bool,
}

#[derive(Clone, Debug)]
pub struct ShipmentReceipt {
    pub anchor_txid: Txid,
    pub state: ParcelState,
}

/// Capabilities of the transfer pipeline.
pub struct PorterContext<S, C, W, K, R, L> {
    pub store: Arc<S>,
    pub chain: Arc<C>,
    pub wallet: Arc<W>,
    pub keyring: Arc<K>,
    pub archive: Arc<R>,
    pub coins: Arc<L>,
    pub secp: Secp256k1<All>,
    pub chain_params: Chain,
}

impl<S, C, W, K, R, L> Clone for PorterContext<S, C, W, K, R, L> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chain: self.chain.clone(),
            wallet: self.wallet.clone(),
            keyring: self.keyring.clone(),
            archive: self.archive.clone(),
            coins: self.coins.clone(),
            secp: self.secp.clone(),
            chain_params: self.chain_params,
        }
    }
}

enum Command {
    RequestShipment {
        request: ShipmentRequest,
        reply: oneshot::Sender<Result<ShipmentReceipt, TapError>>,
    },
    CancelShipment {
        reply: oneshot::Sender<Result<ParcelState, TapError>>,
    },
    Shutdown,
}

struct ConfirmEvent {
    txid: Txid,
    confirmation: TxConfirmation,
}

#[derive(Clone)]
pub struct PorterHandle {
    commands: mpsc::Sender<Command>,
}

impl PorterHandle {
    /// Public entry of the transfer pipeline; resolves once the anchor
    /// transaction is broadcast. Confirmation and proof delivery follow
    /// asynchronously.
    pub async fn request_shipment(
        &self,
        request: ShipmentRequest,
    ) -> Result<ShipmentReceipt, TapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RequestShipment { request, reply })
            .await
            .map_err(|_| TapError::ActorShutdown)?;
        rx.await.map_err(|_| TapError::ActorShutdown)?
    }

    /// Accepted only until broadcast; afterwards the attempt is logged
    /// and the in-flight parcel continues to confirmation.
    pub async fn cancel_shipment(&self) -> Result<ParcelState, TapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CancelShipment { reply })
            .await
            .map_err(|_| TapError::ActorShutdown)?;
        rx.await.map_err(|_| TapError::ActorShutdown)?
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Starts the porter actor. Pending parcels found in the store are
/// re-broadcast and their confirmation waiters re-registered.
pub async fn start<S, C, W, K, R, L>(
    ctx: PorterContext<S, C, W, K, R, L>,
) -> Result<PorterHandle, TapError>
where
    S: ParcelStore + 'static,
    C: ChainBackend + 'static,
    W: WalletAnchor + 'static,
    K: KeyRing + 'static,
    R: ProofArchive + 'static,
    L: CoinLister + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    let pending = ctx.store.pending_parcels().await?;
    for parcel in pending {
        let txid = parcel.anchor_tx.compute_txid();
        info!(%txid, "re-broadcasting pending parcel");
        with_backoff("rebroadcast parcel", || ctx.chain.broadcast(&parcel.anchor_tx)).await?;
        spawn_confirmation_waiter(&ctx, txid, parcel.height_hint, events_tx.clone());
    }

    tokio::spawn(run(ctx, commands_rx, events_rx, events_tx));
    Ok(PorterHandle {
        commands: commands_tx,
    })
}

fn spawn_confirmation_waiter<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    txid: Txid,
    height_hint: u32,
    events: mpsc::Sender<ConfirmEvent>,
) where
    C: ChainBackend + 'static,
    S: Send + Sync + 'static,
    W: Send + Sync + 'static,
    K: Send + Sync + 'static,
    R: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    let chain = ctx.chain.clone();
    tokio::spawn(async move {
        match chain.wait_for_confirmation(txid, height_hint).await {
            Ok(confirmation) => {
                let _ = events.send(ConfirmEvent { txid, confirmation }).await;
            }
            Err(err) => error!(%txid, error = %err, "confirmation wait failed"),
        }
    });
}

async fn run<S, C, W, K, R, L>(
    ctx: PorterContext<S, C, W, K, R, L>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<ConfirmEvent>,
    events_tx: mpsc::Sender<ConfirmEvent>,
) where
    S: ParcelStore + 'static,
    C: ChainBackend + 'static,
    W: WalletAnchor + 'static,
    K: KeyRing + 'static,
    R: ProofArchive + 'static,
    L: CoinLister + 'static,
{
    let mut awaiting: usize = 0;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::RequestShipment { request, reply }) => {
                    let result = process_shipment(&ctx, request, &events_tx).await;
                    if result.is_ok() {
                        awaiting += 1;
                    }
                    let _ = reply.send(result);
                }
                Some(Command::CancelShipment { reply }) => {
                    let result = if awaiting > 0 {
                        // Past broadcast there is nothing to unwind.
                        warn!("shipment cancellation after broadcast ignored");
                        Ok(ParcelState::Broadcast)
                    } else {
                        Err(TapError::InvalidState("no parcel in flight"))
                    };
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown) | None => break,
            },
            Some(event) = events.recv() => {
                match finalize_parcel(&ctx, event.txid, event.confirmation).await {
                    Ok(()) => {
                        awaiting = awaiting.saturating_sub(1);
                        info!(txid = %event.txid, "parcel confirmed, proofs delivered");
                    }
                    // The parcel stays pending; replay picks it up again.
                    Err(err) => error!(txid = %event.txid, error = %err, "parcel finalize failed"),
                }
            }
        }
    }
}

/// Runs the synchronous half of the pipeline: selection, virtual
/// construction and signing, passive re-anchoring, anchor funding and
/// signing, durable logging, broadcast.
async fn process_shipment<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    request: ShipmentRequest,
    events: &mpsc::Sender<ConfirmEvent>,
) -> Result<ShipmentReceipt, TapError>
where
    S: ParcelStore + 'static,
    C: ChainBackend + 'static,
    W: WalletAnchor + 'static,
    K: KeyRing + 'static,
    R: ProofArchive + 'static,
    L: CoinLister + 'static,
{
    let address = &request.address;

    // Coin selection.
    let constraints = CommitmentConstraints {
        asset_id: if address.group_key.is_some() {
            None
        } else {
            Some(address.asset_id)
        },
        group_key: address.group_key,
        min_amount: address.amount,
    };
    constraints.validate()?;
    let eligible = ctx.coins.list_eligible_commitments(&constraints).await?;
    let selected = select_commitments(eligible, address.amount)?;

    // Virtual transaction construction and signing.
    let mut inputs = Vec::with_capacity(selected.len());
    for coin in &selected {
        inputs.push(coin_to_vinput(ctx, coin).await?);
    }
    let change_script = ctx.keyring.derive_next(KeyFamily::ScriptKey).await?;
    let change_internal = ctx.keyring.derive_next(KeyFamily::AnchorInternal).await?;
    let mut packet = build_send_packet(
        ctx.chain_params,
        inputs,
        address.script_key,
        address.internal_key,
        address.amount,
        request.interactive,
        ScriptKey::new(change_script.pub_key),
        change_internal.pub_key,
    )?;

    let mut keymap: HashMap<[u8; 32], Keypair> = HashMap::new();
    for input in &packet.inputs {
        if let Some(keypair) = ctx.keyring.keypair(&input.asset.script_key.pub_key).await? {
            keymap.insert(input.asset.script_key.to_bytes(), keypair);
        }
    }
    vm::sign_packet(&ctx.secp, &mut packet, |key| {
        keymap.get(&key.to_bytes()).copied()
    })?;
    // A packet that fails its own VM never reaches the chain.
    vm::validate_packet(&ctx.secp, &packet)?;

    // Passive assets: everything in the consumed commitments that is not
    // being spent re-anchors under a local output.
    let (passive_index, passive_internal) =
        if packet.outputs[0].output_type == VOutputType::SplitRoot {
            (0, packet.outputs[0].anchor_internal_key)
        } else {
            (packet.max_anchor_index() + 1, change_internal.pub_key)
        };
    let spent: HashSet<(OutPoint, [u8; 32])> = selected
        .iter()
        .map(|coin| (coin.anchor_point, coin.asset.commitment_key()))
        .collect();
    let mut seen_anchors = HashSet::new();
    let mut passive_packets = Vec::new();
    for coin in &selected {
        if !seen_anchors.insert(coin.anchor_point) {
            continue;
        }
        for asset in coin.commitment.assets() {
            if spent.contains(&(coin.anchor_point, asset.commitment_key())) {
                continue;
            }
            let mut input = coin_to_vinput(ctx, coin).await?;
            input.prev_id = PrevId::new(coin.anchor_point, asset.id(), asset.script_key);
            input.asset = asset.clone();
            input.proof = fetch_proof_bytes(ctx, coin.anchor_point, asset.script_key).await?;
            passive_packets.push(passive_packet(
                ctx.chain_params,
                input,
                passive_index,
                passive_internal,
            ));
        }
    }

    // Anchor allocation: merge every virtual output landing on the same
    // bitcoin output into one taproot commitment.
    let allocations = allocate_anchors(ctx, &packet, &passive_packets)?;

    // Fund and sign the anchor transaction. It spends every consumed
    // anchor outpoint so the provenance chains stay connected.
    let fee_rate = with_backoff("fee estimate", || ctx.chain.fee_rate()).await?;
    let mut spent_anchors: Vec<OutPoint> = Vec::new();
    for coin in &selected {
        if !spent_anchors.contains(&coin.anchor_point) {
            spent_anchors.push(coin.anchor_point);
        }
    }
    let anchor_outputs: Vec<TxOut> = allocations
        .values()
        .map(|allocation| TxOut {
            value: Amount::from_sat(ANCHOR_OUTPUT_VALUE),
            script_pubkey: allocation.pk_script.clone(),
        })
        .collect();
    let funded = with_backoff("fund anchor", || {
        ctx.wallet
            .fund_psbt(spent_anchors.clone(), anchor_outputs.clone(), fee_rate)
    })
    .await?;
    let signed = with_backoff("sign anchor", || ctx.wallet.sign_psbt(funded.clone())).await?;
    let anchor_tx = extract_tx(&signed);
    let anchor_txid = anchor_tx.compute_txid();
    let height_hint = with_backoff("height hint", || ctx.chain.best_height()).await?;

    // Assemble the durable parcel, proof suffixes included.
    let parcel = build_parcel(
        ctx,
        &selected,
        &packet,
        &passive_packets,
        &allocations,
        anchor_tx.clone(),
        height_hint,
    )
    .await?;

    // Durable before broadcast.
    with_backoff("log parcel", || ctx.store.log_pending_parcel(&parcel)).await?;
    with_backoff("broadcast anchor", || ctx.chain.broadcast(&anchor_tx)).await?;

    let mut parcel = parcel;
    parcel.state = ParcelState::Broadcast;
    with_backoff("log broadcast", || ctx.store.log_pending_parcel(&parcel)).await?;

    spawn_confirmation_waiter(ctx, anchor_txid, height_hint, events.clone());

    Ok(ShipmentReceipt {
        anchor_txid,
        state: ParcelState::Broadcast,
    })
}

async fn coin_to_vinput<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    coin: &AnchoredCommitment,
) -> Result<VInput, TapError>
where
    R: ProofArchive,
{
    let sibling_hash = coin
        .tapscript_sibling
        .as_ref()
        .map(|preimage| preimage.tap_hash());
    Ok(VInput {
        prev_id: PrevId::new(coin.anchor_point, coin.asset.id(), coin.asset.script_key),
        anchor: Anchor {
            value: coin.anchor_value,
            pk_script: coin.pk_script.clone(),
            internal_key: coin.internal_key,
            merkle_root: Some(coin.commitment.merkle_root(sibling_hash)),
            tapscript_sibling: coin.tapscript_sibling.clone(),
            sighash_type: 0,
        },
        asset: coin.asset.clone(),
        proof: fetch_proof_bytes(ctx, coin.anchor_point, coin.asset.script_key).await?,
    })
}

async fn fetch_proof_bytes<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    anchor_point: OutPoint,
    script_key: ScriptKey,
) -> Result<Option<Vec<u8>>, TapError>
where
    R: ProofArchive,
{
    let locator = ProofLocator {
        out_point: anchor_point,
        script_key: script_key.to_bytes(),
    };
    Ok(ctx
        .archive
        .fetch_proof(&locator)
        .await?
        .map(|file| file.to_bytes()))
}

struct AnchorAllocation {
    internal_key: XOnlyPublicKey,
    commitment: TapCommitment,
    pk_script: ScriptBuf,
}

/// Builds the per-anchor-index taproot commitments over the main packet
/// and the passive packets, and their output scripts.
fn allocate_anchors<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    packet: &VPacket,
    passives: &[VPacket],
) -> Result<BTreeMap<u32, AnchorAllocation>, TapError> {
    let mut assets_by_index: BTreeMap<u32, (XOnlyPublicKey, Vec<Asset>)> = BTreeMap::new();
    let outputs = packet
        .outputs
        .iter()
        .chain(passives.iter().flat_map(|p| p.outputs.iter()));
    for output in outputs {
        let asset = output.asset()?.clone();
        match assets_by_index.entry(output.anchor_output_index) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert((output.anchor_internal_key, vec![asset]));
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                if entry.get().0 != output.anchor_internal_key {
                    return Err(TapError::InvalidState(
                        "anchor index with conflicting internal keys",
                    ));
                }
                entry.get_mut().1.push(asset);
            }
        }
    }

    // Anchor indices must be dense so they map directly onto the funded
    // transaction's output positions.
    for (position, index) in assets_by_index.keys().enumerate() {
        if *index != position as u32 {
            return Err(TapError::InvalidState("anchor output index gap"));
        }
    }

    let mut allocations = BTreeMap::new();
    for (index, (internal_key, assets)) in assets_by_index {
        let commitment = TapCommitment::from_assets(&ctx.secp, assets)?;
        let output_key = commitment.output_key(&ctx.secp, internal_key, None);
        let pk_script =
            ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key));
        allocations.insert(
            index,
            AnchorAllocation {
                internal_key,
                commitment,
                pk_script,
            },
        );
    }
    Ok(allocations)
}

async fn build_parcel<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    selected: &[AnchoredCommitment],
    packet: &VPacket,
    passives: &[VPacket],
    allocations: &BTreeMap<u32, AnchorAllocation>,
    anchor_tx: Transaction,
    height_hint: u32,
) -> Result<OutboundParcel, TapError>
where
    K: KeyRing,
{
    let anchor_txid = anchor_tx.compute_txid();
    let primary = &selected[0];

    let inputs = selected
        .iter()
        .map(|coin| ParcelInput {
            anchor_point: coin.anchor_point,
            asset_id: coin.asset.id().to_bytes(),
            script_key: coin.asset.script_key.to_bytes(),
            amount: coin.asset.amount,
        })
        .collect();

    let mut outputs = Vec::with_capacity(packet.outputs.len());
    for output in &packet.outputs {
        let asset = output.asset()?;
        let allocation = allocations
            .get(&output.anchor_output_index)
            .ok_or(TapError::InvalidState("unallocated anchor index"))?;
        let entry = ProofEntry {
            anchor_tx: anchor_tx.clone(),
            anchor_output_index: output.anchor_output_index,
            asset: asset.clone(),
            inclusion_proof: allocation.commitment.prove(
                asset.commitment_id(),
                asset.commitment_key(),
                allocation.internal_key,
                None,
            ),
        };
        let local = ctx
            .keyring
            .keypair(&output.script_key.pub_key)
            .await?
            .is_some();
        outputs.push(ParcelOutput {
            anchor_point: OutPoint {
                txid: anchor_txid,
                vout: output.anchor_output_index,
            },
            anchor_internal_key: output.anchor_internal_key,
            script_key: output.script_key.to_bytes(),
            amount: output.amount,
            local,
            asset: asset.to_bytes(),
            proof_suffix: entry.to_bytes(),
            prev_anchor_point: primary.anchor_point,
            prev_script_key: primary.asset.script_key.to_bytes(),
        });
    }

    let mut passive_records = Vec::with_capacity(passives.len());
    for passive in passives {
        let output = &passive.outputs[0];
        let asset = output.asset()?;
        let allocation = allocations
            .get(&output.anchor_output_index)
            .ok_or(TapError::InvalidState("unallocated anchor index"))?;
        let entry = ProofEntry {
            anchor_tx: anchor_tx.clone(),
            anchor_output_index: output.anchor_output_index,
            asset: asset.clone(),
            inclusion_proof: allocation.commitment.prove(
                asset.commitment_id(),
                asset.commitment_key(),
                allocation.internal_key,
                None,
            ),
        };
        passive_records.push(PassiveReAnchor {
            prev_anchor_point: passive.inputs[0].prev_id.out_point,
            anchor_point: OutPoint {
                txid: anchor_txid,
                vout: output.anchor_output_index,
            },
            anchor_internal_key: output.anchor_internal_key,
            script_key: output.script_key.to_bytes(),
            asset: asset.to_bytes(),
            proof_suffix: entry.to_bytes(),
        });
    }

    Ok(OutboundParcel {
        state: ParcelState::AnchorSigned,
        anchor_tx,
        height_hint,
        inputs,
        outputs,
        passives: passive_records,
        confirmation: None,
    })
}

/// Confirmation handler: extends and archives the proof chains, moves
/// ownership in the asset store, and marks the parcel delivered.
async fn finalize_parcel<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    txid: Txid,
    confirmation: TxConfirmation,
) -> Result<(), TapError>
where
    S: ParcelStore,
    R: ProofArchive,
    L: CoinLister,
{
    let pending = ctx.store.pending_parcels().await?;
    let Some(mut parcel) = pending
        .into_iter()
        .find(|parcel| parcel.anchor_tx.compute_txid() == txid)
    else {
        warn!(%txid, "confirmation for unknown parcel");
        return Ok(());
    };
    parcel.state = ParcelState::Confirmed;

    // (i) final proofs for every new output.
    for output in &parcel.outputs {
        let entry = ProofEntry::from_bytes(&output.proof_suffix)?;
        let base_locator = ProofLocator {
            out_point: output.prev_anchor_point,
            script_key: output.prev_script_key,
        };
        let mut file = ctx
            .archive
            .fetch_proof(&base_locator)
            .await?
            .ok_or(TapError::ProofInvalid("missing input proof file"))?;
        file.append(entry);
        file.verify(&ctx.secp)?;
        let locator = ProofLocator {
            out_point: output.anchor_point,
            script_key: output.script_key,
        };
        with_backoff("archive transfer proof", || {
            ctx.archive.store_proof(locator, file.clone())
        })
        .await?;
    }

    // (ii) updated proofs for the re-anchored passives.
    for passive in &parcel.passives {
        let entry = ProofEntry::from_bytes(&passive.proof_suffix)?;
        let base_locator = ProofLocator {
            out_point: passive.prev_anchor_point,
            script_key: passive.script_key,
        };
        let mut file = ctx
            .archive
            .fetch_proof(&base_locator)
            .await?
            .ok_or(TapError::ProofInvalid("missing passive proof file"))?;
        file.append(entry);
        file.verify(&ctx.secp)?;
        let locator = ProofLocator {
            out_point: passive.anchor_point,
            script_key: passive.script_key,
        };
        with_backoff("archive passive proof", || {
            ctx.archive.store_proof(locator, file.clone())
        })
        .await?;
    }

    // Ownership moves: consumed anchors leave the coin source, local
    // outputs and passives enter under their new anchors.
    let spent: Vec<OutPoint> = parcel
        .inputs
        .iter()
        .map(|input| input.anchor_point)
        .collect();
    with_backoff("remove spent coins", || ctx.coins.remove_commitments(&spent)).await?;
    let new_coins = rebuild_coins(ctx, &parcel)?;
    with_backoff("add new coins", || ctx.coins.add_commitments(new_coins.clone())).await?;

    // (iii) durable finality.
    parcel.state = ParcelState::ProofsDelivered;
    with_backoff("log delivered parcel", || {
        ctx.store.log_pending_parcel(&parcel)
    })
    .await?;
    with_backoff("confirm parcel", || {
        ctx.store.confirm_parcel_delivery(txid, confirmation)
    })
    .await
}

/// Reconstructs the owned `AnchoredCommitment`s created by a confirmed
/// parcel: local transfer outputs plus every re-anchored passive.
fn rebuild_coins<S, C, W, K, R, L>(
    ctx: &PorterContext<S, C, W, K, R, L>,
    parcel: &OutboundParcel,
) -> Result<Vec<AnchoredCommitment>, TapError> {
    // All assets sharing an anchor output rebuild that output's
    // commitment.
    let mut assets_by_anchor: BTreeMap<OutPoint, Vec<Asset>> = BTreeMap::new();
    let mut owned: Vec<(OutPoint, XOnlyPublicKey, Asset)> = Vec::new();
    for output in &parcel.outputs {
        let asset = Asset::from_bytes(&output.asset)?;
        assets_by_anchor
            .entry(output.anchor_point)
            .or_default()
            .push(asset.clone());
        if output.local {
            owned.push((output.anchor_point, output.anchor_internal_key, asset));
        }
    }
    for passive in &parcel.passives {
        let asset = Asset::from_bytes(&passive.asset)?;
        assets_by_anchor
            .entry(passive.anchor_point)
            .or_default()
            .push(asset.clone());
        owned.push((passive.anchor_point, passive.anchor_internal_key, asset));
    }

    let mut coins = Vec::with_capacity(owned.len());
    for (anchor_point, internal_key, asset) in owned {
        let assets = assets_by_anchor
            .get(&anchor_point)
            .expect("anchor populated above");
        let commitment = TapCommitment::from_assets(&ctx.secp, assets.clone())?;
        let pk_script = parcel
            .anchor_tx
            .output
            .get(anchor_point.vout as usize)
            .map(|txout| txout.script_pubkey.clone())
            .ok_or(TapError::InvalidState("parcel output index out of range"))?;
        coins.push(AnchoredCommitment {
            anchor_point,
            anchor_value: ANCHOR_OUTPUT_VALUE,
            pk_script,
            internal_key,
            tapscript_sibling: None,
            commitment,
            asset,
        });
    }
    Ok(coins)
}
