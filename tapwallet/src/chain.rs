//! Chain backend and bitcoin wallet capabilities. The daemon only ever
//! talks to these traits; production wires them to a full node and the
//! on-chain wallet, tests wire them to the in-process mocks below.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use crate::error::TapError;

/// Confirmation of an anchor transaction, keyed by (txid, block hash) so
/// redelivery after a restart is idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub block_hash: BlockHash,
    pub block_height: u32,
}

#[async_trait::async_trait]
pub trait ChainBackend: Send + Sync {
    async fn best_height(&self) -> Result<u32, TapError>;

    /// Fee estimate in sat/vB.
    async fn fee_rate(&self) -> Result<u64, TapError>;

    /// Best-effort submission; re-broadcasting an already known
    /// transaction is not an error.
    async fn broadcast(&self, tx: &Transaction) -> Result<(), TapError>;

    /// Resolves once `txid` confirms at or above `min_height`. No
    /// timeout: confirmation waits survive for the life of the process
    /// and are re-registered on restart.
    async fn wait_for_confirmation(
        &self,
        txid: Txid,
        min_height: u32,
    ) -> Result<TxConfirmation, TapError>;
}

#[async_trait::async_trait]
pub trait WalletAnchor: Send + Sync {
    /// Funds a transaction spending `inputs` and paying exactly
    /// `outputs`, adding wallet inputs and change as needed. Funding is
    /// idempotent per template.
    async fn fund_psbt(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        fee_rate: u64,
    ) -> Result<Psbt, TapError>;

    async fn sign_psbt(&self, psbt: Psbt) -> Result<Psbt, TapError>;
}

/// In-process chain backend: broadcasts are recorded, confirmations are
/// released by the test (or immediately with auto-confirm).
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockChainState>,
    notify: Notify,
}

#[derive(Default)]
struct MockChainState {
    height: u32,
    auto_confirm: bool,
    broadcasts: Vec<Transaction>,
    confirmations: HashMap<Txid, TxConfirmation>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every broadcast confirms immediately in the next block.
    pub fn with_auto_confirm() -> Arc<Self> {
        let chain = Self::default();
        chain.state.lock().expect("fresh lock").auto_confirm = true;
        Arc::new(chain)
    }

    pub fn set_height(&self, height: u32) {
        self.state.lock().expect("mock chain poisoned").height = height;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state
            .lock()
            .expect("mock chain poisoned")
            .broadcasts
            .clone()
    }

    /// Confirms `txid` in a synthetic block above the current height.
    pub fn confirm(&self, txid: Txid) -> TxConfirmation {
        let mut state = self.state.lock().expect("mock chain poisoned");
        let confirmation = Self::confirmation_for(&mut state, txid);
        drop(state);
        self.notify.notify_waiters();
        confirmation
    }

    fn confirmation_for(state: &mut MockChainState, txid: Txid) -> TxConfirmation {
        if let Some(existing) = state.confirmations.get(&txid) {
            return *existing;
        }
        state.height += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"mock-block");
        hasher.update(txid.to_byte_array());
        hasher.update(state.height.to_be_bytes());
        let confirmation = TxConfirmation {
            block_hash: BlockHash::from_byte_array(hasher.finalize().into()),
            block_height: state.height,
        };
        state.confirmations.insert(txid, confirmation);
        confirmation
    }
}

#[async_trait::async_trait]
impl ChainBackend for MockChain {
    async fn best_height(&self) -> Result<u32, TapError> {
        Ok(self.state.lock().expect("mock chain poisoned").height)
    }

    async fn fee_rate(&self) -> Result<u64, TapError> {
        Ok(2)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<(), TapError> {
        let mut state = self.state.lock().expect("mock chain poisoned");
        let txid = tx.compute_txid();
        if !state
            .broadcasts
            .iter()
            .any(|known| known.compute_txid() == txid)
        {
            state.broadcasts.push(tx.clone());
        }
        if state.auto_confirm {
            Self::confirmation_for(&mut state, txid);
            drop(state);
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn wait_for_confirmation(
        &self,
        txid: Txid,
        min_height: u32,
    ) -> Result<TxConfirmation, TapError> {
        loop {
            // Register for wakeups before inspecting state so a
            // confirmation landing in between is not missed.
            let notified = self.notify.notified();
            {
                let state = self.state.lock().expect("mock chain poisoned");
                if let Some(confirmation) = state.confirmations.get(&txid) {
                    if confirmation.block_height >= min_height {
                        return Ok(*confirmation);
                    }
                }
            }
            notified.await;
        }
    }
}

/// In-process bitcoin wallet. Funding synthesizes a deterministic wallet
/// input from the template, which makes re-funding the same batch or
/// parcel yield an equivalent PSBT.
#[derive(Default)]
pub struct MockWallet;

impl MockWallet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

const MOCK_WALLET_INPUT_VALUE: u64 = 100_000;

#[async_trait::async_trait]
impl WalletAnchor for MockWallet {
    async fn fund_psbt(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        fee_rate: u64,
    ) -> Result<Psbt, TapError> {
        let mut hasher = Sha256::new();
        hasher.update(b"mock-wallet-utxo");
        for input in &inputs {
            hasher.update(input.txid.to_byte_array());
            hasher.update(input.vout.to_be_bytes());
        }
        for output in &outputs {
            hasher.update(output.value.to_sat().to_be_bytes());
            hasher.update(output.script_pubkey.as_bytes());
        }
        let funding_txid = Txid::from_byte_array(hasher.finalize().into());

        let spend: u64 = outputs.iter().map(|output| output.value.to_sat()).sum();
        let fee = fee_rate * 200; // nominal weight, mock only
        let change = MOCK_WALLET_INPUT_VALUE
            .checked_sub(spend + fee)
            .ok_or_else(|| TapError::WalletUnavailable("insufficient mock funds".into()))?;

        let mut input: Vec<TxIn> = inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::default(),
            })
            .collect();
        input.push(TxIn {
            previous_output: OutPoint {
                txid: funding_txid,
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: bitcoin::Witness::default(),
        });
        let mut output = outputs;
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: ScriptBuf::new(),
        });
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        Psbt::from_unsigned_tx(tx).map_err(|err| TapError::WalletUnavailable(err.to_string()))
    }

    async fn sign_psbt(&self, mut psbt: Psbt) -> Result<Psbt, TapError> {
        let txid = psbt.unsigned_tx.compute_txid();
        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(b"mock-signature");
            hasher.update(txid.to_byte_array());
            hasher.update((index as u32).to_be_bytes());
            let half: [u8; 32] = hasher.finalize().into();
            let mut signature = [0u8; 64];
            signature[..32].copy_from_slice(&half);
            signature[32..].copy_from_slice(&half);
            input.final_script_witness = Some(bitcoin::Witness::from_slice(&[&signature[..]]));
        }
        Ok(psbt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_is_idempotent() {
        let chain = MockChain::new();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        chain.broadcast(&tx).await.unwrap();
        chain.broadcast(&tx).await.unwrap();
        assert_eq!(chain.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn confirmation_wakes_waiter() {
        let chain = MockChain::new();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(2),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let txid = tx.compute_txid();
        chain.broadcast(&tx).await.unwrap();

        let waiter = {
            let chain = chain.clone();
            tokio::spawn(async move { chain.wait_for_confirmation(txid, 0).await })
        };
        // Give the waiter a chance to park before confirming.
        tokio::task::yield_now().await;
        let expected = chain.confirm(txid);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, expected);

        // Confirming twice is stable.
        assert_eq!(chain.confirm(txid), expected);
    }

    #[tokio::test]
    async fn funding_same_template_is_equivalent() {
        let wallet = MockWallet::new();
        let outputs = vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new(),
        }];
        let a = wallet
            .fund_psbt(Vec::new(), outputs.clone(), 2)
            .await
            .unwrap();
        let b = wallet.fund_psbt(Vec::new(), outputs, 2).await.unwrap();
        assert_eq!(
            a.unsigned_tx.compute_txid(),
            b.unsigned_tx.compute_txid()
        );

        // Spending templates carry their asset inputs through funding.
        let spend = OutPoint {
            txid: Txid::from_byte_array([7u8; 32]),
            vout: 1,
        };
        let c = wallet
            .fund_psbt(
                vec![spend],
                vec![TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: ScriptBuf::new(),
                }],
                2,
            )
            .await
            .unwrap();
        assert_eq!(c.unsigned_tx.input[0].previous_output, spend);
    }
}
