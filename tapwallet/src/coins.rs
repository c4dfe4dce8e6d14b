//! Coin selection: enumerating anchored asset commitments that satisfy a
//! spend and picking a prefix under the prefer-max-amount strategy.

use std::sync::Mutex;

use bitcoin::{OutPoint, ScriptBuf, XOnlyPublicKey};

use crate::asset::{Asset, AssetId};
use crate::commitment::{SiblingPreimage, TapCommitment};
use crate::error::TapError;

/// What a transfer needs from its inputs: the asset identity (asset id
/// XOR group key) and the minimum total amount.
#[derive(Clone, Debug)]
pub struct CommitmentConstraints {
    pub asset_id: Option<AssetId>,
    pub group_key: Option<XOnlyPublicKey>,
    pub min_amount: u64,
}

impl CommitmentConstraints {
    pub fn validate(&self) -> Result<(), TapError> {
        match (self.asset_id, self.group_key) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(TapError::InvalidArgument(
                "constraints need exactly one of asset id or group key",
            )),
        }
    }

    pub fn matches(&self, asset: &Asset) -> bool {
        match (self.asset_id, self.group_key) {
            (Some(asset_id), None) => asset.id() == asset_id && asset.group_key.is_none(),
            (None, Some(group_key)) => asset
                .group_key
                .as_ref()
                .is_some_and(|group| group.pub_key == group_key),
            _ => false,
        }
    }
}

/// One spendable asset leaf together with the on-chain output anchoring
/// it and the full commitment living there.
#[derive(Clone, Debug)]
pub struct AnchoredCommitment {
    pub anchor_point: OutPoint,
    pub anchor_value: u64,
    pub pk_script: ScriptBuf,
    pub internal_key: XOnlyPublicKey,
    pub tapscript_sibling: Option<SiblingPreimage>,
    pub commitment: TapCommitment,
    pub asset: Asset,
}

/// View of owned assets the porter selects from and, after confirmation,
/// writes back to. The underlying asset store is the sole writer.
#[async_trait::async_trait]
pub trait CoinLister: Send + Sync {
    async fn list_eligible_commitments(
        &self,
        constraints: &CommitmentConstraints,
    ) -> Result<Vec<AnchoredCommitment>, TapError>;

    /// Drops every commitment anchored at one of `anchor_points`
    /// (consumed by a confirmed transfer).
    async fn remove_commitments(&self, anchor_points: &[OutPoint]) -> Result<(), TapError>;

    async fn add_commitments(&self, coins: Vec<AnchoredCommitment>) -> Result<(), TapError>;
}

/// `PreferMaxAmount`: sort descending by amount and take the shortest
/// prefix reaching the minimum. Exhaustion is a hard failure.
pub fn select_commitments(
    mut eligible: Vec<AnchoredCommitment>,
    min_amount: u64,
) -> Result<Vec<AnchoredCommitment>, TapError> {
    eligible.sort_by_key(|coin| std::cmp::Reverse(coin.asset.amount));
    let mut total = 0u64;
    let mut selected = Vec::new();
    for coin in eligible {
        total = total.saturating_add(coin.asset.amount);
        selected.push(coin);
        if total >= min_amount {
            return Ok(selected);
        }
    }
    Err(TapError::MatchingAssetsNotFound {
        needed: min_amount,
        available: total,
    })
}

/// In-memory coin source backing the daemon and the tests.
#[derive(Default)]
pub struct MemoryAssets {
    coins: Mutex<Vec<AnchoredCommitment>>,
}

impl MemoryAssets {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<AnchoredCommitment> {
        self.coins.lock().expect("coin source poisoned").clone()
    }
}

#[async_trait::async_trait]
impl CoinLister for MemoryAssets {
    async fn list_eligible_commitments(
        &self,
        constraints: &CommitmentConstraints,
    ) -> Result<Vec<AnchoredCommitment>, TapError> {
        constraints.validate()?;
        let coins = self
            .coins
            .lock()
            .map_err(|_| TapError::InvalidState("coin source poisoned"))?;
        Ok(coins
            .iter()
            .filter(|coin| constraints.matches(&coin.asset))
            .cloned()
            .collect())
    }

    async fn remove_commitments(&self, anchor_points: &[OutPoint]) -> Result<(), TapError> {
        let mut coins = self
            .coins
            .lock()
            .map_err(|_| TapError::InvalidState("coin source poisoned"))?;
        coins.retain(|coin| !anchor_points.contains(&coin.anchor_point));
        Ok(())
    }

    async fn add_commitments(&self, new_coins: Vec<AnchoredCommitment>) -> Result<(), TapError> {
        let mut coins = self
            .coins
            .lock()
            .map_err(|_| TapError::InvalidState("coin source poisoned"))?;
        coins.extend(new_coins);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::{test_outpoint, test_script_key};
    use crate::asset::{AssetType, Genesis};
    use crate::commitment::AssetCommitment;
    use bitcoin::secp256k1::Secp256k1;

    fn coin(amount: u64, seed: u64) -> AnchoredCommitment {
        let secp = Secp256k1::new();
        let (_, script_key) = test_script_key(seed);
        let (_, internal) = test_script_key(seed + 500);
        let genesis = Genesis::new(test_outpoint(3), "dust", b"", 0, AssetType::Normal);
        let asset = Asset::new_genesis(genesis, amount, script_key, None);
        let commitment =
            TapCommitment::from_commitments([AssetCommitment::new(&secp, [asset.clone()]).unwrap()])
                .unwrap();
        AnchoredCommitment {
            anchor_point: test_outpoint(seed as u8),
            anchor_value: 1_000,
            pk_script: ScriptBuf::new(),
            internal_key: internal.pub_key,
            tapscript_sibling: None,
            commitment,
            asset,
        }
    }

    #[test]
    fn prefers_largest_first() {
        let coins = vec![coin(100, 1), coin(400, 2), coin(250, 3)];
        let selected = select_commitments(coins, 500).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].asset.amount, 400);
        assert_eq!(selected[1].asset.amount, 250);
    }

    #[test]
    fn exact_single_coin() {
        let coins = vec![coin(100, 4), coin(300, 5)];
        let selected = select_commitments(coins, 300).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].asset.amount, 300);
    }

    #[test]
    fn exhaustion_reports_available_total() {
        let coins = vec![coin(100, 6), coin(50, 7)];
        assert!(matches!(
            select_commitments(coins, 200),
            Err(TapError::MatchingAssetsNotFound {
                needed: 200,
                available: 150,
            })
        ));
    }

    #[tokio::test]
    async fn lister_filters_by_identity() {
        let source = MemoryAssets::new();
        let a = coin(10, 8);
        let b = coin(20, 9);
        let wanted = a.asset.id();
        source.add_commitments(vec![a.clone(), b]).await.unwrap();

        let constraints = CommitmentConstraints {
            asset_id: Some(wanted),
            group_key: None,
            min_amount: 1,
        };
        let eligible = source.list_eligible_commitments(&constraints).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].asset.id(), wanted);

        source
            .remove_commitments(&[a.anchor_point])
            .await
            .unwrap();
        assert!(source
            .list_eligible_commitments(&constraints)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn constraints_must_be_exclusive() {
        let (_, key) = test_script_key(700);
        assert!(CommitmentConstraints {
            asset_id: Some(AssetId([1; 32])),
            group_key: Some(key.pub_key),
            min_amount: 1,
        }
        .validate()
        .is_err());
        assert!(CommitmentConstraints {
            asset_id: None,
            group_key: None,
            min_amount: 1,
        }
        .validate()
        .is_err());
    }
}
