use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("no assets provided for commitment")]
    NoAssets,

    #[error("asset genesis mismatch within commitment")]
    GenesisMismatch,

    #[error("asset group key mismatch within commitment")]
    GroupKeyMismatch,

    #[error("asset type mismatch within commitment")]
    AssetTypeMismatch,

    #[error("duplicate script key in commitment")]
    DuplicateScriptKey,

    #[error("invalid genesis signature for group membership")]
    InvalidGenesisSignature,

    #[error("no eligible assets satisfy the requested amount (needed {needed}, available {available})")]
    MatchingAssetsNotFound { needed: u64, available: u64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown even TLV type {0}")]
    UnknownEvenTlv(u64),

    #[error("batch empty, group anchor \"{0}\"")]
    BatchEmpty(String),

    #[error("group anchor \"{0}\" not present in batch")]
    GroupAnchorMissing(String),

    #[error("group anchor \"{0}\" has emission disabled")]
    GroupAnchorEmissionDisabled(String),

    #[error("seedling \"{0}\" already in batch")]
    SeedlingNameInUse(String),

    #[error("batch not cancellable in state {0}")]
    BatchNotCancellable(&'static str),

    #[error("chain backend unavailable: {0}")]
    ChainBackendUnavailable(String),

    #[error("wallet unavailable: {0}")]
    WalletUnavailable(String),

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("proof invalid: {0}")]
    ProofInvalid(&'static str),

    #[error("merkle tree error: {0}")]
    Tree(#[from] state_mssmt::TreeError),

    #[error("merkle proof error: {0}")]
    TreeProof(#[from] state_mssmt::ProofError),

    #[error("secp256k1 error: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("actor is shut down")]
    ActorShutdown,
}

impl TapError {
    /// Transient failures are retried with backoff inside the minting and
    /// transfer actors; everything else surfaces to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TapError::ChainBackendUnavailable(_)
                | TapError::WalletUnavailable(_)
                | TapError::StoreFailure(_)
        )
    }
}

impl From<bincode::Error> for TapError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TapError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreFailure(err.to_string())
    }
}
