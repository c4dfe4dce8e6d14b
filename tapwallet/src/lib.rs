//! Taproot asset wallet: issues and transfers off-chain-represented
//! assets whose provenance is anchored in bitcoin taproot outputs.
//!
//! The crate is organized around three subsystems: the commitment engine
//! ([`commitment`] over the merkle-sum trees in `state-mssmt`), the
//! minting state machine ([`planter`] / [`caretaker`]) and the transfer
//! state machine ([`porter`]). Chain, wallet, key and storage access go
//! through the capability traits in [`chain`], [`keys`], [`store`] and
//! [`proof_file`].

pub mod address;
pub mod asset;
pub mod caretaker;
pub mod chain;
pub mod coins;
pub mod commitment;
pub mod error;
pub mod keys;
pub mod planter;
pub mod porter;
pub mod proof_file;
pub mod psbt;
pub mod store;
pub mod vm;
pub mod vpacket;

pub use address::{Chain, TapAddress};
pub use asset::{Asset, AssetId, AssetType, Genesis, GroupKey, PrevId, ScriptKey, Witness};
pub use caretaker::{CaretakerEvent, MintContext};
pub use chain::{ChainBackend, MockChain, MockWallet, TxConfirmation, WalletAnchor};
pub use coins::{
    select_commitments, AnchoredCommitment, CoinLister, CommitmentConstraints, MemoryAssets,
};
pub use commitment::{AssetCommitment, CommitmentProof, SiblingPreimage, TapCommitment};
pub use error::TapError;
pub use keys::{derivation_path, KeyDescriptor, KeyFamily, KeyRing, SoftKeyRing};
pub use planter::{
    BatchSnapshot, BatchState, MintingBatch, PlanterConfig, PlanterHandle, Seedling,
};
pub use porter::{
    OutboundParcel, ParcelState, PorterContext, PorterHandle, ShipmentReceipt, ShipmentRequest,
};
pub use proof_file::{MemoryProofArchive, ProofArchive, ProofEntry, ProofFile, ProofLocator};
pub use psbt::{decode_packet, encode_packet};
pub use store::{FileStore, MintingStore, ParcelStore};
pub use vm::{sign_packet, validate_packet};
pub use vpacket::{build_send_packet, passive_packet, VInput, VOutput, VOutputType, VPacket};
