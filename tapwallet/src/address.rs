use bech32::{self, FromBase32, ToBase32, Variant};
use bitcoin::XOnlyPublicKey;

use crate::asset::{AssetId, AssetType, ByteReader, ScriptKey};
use crate::commitment::SiblingPreimage;
use crate::error::TapError;

const MAINNET_HRP: &str = "tap";
const TESTNET_HRP: &str = "tapt";

// TLV record types. Odd types are optional and may be unknown to
// senders; unknown even types are a decode error.
const TYPE_VERSION: u64 = 0;
const TYPE_ASSET_ID: u64 = 2;
const TYPE_GROUP_KEY: u64 = 3;
const TYPE_SCRIPT_KEY: u64 = 4;
const TYPE_INTERNAL_KEY: u64 = 6;
const TYPE_SIBLING_PREIMAGE: u64 = 7;
const TYPE_AMOUNT: u64 = 8;
const TYPE_ASSET_TYPE: u64 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chain {
    Mainnet,
    Testnet,
}

impl Chain {
    pub fn hrp(self) -> &'static str {
        match self {
            Chain::Mainnet => MAINNET_HRP,
            Chain::Testnet => TESTNET_HRP,
        }
    }

    pub(crate) fn from_hrp(hrp: &str) -> Result<Self, TapError> {
        match hrp {
            MAINNET_HRP => Ok(Chain::Mainnet),
            TESTNET_HRP => Ok(Chain::Testnet),
            other => Err(TapError::InvalidAddress(format!(
                "unknown HRP {other:?}"
            ))),
        }
    }
}

/// A request to receive `amount` units of `asset_id`, delivered to
/// `script_key` inside a commitment anchored under `internal_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapAddress {
    pub chain: Chain,
    pub version: u8,
    pub asset_id: AssetId,
    pub group_key: Option<XOnlyPublicKey>,
    pub script_key: ScriptKey,
    pub internal_key: XOnlyPublicKey,
    pub tapscript_sibling: Option<SiblingPreimage>,
    pub amount: u64,
    pub asset_type: Option<AssetType>,
}

impl TapAddress {
    pub fn encode(&self) -> Result<String, TapError> {
        let mut payload = Vec::with_capacity(160);
        write_record(&mut payload, TYPE_VERSION, &[self.version]);
        write_record(&mut payload, TYPE_ASSET_ID, &self.asset_id.0);
        if let Some(group_key) = &self.group_key {
            write_record(&mut payload, TYPE_GROUP_KEY, &group_key.serialize());
        }
        write_record(&mut payload, TYPE_SCRIPT_KEY, &self.script_key.to_bytes());
        write_record(
            &mut payload,
            TYPE_INTERNAL_KEY,
            &self.internal_key.serialize(),
        );
        if let Some(sibling) = &self.tapscript_sibling {
            write_record(&mut payload, TYPE_SIBLING_PREIMAGE, &sibling.to_bytes());
        }
        let mut amount = Vec::with_capacity(9);
        write_bigsize(&mut amount, self.amount);
        write_record(&mut payload, TYPE_AMOUNT, &amount);
        if let Some(asset_type) = self.asset_type {
            write_record(&mut payload, TYPE_ASSET_TYPE, &[asset_type.to_byte()]);
        }
        bech32::encode(self.chain.hrp(), payload.to_base32(), Variant::Bech32m)
            .map_err(|err| TapError::InvalidAddress(err.to_string()))
    }

    pub fn decode(address: &str) -> Result<Self, TapError> {
        let (hrp, data, variant) = bech32::decode(address)
            .map_err(|err| TapError::InvalidAddress(err.to_string()))?;
        let chain = Chain::from_hrp(&hrp)?;
        if variant != Variant::Bech32m {
            return Err(TapError::InvalidAddress("not bech32m".into()));
        }
        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|err| TapError::InvalidAddress(err.to_string()))?;

        let mut version = None;
        let mut asset_id = None;
        let mut group_key = None;
        let mut script_key = None;
        let mut internal_key = None;
        let mut tapscript_sibling = None;
        let mut amount = None;
        let mut asset_type = None;

        let mut reader = ByteReader::new(&bytes);
        let mut last_type = None;
        while !reader.is_empty() {
            let record_type = read_bigsize(&mut reader)?;
            // TLV streams are strictly ascending.
            if last_type.is_some_and(|last| record_type <= last) {
                return Err(TapError::InvalidAddress("TLV types out of order".into()));
            }
            last_type = Some(record_type);
            let len = read_bigsize(&mut reader)? as usize;
            let value = reader.read_bytes(len)?;
            match record_type {
                TYPE_VERSION => version = Some(expect_len::<1>(value)?[0]),
                TYPE_ASSET_ID => asset_id = Some(AssetId(expect_len::<32>(value)?)),
                TYPE_GROUP_KEY => {
                    group_key = Some(XOnlyPublicKey::from_slice(&expect_len::<32>(value)?)?)
                }
                TYPE_SCRIPT_KEY => {
                    script_key = Some(ScriptKey::from_bytes(&expect_len::<32>(value)?)?)
                }
                TYPE_INTERNAL_KEY => {
                    internal_key = Some(XOnlyPublicKey::from_slice(&expect_len::<32>(value)?)?)
                }
                TYPE_SIBLING_PREIMAGE => {
                    tapscript_sibling = Some(SiblingPreimage::from_bytes(value)?)
                }
                TYPE_AMOUNT => {
                    let mut value_reader = ByteReader::new(value);
                    let decoded = read_bigsize(&mut value_reader)?;
                    value_reader.finish().map_err(|_| {
                        TapError::InvalidAddress("trailing bytes in amount record".into())
                    })?;
                    amount = Some(decoded);
                }
                TYPE_ASSET_TYPE => {
                    asset_type = Some(AssetType::from_byte(expect_len::<1>(value)?[0])?)
                }
                unknown if unknown % 2 == 0 => return Err(TapError::UnknownEvenTlv(unknown)),
                _ => {} // unknown odd records are skipped
            }
        }

        let missing = |field| TapError::InvalidAddress(format!("missing {field} record"));
        Ok(Self {
            chain,
            version: version.ok_or_else(|| missing("version"))?,
            asset_id: asset_id.ok_or_else(|| missing("asset id"))?,
            group_key,
            script_key: script_key.ok_or_else(|| missing("script key"))?,
            internal_key: internal_key.ok_or_else(|| missing("internal key"))?,
            tapscript_sibling,
            amount: amount.ok_or_else(|| missing("amount"))?,
            asset_type,
        })
    }
}

fn write_record(out: &mut Vec<u8>, record_type: u64, value: &[u8]) {
    write_bigsize(out, record_type);
    write_bigsize(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn expect_len<const N: usize>(value: &[u8]) -> Result<[u8; N], TapError> {
    if value.len() != N {
        return Err(TapError::InvalidAddress(format!(
            "expected {N}-byte record, got {}",
            value.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(value);
    Ok(out)
}

/// Lightning-style BigSize varint.
fn write_bigsize(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= u64::from(u16::MAX) {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= u64::from(u32::MAX) {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn read_bigsize(reader: &mut ByteReader<'_>) -> Result<u64, TapError> {
    let prefix = reader.read_u8()?;
    let value = match prefix {
        0xfd => u64::from(reader.read_u16()?),
        0xfe => u64::from(reader.read_u32()?),
        0xff => reader.read_u64()?,
        byte => u64::from(byte),
    };
    // Reject non-minimal encodings.
    let minimal = match prefix {
        0xfd => value >= 0xfd && value <= u64::from(u16::MAX),
        0xfe => value > u64::from(u16::MAX) && value <= u64::from(u32::MAX),
        0xff => value > u64::from(u32::MAX),
        _ => true,
    };
    if !minimal {
        return Err(TapError::InvalidAddress("non-minimal BigSize".into()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::test_script_key;

    fn sample_address(amount: u64) -> TapAddress {
        let (_, script_key) = test_script_key(21);
        let (_, internal) = test_script_key(22);
        let (_, group) = test_script_key(23);
        TapAddress {
            chain: Chain::Mainnet,
            version: 0,
            asset_id: AssetId([0xab; 32]),
            group_key: Some(group.pub_key),
            script_key,
            internal_key: internal.pub_key,
            tapscript_sibling: Some(SiblingPreimage::Leaf(vec![0x51])),
            amount,
            asset_type: Some(AssetType::Normal),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        for amount in [1, 0xfc, 0xfd, 0xffff, 0x10000, u64::from(u32::MAX) + 1] {
            let address = sample_address(amount);
            let encoded = address.encode().unwrap();
            assert!(encoded.starts_with("tap1"));
            assert_eq!(TapAddress::decode(&encoded).unwrap(), address);
        }
    }

    #[test]
    fn minimal_address_round_trip() {
        let mut address = sample_address(500);
        address.chain = Chain::Testnet;
        address.group_key = None;
        address.tapscript_sibling = None;
        address.asset_type = None;
        let encoded = address.encode().unwrap();
        assert!(encoded.starts_with("tapt1"));
        assert_eq!(TapAddress::decode(&encoded).unwrap(), address);
    }

    #[test]
    fn checksum_corruption_rejected() {
        let encoded = sample_address(77).encode().unwrap();
        let mut corrupted = encoded.into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'q' { b'p' } else { b'q' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert!(TapAddress::decode(&corrupted).is_err());
    }

    #[test]
    fn unknown_even_type_rejected_odd_skipped() {
        let address = sample_address(10);
        let mut payload = Vec::new();
        write_record(&mut payload, TYPE_VERSION, &[address.version]);
        write_record(&mut payload, TYPE_ASSET_ID, &address.asset_id.0);
        write_record(&mut payload, TYPE_SCRIPT_KEY, &address.script_key.to_bytes());
        write_record(
            &mut payload,
            TYPE_INTERNAL_KEY,
            &address.internal_key.serialize(),
        );
        let mut amount = Vec::new();
        write_bigsize(&mut amount, address.amount);
        write_record(&mut payload, TYPE_AMOUNT, &amount);
        // Unknown odd record: tolerated.
        write_record(&mut payload, 11, &[1, 2, 3]);
        let encoded =
            bech32::encode(MAINNET_HRP, payload.to_base32(), Variant::Bech32m).unwrap();
        let decoded = TapAddress::decode(&encoded).unwrap();
        assert_eq!(decoded.amount, 10);

        // Unknown even record: rejected.
        write_record(&mut payload, 12, &[9]);
        let encoded =
            bech32::encode(MAINNET_HRP, payload.to_base32(), Variant::Bech32m).unwrap();
        assert!(matches!(
            TapAddress::decode(&encoded),
            Err(TapError::UnknownEvenTlv(12))
        ));
    }

    #[test]
    fn wrong_hrp_rejected() {
        let payload = vec![0u8; 4];
        let encoded = bech32::encode("btc", payload.to_base32(), Variant::Bech32m).unwrap();
        assert!(TapAddress::decode(&encoded).is_err());
    }
}
