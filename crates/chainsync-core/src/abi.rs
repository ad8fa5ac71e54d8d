//! Minimal ABI event descriptors and topic signature computation.
//!
//! The topic0 of an EVM event is the keccak256 hash of its canonical
//! signature string, e.g. `keccak256("Transfer(address,address,uint256)")`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

/// One ABI input parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    /// Solidity type, e.g. `uint256`, `address[]`, `tuple`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub indexed: bool,
    /// Members of a `tuple` type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, indexed: bool) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            indexed,
            components: Vec::new(),
        }
    }

    /// Canonical type string used in signatures (tuples are expanded).
    pub fn canonical_type(&self) -> String {
        match self.kind.strip_prefix("tuple") {
            Some(suffix) => {
                let inner: Vec<_> = self.components.iter().map(Self::canonical_type).collect();
                format!("({}){}", inner.join(","), suffix)
            }
            None => self.kind.clone(),
        }
    }
}

/// An ABI event item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEvent {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub anonymous: bool,
}

impl AbiEvent {
    pub fn new(name: impl Into<String>, inputs: Vec<AbiParam>) -> Self {
        Self {
            name: name.into(),
            inputs,
            anonymous: false,
        }
    }

    /// `"Name(type1,type2,...)"`.
    pub fn signature(&self) -> String {
        let types: Vec<_> = self.inputs.iter().map(AbiParam::canonical_type).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// The event's topic0 (`0x`-prefixed keccak256 of the signature).
    pub fn topic0(&self) -> String {
        keccak256_signature(&self.signature())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("event '{0}' not found in ABI")]
    EventNotFound(String),

    #[error("event '{name}' is overloaded ({count} signatures) and cannot be resolved by name")]
    Overloaded { name: String, count: usize },
}

/// Look up an event by name. Overloaded names are rejected.
pub fn find_event<'a>(abi: &'a [AbiEvent], name: &str) -> Result<&'a AbiEvent, AbiError> {
    let mut matches = abi.iter().filter(|e| e.name == name);
    let first = matches
        .next()
        .ok_or_else(|| AbiError::EventNotFound(name.to_string()))?;
    let extra = matches.count();
    if extra > 0 {
        return Err(AbiError::Overloaded {
            name: name.to_string(),
            count: extra + 1,
        });
    }
    Ok(first)
}

/// keccak256 of `signature`, hex encoded with a `0x` prefix.
pub fn keccak256_signature(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> AbiEvent {
        AbiEvent::new(
            "Transfer",
            vec![
                AbiParam::new("from", "address", true),
                AbiParam::new("to", "address", true),
                AbiParam::new("value", "uint256", false),
            ],
        )
    }

    #[test]
    fn erc20_transfer_topic() {
        assert_eq!(transfer().signature(), "Transfer(address,address,uint256)");
        assert_eq!(
            transfer().topic0(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn tuple_inputs_expand_in_signature() {
        let mut order = AbiParam::new("order", "tuple[]", false);
        order.components = vec![
            AbiParam::new("maker", "address", false),
            AbiParam::new("amount", "uint128", false),
        ];
        let ev = AbiEvent::new("Filled", vec![order, AbiParam::new("id", "bytes32", true)]);
        assert_eq!(ev.signature(), "Filled((address,uint128)[],bytes32)");
    }

    #[test]
    fn find_event_rejects_missing_and_overloaded() {
        let abi = vec![
            transfer(),
            AbiEvent::new("Approval", vec![]),
            AbiEvent::new("Approval", vec![AbiParam::new("owner", "address", true)]),
        ];
        assert_eq!(find_event(&abi, "Transfer").unwrap().name, "Transfer");
        assert_eq!(
            find_event(&abi, "Mint"),
            Err(AbiError::EventNotFound("Mint".into()))
        );
        assert_eq!(
            find_event(&abi, "Approval"),
            Err(AbiError::Overloaded { name: "Approval".into(), count: 2 })
        );
    }

    #[test]
    fn deserializes_json_abi() {
        let json = r#"[{"type":"event","name":"Transfer","anonymous":false,"inputs":[
            {"indexed":true,"name":"from","type":"address"},
            {"indexed":true,"name":"to","type":"address"},
            {"indexed":false,"name":"value","type":"uint256"}]}]"#;
        let abi: Vec<AbiEvent> = serde_json::from_str(json).unwrap();
        assert_eq!(abi[0], transfer());
    }
}
