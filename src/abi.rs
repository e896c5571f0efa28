use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use alloy_dyn_abi::{DynSolType, Specifier};
use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::{Address, B256};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AppCfg;
use crate::error::{EtlError, Result};

/// One event parameter with its type resolved once at load time.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub ty: DynSolType,
    pub indexed: bool,
}

#[derive(Debug, Clone)]
pub struct EventSignature {
    pub name: String,
    /// Canonical form, e.g. `Transfer(address,address,uint256)`.
    pub signature: String,
    pub selector: B256,
    pub anonymous: bool,
    pub inputs: Vec<ParamSpec>,
}

impl EventSignature {
    pub fn from_event(event: &Event) -> std::result::Result<Self, String> {
        let inputs = event
            .inputs
            .iter()
            .enumerate()
            .map(|(position, param)| {
                let ty: DynSolType = param.resolve().map_err(|e| {
                    format!("event {} parameter {position} ({}): {e}", event.name, param.ty)
                })?;
                let name = if param.name.is_empty() {
                    format!("arg{position}")
                } else {
                    param.name.clone()
                };
                Ok(ParamSpec {
                    name,
                    ty,
                    indexed: param.indexed,
                })
            })
            .collect::<std::result::Result<Vec<_>, String>>()?;

        Ok(Self {
            name: event.name.clone(),
            signature: event.signature(),
            selector: event.selector(),
            anonymous: event.anonymous,
            inputs,
        })
    }

    pub fn indexed_count(&self) -> usize {
        self.inputs.iter().filter(|p| p.indexed).count()
    }

    /// Number of topics a log must carry to match this signature.
    pub fn expected_topics(&self) -> usize {
        self.indexed_count() + usize::from(!self.anonymous)
    }
}

/// A monitored contract: name, address and the event shapes it declares.
#[derive(Debug, Clone)]
pub struct ContractBinding {
    pub name: String,
    pub address: Address,
    /// EIP-55 form of `address`.
    pub checksum: String,
    events: Vec<EventSignature>,
    by_selector: HashMap<B256, Vec<usize>>,
    anonymous: Vec<usize>,
}

impl ContractBinding {
    pub fn new(name: impl Into<String>, address: Address, events: &[Event]) -> Result<Self> {
        let name = name.into();
        let events = events
            .iter()
            .map(EventSignature::from_event)
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|reason| EtlError::abi_load(&name, reason))?;

        let mut by_selector: HashMap<B256, Vec<usize>> = HashMap::new();
        let mut anonymous = Vec::new();
        for (index, event) in events.iter().enumerate() {
            if event.anonymous {
                anonymous.push(index);
            } else {
                by_selector.entry(event.selector).or_default().push(index);
            }
        }

        Ok(Self {
            name,
            checksum: address.to_checksum(None),
            address,
            events,
            by_selector,
            anonymous,
        })
    }

    pub fn events(&self) -> &[EventSignature] {
        &self.events
    }

    /// Signatures worth trying for a log whose first topic is `topic0`, in
    /// declaration order: selector matches first, then anonymous events.
    pub fn candidates<'a>(
        &'a self,
        topic0: Option<&B256>,
    ) -> impl Iterator<Item = &'a EventSignature> + 'a {
        let selected = topic0
            .and_then(|topic| self.by_selector.get(topic))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        selected
            .iter()
            .chain(self.anonymous.iter())
            .map(move |&index| &self.events[index])
    }
}

/// All configured bindings, addressable by exact contract address.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    bindings: Vec<ContractBinding>,
    by_address: HashMap<Address, usize>,
}

impl ContractRegistry {
    pub fn new(bindings: Vec<ContractBinding>) -> Self {
        let by_address = bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| (binding.address, index))
            .collect();
        Self { bindings, by_address }
    }

    pub fn get(&self, address: &Address) -> Option<&ContractBinding> {
        self.by_address.get(address).map(|&index| &self.bindings[index])
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.bindings.iter().map(|b| b.address).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContractBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Parses a bare JSON ABI array or a compiler artifact carrying an `abi`
/// field, returning its events in declaration order.
pub fn parse_abi_document(bytes: &[u8]) -> std::result::Result<Vec<Event>, String> {
    let document: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;

    let mut items = match document {
        Value::Array(items) => items,
        Value::Object(mut artifact) => match artifact.remove("abi") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err("artifact field 'abi' is not an array".to_string()),
            None => return Err("object has no 'abi' field".to_string()),
        },
        _ => return Err("expected a JSON ABI array or an artifact object".to_string()),
    };

    // Event entries without an explicit `anonymous` flag are regular events
    for item in items.iter_mut() {
        if let Value::Object(entry) = item {
            if entry.get("type").and_then(Value::as_str) == Some("event") {
                entry
                    .entry("anonymous")
                    .or_insert(Value::Bool(false));
            }
        }
    }

    // Validate the whole document, then keep events in their written order
    serde_json::from_value::<JsonAbi>(Value::Array(items.clone())).map_err(|e| e.to_string())?;

    items
        .into_iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("event"))
        .map(|item| serde_json::from_value::<Event>(item).map_err(|e| e.to_string()))
        .collect()
}

pub fn load_binding(name: &str, address_hex: &str, abi_path: &Path) -> Result<ContractBinding> {
    let address = Address::from_str(address_hex.trim())
        .map_err(|e| EtlError::abi_load(name, format!("invalid address {address_hex}: {e}")))?;

    let bytes = fs::read(abi_path)
        .map_err(|e| EtlError::abi_load(name, format!("{}: {e}", abi_path.display())))?;
    let events = parse_abi_document(&bytes)
        .map_err(|reason| EtlError::abi_load(name, format!("{}: {reason}", abi_path.display())))?;

    ContractBinding::new(name, address, &events)
}

/// Builds the registry for every configured contract; any missing or
/// malformed ABI document fails the whole load.
pub fn load_registry(cfg: &AppCfg) -> Result<ContractRegistry> {
    let mut bindings = Vec::with_capacity(cfg.contracts.len());
    for contract in &cfg.contracts {
        let path = cfg.contract_abi_path(contract);
        let binding = load_binding(&contract.name, &contract.address, &path)?;
        info!(
            contract = %binding.name,
            address = %binding.checksum,
            events = binding.events().len(),
            "Loaded ABI"
        );
        for event in binding.events() {
            debug!(contract = %binding.name, "  {} {:#x}", event.signature, event.selector);
        }
        bindings.push(binding);
    }
    Ok(ContractRegistry::new(bindings))
}
