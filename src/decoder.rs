use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, Bytes, B256, I256, U256};
use tracing::trace;

use crate::abi::{ContractBinding, EventSignature, ParamSpec};

/// A log as returned by the node, with its chain position resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Decoded argument, classified at decode time into the kinds the payload
/// can express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Binary(Bytes),
    Unsigned(U256),
    Signed(I256),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub event_name: String,
    pub signature: String,
    /// Arguments in declaration order.
    pub args: Vec<(String, ArgValue)>,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Tries the binding's candidate signatures in order and returns the first
/// that decodes, or `None` when the log matches none of them.
pub fn decode_log(binding: &ContractBinding, log: &RawLog) -> Option<DecodedEvent> {
    for event in binding.candidates(log.topics.first()) {
        match decode_with_event(event, log) {
            Ok(args) => {
                return Some(DecodedEvent {
                    event_name: event.name.clone(),
                    signature: event.signature.clone(),
                    args,
                    block_number: log.block_number,
                    tx_hash: log.tx_hash,
                    log_index: log.log_index,
                });
            }
            Err(reason) => {
                trace!(
                    contract = %binding.name,
                    event = %event.name,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    "Signature rejected: {reason}"
                );
            }
        }
    }
    None
}

fn decode_with_event(
    event: &EventSignature,
    log: &RawLog,
) -> Result<Vec<(String, ArgValue)>, String> {
    if log.topics.len() != event.expected_topics() {
        return Err(format!(
            "expected {} topics, log has {}",
            event.expected_topics(),
            log.topics.len()
        ));
    }

    // Skip the selector topic for regular events
    let mut topics = log.topics.iter().skip(usize::from(!event.anonymous));

    let body: Vec<&ParamSpec> = event.inputs.iter().filter(|p| !p.indexed).collect();
    let mut body_values = decode_body(&body, &log.data)?.into_iter();

    let mut args = Vec::with_capacity(event.inputs.len());
    for param in &event.inputs {
        let value = if param.indexed {
            let topic = topics
                .next()
                .ok_or_else(|| format!("missing topic for {}", param.name))?;
            decode_topic(param, topic)?
        } else {
            let value = body_values
                .next()
                .ok_or_else(|| format!("missing data value for {}", param.name))?;
            classify(value)
        };
        args.push((param.name.clone(), value));
    }

    Ok(args)
}

/// Indexed value types sit in the topic word; reference types are only
/// present as their keccak hash.
fn decode_topic(param: &ParamSpec, topic: &B256) -> Result<ArgValue, String> {
    match &param.ty {
        DynSolType::Bool
        | DynSolType::Int(_)
        | DynSolType::Uint(_)
        | DynSolType::Address
        | DynSolType::FixedBytes(_)
        | DynSolType::Function => param
            .ty
            .abi_decode(topic.as_slice())
            .map(classify)
            .map_err(|e| format!("topic for {}: {e}", param.name)),
        _ => Ok(ArgValue::Binary(Bytes::copy_from_slice(topic.as_slice()))),
    }
}

fn decode_body(params: &[&ParamSpec], data: &Bytes) -> Result<Vec<DynSolValue>, String> {
    if params.is_empty() {
        return if data.is_empty() {
            Ok(Vec::new())
        } else {
            Err(format!("no data parameters but {} data bytes", data.len()))
        };
    }

    let types: Vec<DynSolType> = params.iter().map(|p| p.ty.clone()).collect();
    let head = types.iter().map(head_words).sum::<usize>() * 32;
    if types.iter().any(is_dynamic) {
        if data.len() < head || data.len() % 32 != 0 {
            return Err(format!("data length {} does not fit a {head}-byte head", data.len()));
        }
    } else if data.len() != head {
        return Err(format!("expected {head} data bytes, log has {}", data.len()));
    }

    match DynSolType::Tuple(types).abi_decode_params(data) {
        Ok(DynSolValue::Tuple(values)) => Ok(values),
        Ok(other) => Err(format!("expected tuple from log data, got {other:?}")),
        Err(e) => Err(format!("log data: {e}")),
    }
}

fn is_dynamic(ty: &DynSolType) -> bool {
    match ty {
        DynSolType::Bytes | DynSolType::String | DynSolType::Array(_) => true,
        DynSolType::FixedArray(inner, _) => is_dynamic(inner),
        DynSolType::Tuple(inner) => inner.iter().any(is_dynamic),
        _ => false,
    }
}

/// Words a type occupies in the head of an encoded tuple.
fn head_words(ty: &DynSolType) -> usize {
    if is_dynamic(ty) {
        return 1;
    }
    match ty {
        DynSolType::FixedArray(inner, len) => head_words(inner) * len,
        DynSolType::Tuple(inner) => inner.iter().map(head_words).sum(),
        _ => 1,
    }
}

fn classify(value: DynSolValue) -> ArgValue {
    match value {
        DynSolValue::Bytes(bytes) => ArgValue::Binary(bytes.into()),
        DynSolValue::FixedBytes(word, size) => ArgValue::Binary(Bytes::copy_from_slice(&word[..size])),
        DynSolValue::Function(function) => ArgValue::Binary(Bytes::copy_from_slice(function.as_slice())),
        DynSolValue::Uint(value, _) => ArgValue::Unsigned(value),
        DynSolValue::Int(value, _) => ArgValue::Signed(value),
        DynSolValue::Bool(flag) => ArgValue::Unsigned(U256::from(u8::from(flag))),
        DynSolValue::Address(address) => ArgValue::Text(address.to_checksum(None)),
        DynSolValue::String(text) => ArgValue::Text(text),
        other => ArgValue::Text(render_text(&other)),
    }
}

/// Text form for composite values.
fn render_text(value: &DynSolValue) -> String {
    match value {
        DynSolValue::Bool(b) => b.to_string(),
        DynSolValue::Int(i, _) => i.to_string(),
        DynSolValue::Uint(u, _) => u.to_string(),
        DynSolValue::FixedBytes(word, size) => format!("0x{}", hex::encode(&word[..*size])),
        DynSolValue::Bytes(bytes) => format!("0x{}", hex::encode(bytes)),
        DynSolValue::Function(function) => format!("0x{}", hex::encode(function.as_slice())),
        DynSolValue::Address(addr) => addr.to_checksum(None),
        DynSolValue::String(s) => format!("\"{s}\""),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            let rendered: Vec<String> = items.iter().map(render_text).collect();
            format!("[{}]", rendered.join(", "))
        }
        DynSolValue::Tuple(items) => {
            let rendered: Vec<String> = items.iter().map(render_text).collect();
            format!("({})", rendered.join(", "))
        }
        other => format!("{other:?}"),
    }
}
