//! Maps raw service payloads onto a contract's declared outputs

use regex::Regex;
use serde_json::{Map, Value};

use crate::{backend::BackendError, catalog::StepContract};

fn pick(contract: &StepContract, payload: &Map<String, Value>, name: &str) -> Option<Value> {
    if let Some(v) = payload.get(name) {
        return Some(v.clone());
    }
    contract
        .response
        .aliases
        .get(name)?
        .iter()
        .find_map(|field| payload.get(field).cloned())
}

/// Content of the first `<tag>...</tag>` block, or the whole text when absent
pub fn extract_tagged(text: &str, tag: &str) -> Result<String, BackendError> {
    let tag = regex::escape(tag);
    let pattern = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).map_err(|e| {
        BackendError::MalformedResponse {
            message: format!("invalid extraction tag: {e}"),
        }
    })?;

    Ok(pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| text.to_string()))
}

/// Normalize a successful response into `output name -> value` for every
/// declared output present in the payload.
///
/// A missing primary output is a [`BackendError::MalformedResponse`] unless
/// `whole_payload_fallback` is set, in which case the payload itself becomes
/// the primary output.
pub fn normalize_response(
    contract: &StepContract,
    payload: Map<String, Value>,
    whole_payload_fallback: bool,
) -> Result<Map<String, Value>, BackendError> {
    let mut values = Map::new();

    let primary = match pick(contract, &payload, &contract.output) {
        Some(v) if !v.is_null() => v,
        _ if whole_payload_fallback => Value::Object(payload.clone()),
        _ => {
            return Err(BackendError::MalformedResponse {
                message: format!("response is missing output '{}'", contract.output),
            })
        }
    };

    let primary = match (&contract.response.extract_tag, primary) {
        (Some(tag), Value::String(text)) => Value::String(extract_tagged(&text, tag)?),
        (_, other) => other,
    };
    values.insert(contract.output.clone(), primary);

    for name in &contract.additional_outputs {
        if let Some(v) = pick(contract, &payload, name) {
            values.insert(name.clone(), v);
        }
    }

    Ok(values)
}
