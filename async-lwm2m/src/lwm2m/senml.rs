// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! SenML records in JSON (content format 110) and CBOR (112).
//!
//! JSON uses the RFC 8428 string labels; CBOR uses the integer labels
//! `bn=-2 bt=-3 n=0 v=2 vs=3 vb=4 t=6 vd=8` and the string label `vlo` for
//! object links.

use super::*;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ciborium::Value as CborValue;
use serde_json::{Map, Number, Value as JsonValue};

const LABEL_BN: i64 = -2;
const LABEL_BT: i64 = -3;
const LABEL_N: i64 = 0;
const LABEL_V: i64 = 2;
const LABEL_VS: i64 = 3;
const LABEL_VB: i64 = 4;
const LABEL_T: i64 = 6;
const LABEL_VD: i64 = 8;
const LABEL_VLO: &str = "vlo";

/// One SenML record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SenmlRecord {
    /// Base name, prefixed to this and subsequent names.
    pub base_name: Option<String>,
    /// Base time, added to this and subsequent times.
    pub base_time: Option<f64>,
    /// Name relative to the base name.
    pub name: Option<String>,
    /// Value; absent in read-request records.
    pub value: Option<Value>,
    /// Time relative to the base time.
    pub time: Option<f64>,
}

/// A record with its base name and time resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    /// Full path.
    pub path: Lwm2mPath,
    /// Value.
    pub value: Option<Value>,
    /// Absolute time, if any.
    pub time: Option<f64>,
}

/// Builds the records for `entries`, sharing `base_name` and stamping the
/// first record with `base_time`.
pub fn records_for(
    base: Lwm2mPath,
    entries: &[(Lwm2mPath, Value)],
    base_time: Option<f64>,
) -> Vec<SenmlRecord> {
    let prefix = if base.is_root() {
        String::new()
    } else {
        base.to_string()
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, (path, value))| {
            let full = path.to_string();
            SenmlRecord {
                base_name: if i == 0 && !prefix.is_empty() {
                    Some(prefix.clone())
                } else {
                    None
                },
                base_time: if i == 0 { base_time } else { None },
                name: Some(full[prefix.len()..].to_string()),
                value: Some(value.clone()),
                time: None,
            }
        })
        .collect()
}

/// Resolves base names and times.
pub fn resolve(records: &[SenmlRecord]) -> Result<Vec<ResolvedRecord>, ResponseError> {
    let mut base_name = String::new();
    let mut base_time = 0.0;
    let mut resolved = Vec::with_capacity(records.len());

    for record in records {
        if let Some(bn) = &record.base_name {
            base_name = bn.clone();
        }
        if let Some(bt) = record.base_time {
            base_time = bt;
        }
        let name = format!("{}{}", base_name, record.name.as_deref().unwrap_or(""));
        resolved.push(ResolvedRecord {
            path: name.parse().map_err(|_| ResponseError::BadRequest)?,
            value: record.value.clone(),
            time: record.time.map(|t| t + base_time).or(record.base_time),
        });
    }

    Ok(resolved)
}

fn json_number(x: f64) -> JsonValue {
    Number::from_f64(x)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Encodes records as SenML JSON.
pub fn encode_json(records: &[SenmlRecord]) -> Vec<u8> {
    let array: Vec<JsonValue> = records
        .iter()
        .map(|record| {
            let mut map = Map::new();
            if let Some(bn) = &record.base_name {
                map.insert("bn".into(), bn.clone().into());
            }
            if let Some(bt) = record.base_time {
                map.insert("bt".into(), json_number(bt));
            }
            if let Some(n) = &record.name {
                map.insert("n".into(), n.clone().into());
            }
            match &record.value {
                Some(Value::Integer(x)) | Some(Value::Time(x)) => {
                    map.insert("v".into(), (*x).into());
                }
                Some(Value::Unsigned(x)) => {
                    map.insert("v".into(), (*x).into());
                }
                Some(Value::Float(x)) => {
                    map.insert("v".into(), json_number(*x));
                }
                Some(Value::Boolean(x)) => {
                    map.insert("vb".into(), (*x).into());
                }
                Some(Value::String(x)) => {
                    map.insert("vs".into(), x.clone().into());
                }
                Some(Value::Opaque(x)) => {
                    map.insert("vd".into(), URL_SAFE_NO_PAD.encode(x).into());
                }
                Some(Value::ObjLink(oid, iid)) => {
                    map.insert(LABEL_VLO.into(), format!("{}:{}", oid, iid).into());
                }
                None => (),
            }
            if let Some(t) = record.time {
                map.insert("t".into(), json_number(t));
            }
            JsonValue::Object(map)
        })
        .collect();

    JsonValue::Array(array).to_string().into_bytes()
}

fn parse_objlink(text: &str) -> Result<Value, ResponseError> {
    Value::from_text(ValueKind::ObjLink, text)
}

/// Decodes SenML JSON.
pub fn decode_json(payload: &[u8]) -> Result<Vec<SenmlRecord>, ResponseError> {
    let bad = ResponseError::BadRequest;
    let array: Vec<Map<String, JsonValue>> =
        serde_json::from_slice(payload).map_err(|_| bad)?;

    array
        .into_iter()
        .map(|map| {
            let mut record = SenmlRecord::default();
            for (key, value) in map {
                match key.as_str() {
                    "bn" => record.base_name = Some(value.as_str().ok_or(bad)?.to_string()),
                    "bt" => record.base_time = Some(value.as_f64().ok_or(bad)?),
                    "n" => record.name = Some(value.as_str().ok_or(bad)?.to_string()),
                    "t" => record.time = Some(value.as_f64().ok_or(bad)?),
                    "v" => {
                        record.value = Some(match value.as_i64() {
                            Some(x) => Value::Integer(x),
                            None => Value::Float(value.as_f64().ok_or(bad)?),
                        })
                    }
                    "vs" => record.value = Some(Value::String(value.as_str().ok_or(bad)?.into())),
                    "vb" => record.value = Some(Value::Boolean(value.as_bool().ok_or(bad)?)),
                    "vd" => {
                        let text = value.as_str().ok_or(bad)?;
                        let bytes = URL_SAFE_NO_PAD.decode(text).map_err(|_| bad)?;
                        record.value = Some(Value::Opaque(bytes));
                    }
                    LABEL_VLO => record.value = Some(parse_objlink(value.as_str().ok_or(bad)?)?),
                    _ => (),
                }
            }
            Ok(record)
        })
        .collect()
}

fn label(x: i64) -> CborValue {
    CborValue::Integer(x.into())
}

/// Encodes records as SenML CBOR.
pub fn encode_cbor(records: &[SenmlRecord]) -> Result<Vec<u8>, ResponseError> {
    let array: Vec<CborValue> = records
        .iter()
        .map(|record| {
            let mut map = Vec::new();
            if let Some(bn) = &record.base_name {
                map.push((label(LABEL_BN), CborValue::Text(bn.clone())));
            }
            if let Some(bt) = record.base_time {
                map.push((label(LABEL_BT), CborValue::Float(bt)));
            }
            if let Some(n) = &record.name {
                map.push((label(LABEL_N), CborValue::Text(n.clone())));
            }
            match &record.value {
                Some(Value::Integer(x)) | Some(Value::Time(x)) => {
                    map.push((label(LABEL_V), CborValue::Integer((*x).into())))
                }
                Some(Value::Unsigned(x)) => {
                    map.push((label(LABEL_V), CborValue::Integer((*x).into())))
                }
                Some(Value::Float(x)) => map.push((label(LABEL_V), CborValue::Float(*x))),
                Some(Value::Boolean(x)) => map.push((label(LABEL_VB), CborValue::Bool(*x))),
                Some(Value::String(x)) => map.push((label(LABEL_VS), CborValue::Text(x.clone()))),
                Some(Value::Opaque(x)) => map.push((label(LABEL_VD), CborValue::Bytes(x.clone()))),
                Some(Value::ObjLink(oid, iid)) => map.push((
                    CborValue::Text(LABEL_VLO.into()),
                    CborValue::Text(format!("{}:{}", oid, iid)),
                )),
                None => (),
            }
            if let Some(t) = record.time {
                map.push((label(LABEL_T), CborValue::Float(t)));
            }
            CborValue::Map(map)
        })
        .collect();

    let mut out = Vec::new();
    ciborium::into_writer(&CborValue::Array(array), &mut out).map_err(|e| {
        error!("SenML CBOR encoding failed: {}", e);
        ResponseError::InternalServerError
    })?;
    Ok(out)
}

fn cbor_f64(value: &CborValue) -> Option<f64> {
    match value {
        CborValue::Float(x) => Some(*x),
        CborValue::Integer(x) => Some(i128::from(*x) as f64),
        _ => None,
    }
}

/// Decodes SenML CBOR.
pub fn decode_cbor(payload: &[u8]) -> Result<Vec<SenmlRecord>, ResponseError> {
    let bad = ResponseError::BadRequest;
    let root: CborValue = ciborium::from_reader(payload).map_err(|_| bad)?;
    let array = root.into_array().map_err(|_| bad)?;

    array
        .into_iter()
        .map(|item| {
            let map = item.into_map().map_err(|_| bad)?;
            let mut record = SenmlRecord::default();
            for (key, value) in map {
                if let CborValue::Text(text) = &key {
                    if text == LABEL_VLO {
                        let text = value.as_text().ok_or(bad)?;
                        record.value = Some(parse_objlink(text)?);
                    }
                    continue;
                }
                let key = key
                    .as_integer()
                    .and_then(|x| i64::try_from(i128::from(x)).ok())
                    .ok_or(bad)?;
                match key {
                    LABEL_BN => record.base_name = Some(value.into_text().map_err(|_| bad)?),
                    LABEL_BT => record.base_time = Some(cbor_f64(&value).ok_or(bad)?),
                    LABEL_N => record.name = Some(value.into_text().map_err(|_| bad)?),
                    LABEL_T => record.time = Some(cbor_f64(&value).ok_or(bad)?),
                    LABEL_V => {
                        record.value = Some(match &value {
                            CborValue::Integer(x) => {
                                Value::Integer(i64::try_from(i128::from(*x)).map_err(|_| bad)?)
                            }
                            other => Value::Float(cbor_f64(other).ok_or(bad)?),
                        })
                    }
                    LABEL_VS => record.value = Some(Value::String(value.into_text().map_err(|_| bad)?)),
                    LABEL_VB => record.value = Some(Value::Boolean(value.as_bool().ok_or(bad)?)),
                    LABEL_VD => record.value = Some(Value::Opaque(value.into_bytes().map_err(|_| bad)?)),
                    _ => (),
                }
            }
            Ok(record)
        })
        .collect()
}
