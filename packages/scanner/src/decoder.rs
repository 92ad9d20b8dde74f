//! Event Log Decoder
//!
//! Decodes base64 protobuf payloads against the configured message schemas
//! into JSON objects. The output follows the chain explorer's conventions:
//! every declared field is present with its default when absent from the
//! wire, 64-bit integers are decimal strings, enums are symbolic names,
//! bytes are base64, and address/hash fields are their canonical string
//! representations.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost::encoding::{self, check_wire_type, decode_key, skip_field, DecodeContext, WireType};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::debug;

use crate::repr::{address_rep, hash_rep};
use crate::schema::{
    ContractSchema, EnumSchema, FieldDef, FieldLabel, FieldSemantic, MessageSchema, ResolvedType,
    ScalarKind, SchemaRegistry,
};
use crate::transaction::Log;

/// Errors that can occur while decoding a payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("No schema configured for contract address {0}")]
    UnknownContract(String),

    #[error("Contract {contract} has no message type '{message}'")]
    UnknownMessage { contract: String, message: String },

    #[error("Contract {contract} has no input schema for method '{method}'")]
    UnknownMethod { contract: String, method: String },

    #[error("Unresolved type for field '{0}'")]
    UnresolvedType(String),

    #[error("Payload truncated: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Malformed protobuf: {0}")]
    Wire(#[from] prost::DecodeError),

    #[error("Field '{field}': {source}")]
    Field {
        field: String,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Message nesting exceeds {0} levels")]
    RecursionLimit(usize),

    #[error("Field '{field}' cannot be represented: {reason}")]
    InvalidRepresentation { field: String, reason: String },

    #[error("Decoded '{event}' has no string field '{field}'")]
    MissingField { event: String, field: String },
}

/// A decoded message tagged with its type name
///
/// Serializes as one flat object with `eventName` first. A decoded field
/// that is itself called `eventName` is dropped from the output so the
/// object never carries the key twice.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_name: String,
    pub fields: Map<String, Value>,
}

impl Serialize for DecodedEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.fields.iter().filter(|(name, _)| name.as_str() != "eventName");
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("eventName", &self.event_name)?;
        for (name, value) in fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl DecodedEvent {
    /// Raw JSON value of a decoded field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String-valued field, failing when absent, unset or not a string
    pub fn str_field(&self, field: &str) -> Result<&str, DecodeError> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::MissingField {
                event: self.event_name.clone(),
                field: field.to_string(),
            })
    }

    /// Integer field, accepting both JSON numbers and decimal strings
    pub fn int_field(&self, field: &str) -> Option<i64> {
        match self.fields.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Decode a base64 payload as `message_name` of `contract`
pub fn decode(
    contract: &ContractSchema,
    message_name: &str,
    payload: &str,
) -> Result<DecodedEvent, DecodeError> {
    let bytes = STANDARD.decode(payload)?;
    decode_bytes(contract, message_name, &bytes)
}

/// Decode raw protobuf bytes as `message_name` of `contract`
pub fn decode_bytes(
    contract: &ContractSchema,
    message_name: &str,
    bytes: &[u8],
) -> Result<DecodedEvent, DecodeError> {
    let message = contract
        .message(message_name)
        .ok_or_else(|| DecodeError::UnknownMessage {
            contract: contract.name.clone(),
            message: message_name.to_string(),
        })?;
    let fields = MessageDecoder { contract }.decode(message, bytes, 0)?;
    Ok(DecodedEvent {
        event_name: message_name.to_string(),
        fields,
    })
}

/// Replace address and hash wrappers with their canonical strings
///
/// Strings and nulls pass through unchanged, so applying this to an already
/// converted value is a no-op.
pub fn coerce_field(value: Value, semantic: FieldSemantic, field: &str) -> Result<Value, DecodeError> {
    let to_rep: fn(&[u8]) -> String = match semantic {
        FieldSemantic::Plain => return Ok(value),
        FieldSemantic::Address => address_rep,
        FieldSemantic::Hash => hash_rep,
    };
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| coerce_field(item, semantic, field))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(wrapper) => {
            let raw = match wrapper.get("value") {
                Some(Value::String(b64)) => {
                    STANDARD
                        .decode(b64)
                        .map_err(|e| DecodeError::InvalidRepresentation {
                            field: field.to_string(),
                            reason: e.to_string(),
                        })?
                }
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(DecodeError::InvalidRepresentation {
                        field: field.to_string(),
                        reason: format!("unexpected wrapper value {other}"),
                    })
                }
            };
            Ok(Value::String(to_rep(&raw)))
        }
        other => Ok(other),
    }
}

/// Decodes contract logs and method inputs using a shared schema registry
#[derive(Clone)]
pub struct EventLogDecoder {
    registry: Arc<dyn SchemaRegistry>,
}

impl EventLogDecoder {
    /// Create a decoder over the given schemas
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    fn contract(&self, address: &str) -> Result<&ContractSchema, DecodeError> {
        self.registry
            .resolve(address)
            .ok_or_else(|| DecodeError::UnknownContract(address.to_string()))
    }

    /// Decode a log emitted by a configured contract
    ///
    /// Indexed chunks and the non-indexed chunk are each base64-decoded and
    /// concatenated before parsing, so fields split across chunks merge into
    /// one message.
    ///
    /// # Arguments
    /// * `log` - A log whose `address` has a configured schema and whose
    ///   `name` is a message type of that schema
    ///
    /// # Returns
    /// The decoded event tagged with the log name, or an error when the
    /// contract or message is unknown or the payload is malformed
    pub fn decode_log(&self, log: &Log) -> Result<DecodedEvent, DecodeError> {
        let contract = self.contract(&log.address)?;
        let mut bytes = Vec::new();
        for chunk in log.chunks() {
            bytes.extend(STANDARD.decode(chunk)?);
        }
        let event = decode_bytes(contract, &log.name, &bytes)?;
        debug!(
            "Decoded {} from {} ({} bytes, {} fields)",
            log.name,
            contract.name,
            bytes.len(),
            event.fields.len()
        );
        Ok(event)
    }

    /// Decode the base64 protobuf input of `method` on the contract at `address`
    ///
    /// # Arguments
    /// * `address` - Contract address the transaction was sent to
    /// * `method` - Method name, looked up in the contract's input table
    /// * `payload` - Base64 protobuf bytes of the call input
    ///
    /// # Returns
    /// The input message tagged with its type name
    pub fn decode_method_input(
        &self,
        address: &str,
        method: &str,
        payload: &str,
    ) -> Result<DecodedEvent, DecodeError> {
        let contract = self.contract(address)?;
        let input = contract
            .methods
            .get(method)
            .ok_or_else(|| DecodeError::UnknownMethod {
                contract: contract.name.clone(),
                method: method.to_string(),
            })?;
        decode(contract, input, payload)
    }
}

// ==================== Wire format ====================

/// Nesting depth at which decoding gives up, matching prost's own limit
pub const RECURSION_LIMIT: usize = 100;

macro_rules! merge_scalar {
    ($codec:ident, $init:expr, $wire:expr, $buf:expr) => {{
        let mut value = $init;
        encoding::$codec::merge($wire, &mut value, $buf, DecodeContext::default())?;
        value
    }};
}

/// Split off the next length-delimited payload
fn read_len<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let len = prost::decode_length_delimiter(&mut *buf)?;
    let whole: &'a [u8] = *buf;
    if len > whole.len() {
        return Err(DecodeError::Truncated {
            needed: len,
            remaining: whole.len(),
        });
    }
    let (payload, rest) = whole.split_at(len);
    *buf = rest;
    Ok(payload)
}

fn scalar_wire_type(kind: ScalarKind) -> WireType {
    match kind {
        ScalarKind::Double | ScalarKind::Fixed64 | ScalarKind::Sfixed64 => WireType::SixtyFourBit,
        ScalarKind::Float | ScalarKind::Fixed32 | ScalarKind::Sfixed32 => WireType::ThirtyTwoBit,
        ScalarKind::String | ScalarKind::Bytes => WireType::LengthDelimited,
        _ => WireType::Varint,
    }
}

fn natural_wire_type(ty: ResolvedType<'_>) -> WireType {
    match ty {
        ResolvedType::Scalar(kind) => scalar_wire_type(kind),
        ResolvedType::Enum(_) => WireType::Varint,
        ResolvedType::Message(_) => WireType::LengthDelimited,
    }
}

fn is_packable(ty: ResolvedType<'_>) -> bool {
    match ty {
        ResolvedType::Scalar(kind) => kind.is_packable(),
        ResolvedType::Enum(_) => true,
        ResolvedType::Message(_) => false,
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Read one scalar in its JSON form; prost checks the wire type
fn read_scalar(buf: &mut &[u8], kind: ScalarKind, wire: WireType) -> Result<Value, prost::DecodeError> {
    let value = match kind {
        ScalarKind::Int32 => Value::from(merge_scalar!(int32, 0i32, wire, buf)),
        ScalarKind::Int64 => Value::String(merge_scalar!(int64, 0i64, wire, buf).to_string()),
        ScalarKind::Uint32 => Value::from(merge_scalar!(uint32, 0u32, wire, buf)),
        ScalarKind::Uint64 => Value::String(merge_scalar!(uint64, 0u64, wire, buf).to_string()),
        ScalarKind::Sint32 => Value::from(merge_scalar!(sint32, 0i32, wire, buf)),
        ScalarKind::Sint64 => Value::String(merge_scalar!(sint64, 0i64, wire, buf).to_string()),
        ScalarKind::Bool => Value::Bool(merge_scalar!(bool, false, wire, buf)),
        ScalarKind::Fixed32 => Value::from(merge_scalar!(fixed32, 0u32, wire, buf)),
        ScalarKind::Sfixed32 => Value::from(merge_scalar!(sfixed32, 0i32, wire, buf)),
        ScalarKind::Fixed64 => Value::String(merge_scalar!(fixed64, 0u64, wire, buf).to_string()),
        ScalarKind::Sfixed64 => Value::String(merge_scalar!(sfixed64, 0i64, wire, buf).to_string()),
        ScalarKind::Float => float_value(f64::from(merge_scalar!(float, 0f32, wire, buf))),
        ScalarKind::Double => float_value(merge_scalar!(double, 0f64, wire, buf)),
        ScalarKind::String => Value::String(merge_scalar!(string, String::new(), wire, buf)),
        ScalarKind::Bytes => Value::String(STANDARD.encode(merge_scalar!(bytes, Vec::<u8>::new(), wire, buf))),
    };
    Ok(value)
}

fn read_enum(buf: &mut &[u8], wire: WireType) -> Result<i32, prost::DecodeError> {
    Ok(merge_scalar!(int32, 0i32, wire, buf))
}

fn scalar_default(kind: ScalarKind) -> Value {
    match kind {
        k if k.is_long() => Value::String("0".to_string()),
        ScalarKind::Bool => Value::Bool(false),
        ScalarKind::String | ScalarKind::Bytes => Value::String(String::new()),
        _ => Value::from(0),
    }
}

fn enum_value(schema: &EnumSchema, number: i32) -> Value {
    match schema.name_of(number) {
        Some(name) => Value::String(name.to_string()),
        None => Value::from(number),
    }
}

fn map_key(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn field_error(field: &FieldDef) -> impl FnOnce(prost::DecodeError) -> DecodeError + '_ {
    move |source| DecodeError::Field {
        field: field.name.clone(),
        source,
    }
}

struct MessageDecoder<'s> {
    contract: &'s ContractSchema,
}

impl<'s> MessageDecoder<'s> {
    fn resolve(&self, field: &FieldDef) -> Result<ResolvedType<'s>, DecodeError> {
        self.contract
            .resolve_type(&field.ty)
            .ok_or_else(|| DecodeError::UnresolvedType(field.name.clone()))
    }

    /// Decode `bytes` as `message`, nested `depth` levels below the top
    fn decode(
        &self,
        message: &MessageSchema,
        mut bytes: &[u8],
        depth: usize,
    ) -> Result<Map<String, Value>, DecodeError> {
        if depth > RECURSION_LIMIT {
            return Err(DecodeError::RecursionLimit(RECURSION_LIMIT));
        }
        let buf = &mut bytes;
        let mut values: Vec<Option<Value>> = vec![None; message.fields.len()];

        while !buf.is_empty() {
            let (number, wire) = decode_key(buf)?;
            let Some((index, field)) = message.field_by_number(number) else {
                skip_field(wire, number, buf, DecodeContext::default())?;
                continue;
            };
            let ty = self.resolve(field)?;

            match &field.label {
                FieldLabel::Single => {
                    let value = self.read_value(buf, field, ty, wire, depth)?;
                    if let Some(oneof) = &field.oneof {
                        for (other, slot) in message.fields.iter().zip(values.iter_mut()) {
                            if other.oneof.as_ref() == Some(oneof) {
                                *slot = None;
                            }
                        }
                    }
                    values[index] = Some(value);
                }
                FieldLabel::Repeated => {
                    let mut items = Vec::new();
                    if wire == WireType::LengthDelimited && is_packable(ty) {
                        let mut packed = read_len(buf)?;
                        while !packed.is_empty() {
                            items.push(self.read_value(&mut packed, field, ty, natural_wire_type(ty), depth)?);
                        }
                    } else {
                        items.push(self.read_value(buf, field, ty, wire, depth)?);
                    }
                    if let Value::Array(existing) =
                        values[index].get_or_insert_with(|| Value::Array(Vec::new()))
                    {
                        existing.extend(items);
                    }
                }
                FieldLabel::Map(key_kind) => {
                    check_wire_type(WireType::LengthDelimited, wire).map_err(field_error(field))?;
                    let entry = read_len(buf)?;
                    let (key, value) = self.read_map_entry(entry, field, *key_kind, ty, depth)?;
                    if let Value::Object(entries) =
                        values[index].get_or_insert_with(|| Value::Object(Map::new()))
                    {
                        entries.insert(key, value);
                    }
                }
            }
        }

        self.finish(message, values)
    }

    fn read_value(
        &self,
        buf: &mut &[u8],
        field: &FieldDef,
        ty: ResolvedType<'s>,
        wire: WireType,
        depth: usize,
    ) -> Result<Value, DecodeError> {
        match ty {
            ResolvedType::Scalar(kind) => read_scalar(buf, kind, wire).map_err(field_error(field)),
            ResolvedType::Enum(schema) => {
                let number = read_enum(buf, wire).map_err(field_error(field))?;
                Ok(enum_value(schema, number))
            }
            ResolvedType::Message(nested) => {
                check_wire_type(WireType::LengthDelimited, wire).map_err(field_error(field))?;
                let bytes = read_len(buf)?;
                Ok(Value::Object(self.decode(nested, bytes, depth + 1)?))
            }
        }
    }

    fn read_map_entry(
        &self,
        mut bytes: &[u8],
        field: &FieldDef,
        key_kind: ScalarKind,
        value_ty: ResolvedType<'s>,
        depth: usize,
    ) -> Result<(String, Value), DecodeError> {
        let buf = &mut bytes;
        let mut key = None;
        let mut value = None;
        while !buf.is_empty() {
            let (number, wire) = decode_key(buf)?;
            match number {
                1 => key = Some(read_scalar(buf, key_kind, wire).map_err(field_error(field))?),
                2 => value = Some(self.read_value(buf, field, value_ty, wire, depth)?),
                _ => skip_field(wire, number, buf, DecodeContext::default())?,
            }
        }
        let key = map_key(key.unwrap_or_else(|| scalar_default(key_kind)));
        let value = match (value, value_ty) {
            (Some(value), _) => value,
            (None, ResolvedType::Message(nested)) => Value::Object(self.decode(nested, &[], depth + 1)?),
            (None, ty) => self.default_value(ty),
        };
        Ok((key, value))
    }

    fn default_value(&self, ty: ResolvedType<'s>) -> Value {
        match ty {
            ResolvedType::Scalar(kind) => scalar_default(kind),
            ResolvedType::Enum(schema) => enum_value(schema, 0),
            ResolvedType::Message(_) => Value::Null,
        }
    }

    /// Fill defaults, record active oneofs and convert address/hash fields
    fn finish(
        &self,
        message: &MessageSchema,
        values: Vec<Option<Value>>,
    ) -> Result<Map<String, Value>, DecodeError> {
        let mut out = Map::new();
        let mut active_oneofs = Vec::new();

        for (field, value) in message.fields.iter().zip(values) {
            let value = match (value, &field.label) {
                (Some(value), _) => {
                    if let Some(oneof) = &field.oneof {
                        active_oneofs.push((oneof.clone(), field.name.clone()));
                    }
                    value
                }
                (None, FieldLabel::Repeated) => Value::Array(Vec::new()),
                (None, FieldLabel::Map(_)) => Value::Object(Map::new()),
                (None, FieldLabel::Single) if field.oneof.is_some() => continue,
                (None, FieldLabel::Single) => self.default_value(self.resolve(field)?),
            };
            let value = match (&field.label, value) {
                (FieldLabel::Map(_), Value::Object(entries)) => Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| Ok((k, coerce_field(v, field.semantic, &field.name)?)))
                        .collect::<Result<Map<_, _>, DecodeError>>()?,
                ),
                (_, value) => coerce_field(value, field.semantic, &field.name)?,
            };
            out.insert(field.name.clone(), value);
        }

        for (oneof, member) in active_oneofs {
            out.insert(oneof, Value::String(member));
        }
        Ok(out)
    }
}

/// Protobuf writer for building payload fixtures in tests
#[cfg(test)]
pub(crate) mod test_wire {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use prost::encoding::{encode_key, encode_varint, WireType};

    pub fn varint(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint(v, &mut out);
        out
    }

    pub fn key(number: u32, wire: WireType) -> Vec<u8> {
        let mut out = Vec::new();
        encode_key(number, wire, &mut out);
        out
    }

    pub fn varint_field(number: u32, v: u64) -> Vec<u8> {
        [key(number, WireType::Varint), varint(v)].concat()
    }

    pub fn len_field(number: u32, bytes: &[u8]) -> Vec<u8> {
        [key(number, WireType::LengthDelimited), varint(bytes.len() as u64), bytes.to_vec()].concat()
    }

    /// An `aelf.Address`/`aelf.Hash` wrapper around `raw` as field `number`
    pub fn wrapped(number: u32, raw: &[u8]) -> Vec<u8> {
        len_field(number, &len_field(1, raw))
    }

    pub fn b64(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }
}
