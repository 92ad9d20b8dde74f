//! Message Schemas
//!
//! Protobuf message definitions the decoder works against, grouped per
//! contract and looked up by contract address.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;

/// Type name of the chain's address message
pub const ADDRESS_TYPE: &str = "aelf.Address";

/// Type name of the chain's hash message
pub const HASH_TYPE: &str = "aelf.Hash";

/// Type name of the protobuf timestamp message
pub const TIMESTAMP_TYPE: &str = "google.protobuf.Timestamp";

/// Scalar protobuf field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
}

impl ScalarKind {
    /// Parse a protobuf scalar type name
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "double" => ScalarKind::Double,
            "float" => ScalarKind::Float,
            "int32" => ScalarKind::Int32,
            "int64" => ScalarKind::Int64,
            "uint32" => ScalarKind::Uint32,
            "uint64" => ScalarKind::Uint64,
            "sint32" => ScalarKind::Sint32,
            "sint64" => ScalarKind::Sint64,
            "fixed32" => ScalarKind::Fixed32,
            "fixed64" => ScalarKind::Fixed64,
            "sfixed32" => ScalarKind::Sfixed32,
            "sfixed64" => ScalarKind::Sfixed64,
            "bool" => ScalarKind::Bool,
            "string" => ScalarKind::String,
            "bytes" => ScalarKind::Bytes,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether repeated fields of this kind may use packed encoding
    pub fn is_packable(&self) -> bool {
        !matches!(self, ScalarKind::String | ScalarKind::Bytes)
    }

    /// 64-bit integer kinds, rendered as decimal strings
    pub fn is_long(&self) -> bool {
        matches!(
            self,
            ScalarKind::Int64
                | ScalarKind::Uint64
                | ScalarKind::Sint64
                | ScalarKind::Fixed64
                | ScalarKind::Sfixed64
        )
    }
}

/// Declared type of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarKind),
    /// Enum or message, resolved against the owning contract's schema
    Named(String),
}

/// How a decoded value must be represented once decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldSemantic {
    Plain,
    Address,
    Hash,
}

/// Cardinality of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLabel {
    Single,
    Repeated,
    /// `map<key, value>`; the field type is the value type
    Map(ScalarKind),
}

/// One field of a message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawField")]
pub struct FieldDef {
    pub name: String,
    pub number: u32,
    pub ty: FieldType,
    pub label: FieldLabel,
    pub semantic: FieldSemantic,
    pub oneof: Option<String>,
}

/// Field as written in the configuration file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    name: String,
    number: u32,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    key_type: Option<String>,
    #[serde(default)]
    oneof: Option<String>,
}

impl TryFrom<RawField> for FieldDef {
    type Error = String;

    fn try_from(raw: RawField) -> Result<Self, Self::Error> {
        if raw.number == 0 {
            return Err(format!("field '{}' has number 0", raw.name));
        }
        let type_name = raw.type_name.trim_start_matches('.');
        let ty = match ScalarKind::from_name(type_name) {
            Some(kind) => FieldType::Scalar(kind),
            None => FieldType::Named(type_name.to_string()),
        };
        let label = match (raw.label.as_deref(), raw.key_type.as_deref()) {
            (_, Some(key)) => {
                let key_kind = ScalarKind::from_name(key)
                    .filter(|k| !matches!(k, ScalarKind::Double | ScalarKind::Float | ScalarKind::Bytes))
                    .ok_or_else(|| format!("field '{}' has invalid map key type '{}'", raw.name, key))?;
                FieldLabel::Map(key_kind)
            }
            (Some("repeated"), None) => FieldLabel::Repeated,
            (None | Some("optional") | Some("required"), None) => FieldLabel::Single,
            (Some(other), None) => {
                return Err(format!("field '{}' has unknown label '{}'", raw.name, other))
            }
        };
        let semantic = match type_name {
            ADDRESS_TYPE => FieldSemantic::Address,
            HASH_TYPE => FieldSemantic::Hash,
            _ => FieldSemantic::Plain,
        };
        Ok(FieldDef {
            name: raw.name,
            number: raw.number,
            ty,
            label,
            semantic,
            oneof: raw.oneof,
        })
    }
}

/// A protobuf message definition
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageSchema {
    pub fields: Vec<FieldDef>,
}

impl MessageSchema {
    /// Index and definition of the field with the given wire number
    pub fn field_by_number(&self, number: u32) -> Option<(usize, &FieldDef)> {
        self.fields.iter().enumerate().find(|(_, f)| f.number == number)
    }
}

/// A protobuf enum definition
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnumSchema {
    /// Symbolic name to number
    pub values: HashMap<String, i32>,
}

impl EnumSchema {
    /// Symbolic name of `number`; aliases resolve to the lexically smallest name
    pub fn name_of(&self, number: i32) -> Option<&str> {
        self.values
            .iter()
            .filter(|(_, v)| **v == number)
            .map(|(k, _)| k.as_str())
            .min()
    }
}

/// Resolved form of a [`FieldType`]
#[derive(Debug, Clone, Copy)]
pub enum ResolvedType<'a> {
    Scalar(ScalarKind),
    Enum(&'a EnumSchema),
    Message(&'a MessageSchema),
}

/// Messages, enums and method inputs of one contract
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSchema {
    /// Human-readable contract name
    pub name: String,
    /// Deployed contract address
    pub address: String,
    #[serde(default)]
    pub messages: HashMap<String, MessageSchema>,
    #[serde(default)]
    pub enums: HashMap<String, EnumSchema>,
    /// Method name to input message name
    #[serde(default)]
    pub methods: HashMap<String, String>,
}

static WELL_KNOWN: LazyLock<HashMap<&'static str, MessageSchema>> = LazyLock::new(|| {
    let bytes_value = MessageSchema {
        fields: vec![FieldDef {
            name: "value".to_string(),
            number: 1,
            ty: FieldType::Scalar(ScalarKind::Bytes),
            label: FieldLabel::Single,
            semantic: FieldSemantic::Plain,
            oneof: None,
        }],
    };
    let timestamp = MessageSchema {
        fields: vec![
            FieldDef {
                name: "seconds".to_string(),
                number: 1,
                ty: FieldType::Scalar(ScalarKind::Int64),
                label: FieldLabel::Single,
                semantic: FieldSemantic::Plain,
                oneof: None,
            },
            FieldDef {
                name: "nanos".to_string(),
                number: 2,
                ty: FieldType::Scalar(ScalarKind::Int32),
                label: FieldLabel::Single,
                semantic: FieldSemantic::Plain,
                oneof: None,
            },
        ],
    };
    let mut map = HashMap::new();
    map.insert(ADDRESS_TYPE, bytes_value.clone());
    map.insert(HASH_TYPE, bytes_value);
    map.insert(TIMESTAMP_TYPE, timestamp);
    map
});

impl ContractSchema {
    /// Message by name, falling back to the well-known chain types
    pub fn message(&self, name: &str) -> Option<&MessageSchema> {
        let name = name.trim_start_matches('.');
        self.messages.get(name).or_else(|| WELL_KNOWN.get(name))
    }

    /// Input message of a contract method
    pub fn method_input(&self, method: &str) -> Option<&MessageSchema> {
        self.methods.get(method).and_then(|input| self.message(input))
    }

    /// Resolve a field type; enums shadow messages of the same name
    pub fn resolve_type<'a>(&'a self, ty: &FieldType) -> Option<ResolvedType<'a>> {
        match ty {
            FieldType::Scalar(kind) => Some(ResolvedType::Scalar(*kind)),
            FieldType::Named(name) => self
                .enums
                .get(name)
                .map(ResolvedType::Enum)
                .or_else(|| self.message(name).map(ResolvedType::Message)),
        }
    }

    /// Every `(message, field, type)` whose type does not resolve
    pub fn unresolved_types(&self) -> Vec<(String, String, String)> {
        let mut missing = Vec::new();
        for (message_name, message) in &self.messages {
            for field in &message.fields {
                if self.resolve_type(&field.ty).is_none() {
                    if let FieldType::Named(type_name) = &field.ty {
                        missing.push((message_name.clone(), field.name.clone(), type_name.clone()));
                    }
                }
            }
        }
        for (method, input) in &self.methods {
            if self.message(input).is_none() {
                missing.push((method.clone(), "<input>".to_string(), input.clone()));
            }
        }
        missing.sort();
        missing
    }
}

/// Lookup of contract schemas by address
pub trait SchemaRegistry: Send + Sync {
    /// Schema of the contract deployed at `address`
    fn resolve(&self, address: &str) -> Option<&ContractSchema>;
}

/// Configured contract address → schema table
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "Vec<ContractSchema>")]
pub struct SchemaTable {
    by_address: HashMap<String, ContractSchema>,
}

impl From<Vec<ContractSchema>> for SchemaTable {
    fn from(contracts: Vec<ContractSchema>) -> Self {
        let by_address = contracts
            .into_iter()
            .map(|c| (c.address.clone(), c))
            .collect();
        Self { by_address }
    }
}

impl SchemaTable {
    /// Number of configured contracts
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// All configured contract schemas
    pub fn contracts(&self) -> impl Iterator<Item = &ContractSchema> {
        self.by_address.values()
    }
}

impl SchemaRegistry for SchemaTable {
    fn resolve(&self, address: &str) -> Option<&ContractSchema> {
        self.by_address.get(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(value: serde_json::Value) -> Result<FieldDef, serde_json::Error> {
        serde_json::from_value(value)
    }

    // ==================== FieldDef tests ====================

    #[test]
    fn test_field_scalar_type() {
        let f = field(json!({"name": "version", "number": 4, "type": "int32"})).unwrap();
        assert_eq!(f.ty, FieldType::Scalar(ScalarKind::Int32));
        assert_eq!(f.label, FieldLabel::Single);
        assert_eq!(f.semantic, FieldSemantic::Plain);
    }

    #[test]
    fn test_field_address_and_hash_semantics() {
        let a = field(json!({"name": "author", "number": 1, "type": ".aelf.Address"})).unwrap();
        assert_eq!(a.semantic, FieldSemantic::Address);
        assert_eq!(a.ty, FieldType::Named(ADDRESS_TYPE.to_string()));

        let h = field(json!({"name": "codeHash", "number": 2, "type": "aelf.Hash", "label": "repeated"}))
            .unwrap();
        assert_eq!(h.semantic, FieldSemantic::Hash);
        assert_eq!(h.label, FieldLabel::Repeated);
    }

    #[test]
    fn test_field_map_label() {
        let f = field(json!({"name": "m", "number": 3, "type": "int64", "keyType": "string"})).unwrap();
        assert_eq!(f.label, FieldLabel::Map(ScalarKind::String));
    }

    #[test]
    fn test_field_rejects_float_map_key() {
        assert!(field(json!({"name": "m", "number": 3, "type": "int64", "keyType": "double"})).is_err());
    }

    #[test]
    fn test_field_rejects_zero_number() {
        assert!(field(json!({"name": "x", "number": 0, "type": "int32"})).is_err());
    }

    #[test]
    fn test_field_rejects_unknown_label() {
        assert!(field(json!({"name": "x", "number": 1, "type": "int32", "label": "many"})).is_err());
    }

    // ==================== ContractSchema tests ====================

    fn contract() -> ContractSchema {
        serde_json::from_value(json!({
            "name": "Test",
            "address": "addr",
            "messages": {
                "Outer": {"fields": [
                    {"name": "kind", "number": 1, "type": "Kind"},
                    {"name": "inner", "number": 2, "type": "Inner"},
                    {"name": "owner", "number": 3, "type": "aelf.Address"}
                ]},
                "Inner": {"fields": [{"name": "n", "number": 1, "type": "uint64"}]},
                "Broken": {"fields": [{"name": "x", "number": 1, "type": "Missing"}]}
            },
            "enums": {"Kind": {"values": {"NONE": 0, "SOME": 1}}},
            "methods": {"Do": "Outer", "Ghost": "Nowhere"}
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_named_types() {
        let c = contract();
        let outer = c.message("Outer").unwrap();
        assert!(matches!(c.resolve_type(&outer.fields[0].ty), Some(ResolvedType::Enum(_))));
        assert!(matches!(c.resolve_type(&outer.fields[1].ty), Some(ResolvedType::Message(_))));
        assert!(matches!(c.resolve_type(&outer.fields[2].ty), Some(ResolvedType::Message(_))));
    }

    #[test]
    fn test_well_known_messages_available() {
        let c = ContractSchema::default();
        assert!(c.message(ADDRESS_TYPE).is_some());
        assert!(c.message(".aelf.Hash").is_some());
        assert_eq!(c.message(TIMESTAMP_TYPE).unwrap().fields.len(), 2);
    }

    #[test]
    fn test_method_input() {
        let c = contract();
        assert!(c.method_input("Do").is_some());
        assert!(c.method_input("Ghost").is_none());
        assert!(c.method_input("Unknown").is_none());
    }

    #[test]
    fn test_unresolved_types_reported() {
        let missing = contract().unresolved_types();
        assert_eq!(
            missing,
            vec![
                ("Broken".to_string(), "x".to_string(), "Missing".to_string()),
                ("Ghost".to_string(), "<input>".to_string(), "Nowhere".to_string()),
            ]
        );
    }

    #[test]
    fn test_enum_name_of() {
        let c = contract();
        let kind = &c.enums["Kind"];
        assert_eq!(kind.name_of(1), Some("SOME"));
        assert_eq!(kind.name_of(7), None);
    }

    // ==================== SchemaTable tests ====================

    #[test]
    fn test_schema_table_resolves_by_address() {
        let table = SchemaTable::from(vec![contract()]);
        assert_eq!(table.len(), 1);
        assert!(table.resolve("addr").is_some());
        assert!(table.resolve("other").is_none());
    }
}
