//! Field bindings between message arguments and object fields
//!
//! Every bindable type declares a static table of [`FieldBinding`]s: for a
//! message kind and an argument index, a typed getter/setter pair for one
//! named field. The same table drives both directions:
//!
//! - [`apply_inbound`] decodes matching arguments of a received message,
//!   offers each value to the object's acceptance hook, assigns it and
//!   reports the names of the assigned fields;
//! - [`build_outbound`] collects current field values (optionally with one
//!   override) into a new message, each at its bound argument index.
//!
//! Tables are filtered per (type, kind) once and memoised process-wide. The
//! memo is sharded, so populating one entry never blocks or corrupts lookups
//! of unrelated (type, kind) pairs.

use std::any::{Any, TypeId};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::error::{BoardLinkError, Result};
use crate::message::{ArgumentValue, ByteOrder, Message, MessageKind};

/// Wire type of a bound field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Bool,
    Str,
    /// Enumeration carried as a 32-bit integer
    Enum,
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Enum(i32),
}

impl FieldValue {
    /// Decode `bytes` as `field_type`
    pub fn decode(
        field_type: FieldType,
        bytes: &[u8],
        order: ByteOrder,
    ) -> std::result::Result<Self, String> {
        Ok(match field_type {
            FieldType::U8 => FieldValue::U8(u8::from_argument(bytes, order)?),
            FieldType::I8 => FieldValue::I8(i8::from_argument(bytes, order)?),
            FieldType::U16 => FieldValue::U16(u16::from_argument(bytes, order)?),
            FieldType::I16 => FieldValue::I16(i16::from_argument(bytes, order)?),
            FieldType::U32 => FieldValue::U32(u32::from_argument(bytes, order)?),
            FieldType::I32 => FieldValue::I32(i32::from_argument(bytes, order)?),
            FieldType::U64 => FieldValue::U64(u64::from_argument(bytes, order)?),
            FieldType::I64 => FieldValue::I64(i64::from_argument(bytes, order)?),
            FieldType::F32 => FieldValue::F32(f32::from_argument(bytes, order)?),
            FieldType::F64 => FieldValue::F64(f64::from_argument(bytes, order)?),
            FieldType::Bool => FieldValue::Bool(bool::from_argument(bytes, order)?),
            FieldType::Str => FieldValue::Str(String::from_argument(bytes, order)?),
            FieldType::Enum => FieldValue::Enum(i32::from_argument(bytes, order)?),
        })
    }

    /// Encode into argument bytes
    pub fn encode(&self, order: ByteOrder) -> Bytes {
        match self {
            FieldValue::U8(v) => v.to_argument(order),
            FieldValue::I8(v) => v.to_argument(order),
            FieldValue::U16(v) => v.to_argument(order),
            FieldValue::I16(v) => v.to_argument(order),
            FieldValue::U32(v) => v.to_argument(order),
            FieldValue::I32(v) => v.to_argument(order),
            FieldValue::U64(v) => v.to_argument(order),
            FieldValue::I64(v) => v.to_argument(order),
            FieldValue::F32(v) => v.to_argument(order),
            FieldValue::F64(v) => v.to_argument(order),
            FieldValue::Bool(v) => v.to_argument(order),
            FieldValue::Str(v) => v.to_argument(order),
            FieldValue::Enum(v) => v.to_argument(order),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            FieldValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            FieldValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::I32(v) | FieldValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            FieldValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Binding of one argument slot of one message kind to one field of `T`
pub struct FieldBinding<T> {
    pub field: &'static str,
    pub kind: MessageKind,
    pub index: usize,
    pub field_type: FieldType,
    /// Current value, `None` when the field is unset
    pub get: fn(&T) -> Option<FieldValue>,
    /// Assign a decoded value (values always match `field_type`)
    pub set: fn(&mut T, FieldValue),
}

impl<T> FieldBinding<T> {
    pub const fn new(
        field: &'static str,
        kind: MessageKind,
        index: usize,
        field_type: FieldType,
        get: fn(&T) -> Option<FieldValue>,
        set: fn(&mut T, FieldValue),
    ) -> Self {
        Self {
            field,
            kind,
            index,
            field_type,
            get,
            set,
        }
    }
}

impl<T> Clone for FieldBinding<T> {
    fn clone(&self) -> Self {
        Self { ..*self }
    }
}

impl<T> std::fmt::Debug for FieldBinding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldBinding")
            .field("field", &self.field)
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("field_type", &self.field_type)
            .finish()
    }
}

/// A type whose fields are populated from, and serialised into, messages
pub trait Bindable: Sized + 'static {
    /// Full binding table for all kinds (called once per kind, then memoised)
    fn bindings() -> Vec<FieldBinding<Self>>;

    /// Veto hook consulted before each inbound assignment
    fn accept_inbound(
        &self,
        _binding: &FieldBinding<Self>,
        _message: &Message,
        _value: &FieldValue,
    ) -> bool {
        true
    }
}

type BindingTable<T> = Vec<FieldBinding<T>>;

static REGISTRY: OnceLock<DashMap<(TypeId, MessageKind), Arc<dyn Any + Send + Sync>>> =
    OnceLock::new();

fn registry() -> &'static DashMap<(TypeId, MessageKind), Arc<dyn Any + Send + Sync>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// Memoised bindings of `T` for `kind`, sorted by argument index
pub fn bindings_for<T: Bindable>(kind: MessageKind) -> Arc<BindingTable<T>> {
    let key = (TypeId::of::<T>(), kind);

    let entry = match registry().get(&key) {
        Some(existing) => existing.value().clone(),
        None => {
            // Only this shard is locked while the entry is populated
            registry()
                .entry(key)
                .or_insert_with(|| {
                    let mut table: BindingTable<T> = T::bindings()
                        .into_iter()
                        .filter(|b| b.kind == kind)
                        .collect();
                    table.sort_by_key(|b| b.index);
                    trace!(
                        "Memoised {} bindings for {} / {}",
                        table.len(),
                        std::any::type_name::<T>(),
                        kind
                    );
                    Arc::new(table) as Arc<dyn Any + Send + Sync>
                })
                .value()
                .clone()
        }
    };

    match entry.downcast::<BindingTable<T>>() {
        Ok(table) => table,
        // Keys include the TypeId, so the stored table always has type T
        Err(_) => Arc::new(Vec::new()),
    }
}

/// Outcome of applying one message to an object
#[derive(Debug, Default)]
pub struct Applied {
    /// Fields assigned, in argument-index order
    pub changed: Vec<&'static str>,
    /// Field-attributed decode failures; those fields were left untouched
    pub errors: Vec<BoardLinkError>,
}

impl Applied {
    /// The changed fields, or the first decode failure
    pub fn into_result(self) -> Result<Vec<&'static str>> {
        match self.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(self.changed),
        }
    }
}

/// Populate `target` from `message`
///
/// Zero-length or missing arguments are treated as null and skipped. An
/// argument that fails to decode is reported in [`Applied::errors`] and does
/// not stop the remaining bindings from being applied.
pub fn apply_inbound<T: Bindable>(target: &mut T, message: &Message) -> Applied {
    let table = bindings_for::<T>(message.kind);
    let mut applied = Applied {
        changed: Vec::with_capacity(table.len()),
        errors: Vec::new(),
    };

    for binding in table.iter() {
        let bytes = match message.argument_bytes(binding.index) {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => continue,
        };

        let value = match FieldValue::decode(binding.field_type, bytes, message.byte_order) {
            Ok(value) => value,
            Err(reason) => {
                applied.errors.push(BoardLinkError::field(binding.field, reason));
                continue;
            }
        };

        if !target.accept_inbound(binding, message, &value) {
            trace!("Field {} vetoed for {}", binding.field, message.kind);
            continue;
        }

        (binding.set)(target, value);
        applied.changed.push(binding.field);
    }

    applied
}

/// Build a `kind` message from the bound fields of `source`
///
/// `override_value` replaces the current value of the named field. Each value
/// lands at its bound index; unbound slots and unset (`None`) fields before it
/// are emitted as empty arguments, which read back as null.
pub fn build_outbound<T: Bindable>(
    source: &T,
    kind: MessageKind,
    override_value: Option<(&str, FieldValue)>,
) -> Message {
    let table = bindings_for::<T>(kind);
    let mut message = Message::new(kind);

    for binding in table.iter() {
        let value = match &override_value {
            Some((field, value)) if *field == binding.field => Some(value.clone()),
            _ => (binding.get)(source),
        };
        let Some(value) = value else {
            continue;
        };
        while message.arguments.len() < binding.index {
            message.add_raw_argument(Bytes::new());
        }
        message.add_raw_argument(value.encode(message.byte_order));
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Sample {
        name: Option<String>,
        millis: Option<u32>,
        level: Option<u8>,
        locked: bool,
    }

    impl Bindable for Sample {
        fn bindings() -> Vec<FieldBinding<Self>> {
            vec![
                // declared out of index order on purpose
                FieldBinding::new(
                    "millis",
                    MessageKind::StatusResponse,
                    1,
                    FieldType::U32,
                    |p| p.millis.map(FieldValue::U32),
                    |p, v| p.millis = v.as_u32(),
                ),
                FieldBinding::new(
                    "name",
                    MessageKind::StatusResponse,
                    0,
                    FieldType::Str,
                    |p| p.name.clone().map(FieldValue::Str),
                    |p, v| p.name = v.into_string(),
                ),
                FieldBinding::new(
                    "level",
                    MessageKind::Data,
                    0,
                    FieldType::U8,
                    |p| p.level.map(FieldValue::U8),
                    |p, v| p.level = v.as_u8(),
                ),
            ]
        }

        fn accept_inbound(
            &self,
            binding: &FieldBinding<Self>,
            _message: &Message,
            _value: &FieldValue,
        ) -> bool {
            !(self.locked && binding.field == "level")
        }
    }

    fn status_response() -> Message {
        Message::new(MessageKind::StatusResponse)
            .with_argument(String::from("sample"))
            .with_argument(1234u32)
    }

    #[test]
    fn test_apply_inbound() {
        let mut sample = Sample::default();
        let changed = apply_inbound(&mut sample, &status_response()).changed;
        assert_eq!(changed, vec!["name", "millis"]);
        assert_eq!(sample.name.as_deref(), Some("sample"));
        assert_eq!(sample.millis, Some(1234));
        assert_eq!(sample.level, None);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let message = status_response();

        let mut first = Sample::default();
        let changed_first = apply_inbound(&mut first, &message).into_result().unwrap();
        let mut second = Sample::default();
        let changed_second = apply_inbound(&mut second, &message).into_result().unwrap();
        assert_eq!(first, second);
        assert_eq!(changed_first, changed_second);

        let again = apply_inbound(&mut first, &message).changed;
        assert_eq!(again, changed_first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_width_mismatch_names_field() {
        let message = Message::new(MessageKind::StatusResponse)
            .with_argument(String::from("sample"))
            .with_argument(7u16);
        let err = apply_inbound(&mut Sample::default(), &message)
            .into_result()
            .unwrap_err();
        match err {
            BoardLinkError::FieldDecode { field, reason } => {
                assert_eq!(field, "millis");
                assert!(reason.contains("expected 4 bytes"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_acceptance_hook_vetoes() {
        let mut sample = Sample {
            locked: true,
            ..Default::default()
        };
        let message = Message::new(MessageKind::Data).with_argument(9u8);
        let changed = apply_inbound(&mut sample, &message).changed;
        assert!(changed.is_empty());
        assert_eq!(sample.level, None);
    }

    #[test]
    fn test_decode_failure_keeps_other_fields() {
        let message = Message::new(MessageKind::StatusResponse)
            .with_argument(String::from("sample"))
            .with_argument(7u16);
        let mut sample = Sample {
            millis: Some(1),
            ..Default::default()
        };
        let applied = apply_inbound(&mut sample, &message);
        assert_eq!(applied.changed, vec!["name"]);
        assert_eq!(applied.errors.len(), 1);
        assert_eq!(sample.name.as_deref(), Some("sample"));
        assert_eq!(sample.millis, Some(1));
    }

    #[test]
    fn test_build_outbound_places_values_at_bound_index() {
        let sample = Sample {
            name: None,
            millis: Some(5),
            ..Default::default()
        };
        let message = build_outbound(&sample, MessageKind::StatusResponse, None);
        assert_eq!(message.arguments.len(), 2);
        assert!(message.arguments[0].is_empty());
        assert_eq!(message.argument::<u32>(1).unwrap(), 5);

        let mut copy = Sample::default();
        let applied = apply_inbound(&mut copy, &message);
        assert!(applied.errors.is_empty());
        assert_eq!(applied.changed, vec!["millis"]);
        assert_eq!(copy.millis, Some(5));
        assert_eq!(copy.name, None);
    }

    #[test]
    fn test_build_outbound_skips_trailing_null_and_applies_override() {
        let sample = Sample {
            name: Some("x".into()),
            millis: None,
            ..Default::default()
        };
        let message = build_outbound(&sample, MessageKind::StatusResponse, None);
        assert_eq!(message.arguments.len(), 1);
        assert_eq!(message.argument::<String>(0).unwrap(), "x");

        let message = build_outbound(
            &sample,
            MessageKind::StatusResponse,
            Some(("millis", FieldValue::U32(5))),
        );
        assert_eq!(message.arguments.len(), 2);
        assert_eq!(message.argument::<String>(0).unwrap(), "x");
        assert_eq!(message.argument::<u32>(1).unwrap(), 5);
    }

    #[test]
    fn test_concurrent_population() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let kind = if i % 2 == 0 {
                        MessageKind::StatusResponse
                    } else {
                        MessageKind::Data
                    };
                    bindings_for::<Sample>(kind).len()
                })
            })
            .collect();
        let lens: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (i, len) in lens.into_iter().enumerate() {
            assert_eq!(len, if i % 2 == 0 { 2 } else { 1 });
        }
    }
}
