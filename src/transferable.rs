//! Values that can cross isolate boundaries.
//!
//! A [`Transferable`] is a heap-independent copy (or, for references, a
//! remote handle) of an engine value. Copies own their bytes in host memory
//! behind reference counts, so one logical payload can be materialized into
//! any number of destination isolates without being duplicated host-side.
//! Ownership never aliases across heaps: materializing a copy writes fresh
//! engine memory, and moved array buffers leave their source detached.
//!
//! Every variant reports `size` (host bytes held) and `worst_case_heap_size`
//! (upper bound on what materialization can cost the destination heap);
//! the latter feeds the pre-transfer heap guard.

use crate::error::{Error, ErrorCopy, ErrorKind, Result};
use crate::reference::Reference;
use crate::runnable::TaskContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use v8::{ValueDeserializerHelper, ValueSerializerHelper};

/// Typed-view tag for array-buffer views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewKind {
    Uint8,
    Uint8Clamped,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
    DataView,
}

impl ViewKind {
    fn element_size(self) -> usize {
        match self {
            ViewKind::Uint8 | ViewKind::Uint8Clamped | ViewKind::Int8 | ViewKind::DataView => 1,
            ViewKind::Uint16 | ViewKind::Int16 => 2,
            ViewKind::Uint32 | ViewKind::Int32 | ViewKind::Float32 => 4,
            ViewKind::Float64 => 8,
        }
    }
}

/// Owned raw bytes for an array buffer, shared host-side by refcount.
#[derive(Debug, Clone)]
pub struct BufferCopy {
    bytes: Arc<[u8]>,
}

impl BufferCopy {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn materialize<'s>(&self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::ArrayBuffer> {
        let store =
            v8::ArrayBuffer::new_backing_store_from_boxed_slice(self.bytes.to_vec().into())
                .make_shared();
        v8::ArrayBuffer::with_backing_store(scope, &store)
    }
}

/// Structured-clone payload plus the side-channel of array buffers the
/// serializer transferred out of band.
#[derive(Debug, Clone)]
pub struct SerializedCopy {
    bytes: Arc<[u8]>,
    transferred: Vec<BufferCopy>,
}

/// A value that can be materialized into a specific isolate's heap.
#[derive(Clone)]
pub enum Transferable {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    Date(f64),
    String(Arc<str>),
    Serialized(SerializedCopy),
    ArrayBuffer(BufferCopy),
    ArrayBufferView { kind: ViewKind, buffer: BufferCopy },
    Error(ErrorCopy),
    Reference(Reference),
}

impl std::fmt::Debug for Transferable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transferable::Undefined => write!(f, "Undefined"),
            Transferable::Null => write!(f, "Null"),
            Transferable::Boolean(b) => write!(f, "Boolean({b})"),
            Transferable::Number(n) => write!(f, "Number({n})"),
            Transferable::Date(t) => write!(f, "Date({t})"),
            Transferable::String(s) => write!(f, "String({} chars)", s.chars().count()),
            Transferable::Serialized(s) => write!(
                f,
                "Serialized({} bytes, {} buffers)",
                s.bytes.len(),
                s.transferred.len()
            ),
            Transferable::ArrayBuffer(b) => write!(f, "ArrayBuffer({} bytes)", b.len()),
            Transferable::ArrayBufferView { kind, buffer } => {
                write!(f, "ArrayBufferView({kind:?}, {} bytes)", buffer.len())
            }
            Transferable::Error(e) => write!(f, "Error({e})"),
            Transferable::Reference(r) => write!(f, "Reference({:?})", r.type_of()),
        }
    }
}

impl Transferable {
    /// Produce a transferable from any engine value. With `transfer_out`,
    /// array buffers reachable from `value` are moved (their sources
    /// detached) instead of copied. Fails with `NotSerializable` for values
    /// with no transferable representation.
    pub fn copy<'a>(
        scope: &mut v8::HandleScope<'a>,
        value: v8::Local<'a, v8::Value>,
        transfer_out: bool,
    ) -> Result<Transferable> {
        if let Some(primitive) = Self::copy_if_primitive(scope, value) {
            return Ok(primitive);
        }
        if value.is_date() {
            let time = value.number_value(scope).unwrap_or(f64::NAN);
            return Ok(Transferable::Date(time));
        }
        if value.is_array_buffer() {
            let buffer = v8::Local::<v8::ArrayBuffer>::try_from(value)
                .map_err(|_| Error::not_serializable("array buffer cast failed"))?;
            return Self::copy_array_buffer(buffer, transfer_out);
        }
        if value.is_array_buffer_view() {
            return Self::copy_view(scope, value, transfer_out);
        }
        if value.is_native_error() {
            return Ok(Transferable::Error(error_copy_from_value(scope, value)));
        }
        if value.is_function() {
            return Err(Error::not_serializable("functions cannot be transferred"));
        }
        if value.is_symbol() {
            return Err(Error::not_serializable("symbols cannot be transferred"));
        }
        Self::copy_serialized(scope, value, transfer_out)
    }

    /// Fast path for trivially cloneable scalars: number, boolean, null,
    /// undefined, string. Returns `None` for anything else.
    pub fn copy_if_primitive(
        scope: &mut v8::HandleScope<'_>,
        value: v8::Local<'_, v8::Value>,
    ) -> Option<Transferable> {
        if value.is_undefined() {
            Some(Transferable::Undefined)
        } else if value.is_null() {
            Some(Transferable::Null)
        } else if value.is_boolean() {
            Some(Transferable::Boolean(value.boolean_value(scope)))
        } else if value.is_number() {
            Some(Transferable::Number(value.number_value(scope)?))
        } else if value.is_string() {
            let string = v8::Local::<v8::String>::try_from(value).ok()?;
            Some(Transferable::String(
                string.to_rust_string_lossy(scope).into(),
            ))
        } else {
            None
        }
    }

    /// Like `copy_if_primitive` but also accepts error objects, so throw
    /// sites can ship a faithful error without a full structured clone.
    pub fn copy_if_primitive_or_error(
        scope: &mut v8::HandleScope<'_>,
        value: v8::Local<'_, v8::Value>,
    ) -> Option<Transferable> {
        if let Some(primitive) = Self::copy_if_primitive(scope, value) {
            return Some(primitive);
        }
        if value.is_native_error() {
            return Some(Transferable::Error(error_copy_from_value(scope, value)));
        }
        None
    }

    fn copy_array_buffer(
        buffer: v8::Local<'_, v8::ArrayBuffer>,
        transfer_out: bool,
    ) -> Result<Transferable> {
        let bytes = buffer_bytes(buffer);
        if transfer_out {
            if !buffer.is_detachable() {
                return Err(Error::not_serializable(
                    "array buffer is not detachable and cannot be moved",
                ));
            }
            let _ = buffer.detach(None);
        }
        Ok(Transferable::ArrayBuffer(BufferCopy::new(bytes)))
    }

    fn copy_view(
        scope: &mut v8::HandleScope<'_>,
        value: v8::Local<'_, v8::Value>,
        transfer_out: bool,
    ) -> Result<Transferable> {
        let kind = if value.is_uint8_array() {
            ViewKind::Uint8
        } else if value.is_uint8_clamped_array() {
            ViewKind::Uint8Clamped
        } else if value.is_int8_array() {
            ViewKind::Int8
        } else if value.is_uint16_array() {
            ViewKind::Uint16
        } else if value.is_int16_array() {
            ViewKind::Int16
        } else if value.is_uint32_array() {
            ViewKind::Uint32
        } else if value.is_int32_array() {
            ViewKind::Int32
        } else if value.is_float32_array() {
            ViewKind::Float32
        } else if value.is_float64_array() {
            ViewKind::Float64
        } else if value.is_data_view() {
            ViewKind::DataView
        } else {
            return Err(Error::not_serializable("unsupported array buffer view"));
        };
        let view = v8::Local::<v8::ArrayBufferView>::try_from(value)
            .map_err(|_| Error::not_serializable("array buffer view cast failed"))?;
        let mut bytes = vec![0u8; view.byte_length()];
        let copied = view.copy_contents(&mut bytes);
        bytes.truncate(copied);
        if transfer_out {
            if let Some(buffer) = view.buffer(scope) {
                if buffer.is_detachable() {
                    let _ = buffer.detach(None);
                }
            }
        }
        Ok(Transferable::ArrayBufferView {
            kind,
            buffer: BufferCopy::new(bytes),
        })
    }

    fn copy_serialized<'a>(
        scope: &mut v8::HandleScope<'a>,
        value: v8::Local<'a, v8::Value>,
        transfer_out: bool,
    ) -> Result<Transferable> {
        let tc = &mut v8::TryCatch::new(scope);
        let context = tc.get_current_context();
        let mut to_transfer = Vec::new();
        if transfer_out {
            collect_array_buffers(tc, value, &mut to_transfer);
        }
        let serializer = v8::ValueSerializer::new(tc, Box::new(TransferDelegate));
        serializer.write_header();
        for (index, buffer) in to_transfer.iter().enumerate() {
            serializer.transfer_array_buffer(index as u32, *buffer);
        }
        match serializer.write_value(context, value) {
            Some(true) => {}
            _ => {
                let detail = tc
                    .exception()
                    .map(|exception| exception.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "value could not be cloned".to_string());
                return Err(Error::not_serializable(detail));
            }
        }
        let bytes: Arc<[u8]> = serializer.release().into();
        let mut transferred = Vec::with_capacity(to_transfer.len());
        for buffer in to_transfer {
            transferred.push(BufferCopy::new(buffer_bytes(buffer)));
            if buffer.is_detachable() {
                let _ = buffer.detach(None);
            }
        }
        Ok(Transferable::Serialized(SerializedCopy {
            bytes,
            transferred,
        }))
    }

    /// Materialize this transferable into the current isolate. Runs the
    /// pre-transfer heap-guard check first and fails with `HeapLimit` before
    /// the engine touches the new allocation.
    pub fn transfer_in<'s>(
        &self,
        cx: &mut TaskContext<'_, 's>,
    ) -> Result<v8::Local<'s, v8::Value>> {
        let env = cx.environment().clone();
        env.pre_transfer_check(cx.scope(), self.worst_case_heap_size())?;
        let context = cx.default_context()?;
        let scope = &mut v8::ContextScope::new(cx.scope, context);
        match self {
            Transferable::Undefined => Ok(v8::undefined(scope).into()),
            Transferable::Null => Ok(v8::null(scope).into()),
            Transferable::Boolean(value) => Ok(v8::Boolean::new(scope, *value).into()),
            Transferable::Number(value) => Ok(v8::Number::new(scope, *value).into()),
            Transferable::Date(time) => v8::Date::new(scope, *time)
                .map(Into::into)
                .ok_or_else(|| Error::fatal("date allocation failed")),
            Transferable::String(payload) => v8::String::new(scope, payload)
                .map(Into::into)
                .ok_or_else(|| Error::fatal("string allocation failed")),
            Transferable::ArrayBuffer(buffer) => Ok(buffer.materialize(scope).into()),
            Transferable::ArrayBufferView { kind, buffer } => {
                let backing = buffer.materialize(scope);
                let length = buffer.len() / kind.element_size();
                materialize_view(scope, *kind, backing, length)
            }
            Transferable::Error(copy) => Ok(materialize_error(scope, copy)),
            Transferable::Serialized(serialized) => {
                // Rebuild the side-channel buffers before the deserializer
                // takes the scope; locals stay valid either way.
                let backings: Vec<v8::Local<v8::ArrayBuffer>> = serialized
                    .transferred
                    .iter()
                    .map(|buffer| buffer.materialize(scope))
                    .collect();
                let context = scope.get_current_context();
                let deserializer =
                    v8::ValueDeserializer::new(scope, Box::new(TransferDelegate), &serialized.bytes);
                for (index, backing) in backings.into_iter().enumerate() {
                    deserializer.transfer_array_buffer(index as u32, backing);
                }
                let _ = deserializer.read_header(context);
                deserializer
                    .read_value(context)
                    .ok_or_else(|| Error::not_serializable("serialized payload failed to decode"))
            }
            Transferable::Reference(reference) => reference.materialize(scope, &env),
        }
    }

    /// Host memory held by this transferable.
    pub fn size(&self) -> usize {
        match self {
            Transferable::Undefined | Transferable::Null => 0,
            Transferable::Boolean(_) => std::mem::size_of::<bool>(),
            Transferable::Number(_) | Transferable::Date(_) => std::mem::size_of::<f64>(),
            Transferable::String(payload) => payload.len(),
            Transferable::Serialized(serialized) => {
                serialized.bytes.len()
                    + serialized
                        .transferred
                        .iter()
                        .map(BufferCopy::len)
                        .sum::<usize>()
            }
            Transferable::ArrayBuffer(buffer) => buffer.len(),
            Transferable::ArrayBufferView { buffer, .. } => buffer.len(),
            Transferable::Error(copy) => copy.size(),
            Transferable::Reference(_) => std::mem::size_of::<Reference>(),
        }
    }

    /// Upper bound on destination-heap bytes a materialization can cost.
    pub fn worst_case_heap_size(&self) -> usize {
        const HANDLE_OVERHEAD: usize = 64;
        match self {
            Transferable::Undefined | Transferable::Null | Transferable::Boolean(_) => {
                HANDLE_OVERHEAD
            }
            Transferable::Number(_) | Transferable::Date(_) => HANDLE_OVERHEAD,
            // Engine strings may store UTF-16 internally.
            Transferable::String(payload) => payload.len() * 2 + HANDLE_OVERHEAD,
            // Deserialized graphs expand over their wire form.
            Transferable::Serialized(serialized) => {
                serialized.bytes.len() * 2
                    + serialized
                        .transferred
                        .iter()
                        .map(|buffer| buffer.len() + HANDLE_OVERHEAD)
                        .sum::<usize>()
                    + HANDLE_OVERHEAD
            }
            Transferable::ArrayBuffer(buffer) => buffer.len() + HANDLE_OVERHEAD,
            Transferable::ArrayBufferView { buffer, .. } => buffer.len() + 2 * HANDLE_OVERHEAD,
            Transferable::Error(copy) => copy.size() * 2 + 2 * HANDLE_OVERHEAD,
            Transferable::Reference(_) => HANDLE_OVERHEAD,
        }
    }

    // Host-side decode helpers for primitive results.

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Transferable::Number(value) | Transferable::Date(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Transferable::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Transferable::String(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Transferable::ArrayBuffer(buffer) => Some(buffer.bytes()),
            Transferable::ArrayBufferView { buffer, .. } => Some(buffer.bytes()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorCopy> {
        match self {
            Transferable::Error(copy) => Some(copy),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Transferable::Undefined)
    }
}

fn buffer_bytes(buffer: v8::Local<'_, v8::ArrayBuffer>) -> Vec<u8> {
    let store = buffer.get_backing_store();
    let length = store.byte_length();
    match store.data() {
        Some(data) => {
            // SAFETY: the backing store keeps the region alive and we copy
            // out before any detach.
            unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, length).to_vec() }
        }
        None => Vec::new(),
    }
}

/// Walk a value graph collecting the array buffers that a move-transfer
/// must detach. Plain objects and arrays are traversed; exotic objects are
/// left to the serializer.
fn collect_array_buffers<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    out: &mut Vec<v8::Local<'s, v8::ArrayBuffer>>,
) {
    const MAX_NODES: usize = 10_000;
    let mut pending = vec![value];
    let mut seen: Vec<v8::Local<v8::Object>> = Vec::new();
    let mut visited = 0usize;
    while let Some(value) = pending.pop() {
        visited += 1;
        if visited > MAX_NODES {
            return;
        }
        if value.is_array_buffer() {
            if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
                if !out.iter().any(|known| known.strict_equals(buffer.into())) {
                    out.push(buffer);
                }
            }
            continue;
        }
        if value.is_array_buffer_view() {
            if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
                if let Some(buffer) = view.buffer(scope) {
                    if !out.iter().any(|known| known.strict_equals(buffer.into())) {
                        out.push(buffer);
                    }
                }
            }
            continue;
        }
        if !value.is_object() || value.is_function() {
            continue;
        }
        let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
            continue;
        };
        if seen
            .iter()
            .any(|known| known.strict_equals(object.into()))
        {
            continue;
        }
        seen.push(object);
        if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
            for index in 0..array.length() {
                if let Some(element) = array.get_index(scope, index) {
                    pending.push(element);
                }
            }
            continue;
        }
        if let Some(names) = object.get_own_property_names(scope, Default::default()) {
            for index in 0..names.length() {
                let Some(key) = names.get_index(scope, index) else {
                    continue;
                };
                if let Some(property) = object.get(scope, key) {
                    pending.push(property);
                }
            }
        }
    }
}

fn materialize_view<'s>(
    scope: &mut v8::HandleScope<'s>,
    kind: ViewKind,
    buffer: v8::Local<'s, v8::ArrayBuffer>,
    length: usize,
) -> Result<v8::Local<'s, v8::Value>> {
    let view: Option<v8::Local<v8::Value>> = match kind {
        ViewKind::Uint8 => v8::Uint8Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Uint8Clamped => {
            v8::Uint8ClampedArray::new(scope, buffer, 0, length).map(Into::into)
        }
        ViewKind::Int8 => v8::Int8Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Uint16 => v8::Uint16Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Int16 => v8::Int16Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Uint32 => v8::Uint32Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Int32 => v8::Int32Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Float32 => v8::Float32Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::Float64 => v8::Float64Array::new(scope, buffer, 0, length).map(Into::into),
        ViewKind::DataView => Some(v8::DataView::new(scope, buffer, 0, length).into()),
    };
    view.ok_or_else(|| Error::fatal("typed view allocation failed"))
}

fn materialize_error<'s>(
    scope: &mut v8::HandleScope<'s>,
    copy: &ErrorCopy,
) -> v8::Local<'s, v8::Value> {
    let message = v8::String::new(scope, &copy.message)
        .unwrap_or_else(|| v8::String::empty(scope));
    let error = match copy.kind {
        ErrorKind::RangeError => v8::Exception::range_error(scope, message),
        ErrorKind::ReferenceError => v8::Exception::reference_error(scope, message),
        ErrorKind::SyntaxError => v8::Exception::syntax_error(scope, message),
        ErrorKind::TypeError => v8::Exception::type_error(scope, message),
        ErrorKind::Error => v8::Exception::error(scope, message),
    };
    if let Some(stack) = &copy.stack {
        if let Ok(object) = v8::Local::<v8::Object>::try_from(error) {
            let key = v8::String::new(scope, "stack").unwrap_or_else(|| v8::String::empty(scope));
            if let Some(stack) = v8::String::new(scope, stack) {
                object.set(scope, key.into(), stack.into());
            }
        }
    }
    error
}

/// Build an [`ErrorCopy`] from any thrown value. Non-error values (string
/// throws and the like) become a generic error carrying their string form.
pub(crate) fn error_copy_from_value(
    scope: &mut v8::HandleScope<'_>,
    value: v8::Local<'_, v8::Value>,
) -> ErrorCopy {
    if !value.is_native_error() {
        let message = value.to_rust_string_lossy(scope);
        return ErrorCopy::new(ErrorKind::Error, message);
    }
    let object = match v8::Local::<v8::Object>::try_from(value) {
        Ok(object) => object,
        Err(_) => {
            return ErrorCopy::new(ErrorKind::Error, value.to_rust_string_lossy(scope));
        }
    };
    let get_string = |scope: &mut v8::HandleScope<'_>, key: &str| -> Option<String> {
        let key = v8::String::new(scope, key)?;
        let property = object.get(scope, key.into())?;
        if property.is_undefined() || property.is_null() {
            return None;
        }
        Some(property.to_rust_string_lossy(scope))
    };
    let kind = get_string(scope, "name")
        .map(|name| ErrorKind::from_constructor_name(&name))
        .unwrap_or(ErrorKind::Error);
    let message = get_string(scope, "message").unwrap_or_default();
    let mut copy = ErrorCopy::new(kind, message);
    copy.stack = get_string(scope, "stack").map(Into::into);
    copy
}

/// Serializer/deserializer delegate: the only required behavior is turning a
/// data-clone failure into a catchable exception.
struct TransferDelegate;

impl v8::ValueSerializerImpl for TransferDelegate {
    fn throw_data_clone_error<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        message: v8::Local<'s, v8::String>,
    ) {
        let error = v8::Exception::type_error(scope, message);
        scope.throw_exception(error);
    }
}

impl v8::ValueDeserializerImpl for TransferDelegate {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes_are_small() {
        assert_eq!(Transferable::Undefined.size(), 0);
        assert_eq!(Transferable::Null.size(), 0);
        assert_eq!(Transferable::Number(1.5).size(), 8);
        assert!(Transferable::Boolean(true).worst_case_heap_size() < 1024);
    }

    #[test]
    fn test_string_worst_case_accounts_for_utf16() {
        let payload = "x".repeat(1000);
        let transferable = Transferable::String(payload.into());
        assert_eq!(transferable.size(), 1000);
        assert!(transferable.worst_case_heap_size() >= 2000);
    }

    #[test]
    fn test_buffer_copy_reports_len() {
        let transferable = Transferable::ArrayBuffer(BufferCopy::new(vec![0u8; 4096]));
        assert_eq!(transferable.size(), 4096);
        assert!(transferable.worst_case_heap_size() >= 4096);
        assert_eq!(transferable.as_bytes().map(<[u8]>::len), Some(4096));
    }

    #[test]
    fn test_view_kind_element_sizes() {
        assert_eq!(ViewKind::Uint8.element_size(), 1);
        assert_eq!(ViewKind::Int16.element_size(), 2);
        assert_eq!(ViewKind::Float32.element_size(), 4);
        assert_eq!(ViewKind::Float64.element_size(), 8);
        assert_eq!(ViewKind::DataView.element_size(), 1);
    }

    #[test]
    fn test_decode_helpers_reject_other_variants() {
        let number = Transferable::Number(3.0);
        assert_eq!(number.as_number(), Some(3.0));
        assert_eq!(number.as_str(), None);
        assert_eq!(number.as_bytes(), None);
        assert!(number.error().is_none());

        let text = Transferable::String("hi".into());
        assert_eq!(text.as_str(), Some("hi"));
        assert_eq!(text.as_number(), None);
    }
}
