//! Record bindings: a local typed buffer mirroring a directory subtree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OdbError, Result};
use crate::hotlink::{Owner, WatchId};
use crate::schema::{self, FieldDesc, MismatchKind};
use crate::tree::{join_path, KeyTree};
use crate::types::{KeyRef, TypeId, FLAG_EXCLUSIVE};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingId(pub u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMode {
    Read,
    Write,
}

/// Runs after an automatic refresh with a copy of the refreshed buffer
pub type RecordCallback = Arc<dyn Fn(BindingId, &RecordBuffer) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    /// Path relative to the bound directory
    pub name: String,
    pub ty: TypeId,
    pub count: usize,
    pub item_size: usize,
    pub offset: usize,
}

impl FieldSlot {
    pub fn len(&self) -> usize {
        self.count * self.item_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Byte layout of a record: value fields in schema order, each at its
/// natural alignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub fields: Vec<FieldSlot>,
    pub size: usize,
}

impl RecordLayout {
    pub fn new(fields: &[FieldDesc]) -> Self {
        let mut slots = Vec::new();
        let mut offset: usize = 0;
        let mut max_align = 1;
        for f in fields.iter().filter(|f| f.ty.fixed_size() != Some(0)) {
            if f.ty == TypeId::Link {
                continue;
            }
            let align = match f.ty {
                TypeId::String | TypeId::Blob => 1,
                ty => ty.fixed_size().unwrap_or(1),
            };
            max_align = max_align.max(align);
            offset = offset.div_ceil(align) * align;
            slots.push(FieldSlot {
                name: f.name.clone(),
                ty: f.ty,
                count: f.count,
                item_size: f.item_size,
                offset,
            });
            offset += f.count * f.item_size;
        }
        Self {
            fields: slots,
            size: offset.div_ceil(max_align) * max_align,
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// Local copy of a bound record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBuffer {
    layout: Arc<RecordLayout>,
    bytes: Vec<u8>,
    dirty: Vec<bool>,
}

impl RecordBuffer {
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        let bytes = vec![0; layout.size];
        let dirty = vec![false; layout.fields.len()];
        Self {
            layout,
            bytes,
            dirty,
        }
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    fn slot(&self, name: &str) -> Result<(usize, &FieldSlot)> {
        let idx = self
            .layout
            .index_of(name)
            .ok_or_else(|| OdbError::not_found(name))?;
        Ok((idx, &self.layout.fields[idx]))
    }

    /// Typed value of a field
    pub fn get(&self, name: &str) -> Result<Value> {
        let (_, slot) = self.slot(name)?;
        Value::decode(
            slot.ty,
            &self.bytes[slot.offset..slot.offset + slot.len()],
            slot.count,
            slot.item_size,
        )
    }

    /// Store a field and mark it dirty. The value is converted to the field
    /// type; fewer elements are zero-filled, more fail `OutOfRange`. Returns
    /// true if a string had to be cut to fit.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<bool> {
        let (idx, slot) = self.slot(name)?;
        let slot = slot.clone();
        let value = value.into().convert(slot.ty)?;
        if value.len() > slot.count {
            return Err(OdbError::OutOfRange {
                index: value.len() - 1,
                count: slot.count,
            });
        }
        let value = value.resized(slot.count)?;
        let (bytes, truncated) = value.encode(slot.item_size);
        self.bytes[slot.offset..slot.offset + slot.len()].copy_from_slice(&bytes);
        self.dirty[idx] = true;
        Ok(truncated)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.layout
            .index_of(name)
            .map(|i| self.dirty[i])
            .unwrap_or(false)
    }

    pub fn mark_dirty(&mut self, name: &str) -> Result<()> {
        let (idx, _) = self.slot(name)?;
        self.dirty[idx] = true;
        Ok(())
    }

    pub fn dirty_fields(&self) -> Vec<String> {
        self.layout
            .fields
            .iter()
            .zip(&self.dirty)
            .filter(|(_, d)| **d)
            .map(|(f, _)| f.name.clone())
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = false);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replace the raw bytes; every field counts as dirty afterwards
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.bytes.len() {
            return Err(OdbError::Truncated {
                needed: self.bytes.len(),
                available: bytes.len(),
            });
        }
        self.bytes.copy_from_slice(bytes);
        self.dirty.iter_mut().for_each(|d| *d = true);
        Ok(())
    }

    fn write_slot(&mut self, idx: usize, value: &Value) -> Result<()> {
        let slot = &self.layout.fields[idx];
        let value = value.convert(slot.ty)?.resized(slot.count)?;
        let (bytes, _) = value.encode(slot.item_size);
        let range = slot.offset..slot.offset + slot.len();
        self.bytes[range].copy_from_slice(&bytes);
        Ok(())
    }

    fn slot_value(&self, idx: usize) -> Result<Value> {
        let slot = &self.layout.fields[idx];
        Value::decode(
            slot.ty,
            &self.bytes[slot.offset..slot.offset + slot.len()],
            slot.count,
            slot.item_size,
        )
    }
}

/// How to bind
#[derive(Clone)]
pub struct BindOptions {
    pub mode: BindMode,
    pub owner: Owner,
    pub exclusive: bool,
    pub callback: Option<RecordCallback>,
}

impl BindOptions {
    pub fn new(mode: BindMode) -> Self {
        Self {
            mode,
            owner: Owner::Local,
            exclusive: false,
            callback: None,
        }
    }

    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn callback(mut self, callback: RecordCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

struct Binding {
    path: String,
    dir: KeyRef,
    serial: u64,
    mode: BindMode,
    owner: Owner,
    exclusive: bool,
    callback: Option<RecordCallback>,
    watch: Option<WatchId>,
    buffer: RecordBuffer,
}

/// Released binding, handed back so the caller can drop its watch
pub struct Unbound {
    pub id: BindingId,
    pub path: String,
    pub watch: Option<WatchId>,
}

#[derive(Default)]
struct BinderState {
    next_id: u64,
    bindings: BTreeMap<BindingId, Binding>,
}

/// Per-process table of record bindings. Every method that touches keys
/// expects the caller to hold the tree lock in the right mode.
#[derive(Default)]
pub struct RecordBinder {
    state: Mutex<BinderState>,
}

fn field_path(base: &str, name: &str) -> String {
    join_path(base, name)
}

impl RecordBinder {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BinderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `path` to a buffer laid out from `fields`.
    ///
    /// A missing subtree is created from the layout. An existing one must
    /// match name, type and count of every field (extra keys are allowed;
    /// string keys may be longer than declared) or `SchemaMismatch` lists the
    /// conflicts.
    pub fn bind(
        &self,
        tree: &mut KeyTree,
        path: &str,
        fields: &[FieldDesc],
        options: &BindOptions,
    ) -> Result<(BindingId, Arc<RecordLayout>)> {
        let dir = match tree.find(path) {
            Ok(dir) => dir,
            Err(OdbError::NotFound { .. }) => {
                let dir = tree.transaction(|t| {
                    let dir = t.ensure_dir(path)?;
                    schema::apply(t, dir, fields)?;
                    Ok(dir)
                })?;
                info!(path, fields = fields.len(), "Created record from layout");
                dir
            }
            Err(e) => return Err(e),
        };
        let info = tree.key_info(dir)?;
        if info.type_id != TypeId::Key {
            return Err(OdbError::TypeMismatch {
                expected: TypeId::Key,
                actual: info.type_id,
            });
        }

        let actual = schema::schema_of(tree, dir)?;
        let conflicts: Vec<_> = schema::diff(fields, &actual)
            .into_iter()
            .filter(|m| !matches!(m.kind, MismatchKind::Extra | MismatchKind::ItemSizeDiffers { .. }))
            .collect();
        if !conflicts.is_empty() {
            return Err(OdbError::SchemaMismatch {
                mismatches: conflicts,
            });
        }

        let mut state = self.state();
        if info.flags & FLAG_EXCLUSIVE != 0 {
            let ours = state
                .bindings
                .values()
                .any(|b| b.dir == dir && b.exclusive && b.owner == options.owner);
            if !ours {
                return Err(OdbError::ReadOnly {
                    path: path.to_string(),
                });
            }
        }
        // Strings take the stored item size so refresh and flush agree with
        // the keys
        let effective: Vec<FieldDesc> = fields
            .iter()
            .map(|f| {
                let mut f = f.clone();
                if f.ty == TypeId::String {
                    if let Some(a) = actual.iter().find(|a| a.name.eq_ignore_ascii_case(&f.name)) {
                        f.item_size = a.item_size;
                    }
                }
                f
            })
            .collect();
        let layout = Arc::new(RecordLayout::new(&effective));
        let mut buffer = RecordBuffer::new(layout.clone());
        let base = tree.path_of(dir)?;
        for idx in 0..layout.fields.len() {
            let key = tree.find(&field_path(&base, &layout.fields[idx].name))?;
            buffer.write_slot(idx, &tree.get(key)?)?;
        }
        if options.exclusive {
            tree.set_flags(dir, info.flags | FLAG_EXCLUSIVE, false)?;
        }

        state.next_id += 1;
        let id = BindingId(state.next_id);
        state.bindings.insert(
            id,
            Binding {
                path: path.to_string(),
                dir,
                serial: info.serial,
                mode: options.mode,
                owner: options.owner,
                exclusive: options.exclusive,
                callback: options.callback.clone(),
                watch: None,
                buffer,
            },
        );
        debug!(binding = %id, path, mode = ?options.mode, size = layout.size, "Bound record");
        Ok((id, layout))
    }

    pub(crate) fn set_watch(&self, id: BindingId, watch: WatchId) -> Result<()> {
        let mut state = self.state();
        let b = state
            .bindings
            .get_mut(&id)
            .ok_or_else(|| OdbError::not_found(format!("binding {id}")))?;
        b.watch = Some(watch);
        Ok(())
    }

    fn with_binding<R>(&self, id: BindingId, f: impl FnOnce(&mut Binding) -> Result<R>) -> Result<R> {
        let mut state = self.state();
        let b = state
            .bindings
            .get_mut(&id)
            .ok_or_else(|| OdbError::not_found(format!("binding {id}")))?;
        f(b)
    }

    /// Access the local buffer of a binding
    pub fn with_buffer<R>(&self, id: BindingId, f: impl FnOnce(&mut RecordBuffer) -> R) -> Result<R> {
        self.with_binding(id, |b| Ok(f(&mut b.buffer)))
    }

    pub fn snapshot(&self, id: BindingId) -> Result<RecordBuffer> {
        self.with_binding(id, |b| Ok(b.buffer.clone()))
    }

    pub fn callback(&self, id: BindingId) -> Result<Option<RecordCallback>> {
        self.with_binding(id, |b| Ok(b.callback.clone()))
    }

    /// Write dirty fields (every field with `all`) into the keys, then
    /// clear the dirty marks. Returns the number of fields written.
    pub fn flush(&self, tree: &mut KeyTree, id: BindingId, all: bool) -> Result<usize> {
        self.with_binding(id, |b| {
            if b.mode != BindMode::Write {
                return Err(OdbError::ReadOnly { path: b.path.clone() });
            }
            if !tree.is_same_key(b.dir, b.serial) {
                return Err(OdbError::not_found(b.path.clone()));
            }
            let base = tree.path_of(b.dir)?;
            let buffer = &b.buffer;
            let written = tree.transaction(|t| {
                let mut written = 0;
                for idx in 0..buffer.layout.fields.len() {
                    if !all && !buffer.dirty[idx] {
                        continue;
                    }
                    let key = t.find(&field_path(&base, &buffer.layout.fields[idx].name))?;
                    t.set(key, &buffer.slot_value(idx)?)?;
                    written += 1;
                }
                Ok(written)
            })?;
            b.buffer.clear_dirty();
            debug!(binding = %id, written, "Flushed record");
            Ok(written)
        })
    }

    /// Copy current key values into every field not marked dirty
    pub fn refresh(&self, tree: &KeyTree, id: BindingId) -> Result<()> {
        self.with_binding(id, |b| {
            if !tree.is_same_key(b.dir, b.serial) {
                return Err(OdbError::not_found(b.path.clone()));
            }
            let base = tree.path_of(b.dir)?;
            for idx in 0..b.buffer.layout.fields.len() {
                if b.buffer.dirty[idx] {
                    continue;
                }
                let key = tree.find(&field_path(&base, &b.buffer.layout.fields[idx].name))?;
                b.buffer.write_slot(idx, &tree.get(key)?)?;
            }
            Ok(())
        })
    }

    /// Drop a binding without touching the tree
    pub(crate) fn forget(&self, id: BindingId) -> bool {
        self.state().bindings.remove(&id).is_some()
    }

    /// Release a binding; stored data is left as is apart from the
    /// exclusive flag
    pub fn unbind(&self, tree: &mut KeyTree, id: BindingId) -> Result<Unbound> {
        let b = self
            .state()
            .bindings
            .remove(&id)
            .ok_or_else(|| OdbError::not_found(format!("binding {id}")))?;
        if b.exclusive && tree.is_same_key(b.dir, b.serial) {
            let flags = tree.key_info(b.dir)?.flags;
            tree.set_flags(b.dir, flags & !FLAG_EXCLUSIVE, false)?;
        }
        debug!(binding = %id, path = %b.path, "Unbound record");
        Ok(Unbound {
            id,
            path: b.path,
            watch: b.watch,
        })
    }

    pub fn owned_by(&self, owner: Owner) -> Vec<BindingId> {
        self.state()
            .bindings
            .iter()
            .filter(|(_, b)| b.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    const LAYOUT: &str = "\
flag = BOOL : y
rate = DOUBLE : 2.5
label = STRING : [16] idle
counts = WORD[3] :
[0] 1
[1] 2
[2] 3
";

    fn tree() -> KeyTree {
        KeyTree::new(Arena::anonymous(64 * 1024).unwrap()).unwrap()
    }

    #[test]
    fn test_layout_uses_natural_alignment() {
        let layout = RecordLayout::new(&schema::parse(LAYOUT).unwrap());
        let offsets: Vec<usize> = layout.fields.iter().map(|f| f.offset).collect();
        // BOOL 4, DOUBLE aligned to 8, STRING 16, WORD[3] aligned to 2
        assert_eq!(offsets, vec![0, 8, 16, 32]);
        assert_eq!(layout.size, 40);
    }

    #[test]
    fn test_bind_creates_missing_subtree() {
        let mut t = tree();
        let binder = RecordBinder::new();
        let fields = schema::parse(LAYOUT).unwrap();
        let (id, _) = binder
            .bind(&mut t, "/eq/settings", &fields, &BindOptions::new(BindMode::Read))
            .unwrap();
        let rate = binder.with_buffer(id, |b| b.get("rate")).unwrap().unwrap();
        assert_eq!(rate, Value::from(2.5));
        let counts = t.find("/eq/settings/counts").unwrap();
        assert_eq!(t.get(counts).unwrap(), Value::UInt16(vec![1, 2, 3]));
    }

    #[test]
    fn test_bind_rejects_conflicting_subtree() {
        let mut t = tree();
        let dir = t.ensure_dir("/r").unwrap();
        t.create(dir, "rate", TypeId::Int32, 1, 0).unwrap();
        let binder = RecordBinder::new();
        let err = binder
            .bind(&mut t, "/r", &schema::parse(LAYOUT).unwrap(), &BindOptions::new(BindMode::Read))
            .unwrap_err();
        match err {
            OdbError::SchemaMismatch { mismatches } => {
                let names: Vec<&str> = mismatches.iter().map(|m| m.name.as_str()).collect();
                assert_eq!(names, vec!["flag", "rate", "label", "counts"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_flush_writes_only_dirty_fields() {
        let mut t = tree();
        let binder = RecordBinder::new();
        let fields = schema::parse(LAYOUT).unwrap();
        let (id, _) = binder
            .bind(&mut t, "/r", &fields, &BindOptions::new(BindMode::Write))
            .unwrap();

        // Someone else changes `rate` behind our back
        let rate = t.find("/r/rate").unwrap();
        t.set(rate, &Value::from(9.0)).unwrap();

        binder
            .with_buffer(id, |b| b.set("label", "running"))
            .unwrap()
            .unwrap();
        assert_eq!(binder.flush(&mut t, id, false).unwrap(), 1);

        let label = t.find("/r/label").unwrap();
        assert_eq!(t.get(label).unwrap(), Value::from("running"));
        assert_eq!(t.get(rate).unwrap(), Value::from(9.0));

        binder.refresh(&t, id).unwrap();
        let local = binder.with_buffer(id, |b| b.get("rate")).unwrap().unwrap();
        assert_eq!(local, Value::from(9.0));
    }

    #[test]
    fn test_read_binding_cannot_flush() {
        let mut t = tree();
        let binder = RecordBinder::new();
        let (id, _) = binder
            .bind(&mut t, "/r", &schema::parse(LAYOUT).unwrap(), &BindOptions::new(BindMode::Read))
            .unwrap();
        assert!(matches!(
            binder.flush(&mut t, id, true),
            Err(OdbError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_exclusive_bind_blocks_other_owners() {
        let mut t = tree();
        let binder = RecordBinder::new();
        let fields = schema::parse(LAYOUT).unwrap();
        let (id, _) = binder
            .bind(&mut t, "/r", &fields, &BindOptions::new(BindMode::Write).exclusive())
            .unwrap();
        let other = BindOptions::new(BindMode::Read).owner(Owner::Connection(3));
        assert!(matches!(
            binder.bind(&mut t, "/r", &fields, &other),
            Err(OdbError::ReadOnly { .. })
        ));

        binder.unbind(&mut t, id).unwrap();
        binder.bind(&mut t, "/r", &fields, &other).unwrap();
        assert_eq!(binder.owned_by(Owner::Connection(3)).len(), 1);
    }

    #[test]
    fn test_buffer_set_rejects_too_many_elements() {
        let layout = Arc::new(RecordLayout::new(&schema::parse(LAYOUT).unwrap()));
        let mut buf = RecordBuffer::new(layout);
        assert!(buf.set("counts", Value::UInt16(vec![1, 2, 3, 4])).is_err());
        assert!(!buf.set("counts", Value::Int32(vec![7])).unwrap());
        assert_eq!(buf.get("counts").unwrap(), Value::UInt16(vec![7, 0, 0]));
        assert!(buf.set("label", "a string far longer than sixteen").unwrap());
        assert_eq!(buf.dirty_fields(), vec!["label".to_string(), "counts".to_string()]);
    }
}
