//! Hierarchical key namespace stored in the arena.
//!
//! Every key is a fixed-size [`KeyRecord`] allocation. Directories keep their
//! children as an insertion-ordered singly linked sibling list. Values live
//! in a separate allocation referenced by `data`; that block may relocate on
//! resize, the key record never moves. A [`KeyRef`] is the record's offset.

use std::collections::HashSet;

use tracing::{debug, error, warn};

use crate::arena::{Arena, ArenaStats, BLOCK_HEADER_SIZE};
use crate::error::{OdbError, Result};
use crate::types::{
    validate_name, KeyInfo, KeyRef, TypeId, DEFAULT_STRING_LENGTH, FLAG_HIDDEN, FLAG_READ_ONLY,
    MAX_LINK_DEPTH, NAME_LENGTH,
};
use crate::value::Value;

const KEY_TAG: u32 = 0x4B45_5931; // "KEY1"

/// Upper bound on tree depth, guards parent walks against cycles
const MAX_DEPTH: usize = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyRecord {
    tag: u32,
    ty: u32,
    num_values: u32,
    item_size: u32,
    data: u32,
    parent: u32,
    next: u32,
    first_child: u32,
    last_child: u32,
    num_children: u32,
    flags: u32,
    _pad: u32,
    serial: u64,
    generation: u64,
    subtree_generation: u64,
    name: [u8; NAME_LENGTH],
}

const _: () = assert!(std::mem::size_of::<KeyRecord>() == 104);

impl KeyRecord {
    fn new(name: &str, ty: TypeId, serial: u64) -> Self {
        let mut rec = KeyRecord {
            tag: KEY_TAG,
            ty: ty as u32,
            num_values: 0,
            item_size: 0,
            data: 0,
            parent: 0,
            next: 0,
            first_child: 0,
            last_child: 0,
            num_children: 0,
            flags: 0,
            _pad: 0,
            serial,
            generation: 0,
            subtree_generation: 0,
            name: [0; NAME_LENGTH],
        };
        rec.set_name(name);
        rec
    }

    fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(NAME_LENGTH);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LENGTH];
        let len = name.len().min(NAME_LENGTH - 1);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    fn name_matches(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }

    fn type_id(&self) -> Result<TypeId> {
        TypeId::from_raw(self.ty)
    }

    fn is_dir(&self) -> bool {
        self.ty == TypeId::Key as u32
    }

    fn is_link(&self) -> bool {
        self.ty == TypeId::Link as u32
    }

    fn data_len(&self) -> usize {
        self.num_values as usize * self.item_size as usize
    }
}

/// Result of a full structural walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub keys: usize,
    pub directories: usize,
    pub arena: ArenaStats,
}

/// The key namespace; owns the arena it lives in
pub struct KeyTree {
    arena: Arena,
}

impl KeyTree {
    /// Wrap an arena, creating the root directory on a fresh one
    pub fn new(arena: Arena) -> Result<Self> {
        let mut tree = Self { arena };
        if tree.arena.root() == 0 {
            tree.mutate(|t| {
                let offset = t.arena.allocate(std::mem::size_of::<KeyRecord>())?;
                let serial = t.arena.next_serial();
                t.arena.write(offset as usize, &KeyRecord::new("", TypeId::Key, serial))?;
                t.arena.set_root(offset);
                debug!(root = offset, "Created root directory");
                Ok(())
            })?;
        }
        Ok(tree)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn root(&self) -> KeyRef {
        KeyRef(self.arena.root())
    }

    /// Run a mutation bracketed by the arena write sequence.
    ///
    /// A failed mutation is rolled back from the arena undo journal, so it
    /// leaves no trace. A `Corrupted` failure instead keeps what was written
    /// and sets the arena's corrupted flag. Nested calls join the outer one.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.arena.in_undo() {
            return f(self);
        }
        self.arena.begin_write();
        self.arena.begin_undo();
        let result = f(self);
        match &result {
            Ok(_) => self.arena.discard_undo(),
            Err(OdbError::Corrupted { detail }) => {
                error!(detail = %detail, "Mutation found the arena corrupted");
                self.arena.discard_undo();
                self.arena.mark_corrupted();
            }
            Err(_) => self.arena.rollback(),
        }
        self.arena.end_write();
        result
    }

    /// Run several mutations as one: either all of them stay or none do
    pub fn transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.mutate(f)
    }

    // -----------------------------------------------------------------------
    // Space
    // -----------------------------------------------------------------------

    /// Allocate from the arena. When no free block is large enough but the
    /// free total would be, value blocks are compacted and the request
    /// retried once.
    fn allocate(&mut self, size: usize) -> Result<u32> {
        match self.arena.allocate(size) {
            Err(OdbError::OutOfSpace { .. }) if self.worth_compacting(size) => {
                self.compact()?;
                self.arena.allocate(size)
            }
            other => other,
        }
    }

    /// Resize the value block of `key`, compacting once like [`Self::allocate`]
    fn resize_data(&mut self, key: KeyRef, new_len: usize) -> Result<u32> {
        let data = self.record(key)?.data;
        match self.arena.resize(data, new_len) {
            Err(OdbError::OutOfSpace { .. }) if self.worth_compacting(new_len) => {
                self.compact()?;
                let data = self.record(key)?.data;
                self.arena.resize(data, new_len)
            }
            other => other,
        }
    }

    fn worth_compacting(&self, size: usize) -> bool {
        self.arena.stats().free >= size.saturating_add(BLOCK_HEADER_SIZE)
    }

    /// Move value blocks down into lower free space so what is left free
    /// merges into larger blocks. Key records stay in place. Returns the
    /// number of blocks moved.
    pub fn compact(&mut self) -> Result<usize> {
        self.mutate(|t| {
            let mut moved = 0;
            for key in t.subtree_post_order(t.root())? {
                let mut rec = t.record(key)?;
                let len = rec.data_len();
                if rec.data == 0 || len == 0 {
                    continue;
                }
                let target = match t.arena.allocate(len) {
                    Ok(target) => target,
                    Err(OdbError::OutOfSpace { .. }) => continue,
                    Err(e) => return Err(e),
                };
                if target < rec.data {
                    t.arena.copy(rec.data as usize, target as usize, len)?;
                    t.arena.free(rec.data)?;
                    rec.data = target;
                    t.put(key, &rec)?;
                    moved += 1;
                } else {
                    t.arena.free(target)?;
                }
            }
            debug!(moved, "Compacted value blocks");
            Ok(moved)
        })
    }

    pub(crate) fn record(&self, key: KeyRef) -> Result<KeyRecord> {
        let stale = || OdbError::NotFound {
            path: format!("#{}", key.0),
        };
        if !self.arena.is_live(key.offset()) {
            return Err(stale());
        }
        let rec: KeyRecord = self.arena.read(key.offset())?;
        if rec.tag != KEY_TAG {
            return Err(stale());
        }
        Ok(rec)
    }

    fn put(&mut self, key: KeyRef, rec: &KeyRecord) -> Result<()> {
        self.arena.write(key.offset(), rec)
    }

    fn dir_record(&self, dir: KeyRef) -> Result<KeyRecord> {
        let rec = self.record(dir)?;
        if !rec.is_dir() {
            return Err(OdbError::TypeMismatch {
                expected: TypeId::Key,
                actual: rec.type_id()?,
            });
        }
        Ok(rec)
    }

    /// Check that `key` exists and still carries `serial`
    pub fn is_same_key(&self, key: KeyRef, serial: u64) -> bool {
        matches!(self.record(key), Ok(rec) if rec.serial == serial)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// All children of a directory in insertion order, hidden ones included
    pub fn children(&self, dir: KeyRef) -> Result<Vec<KeyRef>> {
        let rec = self.dir_record(dir)?;
        let count = rec.num_children as usize;
        let mut out = Vec::with_capacity(count);
        let mut cur = rec.first_child;
        while cur != 0 {
            if out.len() >= count {
                return Err(OdbError::corrupted(format!(
                    "sibling list under key {} is longer than its {count} children",
                    dir.0
                )));
            }
            out.push(KeyRef(cur));
            cur = self
                .record(KeyRef(cur))
                .map_err(|_| OdbError::corrupted(format!("dangling sibling link {cur}")))?
                .next;
        }
        if out.len() != count {
            return Err(OdbError::corrupted(format!(
                "key {} lists {} of {count} children",
                dir.0,
                out.len()
            )));
        }
        Ok(out)
    }

    /// Case-insensitive child lookup
    pub fn find_child(&self, dir: KeyRef, name: &str) -> Result<Option<KeyRef>> {
        for child in self.children(dir)? {
            if self.record(child)?.name_matches(name) {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Resolve an absolute path, following links on every component
    pub fn find(&self, path: &str) -> Result<KeyRef> {
        self.resolve(path, true, 0)
    }

    /// Resolve a path without following a link in the last component
    pub fn find_link(&self, path: &str) -> Result<KeyRef> {
        self.resolve(path, false, 0)
    }

    fn resolve(&self, path: &str, follow_last: bool, depth: usize) -> Result<KeyRef> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut cur = self.root();
        for (i, comp) in components.iter().enumerate() {
            if !self.record(cur)?.is_dir() {
                return Err(OdbError::not_found(path));
            }
            let child = self
                .find_child(cur, comp)?
                .ok_or_else(|| OdbError::not_found(path))?;
            let rec = self.record(child)?;
            let is_last = i + 1 == components.len();
            cur = if rec.is_link() && (!is_last || follow_last) {
                if depth >= MAX_LINK_DEPTH {
                    warn!(path, "Link chain exceeds {} hops", MAX_LINK_DEPTH);
                    return Err(OdbError::not_found(path));
                }
                let target = self.link_target(&rec)?;
                self.resolve(&target, true, depth + 1)?
            } else {
                child
            };
        }
        Ok(cur)
    }

    /// Absolute path of a key
    pub fn path_of(&self, key: KeyRef) -> Result<String> {
        let mut names = Vec::new();
        let mut cur = key;
        for _ in 0..MAX_DEPTH {
            let rec = self.record(cur)?;
            if rec.parent == 0 {
                names.reverse();
                return Ok(format!("/{}", names.join("/")));
            }
            names.push(rec.name());
            cur = KeyRef(rec.parent);
        }
        Err(OdbError::corrupted(format!(
            "parent chain of key {} does not reach the root",
            key.0
        )))
    }

    pub fn key_info(&self, key: KeyRef) -> Result<KeyInfo> {
        let rec = self.record(key)?;
        Ok(KeyInfo {
            key,
            name: rec.name(),
            type_id: rec.type_id()?,
            num_values: rec.num_values as usize,
            item_size: rec.item_size as usize,
            flags: rec.flags,
            serial: rec.serial,
            generation: rec.generation,
            subtree_generation: rec.subtree_generation,
            num_children: rec.num_children as usize,
        })
    }

    pub fn parent(&self, key: KeyRef) -> Result<Option<KeyRef>> {
        let rec = self.record(key)?;
        Ok((rec.parent != 0).then_some(KeyRef(rec.parent)))
    }

    /// Visible children of a directory in stable insertion order
    pub fn enumerate(&self, dir: KeyRef) -> Result<Vec<KeyRef>> {
        let mut out = Vec::new();
        for child in self.children(dir)? {
            if self.record(child)?.flags & FLAG_HIDDEN == 0 {
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Restartable cursor over visible children: the `index`-th one, if any
    pub fn enum_key(&self, dir: KeyRef, index: usize) -> Result<Option<KeyRef>> {
        Ok(self.enumerate(dir)?.get(index).copied())
    }

    // -----------------------------------------------------------------------
    // Generations
    // -----------------------------------------------------------------------

    /// Stamp `key` with a new commit generation and roll it up to all
    /// ancestors; with `structural`, the parent's own generation too.
    fn commit(&mut self, key: KeyRef, structural: bool) -> Result<u64> {
        let gen = self.arena.next_commit_gen();
        let mut rec = self.record(key)?;
        rec.generation = gen;
        rec.subtree_generation = gen;
        self.put(key, &rec)?;

        let mut parent = rec.parent;
        let mut first = true;
        let mut hops = 0;
        while parent != 0 {
            hops += 1;
            if hops > MAX_DEPTH {
                return Err(OdbError::corrupted("parent chain does not terminate"));
            }
            let pref = KeyRef(parent);
            let mut p = self.record(pref)?;
            p.subtree_generation = gen;
            if first && structural {
                p.generation = gen;
            }
            first = false;
            self.put(pref, &p)?;
            parent = p.parent;
        }
        Ok(gen)
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Create a key under `parent`.
    ///
    /// `item_size` only matters for strings (0 picks the default length).
    /// Values start zeroed; use [`KeyTree::create_with_value`] for defaults.
    pub fn create(
        &mut self,
        parent: KeyRef,
        name: &str,
        ty: TypeId,
        num_values: usize,
        item_size: usize,
    ) -> Result<KeyRef> {
        self.mutate(|t| t.insert_key(parent, name, ty, num_values, item_size, None))
    }

    /// Create a value key holding `value`
    pub fn create_with_value(
        &mut self,
        parent: KeyRef,
        name: &str,
        value: &Value,
        item_size: Option<usize>,
    ) -> Result<KeyRef> {
        let ty = value.type_id();
        let item_size = item_size.unwrap_or_else(|| value.natural_item_size());
        self.arena.ensure_room(value.len(), item_size)?;
        let (bytes, _) = value.encode(item_size);
        self.mutate(|t| t.insert_key(parent, name, ty, value.len(), item_size, Some(&bytes)))
    }

    fn insert_key(
        &mut self,
        parent: KeyRef,
        name: &str,
        ty: TypeId,
        num_values: usize,
        item_size: usize,
        init: Option<&[u8]>,
    ) -> Result<KeyRef> {
        validate_name(name)?;
        let prec = self.dir_record(parent)?;
        if prec.flags & FLAG_READ_ONLY != 0 {
            return Err(OdbError::ReadOnly {
                path: self.path_of(parent)?,
            });
        }
        if self.find_child(parent, name)?.is_some() {
            return Err(OdbError::AlreadyExists {
                path: join_path(&self.path_of(parent)?, name),
            });
        }

        let (num_values, item_size) = match ty {
            TypeId::Key => (0, 0),
            TypeId::Link => return Err(OdbError::InvalidType(ty as u32)),
            TypeId::String if item_size == 0 => (num_values.max(1), DEFAULT_STRING_LENGTH),
            TypeId::String => (num_values.max(1), item_size),
            TypeId::Blob => (num_values, 1),
            fixed => (num_values.max(1), fixed.fixed_size().unwrap_or(1)),
        };
        self.link_new_key(parent, name, ty, num_values, item_size, init)
    }

    /// Size field for a key record
    fn narrow(&self, n: usize) -> Result<u32> {
        u32::try_from(n).map_err(|_| OdbError::OutOfSpace {
            requested: n,
            largest_free: self.arena.largest_free().unwrap_or(0),
        })
    }

    /// Allocate and link a key record; rolls back its allocations on failure
    fn link_new_key(
        &mut self,
        parent: KeyRef,
        name: &str,
        ty: TypeId,
        num_values: usize,
        item_size: usize,
        init: Option<&[u8]>,
    ) -> Result<KeyRef> {
        let len = self.arena.ensure_room(num_values, item_size)?;
        let num_values = self.narrow(num_values)?;
        let item_size = self.narrow(item_size)?;
        let offset = self.allocate(std::mem::size_of::<KeyRecord>())?;
        let data = if len > 0 {
            match self.allocate(len) {
                Ok(d) => d,
                Err(e) => {
                    self.arena.free(offset)?;
                    return Err(e);
                }
            }
        } else {
            0
        };
        if let (Some(bytes), true) = (init, data != 0) {
            let n = bytes.len().min(len);
            self.arena.bytes_mut(data as usize, n)?.copy_from_slice(&bytes[..n]);
        }

        let serial = self.arena.next_serial();
        let mut rec = KeyRecord::new(name, ty, serial);
        rec.num_values = num_values;
        rec.item_size = item_size;
        rec.data = data;
        rec.parent = parent.0;
        let key = KeyRef(offset);
        self.put(key, &rec)?;

        let mut prec = self.record(parent)?;
        if prec.last_child != 0 {
            let last = KeyRef(prec.last_child);
            let mut lrec = self.record(last)?;
            lrec.next = offset;
            self.put(last, &lrec)?;
        } else {
            prec.first_child = offset;
        }
        prec.last_child = offset;
        prec.num_children += 1;
        self.put(parent, &prec)?;

        self.commit(key, true)?;
        Ok(key)
    }

    /// Create every missing directory on `path`; returns the last one
    pub fn ensure_dir(&mut self, path: &str) -> Result<KeyRef> {
        self.mutate(|t| {
            let mut cur = t.root();
            for comp in path.split('/').filter(|c| !c.is_empty()) {
                cur = match t.find_child(cur, comp)? {
                    Some(child) => {
                        let rec = t.record(child)?;
                        if rec.is_link() {
                            t.find(&t.link_target(&rec)?)?
                        } else {
                            child
                        }
                    }
                    None => t.insert_key(cur, comp, TypeId::Key, 0, 0, None)?,
                };
                let rec = t.record(cur)?;
                if !rec.is_dir() {
                    return Err(OdbError::TypeMismatch {
                        expected: TypeId::Key,
                        actual: rec.type_id()?,
                    });
                }
            }
            Ok(cur)
        })
    }

    /// Keys of the subtree rooted at `key`, children before parents
    fn subtree_post_order(&self, key: KeyRef) -> Result<Vec<KeyRef>> {
        let mut out = Vec::new();
        let mut stack = vec![(key, false)];
        while let Some((k, expanded)) = stack.pop() {
            if expanded {
                out.push(k);
                continue;
            }
            stack.push((k, true));
            if self.record(k)?.is_dir() {
                for child in self.children(k)?.into_iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        Ok(out)
    }

    /// Remove `key` from its parent's child list
    fn unlink(&mut self, key: KeyRef) -> Result<()> {
        let rec = self.record(key)?;
        let parent = KeyRef(rec.parent);
        let mut prec = self.record(parent)?;
        let mut prev = 0u32;
        let mut cur = prec.first_child;
        while cur != 0 && cur != key.0 {
            prev = cur;
            cur = self.record(KeyRef(cur))?.next;
        }
        if cur == 0 {
            return Err(OdbError::corrupted(format!(
                "key {} missing from its parent's child list",
                key.0
            )));
        }
        if prev == 0 {
            prec.first_child = rec.next;
        } else {
            let mut p = self.record(KeyRef(prev))?;
            p.next = rec.next;
            self.put(KeyRef(prev), &p)?;
        }
        if prec.last_child == key.0 {
            prec.last_child = prev;
        }
        prec.num_children -= 1;
        self.put(parent, &prec)?;

        let mut rec = self.record(key)?;
        rec.next = 0;
        self.put(key, &rec)
    }

    /// Insert a detached `key` into its parent's child list at `position`
    fn link_at(&mut self, key: KeyRef, position: usize) -> Result<()> {
        let mut rec = self.record(key)?;
        let parent = KeyRef(rec.parent);
        let siblings = self.children(parent)?;
        let position = position.min(siblings.len());
        let mut prec = self.record(parent)?;

        rec.next = siblings.get(position).map(|k| k.0).unwrap_or(0);
        self.put(key, &rec)?;
        if position == 0 {
            prec.first_child = key.0;
        } else {
            let before = siblings[position - 1];
            let mut b = self.record(before)?;
            b.next = key.0;
            self.put(before, &b)?;
        }
        if position == siblings.len() {
            prec.last_child = key.0;
        }
        prec.num_children += 1;
        self.put(parent, &prec)
    }

    /// Subtree of `key` (post order) after checking none of it is read-only
    fn deletable_subtree(&self, key: KeyRef) -> Result<Vec<KeyRef>> {
        if key == self.root() {
            return Err(OdbError::ReadOnly { path: "/".into() });
        }
        let doomed = self.subtree_post_order(key)?;
        for k in &doomed {
            if self.record(*k)?.flags & FLAG_READ_ONLY != 0 {
                return Err(OdbError::ReadOnly {
                    path: self.path_of(*k)?,
                });
            }
        }
        Ok(doomed)
    }

    fn release_keys(&mut self, doomed: &[KeyRef]) -> Result<()> {
        for k in doomed {
            let r = self.record(*k)?;
            if r.data != 0 {
                self.arena.free(r.data)?;
            }
            self.arena.free(k.0)?;
        }
        Ok(())
    }

    /// Delete a key; directories need `recursive` unless empty.
    ///
    /// The whole subtree is checked before anything is released, so a
    /// read-only key anywhere below leaves the tree untouched.
    pub fn delete(&mut self, key: KeyRef, recursive: bool) -> Result<()> {
        self.mutate(|t| {
            let rec = t.record(key)?;
            let doomed = t.deletable_subtree(key)?;
            if rec.is_dir() && rec.num_children > 0 && !recursive {
                return Err(OdbError::NotEmpty {
                    path: t.path_of(key)?,
                });
            }
            t.unlink(key)?;
            t.release_keys(&doomed)?;
            t.commit(KeyRef(rec.parent), false)?;
            debug!(key = key.0, freed = doomed.len(), "Deleted key");
            Ok(())
        })
    }

    pub fn rename(&mut self, key: KeyRef, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        self.mutate(|t| {
            let mut rec = t.record(key)?;
            if key == t.root() || rec.flags & FLAG_READ_ONLY != 0 {
                return Err(OdbError::ReadOnly {
                    path: t.path_of(key)?,
                });
            }
            let parent = KeyRef(rec.parent);
            if let Some(existing) = t.find_child(parent, new_name)? {
                if existing != key {
                    return Err(OdbError::AlreadyExists {
                        path: join_path(&t.path_of(parent)?, new_name),
                    });
                }
            }
            rec.set_name(new_name);
            t.put(key, &rec)?;
            t.commit(key, true)?;
            Ok(())
        })
    }

    /// Move `key` to `position` among its siblings (clamped to the end)
    pub fn reorder(&mut self, key: KeyRef, position: usize) -> Result<()> {
        self.mutate(|t| {
            if key == t.root() {
                return Err(OdbError::ReadOnly { path: "/".into() });
            }
            t.unlink(key)?;
            t.link_at(key, position)?;
            let parent = KeyRef(t.record(key)?.parent);
            t.commit(parent, false)?;
            Ok(())
        })
    }

    /// Create a link `name` under `parent` pointing at the absolute `target`
    pub fn create_link(&mut self, parent: KeyRef, name: &str, target: &str) -> Result<KeyRef> {
        if !target.starts_with('/') {
            return Err(OdbError::InvalidName {
                name: target.to_string(),
            });
        }
        self.find(target)?;
        let mut bytes = target.as_bytes().to_vec();
        bytes.push(0);
        self.mutate(|t| {
            validate_name(name)?;
            t.dir_record(parent)?;
            if t.find_child(parent, name)?.is_some() {
                return Err(OdbError::AlreadyExists {
                    path: join_path(&t.path_of(parent)?, name),
                });
            }
            t.link_new_key(parent, name, TypeId::Link, 1, bytes.len(), Some(&bytes))
        })
    }

    fn link_target(&self, rec: &KeyRecord) -> Result<String> {
        let raw = self.arena.bytes(rec.data as usize, rec.data_len())?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Target path of a link key
    pub fn read_link(&self, key: KeyRef) -> Result<String> {
        let rec = self.record(key)?;
        if !rec.is_link() {
            return Err(OdbError::TypeMismatch {
                expected: TypeId::Link,
                actual: rec.type_id()?,
            });
        }
        self.link_target(&rec)
    }

    /// Replace the flags of a key, optionally for its whole subtree
    pub fn set_flags(&mut self, key: KeyRef, flags: u32, recursive: bool) -> Result<()> {
        self.mutate(|t| {
            let keys = if recursive {
                t.subtree_post_order(key)?
            } else {
                vec![key]
            };
            for k in keys {
                let mut rec = t.record(k)?;
                rec.flags = flags;
                t.put(k, &rec)?;
                t.commit(k, false)?;
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    /// Raw value of a key in its own type
    pub fn get(&self, key: KeyRef) -> Result<Value> {
        let rec = self.record(key)?;
        let ty = rec.type_id()?;
        if !ty.is_numeric() && !matches!(ty, TypeId::String | TypeId::Blob) {
            return Err(OdbError::TypeMismatch {
                expected: TypeId::Blob,
                actual: ty,
            });
        }
        let len = rec.data_len();
        let bytes = if len == 0 {
            &[][..]
        } else {
            self.arena.bytes(rec.data as usize, len)?
        };
        Value::decode(ty, bytes, rec.num_values as usize, rec.item_size as usize)
    }

    /// Value coerced to `ty`
    pub fn get_as(&self, key: KeyRef, ty: TypeId) -> Result<Value> {
        self.get(key)?.convert(ty)
    }

    /// One element of an array key
    pub fn get_index(&self, key: KeyRef, index: usize) -> Result<Value> {
        let value = self.get(key)?;
        let count = value.len();
        value
            .item(index)
            .ok_or(OdbError::OutOfRange { index, count })
    }

    fn writable_value_record(&self, key: KeyRef) -> Result<(KeyRecord, TypeId)> {
        let rec = self.record(key)?;
        let ty = rec.type_id()?;
        if rec.flags & FLAG_READ_ONLY != 0 {
            return Err(OdbError::ReadOnly {
                path: self.path_of(key)?,
            });
        }
        if rec.is_dir() || rec.is_link() {
            return Err(OdbError::TypeMismatch {
                expected: TypeId::Blob,
                actual: ty,
            });
        }
        Ok((rec, ty))
    }

    fn item_size_for(rec: &KeyRecord, ty: TypeId, value: &Value) -> usize {
        match ty {
            TypeId::String => (rec.item_size as usize).max(value.natural_item_size()),
            TypeId::Blob => 1,
            _ => rec.item_size as usize,
        }
    }

    /// Write `value` (already in the key's type) with `item_size` bytes per
    /// element, resizing the value block when the byte length changes
    fn store(&mut self, key: KeyRef, rec: KeyRecord, value: &Value, item_size: usize) -> Result<()> {
        self.arena.ensure_room(value.len(), item_size)?;
        let (bytes, _) = value.encode(item_size);
        let new_len = bytes.len();
        let mut rec = rec;

        let data = if new_len == 0 {
            if rec.data != 0 {
                self.arena.free(rec.data)?;
            }
            0
        } else if rec.data == 0 {
            self.allocate(new_len)?
        } else if new_len != rec.data_len() {
            self.resize_data(key, new_len)?
        } else {
            rec.data
        };
        if data != 0 {
            self.arena.bytes_mut(data as usize, new_len)?.copy_from_slice(&bytes);
        }
        rec.data = data;
        rec.num_values = self.narrow(value.len())?;
        rec.item_size = self.narrow(item_size)?;
        self.put(key, &rec)
    }

    /// Replace the value of a key. The element count follows `value`; strings
    /// grow their item size when needed.
    pub fn set(&mut self, key: KeyRef, value: &Value) -> Result<()> {
        self.mutate(|t| {
            let (rec, ty) = t.writable_value_record(key)?;
            let value = value.convert(ty)?;
            let item_size = Self::item_size_for(&rec, ty, &value);
            t.store(key, rec, &value, item_size)?;
            t.commit(key, false)?;
            Ok(())
        })
    }

    /// Set one element; an index past the end grows the array with
    /// zero / empty elements
    pub fn set_index(&mut self, key: KeyRef, index: usize, item: &Value) -> Result<()> {
        self.mutate(|t| {
            let (rec, ty) = t.writable_value_record(key)?;
            let item = item.convert(ty)?;
            let count = index.checked_add(1).unwrap_or(usize::MAX);
            t.arena.ensure_room(count, Self::item_size_for(&rec, ty, &item).max(1))?;
            let mut value = t.get(key)?;
            value.set_item(index, &item)?;
            let item_size = Self::item_size_for(&rec, ty, &item);
            t.store(key, rec, &value, item_size)?;
            t.commit(key, false)?;
            Ok(())
        })
    }

    /// Change the element count, truncating or zero-extending
    pub fn set_num_values(&mut self, key: KeyRef, num_values: usize) -> Result<()> {
        self.mutate(|t| {
            let (rec, _) = t.writable_value_record(key)?;
            t.arena.ensure_room(num_values, (rec.item_size as usize).max(1))?;
            let value = t.get(key)?.resized(num_values)?;
            t.store(key, rec, &value, rec.item_size as usize)?;
            t.commit(key, false)?;
            Ok(())
        })
    }

    /// Change the per-element length of a string key, cutting longer values
    pub fn set_item_size(&mut self, key: KeyRef, item_size: usize) -> Result<()> {
        self.mutate(|t| {
            let (rec, ty) = t.writable_value_record(key)?;
            if ty != TypeId::String {
                return Err(OdbError::TypeMismatch {
                    expected: TypeId::String,
                    actual: ty,
                });
            }
            let value = t.get(key)?;
            t.arena.ensure_room(value.len(), item_size)?;
            t.store(key, rec, &value, item_size.max(1))?;
            t.commit(key, false)?;
            Ok(())
        })
    }

    /// Replace a key (and its subtree) by a value key with the same name and
    /// position. The replacement is allocated before the old key is released.
    pub fn replace_with_value(
        &mut self,
        key: KeyRef,
        value: &Value,
        item_size: Option<usize>,
    ) -> Result<KeyRef> {
        let ty = value.type_id();
        let item_size = match ty {
            TypeId::String => item_size.unwrap_or_else(|| value.natural_item_size()),
            other => other.fixed_size().unwrap_or(1),
        };
        self.arena.ensure_room(value.len(), item_size)?;
        let (bytes, _) = value.encode(item_size);
        self.mutate(|t| {
            let rec = t.record(key)?;
            let doomed = t.deletable_subtree(key)?;
            let parent = KeyRef(rec.parent);
            let position = t
                .children(parent)?
                .iter()
                .position(|k| *k == key)
                .unwrap_or(0);
            let new_key =
                t.link_new_key(parent, &rec.name(), ty, value.len(), item_size, Some(&bytes))?;
            t.unlink(key)?;
            t.release_keys(&doomed)?;
            t.unlink(new_key)?;
            t.link_at(new_key, position)?;
            t.commit(new_key, true)?;
            Ok(new_key)
        })
    }

    // -----------------------------------------------------------------------
    // Self-check
    // -----------------------------------------------------------------------

    /// Walk the arena and the whole tree.
    ///
    /// Verifies parent links, name uniqueness, child counts, value blocks and
    /// that every live allocation belongs to exactly one key.
    pub fn check(&self) -> Result<TreeStats> {
        let arena = self.arena.check()?;
        let root = self.root();
        let root_rec = self.record(root).map_err(|_| OdbError::corrupted("root key missing"))?;
        if !root_rec.is_dir() || root_rec.parent != 0 {
            return Err(OdbError::corrupted("root key is not a top-level directory"));
        }

        let mut stats = TreeStats {
            arena,
            ..Default::default()
        };
        let mut blocks = 0usize;
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            stats.directories += 1;
            let mut names = HashSet::new();
            for child in self.children(dir)? {
                let rec = self.record(child)?;
                if rec.parent != dir.0 {
                    return Err(OdbError::corrupted(format!(
                        "key {} claims parent {} but is listed under {}",
                        child.0, rec.parent, dir.0
                    )));
                }
                if !names.insert(rec.name().to_ascii_lowercase()) {
                    return Err(OdbError::corrupted(format!(
                        "duplicate name {:?} under key {}",
                        rec.name(),
                        dir.0
                    )));
                }
                rec.type_id()
                    .map_err(|_| OdbError::corrupted(format!("key {} has type {}", child.0, rec.ty)))?;
                if rec.data != 0 {
                    let size = self.arena.payload_size(rec.data as usize)?;
                    if size < rec.data_len() {
                        return Err(OdbError::corrupted(format!(
                            "value of key {} overruns its block",
                            child.0
                        )));
                    }
                    blocks += 1;
                } else if rec.data_len() != 0 {
                    return Err(OdbError::corrupted(format!(
                        "key {} has a value but no block",
                        child.0
                    )));
                }
                stats.keys += 1;
                if rec.is_dir() {
                    stack.push(child);
                }
            }
            if stats.directories > arena.used_blocks {
                return Err(OdbError::corrupted("directory walk does not terminate"));
            }
        }
        stats.keys += 1;
        blocks += stats.keys;
        if blocks != arena.used_blocks {
            return Err(OdbError::corrupted(format!(
                "{} live allocations but {blocks} owned by keys",
                arena.used_blocks
            )));
        }
        Ok(stats)
    }
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split `/a/b/c` into (`/a/b`, `c`)
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) if pos + 1 < trimmed.len() => {
            let parent = if pos == 0 { "/" } else { &trimmed[..pos] };
            Ok((parent, &trimmed[pos + 1..]))
        }
        _ => Err(OdbError::InvalidName {
            name: path.to_string(),
        }),
    }
}
