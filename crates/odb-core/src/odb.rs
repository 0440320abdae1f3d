//! Per-process database handle.
//!
//! `Odb` ties the pieces together: the key tree lives behind the two-level
//! lock, watches and record bindings are process-local tables on top. All
//! path arguments are absolute; value paths may carry a trailing `[i]`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use crate::arena::{Arena, ArenaStats};
use crate::error::{OdbError, Result, Status};
use crate::export::{self, Node, SnapshotFormat};
use crate::hotlink::{Callback, HotlinkDispatcher, Notification, NotificationSink, Owner, WatchId, WatchTarget};
use crate::lock::{ExclusiveGuard, LockManager, SharedGuard};
use crate::record::{BindMode, BindOptions, BindingId, RecordBinder, RecordBuffer, RecordLayout};
use crate::schema::{self, FieldDesc, FieldMismatch};
use crate::tree::{split_parent, KeyTree, TreeStats};
use crate::types::{split_index, KeyInfo, KeyRef, TypeId};
use crate::value::Value;

pub const DEFAULT_CAPACITY: usize = 1024 * 1024;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OdbOptions {
    /// Data bytes of a newly created arena; ignored for existing ones
    pub capacity: usize,
    pub lock_timeout: Duration,
    /// Attach even when the arena fails its checks
    pub allow_corrupted: bool,
    /// Walk the whole arena when attaching
    pub check_on_connect: bool,
    pub client_name: String,
}

impl Default for OdbOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            allow_corrupted: false,
            check_on_connect: true,
            client_name: "odb".to_string(),
        }
    }
}

/// Result of a bounded read
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Value,
    /// `Success` or `Truncated`
    pub status: Status,
}

/// Counts released by [`Odb::release_owner`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released {
    pub watches: usize,
    pub bindings: usize,
}

struct OdbInner {
    lock: LockManager<KeyTree>,
    hotlinks: HotlinkDispatcher,
    records: RecordBinder,
    options: OdbOptions,
    path: Option<PathBuf>,
}

/// Handle to an attached database; clones share the same attachment
#[derive(Clone)]
pub struct Odb {
    inner: Arc<OdbInner>,
    lock_timeout: Duration,
}

enum Attach {
    Create,
    Existing,
    Reset,
}

impl Odb {
    /// Attach to the arena at `path`, creating it if missing
    pub fn open(path: &Path, lock_path: &Path, options: OdbOptions) -> Result<Self> {
        Self::attach(path, lock_path, options, Attach::Create)
    }

    /// Attach to an existing arena only
    pub fn connect(path: &Path, lock_path: &Path, options: OdbOptions) -> Result<Self> {
        Self::attach(path, lock_path, options, Attach::Existing)
    }

    /// Create the arena, discarding any previous contents
    pub fn initialize(path: &Path, lock_path: &Path, options: OdbOptions) -> Result<Self> {
        Self::attach(path, lock_path, options, Attach::Reset)
    }

    /// Private database in anonymous memory
    pub fn in_memory(options: OdbOptions) -> Result<Self> {
        let tree = KeyTree::new(Arena::anonymous(options.capacity)?)?;
        Ok(Self::from_parts(LockManager::new(tree), options, None))
    }

    fn from_parts(lock: LockManager<KeyTree>, options: OdbOptions, path: Option<PathBuf>) -> Self {
        let lock_timeout = options.lock_timeout;
        Self {
            inner: Arc::new(OdbInner {
                lock,
                hotlinks: HotlinkDispatcher::new(),
                records: RecordBinder::new(),
                options,
                path,
            }),
            lock_timeout,
        }
    }

    fn attach(path: &Path, lock_path: &Path, options: OdbOptions, mode: Attach) -> Result<Self> {
        // Hold the inter-process lock while laying out or validating
        let bootstrap = LockManager::with_lock_file((), lock_path)?;
        let guard = bootstrap.write(options.lock_timeout)?;
        let stale = guard.recovered_owner();

        let arena = match mode {
            Attach::Create => Arena::open_or_create(path, options.capacity)?,
            Attach::Existing => Arena::open_existing(path)?,
            Attach::Reset => {
                let mut arena = Arena::open_or_create(path, options.capacity)?;
                if !arena.was_created() {
                    warn!(path = %path.display(), "Discarding previous database contents");
                    arena.reinitialize()?;
                }
                arena
            }
        };
        let tree = if arena.was_created() {
            KeyTree::new(arena)?
        } else {
            Self::validate(arena, &options, stale)?
        };
        drop(guard);

        let stats = tree.arena().stats();
        info!(
            client = %options.client_name,
            path = %path.display(),
            capacity = stats.capacity,
            allocated = stats.allocated,
            "Attached to database"
        );
        let lock = LockManager::with_lock_file(tree, lock_path)?;
        Ok(Self::from_parts(lock, options, Some(path.to_path_buf())))
    }

    fn validate(arena: Arena, options: &OdbOptions, stale: Option<i32>) -> Result<KeyTree> {
        let mut problems = Vec::new();
        if let Err(e) = arena.verify_header() {
            problems.push(e.to_string());
        }
        if arena.is_marked_corrupted() {
            problems.push("arena is flagged corrupted".to_string());
        }
        if !problems.is_empty() && !options.allow_corrupted {
            return Err(OdbError::corrupted(problems.join("; ")));
        }

        let interrupted = arena.interrupted_writer();
        if interrupted {
            warn!("Previous writer stopped mid-mutation; running self-check");
        }
        if let Some(pid) = stale {
            warn!(stale_pid = pid, "Database lock held by a dead process was cleared; running self-check");
        }

        let mut tree = KeyTree::new(arena)?;
        if options.check_on_connect || interrupted || stale.is_some() {
            match tree.check() {
                Ok(stats) => debug!(keys = stats.keys, directories = stats.directories, "Self-check passed"),
                Err(e) => problems.push(e.to_string()),
            }
        }

        if problems.is_empty() {
            if interrupted {
                tree.arena_mut().recover_writer();
            }
            return Ok(tree);
        }
        if options.allow_corrupted {
            warn!(problems = %problems.join("; "), "Attaching to a corrupted database as requested");
            Ok(tree)
        } else {
            error!(problems = %problems.join("; "), "Refusing to attach to a corrupted database");
            Err(OdbError::corrupted(problems.join("; ")))
        }
    }

    /// Same attachment, different lock wait bound
    pub fn with_lock_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: self.inner.clone(),
            lock_timeout: timeout,
        }
    }

    pub fn options(&self) -> &OdbOptions {
        &self.inner.options
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn lock_path(&self) -> Option<&Path> {
        self.inner.lock.lock_path()
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    fn read_tree(&self) -> Result<SharedGuard<'_, KeyTree>> {
        let tree = self.inner.lock.read(self.lock_timeout)?;
        if tree.arena().interrupted_writer() {
            warn!("Found an interrupted mutation under the shared lock; running self-check");
            tree.check()?;
        }
        self.refuse_corrupted(&tree)?;
        Ok(tree)
    }

    fn write_tree(&self) -> Result<ExclusiveGuard<'_, KeyTree>> {
        let mut tree = self.inner.lock.write(self.lock_timeout)?;
        let stale = tree.recovered_owner();
        if stale.is_some() || tree.arena().interrupted_writer() {
            warn!(stale_pid = ?stale, "Recovering from a writer that died holding the lock");
            match tree.check() {
                Ok(_) => tree.arena_mut().recover_writer(),
                Err(e) => {
                    error!(error = %e, "Self-check after lock recovery failed; marking arena corrupted");
                    tree.arena_mut().mark_corrupted();
                }
            }
        }
        self.refuse_corrupted(&tree)?;
        Ok(tree)
    }

    fn refuse_corrupted(&self, tree: &KeyTree) -> Result<()> {
        if tree.arena().is_marked_corrupted() && !self.inner.options.allow_corrupted {
            return Err(OdbError::corrupted("arena is flagged corrupted"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    pub fn find(&self, path: &str) -> Result<KeyRef> {
        self.read_tree()?.find(path)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.find(path) {
            Ok(_) => Ok(true),
            Err(OdbError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Metadata of the key at `path` (links followed)
    pub fn key_info(&self, path: &str) -> Result<KeyInfo> {
        let tree = self.read_tree()?;
        tree.key_info(tree.find(path)?)
    }

    pub fn path_of(&self, key: KeyRef) -> Result<String> {
        self.read_tree()?.path_of(key)
    }

    fn parent_for_create(tree: &mut KeyTree, path: &str) -> Result<(KeyRef, String)> {
        let (parent, name) = split_parent(path)?;
        let name = name.to_string();
        Ok((tree.ensure_dir(parent)?, name))
    }

    /// Create a zeroed key (or a directory), creating missing parents.
    /// On failure no parent is left behind.
    pub fn create(&self, path: &str, ty: TypeId, num_values: usize) -> Result<KeyRef> {
        let mut tree = self.write_tree()?;
        tree.transaction(|t| {
            let (parent, name) = Self::parent_for_create(t, path)?;
            t.create(parent, &name, ty, num_values, 0)
        })
    }

    /// Create a key holding `value`; `item_size` sets the string length
    pub fn create_value(&self, path: &str, value: &Value, item_size: Option<usize>) -> Result<KeyRef> {
        let mut tree = self.write_tree()?;
        tree.transaction(|t| {
            let (parent, name) = Self::parent_for_create(t, path)?;
            t.create_with_value(parent, &name, value, item_size)
        })
    }

    pub fn create_link(&self, path: &str, target: &str) -> Result<KeyRef> {
        let mut tree = self.write_tree()?;
        tree.transaction(|t| {
            let (parent, name) = Self::parent_for_create(t, path)?;
            t.create_link(parent, &name, target)
        })
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        let tree = self.read_tree()?;
        tree.read_link(tree.find_link(path)?)
    }

    /// Delete a key; a link is removed itself, not its target
    pub fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let mut tree = self.write_tree()?;
        let key = tree.find_link(path)?;
        tree.delete(key, recursive)?;
        debug!(path, recursive, "Deleted key");
        Ok(())
    }

    pub fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        let mut tree = self.write_tree()?;
        let key = tree.find_link(path)?;
        tree.rename(key, new_name)
    }

    /// Move a key to `position` among its siblings
    pub fn reorder(&self, path: &str, position: usize) -> Result<()> {
        let mut tree = self.write_tree()?;
        let key = tree.find_link(path)?;
        tree.reorder(key, position)
    }

    pub fn set_flags(&self, path: &str, flags: u32, recursive: bool) -> Result<()> {
        let mut tree = self.write_tree()?;
        let key = tree.find_link(path)?;
        tree.set_flags(key, flags, recursive)
    }

    /// Visible children of a directory, in insertion order
    pub fn enumerate(&self, path: &str) -> Result<Vec<KeyInfo>> {
        let tree = self.read_tree()?;
        let dir = tree.find(path)?;
        tree.enumerate(dir)?
            .into_iter()
            .map(|k| tree.key_info(k))
            .collect()
    }

    /// Child number `index` of a directory, `None` past the end
    pub fn enum_key(&self, path: &str, index: usize) -> Result<Option<KeyInfo>> {
        let tree = self.read_tree()?;
        let dir = tree.find(path)?;
        tree.enum_key(dir, index)?
            .map(|k| tree.key_info(k))
            .transpose()
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Result<Value> {
        let (base, index) = split_index(path)?;
        let tree = self.read_tree()?;
        let key = tree.find(base)?;
        match index {
            Some(i) => tree.get_index(key, i),
            None => tree.get(key),
        }
    }

    /// Read converted to `ty`
    pub fn get_as(&self, path: &str, ty: TypeId) -> Result<Value> {
        self.get(path)?.convert(ty)
    }

    /// Read converted to `ty` into a destination of `max_bytes`. Whatever
    /// fits is returned with status `Truncated` when something was cut.
    pub fn get_with(&self, path: &str, ty: TypeId, max_bytes: usize) -> Result<Fetched> {
        let value = self.get_as(path, ty)?;
        let count = value.len();
        if count == 0 {
            return Ok(Fetched {
                value,
                status: Status::Success,
            });
        }
        if ty == TypeId::String {
            let item_size = max_bytes / count;
            if item_size == 0 {
                return Err(OdbError::Truncated {
                    needed: value.natural_item_size() * count,
                    available: max_bytes,
                });
            }
            if item_size >= value.natural_item_size() {
                return Ok(Fetched {
                    value,
                    status: Status::Success,
                });
            }
            let (bytes, _) = value.encode(item_size);
            return Ok(Fetched {
                value: Value::decode(ty, &bytes, count, item_size)?,
                status: Status::Truncated,
            });
        }
        let fits = max_bytes / ty.fixed_size().unwrap_or(1).max(1);
        if fits >= count {
            return Ok(Fetched {
                value,
                status: Status::Success,
            });
        }
        Ok(Fetched {
            value: value.resized(fits)?,
            status: Status::Truncated,
        })
    }

    /// Read `path`, creating it with `default` when missing. A value key of
    /// an incompatible type is recreated with the default.
    pub fn get_or_create(&self, path: &str, default: &Value) -> Result<Value> {
        let ty = default.type_id();
        let mut tree = self.write_tree()?;
        match tree.find(path) {
            Ok(key) => {
                let info = tree.key_info(key)?;
                if info.type_id == TypeId::Key {
                    return Err(OdbError::TypeMismatch {
                        expected: ty,
                        actual: TypeId::Key,
                    });
                }
                if info.type_id.compatible_with(ty) {
                    return tree.get_as(key, ty);
                }
                warn!(path, found = %info.type_id, wanted = %ty, "Recreating key with requested type");
                tree.replace_with_value(key, default, None)?;
                Ok(default.clone())
            }
            Err(OdbError::NotFound { .. }) => {
                tree.transaction(|t| {
                    let (parent, name) = Self::parent_for_create(t, path)?;
                    t.create_with_value(parent, &name, default, None)
                })?;
                Ok(default.clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Write a value. Missing keys (and parents) are created with the
    /// value's type; `path[i]` writes one element, growing the array.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let (base, index) = split_index(path)?;
        let mut tree = self.write_tree()?;
        match tree.find(base) {
            Ok(key) => match index {
                Some(i) => tree.set_index(key, i, &value),
                None => tree.set(key, &value),
            },
            Err(OdbError::NotFound { .. }) => {
                let value = match index {
                    Some(i) => {
                        let count = i.checked_add(1).unwrap_or(usize::MAX);
                        tree.arena().ensure_room(count, value.natural_item_size().max(1))?;
                        let mut grown = Value::zeroed(value.type_id(), count)?;
                        grown.set_item(i, &value)?;
                        grown
                    }
                    None => value,
                };
                tree.transaction(|t| {
                    let (parent, name) = Self::parent_for_create(t, base)?;
                    t.create_with_value(parent, &name, &value, None)
                })?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Resize an array key, truncating or zero-extending
    pub fn set_num_values(&self, path: &str, num_values: usize) -> Result<()> {
        let mut tree = self.write_tree()?;
        let key = tree.find(path)?;
        tree.set_num_values(key, num_values)
    }

    /// Change the per-element length of a string key
    pub fn set_item_size(&self, path: &str, item_size: usize) -> Result<()> {
        let mut tree = self.write_tree()?;
        let key = tree.find(path)?;
        tree.set_item_size(key, item_size)
    }

    // -----------------------------------------------------------------------
    // Export, import, snapshots
    // -----------------------------------------------------------------------

    pub fn export(&self, path: &str) -> Result<Node> {
        let tree = self.read_tree()?;
        export::export(&tree, tree.find(path)?)
    }

    pub fn export_json(&self, path: &str) -> Result<Json> {
        Ok(self.export(path)?.to_json())
    }

    pub fn import_json(&self, path: &str, json: &Json) -> Result<()> {
        let mut tree = self.write_tree()?;
        tree.transaction(|t| export::import_json(t, path, json))
    }

    pub fn dump(&self, path: &str, format: SnapshotFormat) -> Result<String> {
        let tree = self.read_tree()?;
        export::dump(&tree, tree.find(path)?, format)
    }

    pub fn save(&self, path: &str, file: &Path, format: SnapshotFormat) -> Result<()> {
        let tree = self.read_tree()?;
        export::save(&tree, tree.find(path)?, file, format)
    }

    pub fn load(&self, file: &Path, path: &str) -> Result<()> {
        let mut tree = self.write_tree()?;
        tree.transaction(|t| export::load(t, file, path))
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Make the subtree at `path` match `fields`: missing keys are created,
    /// mismatching ones fixed up keeping values where the type allows, extra
    /// keys removed
    pub fn create_record(&self, path: &str, fields: &[FieldDesc]) -> Result<()> {
        let mut tree = self.write_tree()?;
        tree.transaction(|t| {
            let dir = t.ensure_dir(path)?;
            schema::apply(t, dir, fields)
        })?;
        info!(path, fields = fields.len(), "Applied record structure");
        Ok(())
    }

    /// Itemized differences between `fields` and the subtree at `path`
    pub fn check_record(&self, path: &str, fields: &[FieldDesc]) -> Result<Vec<FieldMismatch>> {
        let tree = self.read_tree()?;
        let actual = schema::schema_of(&tree, tree.find(path)?)?;
        Ok(schema::diff(fields, &actual))
    }

    pub fn bind(&self, path: &str, fields: &[FieldDesc], mode: BindMode) -> Result<BindingId> {
        Ok(self.bind_with(path, fields, BindOptions::new(mode))?.0)
    }

    /// Bind with explicit owner, exclusivity and refresh callback
    pub fn bind_with(
        &self,
        path: &str,
        fields: &[FieldDesc],
        options: BindOptions,
    ) -> Result<(BindingId, Arc<RecordLayout>)> {
        let mut tree = self.write_tree()?;
        let (id, layout) = self.inner.records.bind(&mut tree, path, fields, &options)?;
        let watch = self.inner.hotlinks.register(
            &tree,
            path,
            true,
            options.owner,
            WatchTarget::Binding(id),
        );
        match watch {
            Ok(watch) => self.inner.records.set_watch(id, watch)?,
            Err(e) => {
                if let Err(undo) = self.inner.records.unbind(&mut tree, id) {
                    warn!(binding = %id, error = %undo, "Failed to roll back binding");
                }
                return Err(e);
            }
        }
        Ok((id, layout))
    }

    /// Run `f` on the local buffer of a binding
    pub fn with_record<R>(&self, id: BindingId, f: impl FnOnce(&mut RecordBuffer) -> R) -> Result<R> {
        self.inner.records.with_buffer(id, f)
    }

    /// Copy of the local buffer
    pub fn record(&self, id: BindingId) -> Result<RecordBuffer> {
        self.inner.records.snapshot(id)
    }

    /// Write the dirty fields of a WRITE binding
    pub fn flush(&self, id: BindingId) -> Result<usize> {
        let mut tree = self.write_tree()?;
        self.inner.records.flush(&mut tree, id, false)
    }

    /// Write every field of a WRITE binding
    pub fn flush_all(&self, id: BindingId) -> Result<usize> {
        let mut tree = self.write_tree()?;
        self.inner.records.flush(&mut tree, id, true)
    }

    pub fn refresh(&self, id: BindingId) -> Result<()> {
        let tree = self.read_tree()?;
        self.inner.records.refresh(&tree, id)
    }

    pub fn unbind(&self, id: BindingId) -> Result<()> {
        let mut tree = self.write_tree()?;
        let unbound = self.inner.records.unbind(&mut tree, id)?;
        if let Some(watch) = unbound.watch {
            // Already gone when the subtree was deleted
            let _ = self.inner.hotlinks.unregister(watch);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------------

    /// Call `callback` from [`Odb::poll`] whenever `path` (or, recursive,
    /// anything below it) changed since the previous poll
    pub fn watch(
        &self,
        path: &str,
        recursive: bool,
        callback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> Result<WatchId> {
        let callback: Callback = Arc::new(callback);
        self.watch_target(path, recursive, Owner::Local, WatchTarget::Local(callback))
    }

    /// Forward notifications for `path` to a sink owned by `owner`
    pub fn watch_for(
        &self,
        path: &str,
        recursive: bool,
        owner: Owner,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<WatchId> {
        self.watch_target(path, recursive, owner, WatchTarget::Sink(sink))
    }

    fn watch_target(&self, path: &str, recursive: bool, owner: Owner, target: WatchTarget) -> Result<WatchId> {
        let tree = self.read_tree()?;
        self.inner.hotlinks.register(&tree, path, recursive, owner, target)
    }

    pub fn unwatch(&self, id: WatchId) -> Result<()> {
        self.inner.hotlinks.unregister(id)
    }

    /// Deliver pending notifications. Callbacks run on the calling thread
    /// after the lock is released; bound records are refreshed before their
    /// callbacks. Returns the number of notifications delivered.
    pub fn poll(&self) -> Result<usize> {
        let deliveries = {
            let tree = self.read_tree()?;
            self.inner.hotlinks.collect(&tree)
        };
        if deliveries.is_empty() {
            return Ok(0);
        }
        let report = self.inner.hotlinks.deliver(deliveries);

        for (id, notification) in report.bindings {
            if notification.is_deleted() {
                warn!(binding = %id, path = %notification.path, "Bound subtree was deleted");
                continue;
            }
            if let Err(e) = self.refresh(id) {
                warn!(binding = %id, error = %e, "Automatic record refresh failed");
                continue;
            }
            let callback = self.inner.records.callback(id).ok().flatten();
            if let (Some(cb), Ok(buffer)) = (callback, self.inner.records.snapshot(id)) {
                cb(id, &buffer);
            }
        }
        Ok(report.delivered)
    }

    /// Drop every watch and binding of `owner`; stored data is untouched
    pub fn release_owner(&self, owner: Owner) -> Result<Released> {
        let watches = self.inner.hotlinks.remove_owner(owner);
        let ids = self.inner.records.owned_by(owner);
        let mut first_error = None;
        if !ids.is_empty() {
            match self.write_tree() {
                Ok(mut tree) => {
                    for id in &ids {
                        if let Err(e) = self.inner.records.unbind(&mut tree, *id) {
                            error!(binding = %id, error = %e, "Failed to release binding");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    // The bindings go even without the lock; only their
                    // exclusive flags stay set
                    for id in &ids {
                        self.inner.records.forget(*id);
                    }
                    error!(?owner, error = %e, "Released bindings without clearing exclusive flags");
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let released = Released {
            watches,
            bindings: ids.len(),
        };
        if released != Released::default() {
            debug!(?owner, watches, bindings = ids.len(), "Released owner");
        }
        Ok(released)
    }

    pub fn watch_count(&self) -> usize {
        self.inner.hotlinks.len()
    }

    pub fn binding_count(&self) -> usize {
        self.inner.records.len()
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Full walk of arena and tree. Works on corrupted arenas too.
    pub fn check(&self) -> Result<TreeStats> {
        let tree = self.inner.lock.read(self.lock_timeout)?;
        tree.check()
    }

    /// Clear the corrupted flag, provided a full self-check now passes
    pub fn clear_corrupted(&self) -> Result<TreeStats> {
        let mut tree = self.inner.lock.write(self.lock_timeout)?;
        let stats = tree.check()?;
        if tree.arena().is_marked_corrupted() {
            tree.arena_mut().clear_corrupted();
            info!("Cleared corrupted flag after a clean self-check");
        }
        Ok(stats)
    }

    pub fn stats(&self) -> Result<ArenaStats> {
        Ok(self.read_tree()?.arena().stats())
    }

    /// Push the mapping to its backing file
    pub fn sync(&self) -> Result<()> {
        self.read_tree()?.arena().flush()
    }
}

impl std::fmt::Debug for Odb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Odb")
            .field("path", &self.inner.path)
            .field("client", &self.inner.options.client_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn odb() -> Odb {
        Odb::in_memory(OdbOptions {
            capacity: 64 * 1024,
            ..OdbOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_set_creates_parents_and_indexes() {
        let db = odb();
        db.set("/a/b/c", 5).unwrap();
        assert_eq!(db.get("/a/b/c").unwrap(), Value::from(5));
        db.set("/a/arr[2]", 1.5f32).unwrap();
        assert_eq!(db.get("/a/arr").unwrap(), Value::Float(vec![0.0, 0.0, 1.5]));
        db.set("/a/arr[4]", 2).unwrap();
        assert_eq!(db.get("/a/arr[4]").unwrap(), Value::Float(vec![2.0]));
        assert_eq!(db.key_info("/a/arr").unwrap().num_values, 5);
    }

    #[test]
    fn test_get_with_truncates_strings() {
        let db = odb();
        db.create_value("/s", &Value::from("hello world"), Some(32)).unwrap();
        let full = db.get_with("/s", TypeId::String, 32).unwrap();
        assert_eq!(full.status, Status::Success);
        let cut = db.get_with("/s", TypeId::String, 6).unwrap();
        assert_eq!(cut.status, Status::Truncated);
        assert_eq!(cut.value, Value::from("hello"));
        let unbounded = db.get_with("/s", TypeId::String, usize::MAX).unwrap();
        assert_eq!(unbounded.status, Status::Success);
        assert_eq!(unbounded.value, Value::from("hello world"));
    }

    #[test]
    fn test_get_with_coerces_numbers() {
        let db = odb();
        db.set("/x", Value::Double(vec![2.6, -1.4])).unwrap();
        let got = db.get_with("/x", TypeId::Int32, 4).unwrap();
        assert_eq!(got.value, Value::Int32(vec![3]));
        assert_eq!(got.status, Status::Truncated);
        assert!(matches!(
            db.get_as("/x", TypeId::String),
            Err(OdbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_get_or_create() {
        let db = odb();
        assert_eq!(db.get_or_create("/cfg/n", &Value::from(7)).unwrap(), Value::from(7));
        db.set("/cfg/n", 9).unwrap();
        assert_eq!(db.get_or_create("/cfg/n", &Value::from(7.0)).unwrap(), Value::from(9.0));
        // Incompatible type is recreated
        assert_eq!(
            db.get_or_create("/cfg/n", &Value::from("text")).unwrap(),
            Value::from("text")
        );
        assert_eq!(db.key_info("/cfg/n").unwrap().type_id, TypeId::String);
        assert!(db.get_or_create("/cfg", &Value::from(1)).is_err());
    }

    #[test]
    fn test_delete_twice_is_not_found() {
        let db = odb();
        db.set("/gone", 1).unwrap();
        db.delete("/gone", false).unwrap();
        assert!(matches!(db.delete("/gone", false), Err(OdbError::NotFound { .. })));
    }

    #[test]
    fn test_links_are_transparent() {
        let db = odb();
        db.set("/real/v", 3).unwrap();
        db.create_link("/alias", "/real").unwrap();
        assert_eq!(db.get("/alias/v").unwrap(), Value::from(3));
        db.set("/alias/v", 4).unwrap();
        assert_eq!(db.get("/real/v").unwrap(), Value::from(4));
        assert_eq!(db.read_link("/alias").unwrap(), "/real");
        db.delete("/alias", false).unwrap();
        assert!(db.exists("/real/v").unwrap());
    }

    #[test]
    fn test_watch_and_poll() {
        let db = odb();
        db.set("/w", 0).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        db.watch("/w", false, move |n| {
            sink.lock().unwrap().push(n.value().cloned())
        })
        .unwrap();

        assert_eq!(db.poll().unwrap(), 0);
        db.set("/w", 1).unwrap();
        db.set("/w", 2).unwrap();
        assert_eq!(db.poll().unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Some(Value::from(2))]);
    }

    #[test]
    fn test_callback_may_reenter_database() {
        let db = odb();
        db.set("/src", 0).unwrap();
        let handle = db.clone();
        db.watch("/src", false, move |n| {
            if let Some(v) = n.value() {
                handle.set("/mirror", v.clone()).unwrap();
            }
        })
        .unwrap();
        db.set("/src", 11).unwrap();
        db.poll().unwrap();
        assert_eq!(db.get("/mirror").unwrap(), Value::from(11));
    }

    #[test]
    fn test_release_owner_keeps_data() {
        let db = odb();
        let owner = Owner::Connection(1);
        let fields = schema::parse("a = INT : 1\n").unwrap();
        db.bind_with("/r", &fields, BindOptions::new(BindMode::Read).owner(owner))
            .unwrap();
        assert_eq!(db.watch_count(), 1);
        let released = db.release_owner(owner).unwrap();
        assert_eq!(released, Released { watches: 1, bindings: 1 });
        assert_eq!(db.get("/r/a").unwrap(), Value::from(1));
        assert_eq!(db.binding_count(), 0);
    }
}
