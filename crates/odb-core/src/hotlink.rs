//! Watches and coalesced change delivery.
//!
//! Nothing is queued per write. Each watch remembers the generation it last
//! delivered; `collect` compares that watermark with the key's generation in
//! the arena and yields at most one notification per watch, carrying the
//! value as it is now. Generations live in shared memory, so a write from any
//! process attached to the arena is seen by every other process's poll.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OdbError, Result};
use crate::export::{self, Node};
use crate::record::BindingId;
use crate::tree::KeyTree;
use crate::types::{KeyInfo, KeyRef, TypeId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Who registered a watch or binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Owner {
    /// This process
    Local,
    /// A bridge connection
    Connection(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Value(Value),
    Tree(Node),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Changed(Payload),
    Deleted,
}

/// One delivery for one watch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub watch_id: WatchId,
    pub path: String,
    pub generation: u64,
    pub event: Event,
}

impl Notification {
    pub fn value(&self) -> Option<&Value> {
        match &self.event {
            Event::Changed(Payload::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.event, Event::Deleted)
    }
}

/// Delivery endpoint for watches owned by something other than a local
/// closure (a bridge connection)
pub trait NotificationSink: Send + Sync {
    /// Hand over a notification; `false` means the peer is gone
    fn deliver(&self, notification: &Notification) -> bool;
}

pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Clone)]
pub enum WatchTarget {
    Local(Callback),
    Sink(Arc<dyn NotificationSink>),
    /// Auto-refresh of a record binding
    Binding(BindingId),
}

impl fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Local(_) => f.write_str("Local"),
            WatchTarget::Sink(_) => f.write_str("Sink"),
            WatchTarget::Binding(id) => write!(f, "Binding({})", id.0),
        }
    }
}

struct Watch {
    path: String,
    key: KeyRef,
    serial: u64,
    recursive: bool,
    owner: Owner,
    target: WatchTarget,
    last_generation: u64,
}

/// A notification ready to hand to its target
pub struct Delivery {
    pub owner: Owner,
    pub target: WatchTarget,
    pub notification: Notification,
}

/// Outcome of [`HotlinkDispatcher::deliver`]
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Bindings whose subtree changed, for the caller to refresh
    pub bindings: Vec<(BindingId, Notification)>,
    pub dropped_owners: Vec<Owner>,
}

#[derive(Default)]
struct DispatchState {
    next_id: u64,
    watches: BTreeMap<WatchId, Watch>,
}

#[derive(Default)]
pub struct HotlinkDispatcher {
    state: Mutex<DispatchState>,
}

fn watched_generation(info: &KeyInfo, recursive: bool) -> u64 {
    if recursive {
        info.subtree_generation
    } else {
        info.generation
    }
}

impl HotlinkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch `path`. The watermark starts at the current generation, so only
    /// later commits fire.
    pub fn register(
        &self,
        tree: &KeyTree,
        path: &str,
        recursive: bool,
        owner: Owner,
        target: WatchTarget,
    ) -> Result<WatchId> {
        let key = tree.find(path)?;
        let info = tree.key_info(key)?;
        let mut state = self.state();
        state.next_id += 1;
        let id = WatchId(state.next_id);
        debug!(watch_id = %id, path, recursive, ?owner, ?target, "Registered watch");
        state.watches.insert(
            id,
            Watch {
                path: path.to_string(),
                key,
                serial: info.serial,
                recursive,
                owner,
                target,
                last_generation: watched_generation(&info, recursive),
            },
        );
        Ok(id)
    }

    pub fn unregister(&self, id: WatchId) -> Result<()> {
        match self.state().watches.remove(&id) {
            Some(w) => {
                debug!(watch_id = %id, path = %w.path, "Unregistered watch");
                Ok(())
            }
            None => Err(OdbError::not_found(format!("watch {id}"))),
        }
    }

    /// Drop every watch of `owner`; returns how many went away
    pub fn remove_owner(&self, owner: Owner) -> usize {
        let mut state = self.state();
        let before = state.watches.len();
        state.watches.retain(|_, w| w.owner != owner);
        before - state.watches.len()
    }

    pub fn len(&self) -> usize {
        self.state().watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_owned_by(&self, owner: Owner) -> usize {
        self.state()
            .watches
            .values()
            .filter(|w| w.owner == owner)
            .count()
    }

    /// Find pending watches; call with the tree at least share-locked.
    ///
    /// Watches on deleted keys yield `Deleted` and are removed.
    pub fn collect(&self, tree: &KeyTree) -> Vec<Delivery> {
        let mut state = self.state();
        let mut out = Vec::new();
        let mut gone = Vec::new();

        for (id, watch) in state.watches.iter_mut() {
            if !tree.is_same_key(watch.key, watch.serial) {
                out.push(Delivery {
                    owner: watch.owner,
                    target: watch.target.clone(),
                    notification: Notification {
                        watch_id: *id,
                        path: watch.path.clone(),
                        generation: tree.arena().commit_gen(),
                        event: Event::Deleted,
                    },
                });
                gone.push(*id);
                continue;
            }
            let info = match tree.key_info(watch.key) {
                Ok(info) => info,
                Err(e) => {
                    warn!(watch_id = %id, path = %watch.path, error = %e, "Watched key unreadable");
                    continue;
                }
            };
            let generation = watched_generation(&info, watch.recursive);
            if generation <= watch.last_generation {
                continue;
            }
            let payload = if info.type_id == TypeId::Key {
                export::export(tree, watch.key).map(Payload::Tree)
            } else {
                tree.get(watch.key).map(Payload::Value)
            };
            match payload {
                Ok(payload) => {
                    watch.last_generation = generation;
                    out.push(Delivery {
                        owner: watch.owner,
                        target: watch.target.clone(),
                        notification: Notification {
                            watch_id: *id,
                            path: watch.path.clone(),
                            generation,
                            event: Event::Changed(payload),
                        },
                    });
                }
                Err(e) => {
                    warn!(watch_id = %id, path = %watch.path, error = %e, "Failed to read watched value")
                }
            }
        }
        for id in gone {
            state.watches.remove(&id);
        }
        out
    }

    /// Run callbacks and sinks. Must be called without the tree lock held.
    ///
    /// A sink that reports its peer gone loses all watches of that owner
    /// and gets nothing further from this batch.
    pub fn deliver(&self, deliveries: Vec<Delivery>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut dead: HashSet<Owner> = HashSet::new();

        for d in deliveries {
            if dead.contains(&d.owner) {
                continue;
            }
            match d.target {
                WatchTarget::Local(cb) => {
                    cb(&d.notification);
                    report.delivered += 1;
                }
                WatchTarget::Sink(sink) => {
                    if sink.deliver(&d.notification) {
                        report.delivered += 1;
                    } else {
                        let removed = self.remove_owner(d.owner);
                        warn!(owner = ?d.owner, removed, "Notification sink gone, dropped its watches");
                        dead.insert(d.owner);
                        report.dropped_owners.push(d.owner);
                    }
                }
                WatchTarget::Binding(id) => {
                    report.delivered += 1;
                    report.bindings.push((id, d.notification));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn tree() -> KeyTree {
        KeyTree::new(Arena::anonymous(64 * 1024).unwrap()).unwrap()
    }

    fn recorder() -> (Callback, Arc<Mutex<Vec<Notification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: Callback = Arc::new(move |n: &Notification| sink.lock().unwrap().push(n.clone()));
        (cb, seen)
    }

    #[test]
    fn test_writes_between_polls_coalesce() {
        let mut t = tree();
        let root = t.root();
        let key = t.create(root, "x", TypeId::Int32, 1, 0).unwrap();
        let hl = HotlinkDispatcher::new();
        let (cb, seen) = recorder();
        hl.register(&t, "/x", false, Owner::Local, WatchTarget::Local(cb)).unwrap();

        for i in 1..=100 {
            t.set(key, &Value::from(i)).unwrap();
        }
        let report = hl.deliver(hl.collect(&t));
        assert_eq!(report.delivered, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value(), Some(&Value::from(100)));

        // Nothing new
        drop(seen);
        assert!(hl.collect(&t).is_empty());
    }

    #[test]
    fn test_recursive_watch_sees_nested_writes() {
        let mut t = tree();
        let dir = t.ensure_dir("/a/b").unwrap();
        let key = t.create(dir, "v", TypeId::Double, 1, 0).unwrap();
        let hl = HotlinkDispatcher::new();
        let (flat_cb, flat) = recorder();
        let (deep_cb, deep) = recorder();
        hl.register(&t, "/a", false, Owner::Local, WatchTarget::Local(flat_cb)).unwrap();
        hl.register(&t, "/a", true, Owner::Local, WatchTarget::Local(deep_cb)).unwrap();

        t.set(key, &Value::from(1.5)).unwrap();
        hl.deliver(hl.collect(&t));
        assert!(flat.lock().unwrap().is_empty());
        let deep = deep.lock().unwrap();
        assert_eq!(deep.len(), 1);
        assert!(matches!(deep[0].event, Event::Changed(Payload::Tree(_))));
    }

    #[test]
    fn test_deleted_key_delivers_deletion_once() {
        let mut t = tree();
        let root = t.root();
        let key = t.create(root, "gone", TypeId::Int32, 1, 0).unwrap();
        let hl = HotlinkDispatcher::new();
        let (cb, seen) = recorder();
        hl.register(&t, "/gone", false, Owner::Local, WatchTarget::Local(cb)).unwrap();

        t.set(key, &Value::from(5)).unwrap();
        t.delete(key, false).unwrap();
        hl.deliver(hl.collect(&t));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_deleted());
        assert!(hl.is_empty());
    }

    struct FlakySink {
        alive: AtomicBool,
        calls: AtomicUsize,
    }

    impl NotificationSink for FlakySink {
        fn deliver(&self, _: &Notification) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_dead_sink_loses_all_its_watches() {
        let mut t = tree();
        let root = t.root();
        let a = t.create(root, "a", TypeId::Int32, 1, 0).unwrap();
        let b = t.create(root, "b", TypeId::Int32, 1, 0).unwrap();
        let sink = Arc::new(FlakySink {
            alive: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let owner = Owner::Connection(7);
        let hl = HotlinkDispatcher::new();
        hl.register(&t, "/a", false, owner, WatchTarget::Sink(sink.clone())).unwrap();
        hl.register(&t, "/b", false, owner, WatchTarget::Sink(sink.clone())).unwrap();
        t.set(a, &Value::from(3)).unwrap();
        t.set(b, &Value::from(4)).unwrap();

        let report = hl.deliver(hl.collect(&t));
        assert_eq!(report.dropped_owners, vec![owner]);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hl.count_owned_by(owner), 0);
        assert_eq!(t.get(a).unwrap(), Value::from(3));
        assert!(hl.unregister(WatchId(1)).is_err());
    }
}
