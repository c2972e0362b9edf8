//! Nestable lifetime scopes owning native handles.
//!
//! Every native value the managed side creates or receives is registered to
//! exactly one scope. Ending a scope ends its children first, then runs the
//! per-kind destructor of every handle still registered to it, then marks it
//! ended. Destructors never run anywhere else.
//!
//! ## Key Types
//!
//! - [`Context`] - per-thread owner of a scope tree, bound to a [`Runtime`]
//! - [`Lifetime`] - one scope in the tree
//! - [`Handle`] - a registered native value, addressed by generational key
//! - [`RawHandle`] - the bits of a native value plus the kind that selects its destructor
//!
//! Scopes and handles live in generational arenas. A [`ScopeId`] or
//! [`HandleKey`] whose slot has been recycled no longer matches, so any use of
//! an ended scope or a released handle is detected and panics.
//!
//! `Context`, `Lifetime` and `Handle` are `!Send`: one scope tree per thread.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace, warn};

use crate::runtime::Runtime;
use crate::sys::{ConstTypePtr, TypePtr};
use crate::types::VariantType;

/// Words of storage in a [`RawHandle`]; large enough for a Variant.
pub const HANDLE_WORDS: usize = 3;

/// Selects the destructor for a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// A builtin value that owns native memory (string, array, callable, ...).
    Builtin(VariantType),
    /// A full Variant.
    Variant,
    /// An object reference tracked by the ownership tracker.
    Object,
}

/// Raw bits of a native value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawHandle {
    words: [u64; HANDLE_WORDS],
    kind: HandleKind,
}

impl RawHandle {
    /// Zeroed storage for a value of `kind`.
    pub const fn empty(kind: HandleKind) -> Self {
        Self { words: [0; HANDLE_WORDS], kind }
    }

    pub const fn from_words(kind: HandleKind, words: [u64; HANDLE_WORDS]) -> Self {
        Self { words, kind }
    }

    /// Copies `len` bytes of native storage.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `len` bytes and `len <= HANDLE_WORDS * 8`.
    pub unsafe fn from_native(kind: HandleKind, src: ConstTypePtr, len: usize) -> Self {
        debug_assert!(len <= HANDLE_WORDS * 8);
        let mut raw = Self::empty(kind);
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, raw.words.as_mut_ptr() as *mut u8, len) };
        raw
    }

    #[inline]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline]
    pub fn words(&self) -> &[u64; HANDLE_WORDS] {
        &self.words
    }

    #[inline]
    pub fn as_ptr(&self) -> ConstTypePtr {
        self.words.as_ptr() as ConstTypePtr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> TypePtr {
        self.words.as_mut_ptr() as TypePtr
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHandle")
            .field("kind", &self.kind)
            .field("words", &format_args!("{:#x?}", self.words))
            .finish()
    }
}

/// Generational id of a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Generational key of a registered handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleKey {
    index: u32,
    generation: u32,
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Observes whether a scope has ended, from any thread.
#[derive(Clone, Debug)]
pub struct EndSignal(Arc<AtomicBool>);

impl EndSignal {
    pub fn is_ended(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Arena
// ============================================================================

struct ScopeRecord {
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    handles: Vec<HandleKey>,
    signal: Option<Arc<AtomicBool>>,
}

struct ScopeSlot {
    generation: u32,
    record: Option<ScopeRecord>,
}

struct HandleEntry {
    raw: RawHandle,
    owner: ScopeId,
}

struct HandleSlot {
    generation: u32,
    entry: Option<HandleEntry>,
}

/// Scope tree and handle table of one [`Context`].
///
/// A scope's handle list may hold keys that were moved out or released; they
/// are skipped on end because the handle slot no longer names that scope.
#[derive(Default)]
pub(crate) struct LifetimeArena {
    scopes: Vec<ScopeSlot>,
    free_scopes: Vec<u32>,
    handles: Vec<HandleSlot>,
    free_handles: Vec<u32>,
}

impl LifetimeArena {
    pub(crate) fn open(&mut self, parent: Option<ScopeId>) -> ScopeId {
        if let Some(parent) = parent {
            self.live_scope(parent);
        }
        let record = ScopeRecord { parent, children: Vec::new(), handles: Vec::new(), signal: None };
        let id = if let Some(index) = self.free_scopes.pop() {
            let slot = &mut self.scopes[index as usize];
            slot.record = Some(record);
            ScopeId { index, generation: slot.generation }
        } else {
            let index = self.scopes.len() as u32;
            self.scopes.push(ScopeSlot { generation: 0, record: Some(record) });
            ScopeId { index, generation: 0 }
        };
        if let Some(parent) = parent {
            self.live_scope(parent).children.push(id);
        }
        id
    }

    pub(crate) fn is_live(&self, scope: ScopeId) -> bool {
        self.scopes
            .get(scope.index as usize)
            .is_some_and(|slot| slot.generation == scope.generation && slot.record.is_some())
    }

    fn live_scope(&mut self, scope: ScopeId) -> &mut ScopeRecord {
        match self.scopes.get_mut(scope.index as usize) {
            Some(slot) if slot.generation == scope.generation => match slot.record.as_mut() {
                Some(record) => record,
                None => panic!("scope {scope} used after it ended"),
            },
            _ => panic!("scope {scope} used after it ended"),
        }
    }

    pub(crate) fn register(&mut self, scope: ScopeId, raw: RawHandle) -> HandleKey {
        self.live_scope(scope);
        let entry = HandleEntry { raw, owner: scope };
        let key = if let Some(index) = self.free_handles.pop() {
            let slot = &mut self.handles[index as usize];
            slot.entry = Some(entry);
            HandleKey { index, generation: slot.generation }
        } else {
            let index = self.handles.len() as u32;
            self.handles.push(HandleSlot { generation: 0, entry: Some(entry) });
            HandleKey { index, generation: 0 }
        };
        self.live_scope(scope).handles.push(key);
        trace!("registered {:?} handle {key} in scope {scope}", raw.kind());
        key
    }

    fn entry(&self, key: HandleKey) -> Option<&HandleEntry> {
        let slot = self.handles.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn raw(&self, key: HandleKey) -> Option<RawHandle> {
        self.entry(key).map(|entry| entry.raw)
    }

    pub(crate) fn owner(&self, key: HandleKey) -> Option<ScopeId> {
        self.entry(key).map(|entry| entry.owner)
    }

    pub(crate) fn store(&mut self, key: HandleKey, raw: RawHandle) {
        if let Some(slot) = self.handles.get_mut(key.index as usize)
            && slot.generation == key.generation
            && let Some(entry) = slot.entry.as_mut()
        {
            entry.raw = raw;
        }
    }

    /// Moves a handle to `to`. With `from` given, the handle must be owned by it.
    pub(crate) fn transfer(&mut self, key: HandleKey, from: Option<ScopeId>, to: ScopeId) {
        if let Some(from) = from {
            self.live_scope(from);
        }
        self.live_scope(to);
        let owner = match self.owner(key) {
            Some(owner) => owner,
            None => panic!("handle {key} used after it was released"),
        };
        if let Some(from) = from
            && owner != from
        {
            panic!("handle {key} is owned by scope {owner}, not {from}");
        }
        if owner == to {
            return;
        }
        if let Some(entry) = self.handles[key.index as usize].entry.as_mut() {
            entry.owner = to;
        }
        self.live_scope(to).handles.push(key);
        trace!("moved handle {key} from scope {owner} to {to}");
    }

    /// Removes a handle without running its destructor.
    pub(crate) fn detach(&mut self, key: HandleKey) -> RawHandle {
        let entry = self
            .handles
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| {
                let entry = slot.entry.take()?;
                slot.generation = slot.generation.wrapping_add(1);
                Some(entry)
            });
        match entry {
            Some(entry) => {
                self.free_handles.push(key.index);
                entry.raw
            }
            None => panic!("handle {key} released twice"),
        }
    }

    /// Ends `scope` and its descendants, returning the handles to destroy.
    ///
    /// Descendant handles come first, so a child's handles are always
    /// destroyed before its parent's.
    pub(crate) fn end(&mut self, scope: ScopeId) -> Vec<RawHandle> {
        let record = match self.take_scope(scope) {
            Some(record) => record,
            None => panic!("scope {scope} ended twice"),
        };
        if let Some(parent) = record.parent
            && self.is_live(parent)
        {
            self.live_scope(parent).children.retain(|child| *child != scope);
        }
        let mut released = Vec::new();
        self.collect(scope, record, &mut released);
        released
    }

    fn take_scope(&mut self, scope: ScopeId) -> Option<ScopeRecord> {
        let slot = self.scopes.get_mut(scope.index as usize)?;
        if slot.generation != scope.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_scopes.push(scope.index);
        Some(record)
    }

    fn collect(&mut self, scope: ScopeId, record: ScopeRecord, out: &mut Vec<RawHandle>) {
        for child in record.children {
            if let Some(child_record) = self.take_scope(child) {
                self.collect(child, child_record, out);
            }
        }
        for key in record.handles {
            if self.owner(key) == Some(scope) {
                out.push(self.detach(key));
            }
        }
        if let Some(signal) = record.signal {
            signal.store(true, Ordering::Release);
        }
    }

    fn signal(&mut self, scope: ScopeId) -> EndSignal {
        let record = self.live_scope(scope);
        let flag = record.signal.get_or_insert_with(|| Arc::new(AtomicBool::new(false)));
        EndSignal(Arc::clone(flag))
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.handles.iter().filter(|slot| slot.entry.is_some()).count()
    }
}

// ============================================================================
// Context / Lifetime / Handle
// ============================================================================

pub(crate) struct ContextInner {
    runtime: Arc<Runtime>,
    arena: RefCell<LifetimeArena>,
}

impl ContextInner {
    fn destroy_all(&self, released: Vec<RawHandle>) {
        for raw in released {
            self.runtime.release_handle(raw);
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let live = self.arena.get_mut().live_handles();
        if live > 0 {
            warn!("context dropped with {live} native handles still registered");
        }
    }
}

/// Per-thread owner of a scope tree.
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { inner: Rc::new(ContextInner { runtime, arena: RefCell::new(LifetimeArena::default()) }) }
    }

    /// Opens a new root scope.
    pub fn scope(&self) -> Lifetime {
        let id = self.inner.arena.borrow_mut().open(None);
        Lifetime { ctx: Rc::clone(&self.inner), id }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.inner.runtime
    }

    /// Number of handles registered across every live scope.
    pub fn live_handles(&self) -> usize {
        self.inner.arena.borrow().live_handles()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("live_handles", &self.live_handles()).finish()
    }
}

/// One scope in a [`Context`]'s tree.
///
/// Clones refer to the same scope. Ending it through any clone ends it for all.
#[derive(Clone)]
pub struct Lifetime {
    ctx: Rc<ContextInner>,
    id: ScopeId,
}

impl Lifetime {
    /// Opens a child scope. It ends no later than this one.
    pub fn child(&self) -> Lifetime {
        let id = self.ctx.arena.borrow_mut().open(Some(self.id));
        Lifetime { ctx: Rc::clone(&self.ctx), id }
    }

    #[inline]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.ctx.runtime
    }

    pub fn is_ended(&self) -> bool {
        !self.ctx.arena.borrow().is_live(self.id)
    }

    /// Attaches a native value to this scope.
    ///
    /// # Panics
    ///
    /// If the scope has ended.
    pub fn register(&self, raw: RawHandle) -> Handle {
        let key = self.ctx.arena.borrow_mut().register(self.id, raw);
        Handle { ctx: Rc::clone(&self.ctx), key }
    }

    /// Ends this scope and all of its descendants, destroying their handles.
    ///
    /// # Panics
    ///
    /// If the scope has already ended, including by a parent's end.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn end(&self) {
        let released = self.ctx.arena.borrow_mut().end(self.id);
        debug!("ended scope {} releasing {} handles", self.id, released.len());
        self.ctx.destroy_all(released);
    }

    /// Moves `handle` from this scope to `to`.
    ///
    /// # Panics
    ///
    /// If either scope has ended or `handle` is not owned by this scope.
    pub fn transfer(&self, handle: &Handle, to: &Lifetime) {
        assert!(Rc::ptr_eq(&self.ctx, &to.ctx), "scopes belong to different contexts");
        self.ctx.arena.borrow_mut().transfer(handle.key, Some(self.id), to.id);
    }

    /// A thread-safe flag that turns true when this scope ends.
    pub fn signal(&self) -> EndSignal {
        self.ctx.arena.borrow_mut().signal(self.id)
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime").field("id", &self.id).field("ended", &self.is_ended()).finish()
    }
}

/// A native value registered to a scope.
pub struct Handle {
    ctx: Rc<ContextInner>,
    key: HandleKey,
}

impl Handle {
    #[inline]
    pub fn key(&self) -> HandleKey {
        self.key
    }

    pub fn is_live(&self) -> bool {
        self.ctx.arena.borrow().raw(self.key).is_some()
    }

    /// Scope currently owning the handle.
    pub fn owner(&self) -> Option<ScopeId> {
        self.ctx.arena.borrow().owner(self.key)
    }

    /// Current bits of the value.
    ///
    /// # Panics
    ///
    /// If the owning scope has ended or the handle was released.
    pub fn raw(&self) -> RawHandle {
        match self.ctx.arena.borrow().raw(self.key) {
            Some(raw) => raw,
            None => panic!("handle {} used after its scope ended", self.key),
        }
    }

    /// Runs `f` on a pointer to the value's storage and keeps any change it makes.
    pub fn with_mut<R>(&self, f: impl FnOnce(TypePtr) -> R) -> R {
        let mut raw = self.raw();
        let result = f(raw.as_mut_ptr());
        self.ctx.arena.borrow_mut().store(self.key, raw);
        result
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.ctx.runtime
    }

    /// Moves the handle into `to`, whichever scope currently owns it.
    pub fn move_to(&self, to: &Lifetime) {
        assert!(Rc::ptr_eq(&self.ctx, &to.ctx), "scopes belong to different contexts");
        self.ctx.arena.borrow_mut().transfer(self.key, None, to.id);
    }

    /// Destroys the value now instead of at scope end.
    pub fn release(self) {
        let raw = self.ctx.arena.borrow_mut().detach(self.key);
        self.ctx.runtime.release_handle(raw);
    }

    /// Unregisters the value without destroying it; the caller takes over.
    pub fn detach(self) -> RawHandle {
        self.ctx.arena.borrow_mut().detach(self.key)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("key", &self.key).field("live", &self.is_live()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(word: u64) -> RawHandle {
        RawHandle::from_words(HandleKind::Builtin(VariantType::String), [word, 0, 0])
    }

    fn first_words(handles: &[RawHandle]) -> Vec<u64> {
        handles.iter().map(|h| h.words()[0]).collect()
    }

    #[test]
    fn end_returns_every_registered_handle_once() {
        let mut arena = LifetimeArena::default();
        let scope = arena.open(None);
        for i in 1..=5 {
            arena.register(scope, raw(i));
        }
        let mut released = first_words(&arena.end(scope));
        released.sort();
        assert_eq!(released, vec![1, 2, 3, 4, 5]);
        assert_eq!(arena.live_handles(), 0);
    }

    #[test]
    fn children_release_before_parent() {
        let mut arena = LifetimeArena::default();
        let parent = arena.open(None);
        arena.register(parent, raw(1));
        let child = arena.open(Some(parent));
        arena.register(child, raw(2));
        let grandchild = arena.open(Some(child));
        arena.register(grandchild, raw(3));

        let released = first_words(&arena.end(parent));
        assert_eq!(released, vec![3, 2, 1]);
        assert!(!arena.is_live(child));
        assert!(!arena.is_live(grandchild));
    }

    #[test]
    fn ending_child_unlinks_it_from_parent() {
        let mut arena = LifetimeArena::default();
        let parent = arena.open(None);
        let child = arena.open(Some(parent));
        arena.register(child, raw(7));
        assert_eq!(first_words(&arena.end(child)), vec![7]);
        assert!(arena.end(parent).is_empty());
    }

    #[test]
    #[should_panic(expected = "ended twice")]
    fn double_end_panics() {
        let mut arena = LifetimeArena::default();
        let scope = arena.open(None);
        arena.end(scope);
        arena.end(scope);
    }

    #[test]
    #[should_panic(expected = "ended twice")]
    fn ending_child_after_parent_panics() {
        let mut arena = LifetimeArena::default();
        let parent = arena.open(None);
        let child = arena.open(Some(parent));
        arena.end(parent);
        arena.end(child);
    }

    #[test]
    #[should_panic(expected = "used after it ended")]
    fn register_on_ended_scope_panics() {
        let mut arena = LifetimeArena::default();
        let scope = arena.open(None);
        arena.end(scope);
        arena.register(scope, raw(1));
    }

    #[test]
    fn recycled_scope_slot_does_not_revive_old_id() {
        let mut arena = LifetimeArena::default();
        let old = arena.open(None);
        arena.end(old);
        let new = arena.open(None);
        assert_ne!(old, new);
        assert!(!arena.is_live(old));
        assert!(arena.is_live(new));
    }

    #[test]
    fn transfer_moves_ownership() {
        let mut arena = LifetimeArena::default();
        let inner = arena.open(None);
        let outer = arena.open(None);
        let key = arena.register(inner, raw(9));
        arena.transfer(key, Some(inner), outer);
        assert!(arena.end(inner).is_empty());
        assert_eq!(first_words(&arena.end(outer)), vec![9]);
    }

    #[test]
    fn transfer_back_and_forth_releases_once() {
        let mut arena = LifetimeArena::default();
        let a = arena.open(None);
        let b = arena.open(None);
        let key = arena.register(a, raw(4));
        arena.transfer(key, Some(a), b);
        arena.transfer(key, Some(b), a);
        assert!(arena.end(b).is_empty());
        assert_eq!(first_words(&arena.end(a)), vec![4]);
    }

    #[test]
    #[should_panic(expected = "not")]
    fn transfer_from_wrong_scope_panics() {
        let mut arena = LifetimeArena::default();
        let a = arena.open(None);
        let b = arena.open(None);
        let key = arena.register(a, raw(1));
        arena.transfer(key, Some(b), a);
    }

    #[test]
    #[should_panic(expected = "used after it ended")]
    fn transfer_into_ended_scope_panics() {
        let mut arena = LifetimeArena::default();
        let a = arena.open(None);
        let b = arena.open(None);
        let key = arena.register(a, raw(1));
        arena.end(b);
        arena.transfer(key, Some(a), b);
    }

    #[test]
    fn detached_handle_is_skipped_on_end() {
        let mut arena = LifetimeArena::default();
        let scope = arena.open(None);
        let key = arena.register(scope, raw(1));
        arena.register(scope, raw(2));
        assert_eq!(arena.detach(key).words()[0], 1);
        assert_eq!(first_words(&arena.end(scope)), vec![2]);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_detach_panics() {
        let mut arena = LifetimeArena::default();
        let scope = arena.open(None);
        let key = arena.register(scope, raw(1));
        arena.detach(key);
        arena.detach(key);
    }

    #[test]
    fn end_signal_flips_on_cascade() {
        let mut arena = LifetimeArena::default();
        let parent = arena.open(None);
        let child = arena.open(Some(parent));
        let signal = arena.signal(child);
        assert!(!signal.is_ended());
        arena.end(parent);
        assert!(signal.is_ended());
    }

    #[test]
    fn store_updates_live_bits() {
        let mut arena = LifetimeArena::default();
        let scope = arena.open(None);
        let key = arena.register(scope, raw(1));
        arena.store(key, raw(2));
        assert_eq!(arena.raw(key).map(|r| r.words()[0]), Some(2));
    }
}
