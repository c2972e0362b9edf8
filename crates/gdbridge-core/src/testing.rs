//! In-process fake engine for tests and benches.
//!
//! [`FakeEngine`] implements [`NativeApi`] over plain Rust data so the binding
//! layer can be exercised without a host process. It models what the binding
//! layer relies on and nothing more:
//!
//! - Handle-backed builtins live in leaked cells that are marked destroyed
//!   (never freed), so tests can assert exactly-once destruction; a second
//!   destroy panics.
//! - A Variant is `[tag, payload, payload]`; values wider than 16 bytes are boxed.
//! - Objects carry a class, an instance id, a reference count and instance
//!   bindings; extension classes registered through the class database are
//!   constructed through their creation callbacks.
//! - Engine methods are closures over [`FakeValue`] with a declared signature,
//!   so the checked call path reports argument errors like the engine does.
//!
//! Constructors and other bare function pointers allocate from the heap of the
//! most recent `FakeEngine` created on the current thread.

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::api::NativeApi;
use crate::error::CallError;
use crate::lifetime::{HandleKind, RawHandle};
use crate::runtime::{LibraryToken, Runtime};
use crate::sys::*;
use crate::types::{InitializationLevel, Operator, VARIANT_TYPE_COUNT, VariantType};

/// Hash under which the fake registers the `absi` utility function.
pub const ABSI_HASH: i64 = 2157319888;

/// Hash tests use for engine methods they define themselves.
pub const PAIR_HASH: i64 = 0x5a1a;

const REF_COUNTED_HASH: i64 = 2240911060;
const GET_REFERENCE_COUNT_HASH: i64 = 3905245786;

type Words = [u64; 3];

/// Simplified engine value used by fake method bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Object(usize),
}

type MethodBody = dyn Fn(ObjectPtr, &[FakeValue]) -> Option<FakeValue> + Send + Sync;

struct FakeMethod {
    name: String,
    hash: i64,
    params: Vec<VariantType>,
    ret: Option<VariantType>,
    body: Box<MethodBody>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tag_of(words: &Words) -> VariantType {
    VariantType::try_from(words[0] as u32).unwrap_or(VariantType::Nil)
}

fn tag(ty: VariantType) -> u64 {
    u64::from(u32::from(ty))
}

fn is_boxed(ty: VariantType) -> bool {
    ty.native_size() > 16
}

fn is_text(ty: VariantType) -> bool {
    matches!(ty, VariantType::String | VariantType::StringName | VariantType::NodePath)
}

// ============================================================================
// Builtin cells
// ============================================================================

#[derive(Default)]
struct Heap {
    live: AtomicUsize,
}

thread_local! {
    static CURRENT_HEAP: RefCell<Option<Arc<Heap>>> = const { RefCell::new(None) };
}

fn current_heap() -> Arc<Heap> {
    match CURRENT_HEAP.with(|heap| heap.borrow().clone()) {
        Some(heap) => heap,
        None => panic!("fake engine: no FakeEngine created on this thread"),
    }
}

type List = Arc<Mutex<Vec<Words>>>;
type Map = Arc<Mutex<Vec<(Words, Words)>>>;

enum Data {
    Text(String),
    List(List),
    Map(Map),
    Opaque,
}

struct Cell {
    heap: Arc<Heap>,
    kind: VariantType,
    destroyed: AtomicBool,
    data: Mutex<Data>,
}

fn new_cell(heap: &Arc<Heap>, kind: VariantType, data: Data) -> u64 {
    heap.live.fetch_add(1, Ordering::Relaxed);
    let cell = Cell { heap: Arc::clone(heap), kind, destroyed: AtomicBool::new(false), data: Mutex::new(data) };
    Box::into_raw(Box::new(cell)) as u64
}

fn default_data(kind: VariantType) -> Data {
    match kind {
        kind if is_text(kind) => Data::Text(String::new()),
        VariantType::Array => Data::List(Arc::default()),
        VariantType::Dictionary => Data::Map(Arc::default()),
        _ => Data::Opaque,
    }
}

/// # Safety
///
/// `word` must come from [`new_cell`].
unsafe fn cell<'a>(word: u64) -> &'a Cell {
    match unsafe { (word as *const Cell).as_ref() } {
        Some(cell) => {
            assert!(!cell.destroyed.load(Ordering::Relaxed), "fake engine: {} used after destroy", cell.kind);
            cell
        }
        None => panic!("fake engine: null builtin value"),
    }
}

unsafe fn copy_cell(word: u64, kind: VariantType) -> u64 {
    let src = unsafe { cell(word) };
    let data = match &*lock(&src.data) {
        Data::Text(text) => Data::Text(text.clone()),
        Data::List(list) => Data::List(Arc::clone(list)),
        Data::Map(map) => Data::Map(Arc::clone(map)),
        Data::Opaque => Data::Opaque,
    };
    new_cell(&src.heap, kind, data)
}

unsafe fn destroy_cell(word: u64) {
    let cell = match unsafe { (word as *const Cell).as_ref() } {
        Some(cell) => cell,
        None => return,
    };
    if cell.destroyed.swap(true, Ordering::Relaxed) {
        panic!("fake engine: {} destroyed twice", cell.kind);
    }
    cell.heap.live.fetch_sub(1, Ordering::Relaxed);
    let data = std::mem::replace(&mut *lock(&cell.data), Data::Opaque);
    match data {
        Data::List(list) if Arc::strong_count(&list) == 1 => {
            for mut element in lock(&list).drain(..) {
                unsafe { destroy_variant(&mut element) };
            }
        }
        Data::Map(map) if Arc::strong_count(&map) == 1 => {
            for (mut key, mut value) in lock(&map).drain(..) {
                unsafe {
                    destroy_variant(&mut key);
                    destroy_variant(&mut value);
                }
            }
        }
        _ => {}
    }
}

unsafe fn cell_text(word: u64) -> String {
    match &*lock(unsafe { &cell(word).data }) {
        Data::Text(text) => text.clone(),
        _ => String::new(),
    }
}

unsafe fn cell_list(word: u64) -> List {
    match &*lock(unsafe { &cell(word).data }) {
        Data::List(list) => Arc::clone(list),
        _ => panic!("fake engine: not an array"),
    }
}

unsafe fn cell_map(word: u64) -> Map {
    match &*lock(unsafe { &cell(word).data }) {
        Data::Map(map) => Arc::clone(map),
        _ => panic!("fake engine: not a dictionary"),
    }
}

fn leak_bytes(src: *const u8, len: usize) -> u64 {
    let mut bytes = vec![0u8; 64].into_boxed_slice();
    unsafe { ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), len) };
    Box::into_raw(bytes) as *mut u8 as u64
}

// ============================================================================
// Objects
// ============================================================================

struct FakeObject {
    id: u64,
    class: Mutex<String>,
    ref_counted: bool,
    refcount: AtomicI64,
    destroyed: AtomicBool,
    instance: Mutex<Option<(usize, Option<FreeInstanceFn>, usize)>>,
    bindings: Mutex<Vec<(usize, usize, &'static RawInstanceBindingCallbacks)>>,
}

unsafe fn object<'a>(ptr: usize) -> &'a FakeObject {
    match unsafe { (ptr as *const FakeObject).as_ref() } {
        Some(object) => object,
        None => panic!("fake engine: null object"),
    }
}

fn counted(object: ObjectPtr) -> &'static FakeObject {
    unsafe { self::object(object as usize) }
}

unsafe fn object_reference(ptr: usize) {
    let object = unsafe { object(ptr) };
    if object.ref_counted {
        object.refcount.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe fn object_unreference(ptr: usize) {
    let object = unsafe { object(ptr) };
    if object.ref_counted && object.refcount.fetch_sub(1, Ordering::Relaxed) == 1 {
        unsafe { destroy_fake_object(ptr) };
    }
}

unsafe fn destroy_fake_object(ptr: usize) {
    let object = unsafe { object(ptr) };
    if object.destroyed.swap(true, Ordering::Relaxed) {
        panic!("fake engine: object {} destroyed twice", object.id);
    }
    let bindings = std::mem::take(&mut *lock(&object.bindings));
    for (token, binding, callbacks) in bindings {
        if let Some(free) = callbacks.free_callback {
            unsafe { free(token as *mut c_void, ptr as *mut c_void, binding as *mut c_void) };
        }
    }
    let instance = lock(&object.instance).take();
    if let Some((instance, Some(free), userdata)) = instance {
        unsafe { free(userdata as *mut c_void, instance as ClassInstancePtr) };
    }
}

// ============================================================================
// Variants
// ============================================================================

unsafe fn copy_variant(src: &Words) -> Words {
    let ty = tag_of(src);
    match ty {
        ty if ty.needs_destructor() => [src[0], unsafe { copy_cell(src[1], ty) }, 0],
        VariantType::Object => {
            if src[1] != 0 {
                unsafe { object_reference(src[1] as usize) };
            }
            *src
        }
        ty if is_boxed(ty) => [src[0], leak_bytes(src[1] as *const u8, ty.native_size()), 0],
        _ => *src,
    }
}

unsafe fn destroy_variant(words: &mut Words) {
    match tag_of(words) {
        ty if ty.needs_destructor() => unsafe { destroy_cell(words[1]) },
        VariantType::Object if words[1] != 0 => unsafe { object_unreference(words[1] as usize) },
        _ => {}
    }
    *words = [0; 3];
}

unsafe fn read_value(words: &Words) -> Option<FakeValue> {
    Some(match tag_of(words) {
        VariantType::Nil => FakeValue::Nil,
        VariantType::Bool => FakeValue::Bool(words[1] & 0xff != 0),
        VariantType::Int => FakeValue::Int(words[1] as i64),
        VariantType::Float => FakeValue::Float(f64::from_bits(words[1])),
        ty if is_text(ty) => FakeValue::Text(unsafe { cell_text(words[1]) }),
        VariantType::Object => FakeValue::Object(words[1] as usize),
        _ => return None,
    })
}

fn value_type(value: &FakeValue) -> VariantType {
    match value {
        FakeValue::Nil => VariantType::Nil,
        FakeValue::Bool(_) => VariantType::Bool,
        FakeValue::Int(_) => VariantType::Int,
        FakeValue::Float(_) => VariantType::Float,
        FakeValue::Text(_) => VariantType::String,
        FakeValue::Object(_) => VariantType::Object,
    }
}

fn value_words(heap: &Arc<Heap>, value: &FakeValue) -> Words {
    match value {
        FakeValue::Nil => [0; 3],
        FakeValue::Bool(b) => [tag(VariantType::Bool), u64::from(*b), 0],
        FakeValue::Int(i) => [tag(VariantType::Int), *i as u64, 0],
        FakeValue::Float(f) => [tag(VariantType::Float), f.to_bits(), 0],
        FakeValue::Text(text) => [tag(VariantType::String), new_cell(heap, VariantType::String, Data::Text(text.clone())), 0],
        FakeValue::Object(ptr) => {
            if *ptr != 0 {
                unsafe { object_reference(*ptr) };
            }
            [tag(VariantType::Object), *ptr as u64, 0]
        }
    }
}

unsafe fn variants_equal(a: &Words, b: &Words) -> bool {
    match unsafe { (read_value(a), read_value(b)) } {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

unsafe fn stringify(words: &Words) -> String {
    let ty = tag_of(words);
    match unsafe { read_value(words) } {
        Some(FakeValue::Nil) => "<null>".to_string(),
        Some(FakeValue::Bool(b)) => b.to_string(),
        Some(FakeValue::Int(i)) => i.to_string(),
        Some(FakeValue::Float(f)) => f.to_string(),
        Some(FakeValue::Text(text)) => text,
        Some(FakeValue::Object(ptr)) if ptr != 0 => format!("<Object#{}>", unsafe { object(ptr) }.id),
        Some(FakeValue::Object(_)) => "<null>".to_string(),
        None if ty == VariantType::Array => {
            let list = unsafe { cell_list(words[1]) };
            let items: Vec<String> = lock(&list).iter().map(|item| unsafe { stringify(item) }).collect();
            format!("[{}]", items.join(", "))
        }
        None => ty.name().to_string(),
    }
}

fn evaluate(op: Operator, left: &FakeValue, right: &FakeValue) -> Option<FakeValue> {
    use FakeValue::*;
    Some(match (left, right) {
        (Int(a), Int(b)) => match op {
            Operator::Equal => Bool(a == b),
            Operator::NotEqual => Bool(a != b),
            Operator::Less => Bool(a < b),
            Operator::LessEqual => Bool(a <= b),
            Operator::Greater => Bool(a > b),
            Operator::GreaterEqual => Bool(a >= b),
            Operator::Add => Int(a.wrapping_add(*b)),
            Operator::Subtract => Int(a.wrapping_sub(*b)),
            Operator::Multiply => Int(a.wrapping_mul(*b)),
            Operator::Divide if *b != 0 => Int(a / b),
            _ => return None,
        },
        (Int(_) | Float(_), Int(_) | Float(_)) => {
            let as_float = |value: &FakeValue| match value {
                Int(i) => *i as f64,
                Float(f) => *f,
                _ => 0.0,
            };
            let (a, b) = (as_float(left), as_float(right));
            match op {
                Operator::Equal => Bool(a == b),
                Operator::NotEqual => Bool(a != b),
                Operator::Less => Bool(a < b),
                Operator::Greater => Bool(a > b),
                Operator::Add => Float(a + b),
                Operator::Subtract => Float(a - b),
                Operator::Multiply => Float(a * b),
                Operator::Divide => Float(a / b),
                _ => return None,
            }
        }
        (Text(a), Text(b)) => match op {
            Operator::Equal => Bool(a == b),
            Operator::NotEqual => Bool(a != b),
            Operator::Add => Text(format!("{a}{b}")),
            _ => return None,
        },
        (_, _) => match op {
            Operator::Equal => Bool(left == right),
            Operator::NotEqual => Bool(left != right),
            _ => return None,
        },
    })
}

// ============================================================================
// Function pointers handed out by the fake
// ============================================================================

macro_rules! type_table {
    ($f:ident: $fnty:ty) => {
        type_table!(@ $f: $fnty; 0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31 32 33 34 35 36 37)
    };
    (@ $f:ident: $fnty:ty; $($n:literal)*) => {
        [$($f::<$n> as $fnty),*]
    };
}

const FROM_TYPE: [VariantFromTypeFn; VARIANT_TYPE_COUNT] = type_table!(from_type: VariantFromTypeFn);
const TO_TYPE: [TypeFromVariantFn; VARIANT_TYPE_COUNT] = type_table!(to_type: TypeFromVariantFn);
const DEFAULT_CONSTRUCTORS: [PtrConstructor; VARIANT_TYPE_COUNT] = type_table!(construct_default: PtrConstructor);
const COPY_CONSTRUCTORS: [PtrConstructor; VARIANT_TYPE_COUNT] = type_table!(construct_copy: PtrConstructor);
const STRING_CONSTRUCTORS: [PtrConstructor; VARIANT_TYPE_COUNT] = type_table!(construct_from_string: PtrConstructor);

fn type_from_const(code: u32) -> VariantType {
    VariantType::try_from(code).unwrap_or(VariantType::Nil)
}

unsafe extern "C" fn from_type<const T: u32>(r_variant: VariantPtr, native: TypePtr) {
    let ty = type_from_const(T);
    let words = match ty {
        ty if ty.needs_destructor() => [tag(ty), unsafe { copy_cell(*(native as *const u64), ty) }, 0],
        VariantType::Object => {
            let ptr = unsafe { *(native as *const usize) };
            if ptr != 0 {
                unsafe { object_reference(ptr) };
            }
            [tag(ty), ptr as u64, 0]
        }
        ty if is_boxed(ty) => [tag(ty), leak_bytes(native as *const u8, ty.native_size()), 0],
        ty => {
            let mut words = [tag(ty), 0, 0];
            unsafe { ptr::copy_nonoverlapping(native as *const u8, words[1..].as_mut_ptr() as *mut u8, ty.native_size()) };
            words
        }
    };
    unsafe { ptr::write_unaligned(r_variant as *mut Words, words) };
}

unsafe extern "C" fn to_type<const T: u32>(r_native: TypePtr, variant: VariantPtr) {
    let ty = type_from_const(T);
    let words = unsafe { ptr::read_unaligned(variant as *const Words) };
    match ty {
        ty if ty.needs_destructor() => {
            let copy = unsafe { copy_cell(words[1], ty) };
            unsafe { ptr::write_bytes(r_native as *mut u8, 0, ty.native_size()) };
            unsafe { ptr::write_unaligned(r_native as *mut u64, copy) };
        }
        VariantType::Object => unsafe { ptr::write_unaligned(r_native as *mut usize, words[1] as usize) },
        ty if is_boxed(ty) => unsafe {
            ptr::copy_nonoverlapping(words[1] as *const u8, r_native as *mut u8, ty.native_size())
        },
        ty => unsafe { ptr::copy_nonoverlapping(words[1..].as_ptr() as *const u8, r_native as *mut u8, ty.native_size()) },
    }
}

unsafe extern "C" fn construct_default<const T: u32>(r_base: TypePtr, _args: *const ConstTypePtr) {
    let ty = type_from_const(T);
    let word = new_cell(&current_heap(), ty, default_data(ty));
    unsafe {
        ptr::write_bytes(r_base as *mut u8, 0, ty.native_size());
        ptr::write_unaligned(r_base as *mut u64, word);
    }
}

unsafe extern "C" fn construct_copy<const T: u32>(r_base: TypePtr, args: *const ConstTypePtr) {
    let ty = type_from_const(T);
    unsafe {
        let src = ptr::read_unaligned(*args as *const u64);
        ptr::write_bytes(r_base as *mut u8, 0, ty.native_size());
        ptr::write_unaligned(r_base as *mut u64, copy_cell(src, ty));
    }
}

unsafe extern "C" fn construct_from_string<const T: u32>(r_base: TypePtr, args: *const ConstTypePtr) {
    let ty = type_from_const(T);
    unsafe {
        let src = ptr::read_unaligned(*args as *const u64);
        let heap = Arc::clone(&cell(src).heap);
        let word = new_cell(&heap, ty, Data::Text(cell_text(src)));
        ptr::write_unaligned(r_base as *mut u64, word);
    }
}

unsafe extern "C" fn destroy_builtin(base: TypePtr) {
    unsafe { destroy_cell(ptr::read_unaligned(base as *const u64)) }
}

unsafe extern "C" fn string_length(base: TypePtr, _args: *const ConstTypePtr, ret: TypePtr, _argc: i32) {
    unsafe {
        let text = cell_text(ptr::read_unaligned(base as *const u64));
        ptr::write_unaligned(ret as *mut i64, text.chars().count() as i64);
    }
}

unsafe extern "C" fn array_size(base: TypePtr, _args: *const ConstTypePtr, ret: TypePtr, _argc: i32) {
    unsafe {
        let list = cell_list(ptr::read_unaligned(base as *const u64));
        ptr::write_unaligned(ret as *mut i64, lock(&list).len() as i64);
    }
}

unsafe extern "C" fn array_append(base: TypePtr, args: *const ConstTypePtr, _ret: TypePtr, _argc: i32) {
    unsafe {
        let list = cell_list(ptr::read_unaligned(base as *const u64));
        let value = ptr::read_unaligned(*args as *const Words);
        lock(&list).push(copy_variant(&value));
    }
}

unsafe extern "C" fn dictionary_size(base: TypePtr, _args: *const ConstTypePtr, ret: TypePtr, _argc: i32) {
    unsafe {
        let map = cell_map(ptr::read_unaligned(base as *const u64));
        ptr::write_unaligned(ret as *mut i64, lock(&map).len() as i64);
    }
}

unsafe extern "C" fn dictionary_has(base: TypePtr, args: *const ConstTypePtr, ret: TypePtr, _argc: i32) {
    unsafe {
        let map = cell_map(ptr::read_unaligned(base as *const u64));
        let key = ptr::read_unaligned(*args as *const Words);
        let found = lock(&map).iter().any(|(k, _)| variants_equal(k, &key));
        ptr::write(ret as *mut u8, u8::from(found));
    }
}

unsafe extern "C" fn absi(ret: TypePtr, args: *const ConstTypePtr, _argc: i32) {
    unsafe {
        let value = ptr::read_unaligned(*args as *const i64);
        ptr::write_unaligned(ret as *mut i64, value.wrapping_abs());
    }
}

macro_rules! ptr_operators {
    ($($name:ident: $ty:ty => $out:ty = |$a:ident, $b:ident| $body:expr;)*) => {
        $(
            unsafe extern "C" fn $name(left: ConstTypePtr, right: ConstTypePtr, result: TypePtr) {
                unsafe {
                    let $a = ptr::read_unaligned(left as *const $ty);
                    let $b = ptr::read_unaligned(right as *const $ty);
                    let value: $out = $body;
                    ptr::write_unaligned(result as *mut $out, value);
                }
            }
        )*
    };
}

ptr_operators! {
    int_equal: i64 => u8 = |a, b| u8::from(a == b);
    int_not_equal: i64 => u8 = |a, b| u8::from(a != b);
    int_less: i64 => u8 = |a, b| u8::from(a < b);
    int_greater: i64 => u8 = |a, b| u8::from(a > b);
    int_add: i64 => i64 = |a, b| a.wrapping_add(b);
    int_subtract: i64 => i64 = |a, b| a.wrapping_sub(b);
    int_multiply: i64 => i64 = |a, b| a.wrapping_mul(b);
    float_add: f64 => f64 = |a, b| a + b;
    float_less: f64 => u8 = |a, b| u8::from(a < b);
}

fn ptr_operator(op: Operator, ty: VariantType) -> Option<PtrOperatorEvaluator> {
    let evaluator: PtrOperatorEvaluator = match (op, ty) {
        (Operator::Equal, VariantType::Int) => int_equal,
        (Operator::NotEqual, VariantType::Int) => int_not_equal,
        (Operator::Less, VariantType::Int) => int_less,
        (Operator::Greater, VariantType::Int) => int_greater,
        (Operator::Add, VariantType::Int) => int_add,
        (Operator::Subtract, VariantType::Int) => int_subtract,
        (Operator::Multiply, VariantType::Int) => int_multiply,
        (Operator::Add, VariantType::Float) => float_add,
        (Operator::Less, VariantType::Float) => float_less,
        _ => return None,
    };
    Some(evaluator)
}

// ============================================================================
// Class database
// ============================================================================

struct ExtensionMethod {
    name: String,
    userdata: usize,
    call: Option<MethodCallFn>,
    ptrcall: Option<MethodPtrCallFn>,
    argument_count: u32,
    has_return: bool,
    flags: u32,
}

struct ExtensionClass {
    userdata: usize,
    is_virtual: bool,
    create: Option<CreateInstanceFn>,
    free: Option<FreeInstanceFn>,
    get_virtual: Option<GetVirtualFn>,
    methods: Vec<ExtensionMethod>,
    properties: Vec<(String, VariantType, String, String)>,
    signals: Vec<(String, usize)>,
}

struct ClassInfo {
    parent: Option<String>,
    ref_counted: bool,
    tag: usize,
    extension: Option<ExtensionClass>,
}

/// What the fake class database recorded for an extension class.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredClass {
    pub parent: String,
    pub is_virtual: bool,
    pub methods: Vec<String>,
    pub properties: Vec<(String, VariantType, String, String)>,
    pub signals: Vec<(String, usize)>,
}

/// Method metadata recorded at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredMethod {
    pub argument_count: u32,
    pub has_return: bool,
    pub flags: u32,
}

struct State {
    heap: Arc<Heap>,
    classes: Mutex<FxHashMap<String, ClassInfo>>,
    methods: Mutex<FxHashMap<(String, String), usize>>,
    objects: Mutex<FxHashMap<u64, usize>>,
    singletons: Mutex<FxHashMap<String, usize>>,
    next_id: AtomicU64,
    withheld: Mutex<Vec<VariantType>>,
    messages: Mutex<Vec<String>>,
    calls: Mutex<FxHashMap<String, usize>>,
}

/// In-process stand-in for the engine. Clones share state.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<State>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// A fresh engine with `Object`, `RefCounted`, `Resource`, `Node`,
    /// `Node2D` and an `Engine` singleton.
    pub fn new() -> Self {
        let heap = Arc::new(Heap::default());
        CURRENT_HEAP.with(|current| *current.borrow_mut() = Some(Arc::clone(&heap)));
        let engine = Self {
            state: Arc::new(State {
                heap,
                classes: Mutex::default(),
                methods: Mutex::default(),
                objects: Mutex::default(),
                singletons: Mutex::default(),
                next_id: AtomicU64::new(1000),
                withheld: Mutex::default(),
                messages: Mutex::default(),
                calls: Mutex::default(),
            }),
        };
        engine.define_class("Object", None, false);
        engine.define_class("RefCounted", Some("Object"), true);
        engine.define_class("Resource", Some("RefCounted"), true);
        engine.define_class("Node", Some("Object"), false);
        engine.define_class("Node2D", Some("Node"), false);
        engine.define_class("Engine", Some("Object"), false);

        engine.define_method("RefCounted", "init_ref", REF_COUNTED_HASH, &[], Some(VariantType::Bool), move |obj, _| {
            counted(obj).refcount.store(1, Ordering::Relaxed);
            Some(FakeValue::Bool(true))
        });
        engine.define_method("RefCounted", "reference", REF_COUNTED_HASH, &[], Some(VariantType::Bool), move |obj, _| {
            counted(obj).refcount.fetch_add(1, Ordering::Relaxed);
            Some(FakeValue::Bool(true))
        });
        engine.define_method("RefCounted", "unreference", REF_COUNTED_HASH, &[], Some(VariantType::Bool), move |obj, _| {
            let previous = counted(obj).refcount.fetch_sub(1, Ordering::Relaxed);
            Some(FakeValue::Bool(previous == 1))
        });
        engine.define_method(
            "RefCounted",
            "get_reference_count",
            GET_REFERENCE_COUNT_HASH,
            &[],
            Some(VariantType::Int),
            move |obj, _| Some(FakeValue::Int(counted(obj).refcount.load(Ordering::Relaxed))),
        );

        let singleton = engine.construct("Engine");
        lock(&engine.state.singletons).insert("Engine".to_string(), singleton as usize);
        engine
    }

    /// A runtime linked through the scene level.
    pub fn runtime(&self) -> Arc<Runtime> {
        let runtime = self.unlinked_runtime();
        for level in [InitializationLevel::Core, InitializationLevel::Servers, InitializationLevel::Scene] {
            if let Err(err) = runtime.link(level) {
                panic!("fake engine failed to link {level}: {err}");
            }
        }
        runtime
    }

    /// A runtime that has not linked any level.
    pub fn unlinked_runtime(&self) -> Arc<Runtime> {
        Runtime::new(self.clone(), LibraryToken::new(ptr::dangling_mut()))
    }

    pub fn define_class(&self, name: &str, parent: Option<&str>, ref_counted: bool) {
        let tag = Box::into_raw(Box::new(name.to_string())) as usize;
        let info = ClassInfo { parent: parent.map(str::to_string), ref_counted, tag, extension: None };
        lock(&self.state.classes).insert(name.to_string(), info);
    }

    /// Defines an engine method callable through method binds.
    pub fn define_method(
        &self,
        class: &str,
        name: &str,
        hash: i64,
        params: &[VariantType],
        ret: Option<VariantType>,
        body: impl Fn(ObjectPtr, &[FakeValue]) -> Option<FakeValue> + Send + Sync + 'static,
    ) {
        let method =
            FakeMethod { name: name.to_string(), hash, params: params.to_vec(), ret, body: Box::new(body) };
        let ptr = Box::into_raw(Box::new(method)) as usize;
        lock(&self.state.methods).insert((class.to_string(), name.to_string()), ptr);
    }

    pub fn remove_method(&self, class: &str, name: &str) {
        lock(&self.state.methods).remove(&(class.to_string(), name.to_string()));
    }

    /// Makes the Variant converters for `ty` unresolvable.
    pub fn withhold_conversion(&self, ty: VariantType) {
        lock(&self.state.withheld).push(ty);
    }

    /// Messages printed through the engine's error and warning functions.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.state.messages).clone()
    }

    /// Builtin values constructed and not yet destroyed.
    pub fn live_values(&self) -> usize {
        self.state.heap.live.load(Ordering::Relaxed)
    }

    /// Whether the native value behind `raw` has been destroyed.
    pub fn is_destroyed(&self, raw: &RawHandle) -> bool {
        let words = raw.words();
        let cell_word = match raw.kind() {
            HandleKind::Builtin(_) => words[0],
            HandleKind::Variant if tag_of(words).needs_destructor() => words[1],
            HandleKind::Variant => return false,
            HandleKind::Object => return self.is_object_destroyed(words[0] as ObjectPtr),
        };
        match unsafe { (cell_word as *const Cell).as_ref() } {
            Some(cell) => cell.destroyed.load(Ordering::Relaxed),
            None => false,
        }
    }

    pub fn construct(&self, class: &str) -> ObjectPtr {
        match CString::new(class) {
            Ok(name) => self.classdb_construct_object(&name),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Deletes an object from the engine side.
    pub fn destroy_object(&self, object: ObjectPtr) {
        unsafe { destroy_fake_object(object as usize) }
    }

    pub fn is_object_destroyed(&self, object: ObjectPtr) -> bool {
        unsafe { self::object(object as usize) }.destroyed.load(Ordering::Relaxed)
    }

    pub fn reference_count(&self, object: ObjectPtr) -> i64 {
        unsafe { self::object(object as usize) }.refcount.load(Ordering::Relaxed)
    }

    pub fn class_of(&self, object: ObjectPtr) -> String {
        lock(&unsafe { self::object(object as usize) }.class).clone()
    }

    /// The extension instance bound to `object`, or null.
    pub fn instance_of(&self, object: ObjectPtr) -> ClassInstancePtr {
        match *lock(&unsafe { self::object(object as usize) }.instance) {
            Some((instance, _, _)) => instance as ClassInstancePtr,
            None => ptr::null_mut(),
        }
    }

    /// How many times an engine method named `name` ran.
    pub fn call_count(&self, name: &str) -> usize {
        lock(&self.state.calls).get(name).copied().unwrap_or(0)
    }

    pub fn registered_class(&self, name: &str) -> Option<RegisteredClass> {
        let classes = lock(&self.state.classes);
        let info = classes.get(name)?;
        let extension = info.extension.as_ref()?;
        Some(RegisteredClass {
            parent: info.parent.clone().unwrap_or_default(),
            is_virtual: extension.is_virtual,
            methods: extension.methods.iter().map(|m| m.name.clone()).collect(),
            properties: extension.properties.clone(),
            signals: extension.signals.clone(),
        })
    }

    pub fn registered_method(&self, class: &str, method: &str) -> Option<RegisteredMethod> {
        let classes = lock(&self.state.classes);
        let extension = classes.get(class)?.extension.as_ref()?;
        let method = extension.methods.iter().find(|m| m.name == method)?;
        Some(RegisteredMethod { argument_count: method.argument_count, has_return: method.has_return, flags: method.flags })
    }

    /// Invokes a virtual override the way the engine does. `false` if the
    /// object's class does not override `name`.
    pub fn call_virtual(&self, object: ObjectPtr, name: &str, args: &[ConstTypePtr], ret: TypePtr) -> bool {
        let fake = unsafe { self::object(object as usize) };
        let class = lock(&fake.class).clone();
        let Some((instance, _, _)) = *lock(&fake.instance) else {
            return false;
        };
        let Some((userdata, get_virtual)) = self.extension_lookup(&class, |ext| ext.get_virtual.map(|f| (ext.userdata, f)))
        else {
            return false;
        };
        let Ok(name) = CString::new(name) else {
            return false;
        };
        match unsafe { get_virtual(userdata as *mut c_void, name.as_ptr()) } {
            Some(call) => {
                let args = if args.is_empty() { ptr::null() } else { args.as_ptr() };
                unsafe { call(instance as ClassInstancePtr, args, ret) };
                true
            }
            None => false,
        }
    }

    /// Calls a registered extension method through its Variant entry point.
    pub fn call_method(&self, object: ObjectPtr, name: &str, args: &[ConstVariantPtr], ret: VariantPtr) -> RawCallError {
        let (instance, userdata, call) = self.method_entry(object, name, |m| m.call.map(|f| (m.userdata, f)));
        let mut error = RawCallError::default();
        let args_ptr = if args.is_empty() { ptr::null() } else { args.as_ptr() };
        unsafe { call(userdata as *mut c_void, instance, args_ptr, args.len() as Int, ret, &mut error) };
        error
    }

    /// Calls a registered extension method through its pointer-call entry point.
    pub fn ptrcall_method(&self, object: ObjectPtr, name: &str, args: &[ConstTypePtr], ret: TypePtr) {
        let (instance, userdata, ptrcall) = self.method_entry(object, name, |m| m.ptrcall.map(|f| (m.userdata, f)));
        let args_ptr = if args.is_empty() { ptr::null() } else { args.as_ptr() };
        unsafe { ptrcall(userdata as *mut c_void, instance, args_ptr, ret) };
    }

    fn method_entry<F: Copy>(
        &self,
        object: ObjectPtr,
        name: &str,
        select: impl Fn(&ExtensionMethod) -> Option<(usize, F)>,
    ) -> (ClassInstancePtr, usize, F) {
        let fake = unsafe { self::object(object as usize) };
        let class = lock(&fake.class).clone();
        let instance = match *lock(&fake.instance) {
            Some((instance, _, _)) => instance as ClassInstancePtr,
            None => ptr::null_mut(),
        };
        let found = self.extension_lookup(&class, |ext| ext.methods.iter().find(|m| m.name == name).and_then(&select));
        match found {
            Some((userdata, function)) => (instance, userdata, function),
            None => panic!("fake engine: {class} has no extension method {name}"),
        }
    }

    /// Walks `class` and its ancestors until `f` finds something in an extension class.
    fn extension_lookup<R>(&self, class: &str, f: impl Fn(&ExtensionClass) -> Option<R>) -> Option<R> {
        let classes = lock(&self.state.classes);
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            let info = classes.get(&name)?;
            if let Some(found) = info.extension.as_ref().and_then(&f) {
                return Some(found);
            }
            current = info.parent.clone();
        }
        None
    }

    fn inherits(&self, class: &str, ancestor: &str) -> bool {
        let classes = lock(&self.state.classes);
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = classes.get(&name).and_then(|info| info.parent.clone());
        }
        false
    }

    fn method(&self, class: &str, name: &str) -> Option<&'static FakeMethod> {
        let classes = lock(&self.state.classes);
        let methods = lock(&self.state.methods);
        let mut current = Some(class.to_string());
        while let Some(class) = current {
            if let Some(ptr) = methods.get(&(class.clone(), name.to_string())) {
                return unsafe { (*ptr as *const FakeMethod).as_ref() };
            }
            current = classes.get(&class).and_then(|info| info.parent.clone());
        }
        None
    }

    fn count_call(&self, method: &FakeMethod) {
        *lock(&self.state.calls).entry(method.name.clone()).or_default() += 1;
    }

    fn record_message(&self, prefix: &str, description: &CStr) {
        lock(&self.state.messages).push(format!("{prefix}: {}", description.to_string_lossy()));
    }

    unsafe fn read_native(&self, ty: VariantType, src: ConstTypePtr) -> FakeValue {
        unsafe {
            match ty {
                VariantType::Bool => FakeValue::Bool(ptr::read(src as *const u8) != 0),
                VariantType::Int => FakeValue::Int(ptr::read_unaligned(src as *const i64)),
                VariantType::Float => FakeValue::Float(ptr::read_unaligned(src as *const f64)),
                ty if is_text(ty) => FakeValue::Text(cell_text(ptr::read_unaligned(src as *const u64))),
                VariantType::Object => FakeValue::Object(ptr::read_unaligned(src as *const usize)),
                VariantType::Nil => read_value(&ptr::read_unaligned(src as *const Words)).unwrap_or(FakeValue::Nil),
                ty => panic!("fake engine: methods cannot take {ty}"),
            }
        }
    }

    unsafe fn write_native(&self, ty: VariantType, value: &FakeValue, dst: TypePtr) {
        unsafe {
            match (ty, value) {
                (VariantType::Bool, FakeValue::Bool(b)) => ptr::write(dst as *mut u8, u8::from(*b)),
                (VariantType::Int, FakeValue::Int(i)) => ptr::write_unaligned(dst as *mut i64, *i),
                (VariantType::Float, FakeValue::Float(f)) => ptr::write_unaligned(dst as *mut f64, *f),
                (VariantType::String, FakeValue::Text(text)) => {
                    let word = new_cell(&self.state.heap, VariantType::String, Data::Text(text.clone()));
                    ptr::write_unaligned(dst as *mut u64, word)
                }
                (VariantType::Object, FakeValue::Object(ptr)) => {
                    if *ptr != 0 {
                        object_reference(*ptr);
                    }
                    ptr::write_unaligned(dst as *mut usize, *ptr)
                }
                (VariantType::Nil, value) => ptr::write_unaligned(dst as *mut Words, value_words(&self.state.heap, value)),
                (ty, value) => panic!("fake engine: cannot return {value:?} as {ty}"),
            }
        }
    }
}

fn call_error(error: CallError) -> RawCallError {
    error.to_raw()
}

// ============================================================================
// NativeApi
// ============================================================================

impl NativeApi for FakeEngine {
    fn print_error(&self, description: &CStr, _function: &CStr, _file: &CStr, _line: i32, _notify_editor: bool) {
        self.record_message("error", description);
    }

    fn print_warning(&self, description: &CStr, _function: &CStr, _file: &CStr, _line: i32, _notify_editor: bool) {
        self.record_message("warning", description);
    }

    fn print_script_error(&self, description: &CStr, _function: &CStr, _file: &CStr, _line: i32, _notify_editor: bool) {
        self.record_message("script error", description);
    }

    unsafe fn variant_new_copy(&self, dest: VariantPtr, src: ConstVariantPtr) {
        unsafe {
            let words = copy_variant(&ptr::read_unaligned(src as *const Words));
            ptr::write_unaligned(dest as *mut Words, words);
        }
    }

    unsafe fn variant_new_nil(&self, dest: VariantPtr) {
        unsafe { ptr::write_unaligned(dest as *mut Words, [0; 3]) }
    }

    unsafe fn variant_destroy(&self, variant: VariantPtr) {
        unsafe {
            let mut words = ptr::read_unaligned(variant as *const Words);
            destroy_variant(&mut words);
            ptr::write_unaligned(variant as *mut Words, words);
        }
    }

    unsafe fn variant_call(&self, variant: VariantPtr, method: &CStr, args: &[ConstVariantPtr], ret: VariantPtr) -> RawCallError {
        unsafe { ptr::write_unaligned(ret as *mut Words, [0; 3]) };
        let words = unsafe { ptr::read_unaligned(variant as *const Words) };
        let ty = tag_of(&words);
        let result = match (ty, method.to_bytes()) {
            (VariantType::String, b"length") => unsafe { cell_text(words[1]) }.chars().count() as i64,
            (VariantType::Array, b"size") => lock(&*unsafe { cell_list(words[1]) }).len() as i64,
            (VariantType::Dictionary, b"size") => lock(&*unsafe { cell_map(words[1]) }).len() as i64,
            _ => return call_error(CallError::InvalidMethod),
        };
        if !args.is_empty() {
            return call_error(CallError::TooManyArguments { expected: 0 });
        }
        unsafe { ptr::write_unaligned(ret as *mut Words, value_words(&self.state.heap, &FakeValue::Int(result))) };
        RawCallError::default()
    }

    unsafe fn variant_evaluate(&self, op: Operator, left: ConstVariantPtr, right: ConstVariantPtr, ret: VariantPtr) -> bool {
        let (left, right) = unsafe {
            (
                read_value(&ptr::read_unaligned(left as *const Words)),
                read_value(&ptr::read_unaligned(right as *const Words)),
            )
        };
        let result = match (left, right) {
            (Some(left), Some(right)) => evaluate(op, &left, &right),
            _ => None,
        };
        match result {
            Some(value) => {
                unsafe { ptr::write_unaligned(ret as *mut Words, value_words(&self.state.heap, &value)) };
                true
            }
            None => false,
        }
    }

    unsafe fn variant_get(&self, variant: ConstVariantPtr, key: ConstVariantPtr, ret: VariantPtr) -> bool {
        let words = unsafe { ptr::read_unaligned(variant as *const Words) };
        let key = unsafe { ptr::read_unaligned(key as *const Words) };
        let found = match tag_of(&words) {
            VariantType::Array => match unsafe { read_value(&key) } {
                Some(FakeValue::Int(index)) => {
                    let list = unsafe { cell_list(words[1]) };
                    let list = lock(&list);
                    usize::try_from(index).ok().and_then(|index| list.get(index).copied())
                }
                _ => None,
            },
            VariantType::Dictionary => {
                let map = unsafe { cell_map(words[1]) };
                let map = lock(&map);
                map.iter().find(|(k, _)| unsafe { variants_equal(k, &key) }).map(|(_, v)| *v)
            }
            _ => None,
        };
        match found {
            Some(value) => {
                unsafe { ptr::write_unaligned(ret as *mut Words, copy_variant(&value)) };
                true
            }
            None => false,
        }
    }

    unsafe fn variant_set(&self, variant: VariantPtr, key: ConstVariantPtr, value: ConstVariantPtr) -> bool {
        let words = unsafe { ptr::read_unaligned(variant as *const Words) };
        let key = unsafe { ptr::read_unaligned(key as *const Words) };
        let value = unsafe { copy_variant(&ptr::read_unaligned(value as *const Words)) };
        match tag_of(&words) {
            VariantType::Array => {
                let list = unsafe { cell_list(words[1]) };
                let mut list = lock(&list);
                let slot = match unsafe { read_value(&key) } {
                    Some(FakeValue::Int(index)) => usize::try_from(index).ok().and_then(|index| list.get_mut(index)),
                    _ => None,
                };
                match slot {
                    Some(slot) => {
                        unsafe { destroy_variant(slot) };
                        *slot = value;
                        true
                    }
                    None => {
                        unsafe { destroy_variant(&mut value.clone()) };
                        false
                    }
                }
            }
            VariantType::Dictionary => {
                let map = unsafe { cell_map(words[1]) };
                let mut map = lock(&map);
                match map.iter_mut().find(|(k, _)| unsafe { variants_equal(k, &key) }) {
                    Some((_, slot)) => {
                        unsafe { destroy_variant(slot) };
                        *slot = value;
                    }
                    None => map.push((unsafe { copy_variant(&key) }, value)),
                }
                true
            }
            _ => {
                unsafe { destroy_variant(&mut value.clone()) };
                false
            }
        }
    }

    unsafe fn variant_hash(&self, variant: ConstVariantPtr) -> i64 {
        let words = unsafe { ptr::read_unaligned(variant as *const Words) };
        match unsafe { read_value(&words) } {
            Some(FakeValue::Int(i)) => i,
            Some(FakeValue::Text(text)) => {
                let hash = text.bytes().fold(0xcbf29ce484222325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x100000001b3));
                hash as i64
            }
            _ => words[0] as i64,
        }
    }

    unsafe fn variant_stringify(&self, variant: ConstVariantPtr, r_string: TypePtr) {
        let text = unsafe { stringify(&ptr::read_unaligned(variant as *const Words)) };
        let word = new_cell(&self.state.heap, VariantType::String, Data::Text(text));
        unsafe { ptr::write_unaligned(r_string as *mut u64, word) };
    }

    unsafe fn variant_get_type(&self, variant: ConstVariantPtr) -> VariantType {
        let words = unsafe { ptr::read_unaligned(variant as *const Words) };
        tag_of(&words)
    }

    unsafe fn variant_booleanize(&self, variant: ConstVariantPtr) -> bool {
        match unsafe { read_value(&ptr::read_unaligned(variant as *const Words)) } {
            Some(FakeValue::Nil) => false,
            Some(FakeValue::Bool(b)) => b,
            Some(FakeValue::Int(i)) => i != 0,
            Some(FakeValue::Float(f)) => f != 0.0,
            Some(FakeValue::Text(text)) => !text.is_empty(),
            Some(FakeValue::Object(ptr)) => ptr != 0,
            None => true,
        }
    }

    fn variant_from_type_constructor(&self, ty: VariantType) -> Option<VariantFromTypeFn> {
        (!lock(&self.state.withheld).contains(&ty)).then(|| FROM_TYPE[ty.index()])
    }

    fn variant_to_type_constructor(&self, ty: VariantType) -> Option<TypeFromVariantFn> {
        (!lock(&self.state.withheld).contains(&ty)).then(|| TO_TYPE[ty.index()])
    }

    fn ptr_operator_evaluator(&self, op: Operator, left: VariantType, right: VariantType) -> Option<PtrOperatorEvaluator> {
        if left != right {
            return None;
        }
        ptr_operator(op, left)
    }

    fn ptr_constructor(&self, ty: VariantType, index: i32) -> Option<PtrConstructor> {
        if !ty.needs_destructor() {
            return None;
        }
        match index {
            0 => Some(DEFAULT_CONSTRUCTORS[ty.index()]),
            1 => Some(COPY_CONSTRUCTORS[ty.index()]),
            2 if matches!(ty, VariantType::StringName | VariantType::NodePath) => Some(STRING_CONSTRUCTORS[ty.index()]),
            _ => None,
        }
    }

    fn ptr_destructor(&self, ty: VariantType) -> Option<PtrDestructor> {
        ty.needs_destructor().then_some(destroy_builtin as PtrDestructor)
    }

    fn ptr_builtin_method(&self, ty: VariantType, method: &CStr, hash: i64) -> Option<PtrBuiltInMethod> {
        let function: PtrBuiltInMethod = match (ty, method.to_bytes(), hash) {
            (VariantType::String, b"length", 3173160232) => string_length,
            (VariantType::Array, b"size", 3173160232) => array_size,
            (VariantType::Array, b"append", 3316032543) => array_append,
            (VariantType::Dictionary, b"size", 3173160232) => dictionary_size,
            (VariantType::Dictionary, b"has", 3680194679) => dictionary_has,
            _ => return None,
        };
        Some(function)
    }

    fn ptr_utility_function(&self, name: &CStr, hash: i64) -> Option<PtrUtilityFunction> {
        (name.to_bytes() == b"absi" && hash == ABSI_HASH).then_some(absi as PtrUtilityFunction)
    }

    unsafe fn string_new_with_utf8(&self, dest: TypePtr, text: &str) {
        let word = new_cell(&self.state.heap, VariantType::String, Data::Text(text.to_string()));
        unsafe { ptr::write_unaligned(dest as *mut u64, word) };
    }

    unsafe fn string_to_utf8(&self, string: ConstTypePtr, buf: &mut [u8]) -> usize {
        let text = unsafe { cell_text(ptr::read_unaligned(string as *const u64)) };
        let len = text.len().min(buf.len());
        buf[..len].copy_from_slice(&text.as_bytes()[..len]);
        text.len()
    }

    unsafe fn array_operator_index(&self, array: TypePtr, index: i64) -> VariantPtr {
        let list = unsafe { cell_list(ptr::read_unaligned(array as *const u64)) };
        let mut list = lock(&list);
        match usize::try_from(index).ok().and_then(|index| list.get_mut(index)) {
            Some(element) => element as *mut Words as VariantPtr,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dictionary_operator_index(&self, dictionary: TypePtr, key: ConstVariantPtr) -> VariantPtr {
        let map = unsafe { cell_map(ptr::read_unaligned(dictionary as *const u64)) };
        let key = unsafe { ptr::read_unaligned(key as *const Words) };
        let mut map = lock(&map);
        let index = match map.iter().position(|(k, _)| unsafe { variants_equal(k, &key) }) {
            Some(index) => index,
            None => {
                map.push((unsafe { copy_variant(&key) }, [0; 3]));
                map.len() - 1
            }
        };
        &mut map[index].1 as *mut Words as VariantPtr
    }

    unsafe fn object_method_bind_call(
        &self,
        bind: MethodBindPtr,
        object: ObjectPtr,
        args: &[ConstVariantPtr],
        ret: VariantPtr,
    ) -> RawCallError {
        unsafe { ptr::write_unaligned(ret as *mut Words, [0; 3]) };
        let method = match unsafe { (bind as *const FakeMethod).as_ref() } {
            Some(method) => method,
            None => return call_error(CallError::InvalidMethod),
        };
        if object.is_null() {
            return call_error(CallError::InstanceIsNull);
        }
        let expected = method.params.len() as i32;
        if args.len() < method.params.len() {
            return call_error(CallError::TooFewArguments { expected });
        }
        if args.len() > method.params.len() {
            return call_error(CallError::TooManyArguments { expected });
        }
        let mut values = Vec::with_capacity(args.len());
        for (index, (arg, param)) in args.iter().zip(&method.params).enumerate() {
            let value = unsafe { read_value(&ptr::read_unaligned(*arg as *const Words)) }.unwrap_or(FakeValue::Nil);
            if *param != VariantType::Nil && value_type(&value) != *param {
                return call_error(CallError::InvalidArgument { argument: index as i32, expected: *param });
            }
            values.push(value);
        }
        self.count_call(method);
        if let Some(value) = (method.body)(object, &values) {
            unsafe { ptr::write_unaligned(ret as *mut Words, value_words(&self.state.heap, &value)) };
        }
        RawCallError::default()
    }

    unsafe fn object_method_bind_ptrcall(&self, bind: MethodBindPtr, object: ObjectPtr, args: *const ConstTypePtr, ret: TypePtr) {
        let method = match unsafe { (bind as *const FakeMethod).as_ref() } {
            Some(method) => method,
            None => panic!("fake engine: null method bind"),
        };
        let values: Vec<FakeValue> = method
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| unsafe { self.read_native(*param, *args.add(index)) })
            .collect();
        self.count_call(method);
        let result = (method.body)(object, &values);
        if let (Some(ty), Some(value)) = (method.ret, result) {
            unsafe { self.write_native(ty, &value, ret) };
        }
    }

    unsafe fn object_destroy(&self, object: ObjectPtr) {
        unsafe { destroy_fake_object(object as usize) }
    }

    fn global_get_singleton(&self, name: &CStr) -> ObjectPtr {
        let name = name.to_string_lossy();
        lock(&self.state.singletons).get(&*name).map_or(ptr::null_mut(), |ptr| *ptr as ObjectPtr)
    }

    unsafe fn object_get_instance_binding(
        &self,
        object: ObjectPtr,
        token: *mut c_void,
        callbacks: &'static RawInstanceBindingCallbacks,
    ) -> *mut c_void {
        let fake = unsafe { self::object(object as usize) };
        if let Some((_, binding, _)) = lock(&fake.bindings).iter().find(|(t, _, _)| *t == token as usize) {
            return *binding as *mut c_void;
        }
        let binding = match callbacks.create_callback {
            Some(create) => unsafe { create(token, object) },
            None => ptr::null_mut(),
        };
        lock(&fake.bindings).push((token as usize, binding as usize, callbacks));
        binding
    }

    unsafe fn object_set_instance(&self, object: ObjectPtr, class_name: &CStr, instance: ClassInstancePtr) {
        let fake = unsafe { self::object(object as usize) };
        let class = class_name.to_string_lossy().into_owned();
        let classes = lock(&self.state.classes);
        let extension = classes.get(&class).and_then(|info| info.extension.as_ref());
        let (free, userdata) = extension.map_or((None, 0), |ext| (ext.free, ext.userdata));
        *lock(&fake.instance) = Some((instance as usize, free, userdata));
        *lock(&fake.class) = class;
    }

    unsafe fn object_cast_to(&self, object: ObjectPtr, class_tag: *mut c_void) -> ObjectPtr {
        if object.is_null() || class_tag.is_null() {
            return ptr::null_mut();
        }
        let ancestor = unsafe { &*(class_tag as *const String) }.clone();
        let class = lock(&unsafe { self::object(object as usize) }.class).clone();
        if self.inherits(&class, &ancestor) { object } else { ptr::null_mut() }
    }

    fn object_get_instance_from_id(&self, id: InstanceId) -> ObjectPtr {
        match lock(&self.state.objects).get(&id) {
            Some(ptr) if !unsafe { self::object(*ptr) }.destroyed.load(Ordering::Relaxed) => *ptr as ObjectPtr,
            _ => ptr::null_mut(),
        }
    }

    unsafe fn object_get_instance_id(&self, object: ObjectPtr) -> InstanceId {
        unsafe { self::object(object as usize) }.id
    }

    fn classdb_construct_object(&self, class_name: &CStr) -> ObjectPtr {
        let class = class_name.to_string_lossy().into_owned();
        let (ref_counted, create) = {
            let classes = lock(&self.state.classes);
            let Some(info) = classes.get(&class) else {
                return ptr::null_mut();
            };
            let create = info.extension.as_ref().and_then(|ext| ext.create.map(|f| (f, ext.userdata)));
            (info.ref_counted, create)
        };
        if let Some((create, userdata)) = create {
            return unsafe { create(userdata as *mut c_void) };
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let object = FakeObject {
            id,
            class: Mutex::new(class),
            ref_counted,
            refcount: AtomicI64::new(0),
            destroyed: AtomicBool::new(false),
            instance: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
        };
        let ptr = Box::into_raw(Box::new(object)) as usize;
        lock(&self.state.objects).insert(id, ptr);
        ptr as ObjectPtr
    }

    fn classdb_get_method_bind(&self, class_name: &CStr, method: &CStr, hash: i64) -> MethodBindPtr {
        let class = class_name.to_string_lossy();
        let name = method.to_string_lossy();
        match self.method(&class, &name) {
            Some(method) if method.hash == hash => method as *const FakeMethod as MethodBindPtr,
            _ => ptr::null_mut(),
        }
    }

    fn classdb_get_class_tag(&self, class_name: &CStr) -> *mut c_void {
        let class = class_name.to_string_lossy();
        lock(&self.state.classes).get(&*class).map_or(ptr::null_mut(), |info| info.tag as *mut c_void)
    }

    unsafe fn classdb_register_extension_class(
        &self,
        _library: ClassLibraryPtr,
        class_name: &CStr,
        parent_name: &CStr,
        info: &RawClassCreationInfo,
    ) {
        let class = class_name.to_string_lossy().into_owned();
        let parent = parent_name.to_string_lossy().into_owned();
        let mut classes = lock(&self.state.classes);
        if classes.contains_key(&class) {
            panic!("fake engine: class {class} registered twice");
        }
        let ref_counted = match classes.get(&parent) {
            Some(parent) => parent.ref_counted,
            None => panic!("fake engine: unknown parent class {parent}"),
        };
        let extension = ExtensionClass {
            userdata: info.class_userdata as usize,
            is_virtual: info.is_virtual != FALSE,
            create: info.create_instance_func,
            free: info.free_instance_func,
            get_virtual: info.get_virtual_func,
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        };
        let tag = Box::into_raw(Box::new(class.clone())) as usize;
        classes.insert(class, ClassInfo { parent: Some(parent), ref_counted, tag, extension: Some(extension) });
    }

    unsafe fn classdb_register_extension_class_method(&self, _library: ClassLibraryPtr, class_name: &CStr, info: &RawMethodInfo) {
        let name = unsafe { CStr::from_ptr(info.name as *const c_char) }.to_string_lossy().into_owned();
        let method = ExtensionMethod {
            name,
            userdata: info.method_userdata as usize,
            call: info.call_func,
            ptrcall: info.ptrcall_func,
            argument_count: info.argument_count,
            has_return: info.has_return_value != FALSE,
            flags: info.method_flags,
        };
        self.with_extension(class_name, |ext| ext.methods.push(method));
    }

    unsafe fn classdb_register_extension_class_property(
        &self,
        _library: ClassLibraryPtr,
        class_name: &CStr,
        info: &RawPropertyInfo,
        setter: &CStr,
        getter: &CStr,
    ) {
        let name = unsafe { CStr::from_ptr(info.name) }.to_string_lossy().into_owned();
        let ty = VariantType::try_from(info.ty).unwrap_or(VariantType::Nil);
        let entry = (name, ty, setter.to_string_lossy().into_owned(), getter.to_string_lossy().into_owned());
        self.with_extension(class_name, |ext| ext.properties.push(entry));
    }

    unsafe fn classdb_register_extension_class_signal(
        &self,
        _library: ClassLibraryPtr,
        class_name: &CStr,
        signal: &CStr,
        args: &[RawPropertyInfo],
    ) {
        let entry = (signal.to_string_lossy().into_owned(), args.len());
        self.with_extension(class_name, |ext| ext.signals.push(entry));
    }

    unsafe fn classdb_unregister_extension_class(&self, _library: ClassLibraryPtr, class_name: &CStr) {
        let class = class_name.to_string_lossy().into_owned();
        if lock(&self.state.classes).remove(&class).is_none() {
            panic!("fake engine: unregistering unknown class {class}");
        }
    }
}

impl FakeEngine {
    fn with_extension(&self, class_name: &CStr, f: impl FnOnce(&mut ExtensionClass)) {
        let class = class_name.to_string_lossy();
        let mut classes = lock(&self.state.classes);
        match classes.get_mut(&*class).and_then(|info| info.extension.as_mut()) {
            Some(extension) => f(extension),
            None => panic!("fake engine: {class} is not an extension class"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_cells_count_live_values() {
        let engine = FakeEngine::new();
        let mut storage = 0u64;
        unsafe { engine.string_new_with_utf8(&mut storage as *mut u64 as TypePtr, "x") };
        assert_eq!(engine.live_values(), 1);
        unsafe { destroy_builtin(&mut storage as *mut u64 as TypePtr) };
        assert_eq!(engine.live_values(), 0);
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    fn double_destroy_panics() {
        let engine = FakeEngine::new();
        let mut storage = 0u64;
        unsafe {
            engine.string_new_with_utf8(&mut storage as *mut u64 as TypePtr, "x");
            destroy_builtin(&mut storage as *mut u64 as TypePtr);
            destroy_builtin(&mut storage as *mut u64 as TypePtr);
        }
    }

    #[test]
    fn class_chain_casts() {
        let engine = FakeEngine::new();
        let resource = engine.construct("Resource");
        let tag = engine.classdb_get_class_tag(c"RefCounted");
        assert_eq!(unsafe { engine.object_cast_to(resource, tag) }, resource);
        let node = engine.construct("Node");
        assert!(unsafe { engine.object_cast_to(node, tag) }.is_null());
    }

    #[test]
    fn method_binds_check_hash() {
        let engine = FakeEngine::new();
        assert!(!engine.classdb_get_method_bind(c"Resource", c"reference", REF_COUNTED_HASH).is_null());
        assert!(engine.classdb_get_method_bind(c"Resource", c"reference", 0).is_null());
    }

    #[test]
    fn singleton_is_registered() {
        let engine = FakeEngine::new();
        assert!(!engine.global_get_singleton(c"Engine").is_null());
        assert!(engine.global_get_singleton(c"Nope").is_null());
    }
}
