use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::VmError;
use crate::types::Pid;

// ─── Interned-style string ────────────────────────────────────

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

pub(crate) fn fnv_combine(h: u64, v: u64) -> u64 {
    (h ^ v).wrapping_mul(FNV_PRIME)
}

/// Immutable, length-tagged string with a precomputed hash.
///
/// Shared by `Arc`; identity implies equality, but equal strings need not
/// be identical objects.
#[derive(Debug)]
pub struct Str {
    text: Box<str>,
    hash: u64,
}

impl Str {
    pub fn new(text: impl Into<String>) -> Arc<Str> {
        let text: String = text.into();
        let hash = fnv1a(text.as_bytes());
        Arc::new(Str {
            text: text.into_boxed_str(),
            hash,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for Str {
    fn eq(&self, other: &Self) -> bool {
        // Hash first: unequal hashes prove inequality without a scan.
        self.hash == other.hash && self.text == other.text
    }
}

impl Eq for Str {}

impl fmt::Display for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

// ─── Container objects ────────────────────────────────────────

/// Mutable ordered sequence. Mutation through a shared handle copies first.
#[derive(Clone, Debug, Default)]
pub struct ArrayObj {
    pub items: Vec<Value>,
    /// A frozen container refuses mutation at any refcount.
    pub immutable: bool,
}

/// String-keyed map with a stable key-to-slot layout.
///
/// Keys keep insertion order; the `shape` fingerprint changes whenever the
/// key layout changes, which is what the inline caches key on.
#[derive(Clone, Debug, Default)]
pub struct MapObj {
    keys: Vec<Arc<Str>>,
    vals: Vec<Value>,
    shape: u64,
    pub immutable: bool,
}

impl MapObj {
    pub fn new() -> MapObj {
        MapObj {
            keys: Vec::new(),
            vals: Vec::new(),
            shape: FNV_OFFSET,
            immutable: false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Layout fingerprint: two maps with the same keys in the same order
    /// share a shape, so a cached slot index transfers between them.
    pub fn shape(&self) -> u64 {
        self.shape
    }

    pub fn slot_of(&self, key: &Str) -> Option<usize> {
        self.keys.iter().position(|k| k.as_ref() == key)
    }

    pub fn get(&self, key: &Str) -> Option<&Value> {
        self.slot_of(key).map(|i| &self.vals[i])
    }

    pub fn get_slot(&self, slot: usize) -> Option<&Value> {
        self.vals.get(slot)
    }

    pub fn set(&mut self, key: Arc<Str>, val: Value) {
        match self.slot_of(&key) {
            Some(i) => self.vals[i] = val,
            None => {
                self.shape = fnv_combine(self.shape, key.hash());
                self.keys.push(key);
                self.vals.push(val);
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Arc<Str>, &Value)> {
        self.keys.iter().zip(self.vals.iter())
    }
}

/// Named record with ordered fields.
#[derive(Clone, Debug)]
pub struct StructObj {
    pub name: Arc<Str>,
    pub fields: Vec<(Arc<Str>, Value)>,
}

impl StructObj {
    pub fn field(&self, name: &Str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v)
    }
}

/// Tagged variant with an optional payload.
#[derive(Clone, Debug)]
pub struct EnumObj {
    pub enum_name: Arc<Str>,
    pub variant: Arc<Str>,
    pub payload: Option<Value>,
}

/// A function reference plus its captured values.
#[derive(Clone, Debug)]
pub struct ClosureObj {
    pub function: u16,
    pub upvalues: Vec<Value>,
}

/// Guest-level `Result` variant.
#[derive(Clone, Debug)]
pub enum GuestResult {
    Ok(Value),
    Err(Value),
}

/// Guest-level `Option` variant.
#[derive(Clone, Debug)]
pub enum GuestOption {
    Some(Value),
    None,
}

// ─── Value ────────────────────────────────────────────────────

/// A runtime value. Containers are refcounted and copy-on-write: mutating
/// through a handle whose refcount exceeds one clones the container first.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<Str>),
    Bytes(Arc<Vec<u8>>),
    Array(Arc<ArrayObj>),
    Map(Arc<MapObj>),
    Pid(Pid),
    Function(u16),
    Closure(Arc<ClosureObj>),
    Result(Arc<GuestResult>),
    Option(Arc<GuestOption>),
    Struct(Arc<StructObj>),
    Enum(Arc<EnumObj>),
}

impl Value {
    pub fn str(text: impl Into<String>) -> Value {
        Value::Str(Str::new(text))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(ArrayObj {
            items,
            immutable: false,
        }))
    }

    pub fn map(obj: MapObj) -> Value {
        Value::Map(Arc::new(obj))
    }

    pub fn ok(v: Value) -> Value {
        Value::Result(Arc::new(GuestResult::Ok(v)))
    }

    pub fn err(v: Value) -> Value {
        Value::Result(Arc::new(GuestResult::Err(v)))
    }

    pub fn some(v: Value) -> Value {
        Value::Option(Arc::new(GuestOption::Some(v)))
    }

    pub fn none() -> Value {
        Value::Option(Arc::new(GuestOption::None))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Pid(_) => "pid",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
            Value::Result(_) => "result",
            Value::Option(_) => "option",
            Value::Struct(_) => "struct",
            Value::Enum(_) => "enum",
        }
    }

    /// Nil and false are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    fn type_error(expected: &str, got: &Value) -> VmError {
        VmError::Type {
            expected: expected.to_string(),
            got: got.type_name().to_string(),
        }
    }

    // ─── Equality / ordering / hashing ────────────────────────

    /// Structural equality. Ints and floats compare by numeric value.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Pid(a), Value::Pid(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.items.len() == b.items.len()
                    && a.items.iter().zip(&b.items).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.entries()
                        .all(|(k, v)| b.get(k).map(|w| v.equals(w)).unwrap_or(false))
            }
            (Value::Result(a), Value::Result(b)) => match (a.as_ref(), b.as_ref()) {
                (GuestResult::Ok(x), GuestResult::Ok(y)) => x.equals(y),
                (GuestResult::Err(x), GuestResult::Err(y)) => x.equals(y),
                _ => false,
            },
            (Value::Option(a), Value::Option(b)) => match (a.as_ref(), b.as_ref()) {
                (GuestOption::Some(x), GuestOption::Some(y)) => x.equals(y),
                (GuestOption::None, GuestOption::None) => true,
                _ => false,
            },
            (Value::Struct(a), Value::Struct(b)) => {
                a.name == b.name
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .zip(&b.fields)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.equals(vb))
            }
            (Value::Enum(a), Value::Enum(b)) => {
                a.enum_name == b.enum_name
                    && a.variant == b.variant
                    && match (&a.payload, &b.payload) {
                        (Some(x), Some(y)) => x.equals(y),
                        (None, None) => true,
                        _ => false,
                    }
            }
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Stable hash: equal values hash equal. Floats with an integral value
    /// hash like the corresponding int, matching `equals` promotion.
    pub fn hash(&self) -> u64 {
        match self {
            Value::Nil => 0x9e37_79b9,
            Value::Bool(b) => {
                if *b {
                    0x517c_c1b7
                } else {
                    0x2754_4a41
                }
            }
            Value::Int(i) => fnv_combine(1, *i as u64),
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    fnv_combine(1, *f as i64 as u64)
                } else {
                    fnv_combine(2, f.to_bits())
                }
            }
            Value::Str(s) => s.hash(),
            Value::Bytes(b) => fnv1a(b),
            Value::Pid(p) => fnv_combine(3, p.as_u64()),
            Value::Function(i) => fnv_combine(4, u64::from(*i)),
            Value::Closure(c) => fnv_combine(4, u64::from(c.function)),
            Value::Array(a) => a
                .items
                .iter()
                .fold(fnv_combine(5, a.items.len() as u64), |h, v| {
                    fnv_combine(h, v.hash())
                }),
            Value::Map(m) => {
                // XOR-fold entries so equal maps hash equal regardless of
                // key insertion order.
                let acc = m
                    .entries()
                    .fold(0u64, |h, (k, v)| h ^ fnv_combine(k.hash(), v.hash()));
                fnv_combine(fnv_combine(6, m.len() as u64), acc)
            }
            Value::Result(r) => match r.as_ref() {
                GuestResult::Ok(v) => fnv_combine(7, v.hash()),
                GuestResult::Err(v) => fnv_combine(8, v.hash()),
            },
            Value::Option(o) => match o.as_ref() {
                GuestOption::Some(v) => fnv_combine(9, v.hash()),
                GuestOption::None => 10,
            },
            Value::Struct(s) => s
                .fields
                .iter()
                .fold(fnv_combine(11, s.name.hash()), |h, (k, v)| {
                    fnv_combine(h, k.hash() ^ v.hash())
                }),
            Value::Enum(e) => {
                let h = fnv_combine(12, e.enum_name.hash() ^ e.variant.hash());
                match &e.payload {
                    Some(v) => fnv_combine(h, v.hash()),
                    None => h,
                }
            }
        }
    }

    /// Ordered comparison: numbers by numeric order with promotion,
    /// strings lexicographically. Everything else is a type error.
    pub fn compare(&self, other: &Value) -> Result<Ordering, VmError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64)
                .partial_cmp(b)
                .ok_or(VmError::Runtime("incomparable floats".to_string())),
            (Value::Float(a), Value::Int(b)) => a
                .partial_cmp(&(*b as f64))
                .ok_or(VmError::Runtime("incomparable floats".to_string())),
            (Value::Float(a), Value::Float(b)) => a
                .partial_cmp(b)
                .ok_or(VmError::Runtime("incomparable floats".to_string())),
            (Value::Str(a), Value::Str(b)) => Ok(a.as_str().cmp(b.as_str())),
            (a, b) => Err(VmError::Type {
                expected: "two numbers or two strings".to_string(),
                got: format!("{} and {}", a.type_name(), b.type_name()),
            }),
        }
    }

    // ─── Arithmetic ───────────────────────────────────────────

    /// `int + int` stays int; a float operand promotes; `string + string`
    /// concatenates into a new string.
    pub fn add(&self, other: &Value) -> Result<Value, VmError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Str(a), Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a.as_str());
                s.push_str(b.as_str());
                Ok(Value::str(s))
            }
            (a, b) => Err(VmError::Type {
                expected: "numbers or strings".to_string(),
                got: format!("{} and {}", a.type_name(), b.type_name()),
            }),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, VmError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
            (a, b) => Err(Self::numeric_error(a, b)),
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value, VmError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 * b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a * *b as f64)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
            (a, b) => Err(Self::numeric_error(a, b)),
        }
    }

    /// Division by zero is an error for ints and floats alike.
    pub fn div(&self, other: &Value) -> Result<Value, VmError> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err(VmError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(*b))),
            (Value::Int(_) | Value::Float(_), Value::Float(f)) if *f == 0.0 => {
                Err(VmError::DivisionByZero)
            }
            (Value::Float(_), Value::Int(0)) => Err(VmError::DivisionByZero),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 / b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / *b as f64)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
            (a, b) => Err(Self::numeric_error(a, b)),
        }
    }

    pub fn rem(&self, other: &Value) -> Result<Value, VmError> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err(VmError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
            (Value::Int(_) | Value::Float(_), Value::Float(f)) if *f == 0.0 => {
                Err(VmError::DivisionByZero)
            }
            (Value::Float(_), Value::Int(0)) => Err(VmError::DivisionByZero),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 % b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a % *b as f64)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),
            (a, b) => Err(Self::numeric_error(a, b)),
        }
    }

    pub fn neg(&self) -> Result<Value, VmError> {
        match self {
            Value::Int(a) => Ok(Value::Int(a.wrapping_neg())),
            Value::Float(a) => Ok(Value::Float(-a)),
            v => Err(Self::type_error("number", v)),
        }
    }

    fn numeric_error(a: &Value, b: &Value) -> VmError {
        VmError::Type {
            expected: "numbers".to_string(),
            got: format!("{} and {}", a.type_name(), b.type_name()),
        }
    }

    // ─── Copying and hand-off ─────────────────────────────────

    /// Fully independent copy for hand-off between block heaps. Strings
    /// and bytes stay shared; they are immutable by construction.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(a) => Value::Array(Arc::new(ArrayObj {
                items: a.items.iter().map(Value::deep_copy).collect(),
                immutable: false,
            })),
            Value::Map(m) => {
                let mut out = MapObj::new();
                for (k, v) in m.entries() {
                    out.set(k.clone(), v.deep_copy());
                }
                Value::Map(Arc::new(out))
            }
            Value::Struct(s) => Value::Struct(Arc::new(StructObj {
                name: s.name.clone(),
                fields: s
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            })),
            Value::Enum(e) => Value::Enum(Arc::new(EnumObj {
                enum_name: e.enum_name.clone(),
                variant: e.variant.clone(),
                payload: e.payload.as_ref().map(Value::deep_copy),
            })),
            Value::Closure(c) => Value::Closure(Arc::new(ClosureObj {
                function: c.function,
                upvalues: c.upvalues.iter().map(Value::deep_copy).collect(),
            })),
            Value::Result(r) => match r.as_ref() {
                GuestResult::Ok(v) => Value::ok(v.deep_copy()),
                GuestResult::Err(v) => Value::err(v.deep_copy()),
            },
            Value::Option(o) => match o.as_ref() {
                GuestOption::Some(v) => Value::some(v.deep_copy()),
                GuestOption::None => Value::none(),
            },
            v => v.clone(),
        }
    }

    /// Mark containers immutable, recursively. A frozen container refuses
    /// mutation regardless of refcount.
    pub fn freeze(self) -> Value {
        match self {
            Value::Array(a) => {
                let mut obj = ArrayObj {
                    items: a.items.iter().cloned().map(Value::freeze).collect(),
                    immutable: true,
                };
                obj.items.shrink_to_fit();
                Value::Array(Arc::new(obj))
            }
            Value::Map(m) => {
                let mut out = MapObj::new();
                for (k, v) in m.entries() {
                    out.set(k.clone(), v.clone().freeze());
                }
                out.immutable = true;
                Value::Map(Arc::new(out))
            }
            v => v,
        }
    }

    /// Rough heap footprint in bytes, for resource accounting.
    pub fn approx_size(&self) -> usize {
        const BASE: usize = std::mem::size_of::<Value>();
        match self {
            Value::Str(s) => BASE + s.len(),
            Value::Bytes(b) => BASE + b.len(),
            Value::Array(a) => a.items.iter().map(Value::approx_size).sum::<usize>() + BASE,
            Value::Map(m) => {
                m.entries()
                    .map(|(k, v)| k.len() + v.approx_size())
                    .sum::<usize>()
                    + BASE
            }
            Value::Struct(s) => {
                s.fields
                    .iter()
                    .map(|(k, v)| k.len() + v.approx_size())
                    .sum::<usize>()
                    + BASE
            }
            Value::Enum(e) => e.payload.as_ref().map(Value::approx_size).unwrap_or(0) + BASE,
            Value::Closure(c) => c.upvalues.iter().map(Value::approx_size).sum::<usize>() + BASE,
            _ => BASE,
        }
    }

    // ─── COW mutation helpers ─────────────────────────────────

    /// Push onto an array, cloning first if the array is shared.
    pub fn array_push(&mut self, item: Value) -> Result<(), VmError> {
        match self {
            Value::Array(a) => {
                if a.immutable {
                    return Err(VmError::Runtime("array is immutable".to_string()));
                }
                Arc::make_mut(a).items.push(item);
                Ok(())
            }
            v => Err(Self::type_error("array", v)),
        }
    }

    pub fn array_get(&self, index: &Value) -> Result<Value, VmError> {
        let (arr, i) = self.array_index(index)?;
        Ok(arr.items[i].clone())
    }

    pub fn array_set(&mut self, index: &Value, item: Value) -> Result<(), VmError> {
        let i = {
            let (arr, i) = self.array_index(index)?;
            if arr.immutable {
                return Err(VmError::Runtime("array is immutable".to_string()));
            }
            i
        };
        if let Value::Array(a) = self {
            Arc::make_mut(a).items[i] = item;
        }
        Ok(())
    }

    fn array_index(&self, index: &Value) -> Result<(&ArrayObj, usize), VmError> {
        let arr = match self {
            Value::Array(a) => a,
            v => return Err(Self::type_error("array", v)),
        };
        let i = match index {
            Value::Int(i) => *i,
            v => return Err(Self::type_error("int", v)),
        };
        if i < 0 || i as usize >= arr.items.len() {
            return Err(VmError::OutOfBounds {
                index: i,
                len: arr.items.len(),
            });
        }
        Ok((arr, i as usize))
    }

    /// Missing key reads nil; keys must be strings.
    pub fn map_get(&self, key: &Value) -> Result<Value, VmError> {
        let map = match self {
            Value::Map(m) => m,
            v => return Err(Self::type_error("map", v)),
        };
        let key = match key {
            Value::Str(s) => s,
            v => return Err(Self::type_error("string key", v)),
        };
        Ok(map.get(key).cloned().unwrap_or(Value::Nil))
    }

    pub fn map_set(&mut self, key: &Value, val: Value) -> Result<(), VmError> {
        let key = match key {
            Value::Str(s) => s.clone(),
            v => return Err(Self::type_error("string key", v)),
        };
        match self {
            Value::Map(m) => {
                if m.immutable {
                    return Err(VmError::Runtime("map is immutable".to_string()));
                }
                Arc::make_mut(m).set(key, val);
                Ok(())
            }
            v => Err(Self::type_error("map", v)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.entries().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Pid(p) => write!(f, "{p}"),
            Value::Function(i) => write!(f, "<fn {i}>"),
            Value::Closure(c) => write!(f, "<closure {}>", c.function),
            Value::Result(r) => match r.as_ref() {
                GuestResult::Ok(v) => write!(f, "Ok({v})"),
                GuestResult::Err(v) => write!(f, "Err({v})"),
            },
            Value::Option(o) => match o.as_ref() {
                GuestOption::Some(v) => write!(f, "Some({v})"),
                GuestOption::None => write!(f, "None"),
            },
            Value::Struct(s) => write!(f, "{}{{..{} fields}}", s.name, s.fields.len()),
            Value::Enum(e) => write!(f, "{}::{}", e.enum_name, e.variant),
        }
    }
}
