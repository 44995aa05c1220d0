// bog-embed - Value conversion for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Conversions between host values and Bog values.
//!
//! [`BogValue`] is an owned snapshot of a VM value: it holds no GC handles,
//! so it stays valid after the VM runs more code. [`IntoBog`] and
//! [`FromBog`] convert plain Rust types at the boundary.

use std::fmt;

use bog_vm::gc::{Gc, Ref};
use bog_vm::value::Value;
use bog_vm::Vm;

/// Snapshots deeper than this render as opaque; guards against cyclic
/// values.
const MAX_SNAPSHOT_DEPTH: usize = 64;

/// An owned mirror of a Bog runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum BogValue {
    None,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Tuple(Vec<BogValue>),
    List(Vec<BogValue>),
    Map(Vec<(BogValue, BogValue)>),
    Range { start: i64, end: i64, step: i64 },
    Err(Box<BogValue>),
    /// A value that has no owned representation (functions, iterators).
    Opaque(&'static str),
}

impl fmt::Display for BogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, false)
    }
}

impl BogValue {
    fn write(&self, f: &mut fmt::Formatter<'_>, quoted: bool) -> fmt::Result {
        match self {
            BogValue::None => write!(f, "none"),
            BogValue::Bool(b) => write!(f, "{}", b),
            BogValue::Int(v) => write!(f, "{}", v),
            BogValue::Num(v) => write!(f, "{}", bog_vm::value::fmt_num(*v)),
            BogValue::Str(s) => {
                if quoted {
                    write!(f, "{:?}", s)
                } else {
                    write!(f, "{}", s)
                }
            }
            BogValue::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.write(f, true)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            BogValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.write(f, true)?;
                }
                write!(f, "]")
            }
            BogValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    k.write(f, true)?;
                    write!(f, ": ")?;
                    v.write(f, true)?;
                }
                write!(f, "}}")
            }
            BogValue::Range { start, end, step } => {
                write!(f, "{}...{}", start, end)?;
                if *step != 1 {
                    write!(f, " by {}", step)?;
                }
                Ok(())
            }
            BogValue::Err(inner) => {
                write!(f, "error(")?;
                inner.write(f, true)?;
                write!(f, ")")
            }
            BogValue::Opaque(name) => write!(f, "<{}>", name),
        }
    }

    /// True for the `err` case.
    pub fn is_err(&self) -> bool {
        matches!(self, BogValue::Err(_))
    }
}

/// Snapshot a VM value into an owned [`BogValue`].
pub fn snapshot(gc: &Gc, value: Ref) -> BogValue {
    snapshot_at(gc, value, 0)
}

fn snapshot_at(gc: &Gc, value: Ref, depth: usize) -> BogValue {
    if depth > MAX_SNAPSHOT_DEPTH {
        return BogValue::Opaque("...");
    }
    match gc.get(value) {
        Value::None => BogValue::None,
        Value::Bool(b) => BogValue::Bool(*b),
        Value::Int(v) => BogValue::Int(*v),
        Value::Num(v) => BogValue::Num(*v),
        Value::Str(s) => BogValue::Str(s.clone()),
        Value::Tuple(items) => BogValue::Tuple(
            items
                .iter()
                .map(|&r| snapshot_at(gc, r, depth + 1))
                .collect(),
        ),
        Value::List(items) => BogValue::List(
            items
                .iter()
                .map(|&r| snapshot_at(gc, r, depth + 1))
                .collect(),
        ),
        Value::Map(entries) => BogValue::Map(
            entries
                .iter()
                .map(|&(k, v)| (snapshot_at(gc, k, depth + 1), snapshot_at(gc, v, depth + 1)))
                .collect(),
        ),
        Value::Range { start, end, step } => BogValue::Range {
            start: *start,
            end: *end,
            step: *step,
        },
        Value::Err(inner) => BogValue::Err(Box::new(snapshot_at(gc, *inner, depth + 1))),
        other => BogValue::Opaque(other.type_name()),
    }
}

/// Build a VM value from an owned [`BogValue`].
///
/// The returned handle is unrooted; pass it into a VM call (which roots
/// arguments) before triggering collections.
pub fn to_ref(vm: &mut Vm, value: &BogValue) -> Ref {
    match value {
        BogValue::None => Gc::NONE,
        BogValue::Bool(b) => Gc::bool_ref(*b),
        BogValue::Int(v) => vm.gc.alloc(Value::Int(*v)),
        BogValue::Num(v) => vm.gc.alloc(Value::Num(*v)),
        BogValue::Str(s) => vm.gc.alloc(Value::Str(s.clone())),
        BogValue::Tuple(items) => {
            let refs: Vec<Ref> = items.iter().map(|v| to_ref(vm, v)).collect();
            vm.gc.alloc(Value::Tuple(refs.into_boxed_slice()))
        }
        BogValue::List(items) => {
            let refs: Vec<Ref> = items.iter().map(|v| to_ref(vm, v)).collect();
            vm.gc.alloc(Value::List(refs))
        }
        BogValue::Map(entries) => {
            let pairs: Vec<(Ref, Ref)> = entries
                .iter()
                .map(|(k, v)| (to_ref(vm, k), to_ref(vm, v)))
                .collect();
            vm.gc.alloc(Value::Map(pairs))
        }
        BogValue::Range { start, end, step } => vm.gc.alloc(Value::Range {
            start: *start,
            end: *end,
            step: *step,
        }),
        BogValue::Err(inner) => {
            let inner = to_ref(vm, inner);
            vm.gc.alloc(Value::Err(inner))
        }
        BogValue::Opaque(_) => Gc::NONE,
    }
}

/// Convert a Rust value into a [`BogValue`].
pub trait IntoBog {
    fn into_bog(self) -> BogValue;
}

/// Convert a [`BogValue`] back into a Rust value.
pub trait FromBog: Sized {
    fn from_bog(value: &BogValue) -> Option<Self>;
}

impl IntoBog for BogValue {
    fn into_bog(self) -> BogValue {
        self
    }
}

impl IntoBog for () {
    fn into_bog(self) -> BogValue {
        BogValue::None
    }
}

impl IntoBog for bool {
    fn into_bog(self) -> BogValue {
        BogValue::Bool(self)
    }
}

impl IntoBog for i64 {
    fn into_bog(self) -> BogValue {
        BogValue::Int(self)
    }
}

impl IntoBog for i32 {
    fn into_bog(self) -> BogValue {
        BogValue::Int(self as i64)
    }
}

impl IntoBog for f64 {
    fn into_bog(self) -> BogValue {
        BogValue::Num(self)
    }
}

impl IntoBog for &str {
    fn into_bog(self) -> BogValue {
        BogValue::Str(self.to_string())
    }
}

impl IntoBog for String {
    fn into_bog(self) -> BogValue {
        BogValue::Str(self)
    }
}

impl<T: IntoBog> IntoBog for Vec<T> {
    fn into_bog(self) -> BogValue {
        BogValue::List(self.into_iter().map(IntoBog::into_bog).collect())
    }
}

impl FromBog for BogValue {
    fn from_bog(value: &BogValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromBog for bool {
    fn from_bog(value: &BogValue) -> Option<Self> {
        match value {
            BogValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromBog for i64 {
    fn from_bog(value: &BogValue) -> Option<Self> {
        match value {
            BogValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromBog for f64 {
    fn from_bog(value: &BogValue) -> Option<Self> {
        match value {
            BogValue::Num(v) => Some(*v),
            BogValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl FromBog for String {
    fn from_bog(value: &BogValue) -> Option<Self> {
        match value {
            BogValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl<T: FromBog> FromBog for Vec<T> {
    fn from_bog(value: &BogValue) -> Option<Self> {
        match value {
            BogValue::List(items) | BogValue::Tuple(items) => {
                items.iter().map(T::from_bog).collect()
            }
            _ => None,
        }
    }
}
