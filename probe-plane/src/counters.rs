//! Per-client perf counters
//!
//! Probes export named values that an observer can sample. Numeric counters
//! live in one 64-bit atomic slot. `long` and `int` counters are two views of
//! the same integer (`int` reads truncate it); `float` counters keep the raw
//! bits of an `f32` and only accept float access. Text counters sit behind a
//! short lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::domain::RuntimeError;

/// Initial value, and declared type, of a counter
#[derive(Debug, Clone, PartialEq)]
pub enum PerfValue {
    Long(i64),
    Int(i32),
    Float(f32),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumericKind {
    Long,
    Int,
    Float,
}

impl NumericKind {
    fn name(self) -> &'static str {
        match self {
            NumericKind::Long => "long",
            NumericKind::Int => "int",
            NumericKind::Float => "float",
        }
    }

    fn is_integer(self) -> bool {
        !matches!(self, NumericKind::Float)
    }
}

enum Slot {
    Numeric { kind: NumericKind, bits: AtomicI64 },
    Text(Mutex<String>),
}

struct Counter {
    description: String,
    slot: Slot,
}

#[derive(Default)]
pub struct PerfCounters {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
}

fn float_to_slot(value: f32) -> i64 {
    i64::from(value.to_bits() as i32)
}

fn slot_to_float(bits: i64) -> f32 {
    f32::from_bits(bits as i32 as u32)
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` with its initial value
    ///
    /// # Errors
    /// Returns [`RuntimeError::DuplicateCounter`] if `name` already exists
    pub fn declare(
        &self,
        name: impl Into<String>,
        initial: PerfValue,
        description: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        let slot = match initial {
            PerfValue::Long(v) => Slot::Numeric { kind: NumericKind::Long, bits: AtomicI64::new(v) },
            PerfValue::Int(v) => {
                Slot::Numeric { kind: NumericKind::Int, bits: AtomicI64::new(i64::from(v)) }
            }
            PerfValue::Float(v) => {
                Slot::Numeric { kind: NumericKind::Float, bits: AtomicI64::new(float_to_slot(v)) }
            }
            PerfValue::Text(v) => Slot::Text(Mutex::new(v)),
        };
        let mut counters = self.counters.write();
        if counters.contains_key(&name) {
            return Err(RuntimeError::DuplicateCounter(name));
        }
        counters.insert(name, Arc::new(Counter { description: description.into(), slot }));
        Ok(())
    }

    pub fn get_long(&self, name: &str) -> Result<i64, RuntimeError> {
        self.numeric(name, NumericKind::Long, |bits| bits.load(Ordering::Acquire))
    }

    pub fn put_long(&self, name: &str, value: i64) -> Result<(), RuntimeError> {
        self.numeric(name, NumericKind::Long, |bits| bits.store(value, Ordering::Release))
    }

    /// Atomically add `delta`, returning the new value
    pub fn add_long(&self, name: &str, delta: i64) -> Result<i64, RuntimeError> {
        self.numeric(name, NumericKind::Long, |bits| {
            bits.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta)
        })
    }

    pub fn get_int(&self, name: &str) -> Result<i32, RuntimeError> {
        self.numeric(name, NumericKind::Int, |bits| bits.load(Ordering::Acquire) as i32)
    }

    pub fn put_int(&self, name: &str, value: i32) -> Result<(), RuntimeError> {
        self.numeric(name, NumericKind::Int, |bits| bits.store(i64::from(value), Ordering::Release))
    }

    pub fn get_float(&self, name: &str) -> Result<f32, RuntimeError> {
        self.numeric(name, NumericKind::Float, |bits| slot_to_float(bits.load(Ordering::Acquire)))
    }

    pub fn put_float(&self, name: &str, value: f32) -> Result<(), RuntimeError> {
        self.numeric(name, NumericKind::Float, |bits| bits.store(float_to_slot(value), Ordering::Release))
    }

    pub fn get_text(&self, name: &str) -> Result<String, RuntimeError> {
        let counter = self.counter(name)?;
        match &counter.slot {
            Slot::Text(text) => Ok(text.lock().clone()),
            Slot::Numeric { kind, .. } => Err(type_error(name, "text", kind.name())),
        }
    }

    pub fn put_text(&self, name: &str, value: impl Into<String>) -> Result<(), RuntimeError> {
        let counter = self.counter(name)?;
        match &counter.slot {
            Slot::Text(text) => {
                *text.lock() = value.into();
                Ok(())
            }
            Slot::Numeric { kind, .. } => Err(type_error(name, "text", kind.name())),
        }
    }

    pub fn description(&self, name: &str) -> Result<String, RuntimeError> {
        Ok(self.counter(name)?.description.clone())
    }

    /// Current values, typed as declared, sorted by name
    pub fn snapshot(&self) -> Vec<(String, PerfValue)> {
        let counters = self.counters.read();
        let mut values: Vec<(String, PerfValue)> = counters
            .iter()
            .map(|(name, counter)| {
                let value = match &counter.slot {
                    Slot::Numeric { kind, bits } => {
                        let raw = bits.load(Ordering::Acquire);
                        match kind {
                            NumericKind::Long => PerfValue::Long(raw),
                            NumericKind::Int => PerfValue::Int(raw as i32),
                            NumericKind::Float => PerfValue::Float(slot_to_float(raw)),
                        }
                    }
                    Slot::Text(text) => PerfValue::Text(text.lock().clone()),
                };
                (name.clone(), value)
            })
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }

    fn counter(&self, name: &str) -> Result<Arc<Counter>, RuntimeError> {
        self.counters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownCounter(name.to_string()))
    }

    /// Run `op` on the slot of `name` if it can be read as `expected`
    fn numeric<R>(
        &self,
        name: &str,
        expected: NumericKind,
        op: impl FnOnce(&AtomicI64) -> R,
    ) -> Result<R, RuntimeError> {
        let counter = self.counter(name)?;
        match &counter.slot {
            Slot::Numeric { kind, bits } if kind.is_integer() == expected.is_integer() => Ok(op(bits)),
            Slot::Numeric { kind, .. } => Err(type_error(name, expected.name(), kind.name())),
            Slot::Text(_) => Err(type_error(name, expected.name(), "text")),
        }
    }
}

fn type_error(name: &str, expected: &'static str, actual: &'static str) -> RuntimeError {
    RuntimeError::CounterType { name: name.to_string(), expected, actual }
}
