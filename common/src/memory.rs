//! In-memory back ends for the persistence tiers.

use std::collections::BTreeMap;

use crate::{
    error::StoreError,
    persist::{KeyValueStore, LogStore, VolatileAcrossSleep},
};

/// Sleep-surviving cell. A fresh value models power-on initialisation.
#[derive(Debug, Clone, Copy)]
pub struct RetainedCell<T>(T);

impl<T: Copy> RetainedCell<T> {
    pub fn power_on(initial: T) -> Self {
        Self(initial)
    }
}

impl<T: Copy> VolatileAcrossSleep<T> for RetainedCell<T> {
    fn get(&self) -> T {
        self.0
    }

    fn set(&mut self, value: T) {
        self.0 = value;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    U32(u32),
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: BTreeMap<String, Value>,
    unavailable: bool,
}

impl MemoryKv {
    pub fn unavailable() -> Self {
        Self {
            entries: BTreeMap::new(),
            unavailable: true,
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::OpenFailed("memory kv marked unavailable".into()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKv {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(match self.entries.get(key) {
            Some(Value::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.check()?;
        Ok(match self.entries.get(key) {
            Some(Value::U32(value)) => Some(*value),
            _ => None,
        })
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.check()?;
        self.entries.insert(key.to_string(), Value::U32(value));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLog {
    bytes: Option<Vec<u8>>,
    capacity: u64,
    unavailable: bool,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::with_capacity(64 * 1024)
    }
}

impl MemoryLog {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            bytes: None,
            capacity,
            unavailable: false,
        }
    }

    pub fn set_available(&mut self, available: bool) {
        self.unavailable = !available;
    }

    pub fn line_count(&self) -> usize {
        self.bytes
            .as_ref()
            .map(|bytes| bytes.iter().filter(|byte| **byte == b'\n').count())
            .unwrap_or(0)
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, line: &str) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::OpenFailed("memory log marked unavailable".into()));
        }
        self.bytes
            .get_or_insert_with(Vec::new)
            .extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<u8>, StoreError> {
        self.bytes.clone().ok_or(StoreError::NotFound)
    }

    fn remove(&mut self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::WriteFailed("memory log marked unavailable".into()));
        }
        self.bytes = None;
        Ok(())
    }

    fn free_bytes(&self) -> Option<u64> {
        let used = self.bytes.as_ref().map(Vec::len).unwrap_or(0) as u64;
        Some(self.capacity.saturating_sub(used))
    }
}
