//! The two persistence tiers a boot can rely on.
//!
//! [`VolatileAcrossSleep`] values live in memory that is retained through a
//! deep-sleep suspend and re-initialised on power-up. Everything that must
//! outlive a power loss goes through [`DurableStore`]: a small set of named
//! key/value slots plus one append-only log.

use std::fmt::Display;

use log::warn;

use crate::{
    error::StoreError,
    types::{NO_DATA, NO_GPS},
};

pub const KEY_LAST_MEASURE: &str = "lastMeasure";
pub const KEY_COUNTER: &str = "counter";
pub const KEY_GPS: &str = "gps";
pub const KEY_INTERVAL: &str = "interval";

pub trait VolatileAcrossSleep<T: Copy> {
    fn get(&self) -> T;
    fn set(&mut self, value: T);
}

/// A typed value that survives full power loss.
pub trait DurableAcrossPower<T> {
    fn load(&self) -> Result<T, StoreError>;
    fn save(&mut self, value: &T) -> Result<(), StoreError>;
}

/// Named slots of the durable store. No transactional guarantee across keys.
pub trait KeyValueStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError>;
    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError>;
}

/// The append-only measurement log.
pub trait LogStore {
    fn append(&mut self, line: &str) -> Result<(), StoreError>;
    /// Raw log bytes; [`StoreError::NotFound`] when nothing was logged since the last clear.
    fn read_all(&self) -> Result<Vec<u8>, StoreError>;
    /// Deletes the whole log. Removing an absent log is not an error.
    fn remove(&mut self) -> Result<(), StoreError>;
    fn free_bytes(&self) -> Option<u64>;
}

pub trait SlotValue: Sized + Clone {
    fn read<K: KeyValueStore + ?Sized>(kv: &K, key: &str) -> Result<Option<Self>, StoreError>;
    fn write<K: KeyValueStore + ?Sized>(kv: &mut K, key: &str, value: &Self)
        -> Result<(), StoreError>;
}

impl SlotValue for u32 {
    fn read<K: KeyValueStore + ?Sized>(kv: &K, key: &str) -> Result<Option<Self>, StoreError> {
        kv.get_u32(key)
    }

    fn write<K: KeyValueStore + ?Sized>(
        kv: &mut K,
        key: &str,
        value: &Self,
    ) -> Result<(), StoreError> {
        kv.set_u32(key, *value)
    }
}

impl SlotValue for String {
    fn read<K: KeyValueStore + ?Sized>(kv: &K, key: &str) -> Result<Option<Self>, StoreError> {
        kv.get_str(key)
    }

    fn write<K: KeyValueStore + ?Sized>(
        kv: &mut K,
        key: &str,
        value: &Self,
    ) -> Result<(), StoreError> {
        kv.set_str(key, value)
    }
}

/// One key of a [`KeyValueStore`] with the value it reads as when unset.
pub struct KvSlot<'a, K: ?Sized, T> {
    kv: &'a mut K,
    key: &'static str,
    default: T,
}

impl<'a, K: KeyValueStore + ?Sized, T: SlotValue> KvSlot<'a, K, T> {
    pub fn new(kv: &'a mut K, key: &'static str, default: T) -> Self {
        Self { kv, key, default }
    }
}

impl<K: KeyValueStore + ?Sized, T: SlotValue> DurableAcrossPower<T> for KvSlot<'_, K, T> {
    fn load(&self) -> Result<T, StoreError> {
        Ok(T::read(&*self.kv, self.key)?.unwrap_or_else(|| self.default.clone()))
    }

    fn save(&mut self, value: &T) -> Result<(), StoreError> {
        T::write(&mut *self.kv, self.key, value)
    }
}

/// A key/value back end that may have failed to open at boot. While
/// offline every call fails with [`StoreError::OpenFailed`], so a boot can
/// still run its recording attempt and reach the sleep call.
#[derive(Debug)]
pub enum Attached<K> {
    Ready(K),
    Offline(String),
}

impl<K> Attached<K> {
    pub fn from_open<E: Display>(opened: Result<K, E>) -> Self {
        match opened {
            Ok(kv) => Self::Ready(kv),
            Err(err) => {
                warn!("durable store unavailable this boot: {err}");
                Self::Offline(err.to_string())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    fn ready(&self) -> Result<&K, StoreError> {
        match self {
            Self::Ready(kv) => Ok(kv),
            Self::Offline(reason) => Err(StoreError::OpenFailed(reason.clone())),
        }
    }

    fn ready_mut(&mut self) -> Result<&mut K, StoreError> {
        match self {
            Self::Ready(kv) => Ok(kv),
            Self::Offline(reason) => Err(StoreError::OpenFailed(reason.clone())),
        }
    }
}

impl<K: KeyValueStore> KeyValueStore for Attached<K> {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ready()?.get_str(key)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ready_mut()?.set_str(key, value)
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.ready()?.get_u32(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.ready_mut()?.set_u32(key, value)
    }
}

pub struct DurableStore<K, L> {
    kv: K,
    log: L,
}

impl<K: KeyValueStore, L: LogStore> DurableStore<K, L> {
    pub fn new(kv: K, log: L) -> Self {
        Self { kv, log }
    }

    pub fn counter(&mut self) -> KvSlot<'_, K, u32> {
        KvSlot::new(&mut self.kv, KEY_COUNTER, 0)
    }

    pub fn last_reading(&mut self) -> KvSlot<'_, K, String> {
        KvSlot::new(&mut self.kv, KEY_LAST_MEASURE, NO_DATA.to_string())
    }

    pub fn gps(&mut self) -> KvSlot<'_, K, String> {
        KvSlot::new(&mut self.kv, KEY_GPS, NO_GPS.to_string())
    }

    pub fn interval_minutes(&mut self, default: u32) -> KvSlot<'_, K, u32> {
        KvSlot::new(&mut self.kv, KEY_INTERVAL, default)
    }

    pub fn increment_counter(&mut self) -> Result<u32, StoreError> {
        let mut counter = self.counter();
        let next = counter.load()?.saturating_add(1);
        counter.save(&next)?;
        Ok(next)
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }
}
