use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// A named-slot byte store. Every slot holds one value which is replaced as
/// a whole; `swap` only succeeds when the stored value still equals
/// `current`, which is what `Slot::update` builds its retry loop on.
pub trait Store: Send + Sync {
    fn get(&self, slot: &str) -> Result<Option<Vec<u8>>>;
    fn swap(&self, slot: &str, current: Option<&[u8]>, new: Vec<u8>) -> Result<bool>;
    fn put(&self, slot: &str, value: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<SledStore> {
        info!("open store at {}", path.display());
        Ok(SledStore {
            db: sled::open(path)?,
        })
    }

    /// A store that is deleted on drop.
    pub fn temporary() -> Result<SledStore> {
        Ok(SledStore {
            db: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl Store for SledStore {
    fn get(&self, slot: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(slot)?.map(|v| v.to_vec()))
    }

    fn swap(&self, slot: &str, current: Option<&[u8]>, new: Vec<u8>) -> Result<bool> {
        match self.db.compare_and_swap(slot, current, Some(new))? {
            Ok(()) => {
                self.db.flush()?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn put(&self, slot: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(slot, value)?;
        self.db.flush()?;
        Ok(())
    }
}

/// Typed view over one slot holding an ordered list of `T`.
pub struct Slot<T> {
    store: Arc<dyn Store>,
    name: String,
    _records: PhantomData<fn() -> T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            _records: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Slot<T> {
    pub fn new(store: Arc<dyn Store>, name: &str) -> Slot<T> {
        Slot {
            store,
            name: name.to_string(),
            _records: PhantomData,
        }
    }

    pub fn load(&self) -> Result<Vec<T>> {
        decode(self.store.get(&self.name)?.as_deref())
    }

    /// Read-modify-write of the whole list. `f` may run more than once when
    /// another writer gets in between; an error from `f` aborts without
    /// writing anything.
    pub fn update<R, F>(&self, mut f: F) -> Result<R>
    where
        F: FnMut(&mut Vec<T>) -> Result<R>,
    {
        loop {
            let current = self.store.get(&self.name)?;
            let mut records = decode(current.as_deref())?;
            let out = f(&mut records)?;
            let encoded = bincode::serialize(&records)?;
            if current.as_deref() == Some(encoded.as_slice()) {
                return Ok(out);
            }
            if self.store.swap(&self.name, current.as_deref(), encoded)? {
                return Ok(out);
            }
            debug!("slot {} changed concurrently, retrying", self.name);
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: Option<&[u8]>) -> Result<Vec<T>> {
    match bytes {
        Some(b) => Ok(bincode::deserialize(b)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::thread;

    fn slot() -> Slot<u32> {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        Slot::new(store, "numbers")
    }

    #[test]
    fn empty_slot_loads_as_empty_list() {
        assert!(slot().load().unwrap().is_empty());
    }

    #[test]
    fn failed_update_writes_nothing() {
        let s = slot();
        s.update(|records| {
            records.extend([1, 2]);
            Ok(())
        })
        .unwrap();
        let res = s.update(|records| {
            records.push(3);
            Err::<(), _>(Error::InvalidAmount)
        });
        assert!(res.is_err());
        assert_eq!(s.load().unwrap(), vec![1, 2]);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let s = slot();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = s.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        s.update(|records| {
                            records.push(i * 100 + j);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.load().unwrap().len(), 200);
    }
}
