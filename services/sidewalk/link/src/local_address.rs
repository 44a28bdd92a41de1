//! Local device address, kept in RAM and optionally persisted.
//!
//! A single registry is normally shared by every link interface in the
//! process through [`init_global`] / [`global`].

use std::cell::RefCell;
use std::sync::Arc;

use critical_section::Mutex;
use sid_storage::{get_json, put_json, KvStore, RecordKey};
use sid_wire::Address;
use tracing::{debug, info};

use crate::LinkError;

#[derive(Default)]
struct Slots {
    volatile: Option<Address>,
    persisted: Option<Address>,
}

/// Volatile and persisted local address
pub struct LocalAddressRegistry {
    store: Arc<dyn KvStore>,
    slots: Mutex<RefCell<Slots>>,
}

impl std::fmt::Debug for LocalAddressRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (volatile, persisted) = critical_section::with(|cs| {
            let slots = self.slots.borrow_ref(cs);
            (slots.volatile, slots.persisted)
        });
        f.debug_struct("LocalAddressRegistry")
            .field("volatile", &volatile)
            .field("persisted", &persisted)
            .finish()
    }
}

impl LocalAddressRegistry {
    /// Registry over `store`
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(RefCell::new(Slots::default())),
        }
    }

    /// Update the local address.
    ///
    /// With `flush` the address also goes to the store. `None` with `flush`
    /// persists the current in-memory address.
    pub fn set_local(&self, addr: Option<&Address>, flush: bool) -> Result<(), LinkError> {
        let target = match (addr, flush) {
            (None, false) => return Err(LinkError::InvalidArgs("no address to set")),
            (Some(addr), _) => {
                if addr.is_unset() {
                    return Err(LinkError::InvalidArgs("address is unset"));
                }
                critical_section::with(|cs| {
                    self.slots.borrow_ref_mut(cs).volatile = Some(*addr);
                });
                debug!("Local address set to {:02x?}", addr.as_raw());
                *addr
            }
            (None, true) => critical_section::with(|cs| self.slots.borrow_ref(cs).volatile)
                .ok_or(LinkError::NotFound("local address"))?,
        };

        if flush {
            put_json(self.store.as_ref(), &RecordKey::LocalAddress, &target)?;
            self.store.flush()?;
            critical_section::with(|cs| {
                self.slots.borrow_ref_mut(cs).persisted = Some(target);
            });
            info!("Local address {:02x?} persisted", target.as_raw());
        }
        Ok(())
    }

    /// Current local address: volatile first, then persisted
    pub fn get_local(&self) -> Result<Address, LinkError> {
        let cached = critical_section::with(|cs| {
            let slots = self.slots.borrow_ref(cs);
            slots.volatile.or(slots.persisted)
        });
        if let Some(addr) = cached {
            return Ok(addr);
        }

        let stored: Option<Address> = get_json(self.store.as_ref(), &RecordKey::LocalAddress)?;
        let addr = stored.ok_or(LinkError::NotFound("local address"))?;
        critical_section::with(|cs| {
            self.slots.borrow_ref_mut(cs).persisted = Some(addr);
        });
        debug!("Local address {:02x?} loaded from store", addr.as_raw());
        Ok(addr)
    }

    /// Forget the address in RAM and in the store
    pub fn clear(&self) -> Result<(), LinkError> {
        critical_section::with(|cs| {
            *self.slots.borrow_ref_mut(cs) = Slots::default();
        });
        self.store.delete(&RecordKey::LocalAddress)?;
        Ok(())
    }
}

static GLOBAL: Mutex<RefCell<Option<Arc<LocalAddressRegistry>>>> = Mutex::new(RefCell::new(None));

/// Install the process-wide registry, returning it
pub fn init_global(store: Arc<dyn KvStore>) -> Arc<LocalAddressRegistry> {
    let registry = Arc::new(LocalAddressRegistry::new(store));
    critical_section::with(|cs| {
        *GLOBAL.borrow_ref_mut(cs) = Some(registry.clone());
    });
    registry
}

/// The process-wide registry, if installed
pub fn global() -> Option<Arc<LocalAddressRegistry>> {
    critical_section::with(|cs| GLOBAL.borrow_ref(cs).clone())
}

/// Drop the process-wide registry
pub fn deinit_global() {
    critical_section::with(|cs| {
        *GLOBAL.borrow_ref_mut(cs) = None;
    });
}
