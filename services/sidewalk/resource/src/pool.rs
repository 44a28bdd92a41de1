//! Fixed-block message pool.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use critical_section::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ForeignMessage, ResourceError};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Allocation priority
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Best effort
    Low = 0,
    /// Regular traffic
    #[default]
    Normal = 1,
    /// May use reserved blocks
    High = 2,
    /// Link control traffic
    Critical = 3,
}

/// Pool geometry and defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Header room reserved in front of each payload
    pub offset: u16,
    /// Bytes per block
    pub block_size: u16,
    /// Number of blocks
    pub block_count: u16,
    /// Blocks only `High` and above may take
    pub high_priority_reserve: u16,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            offset: 16,
            block_size: 288,
            block_count: 16,
            high_priority_reserve: 0,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Blocks currently handed out
    pub in_use: usize,
    /// Blocks available
    pub free: usize,
    /// Highest `in_use` seen
    pub peak_in_use: usize,
    /// Requests that ended in `OutOfMemory`
    pub alloc_failures: u64,
    /// Times the no-memory callback ran
    pub no_memory_callbacks: u64,
}

/// Called once when a request cannot be served, with the requested size and priority.
///
/// The callback may release messages back to the pool; the request is retried once.
pub type NoMemoryCallback = dyn Fn(&ResourceManager, usize, Priority) + Send + Sync;

/// Handle to one allocated block.
///
/// The handle is the only way to reach the block and is consumed by
/// [`ResourceManager::free`].
#[derive(Debug)]
#[must_use = "a message must be returned with ResourceManager::free"]
pub struct Message {
    pool: u32,
    slot: u16,
    offset: u16,
    end: u16,
    priority: Priority,
}

impl Message {
    /// Current data length
    pub fn len(&self) -> usize {
        (self.end - self.offset) as usize
    }

    /// Whether the data region is empty
    pub fn is_empty(&self) -> bool {
        self.end == self.offset
    }

    /// Start of the data region within the block
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    /// Priority the block was allocated with
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

struct PoolState {
    arena: Vec<u8>,
    in_use: Vec<bool>,
    free: Vec<u16>,
    stats: PoolStats,
}

/// Priority-aware block allocator
pub struct ResourceManager {
    id: u32,
    config: ResourceManagerConfig,
    state: Mutex<RefCell<PoolState>>,
    on_no_memory: Mutex<RefCell<Option<Arc<NoMemoryCallback>>>>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResourceManager {
    /// Create a pool with the given geometry
    pub fn new(config: ResourceManagerConfig) -> Result<Self, ResourceError> {
        if config.block_size == 0 || config.block_count == 0 {
            return Err(ResourceError::InvalidArgs("empty pool"));
        }
        if config.offset > config.block_size {
            return Err(ResourceError::InvalidArgs("offset exceeds block size"));
        }
        if config.high_priority_reserve >= config.block_count {
            return Err(ResourceError::InvalidArgs("reserve covers whole pool"));
        }

        let blocks = config.block_count as usize;
        let state = PoolState {
            arena: vec![0u8; blocks * config.block_size as usize],
            in_use: vec![false; blocks],
            // Pop from the back hands out low slots first
            free: (0..config.block_count).rev().collect(),
            stats: PoolStats {
                free: blocks,
                ..PoolStats::default()
            },
        };

        debug!(
            "Resource pool created: {} blocks of {} bytes, offset {}",
            config.block_count, config.block_size, config.offset
        );

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            state: Mutex::new(RefCell::new(state)),
            on_no_memory: Mutex::new(RefCell::new(None)),
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// Register the no-memory callback, replacing any previous one
    pub fn set_no_memory_callback<F>(&self, callback: F)
    where
        F: Fn(&ResourceManager, usize, Priority) + Send + Sync + 'static,
    {
        let callback: Arc<NoMemoryCallback> = Arc::new(callback);
        critical_section::with(|cs| {
            *self.on_no_memory.borrow_ref_mut(cs) = Some(callback);
        });
    }

    /// Remove the no-memory callback
    pub fn clear_no_memory_callback(&self) {
        critical_section::with(|cs| {
            *self.on_no_memory.borrow_ref_mut(cs) = None;
        });
    }

    /// Allocate `size` bytes behind the configured header offset
    pub fn get_with_priority(
        &self,
        size: usize,
        priority: Priority,
    ) -> Result<Message, ResourceError> {
        self.get_with_offset_and_priority(size, self.config.offset as usize, priority)
    }

    /// Allocate `size` bytes behind `offset` bytes of header room
    pub fn get_with_offset_and_priority(
        &self,
        size: usize,
        offset: usize,
        priority: Priority,
    ) -> Result<Message, ResourceError> {
        offset
            .checked_add(size)
            .filter(|end| *end <= self.config.block_size as usize)
            .ok_or(ResourceError::InvalidArgs("request exceeds block size"))?;

        if let Some(msg) = self.try_alloc(size, offset, priority) {
            return Ok(msg);
        }

        let callback = critical_section::with(|cs| self.on_no_memory.borrow_ref(cs).clone());
        if let Some(callback) = callback {
            critical_section::with(|cs| {
                self.state.borrow_ref_mut(cs).stats.no_memory_callbacks += 1;
            });
            // Run without holding the pool so the callback can free
            callback(self, size, priority);

            if let Some(msg) = self.try_alloc(size, offset, priority) {
                debug!("Allocation of {} bytes succeeded after no-memory callback", size);
                return Ok(msg);
            }
        }

        critical_section::with(|cs| {
            self.state.borrow_ref_mut(cs).stats.alloc_failures += 1;
        });
        warn!("Out of memory: {} bytes at {:?} priority", size, priority);
        Err(ResourceError::OutOfMemory { size })
    }

    fn try_alloc(&self, size: usize, offset: usize, priority: Priority) -> Option<Message> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);

            let reserve = self.config.high_priority_reserve as usize;
            if priority < Priority::High && state.free.len() <= reserve {
                return None;
            }

            let slot = state.free.pop()?;
            state.in_use[slot as usize] = true;
            state.stats.in_use += 1;
            state.stats.free -= 1;
            state.stats.peak_in_use = state.stats.peak_in_use.max(state.stats.in_use);

            let base = slot as usize * self.config.block_size as usize;
            let block = &mut state.arena[base..base + self.config.block_size as usize];
            block.fill(0);

            Some(Message {
                pool: self.id,
                slot,
                offset: offset as u16,
                end: (offset + size) as u16,
                priority,
            })
        })
    }

    /// Move the start of the data region by `delta` bytes without copying.
    ///
    /// Negative values open header room, positive values strip leading bytes.
    pub fn update_offset(&self, msg: &mut Message, delta: i32) -> Result<(), ResourceError> {
        self.check_owner(msg)?;

        let offset = i32::from(msg.offset)
            .checked_add(delta)
            .filter(|offset| (0..=i32::from(msg.end)).contains(offset))
            .ok_or(ResourceError::InvalidArgs("offset outside block"))?;
        msg.offset = offset as u16;
        Ok(())
    }

    /// Shorten the data region to `len` bytes
    pub fn truncate(&self, msg: &mut Message, len: usize) -> Result<(), ResourceError> {
        self.check_owner(msg)?;

        if len > msg.len() {
            return Err(ResourceError::InvalidArgs("truncate beyond data"));
        }
        msg.end = msg.offset + len as u16;
        Ok(())
    }

    /// Release a message back to the pool.
    ///
    /// A message from another pool is handed back untouched inside the error.
    pub fn free(&self, msg: Message) -> Result<(), ForeignMessage> {
        if msg.pool != self.id {
            return Err(ForeignMessage(msg));
        }

        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let slot = msg.slot as usize;
            assert!(state.in_use[slot], "block {} released while free", slot);

            state.in_use[slot] = false;
            state.free.push(msg.slot);
            state.stats.in_use -= 1;
            state.stats.free += 1;
        });
        Ok(())
    }

    /// Run `f` over the data region
    pub fn with_data<R>(
        &self,
        msg: &Message,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ResourceError> {
        self.check_owner(msg)?;
        let (start, end) = self.bounds(msg);
        Ok(critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            f(&state.arena[start..end])
        }))
    }

    /// Run `f` over the mutable data region
    pub fn with_data_mut<R>(
        &self,
        msg: &Message,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, ResourceError> {
        self.check_owner(msg)?;
        let (start, end) = self.bounds(msg);
        Ok(critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            f(&mut state.arena[start..end])
        }))
    }

    /// Copy `data` into the data region at `at`
    pub fn write(&self, msg: &Message, at: usize, data: &[u8]) -> Result<(), ResourceError> {
        let end = at
            .checked_add(data.len())
            .filter(|end| *end <= msg.len())
            .ok_or(ResourceError::InvalidArgs("write past end of message"))?;
        self.with_data_mut(msg, |buf| buf[at..end].copy_from_slice(data))
    }

    /// Copy the data region out
    pub fn to_vec(&self, msg: &Message) -> Result<Vec<u8>, ResourceError> {
        self.with_data(msg, |buf| buf.to_vec())
    }

    /// Blocks currently available
    pub fn available(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref(cs).free.len())
    }

    /// Snapshot of pool statistics
    pub fn stats(&self) -> PoolStats {
        critical_section::with(|cs| self.state.borrow_ref(cs).stats)
    }

    fn check_owner(&self, msg: &Message) -> Result<(), ResourceError> {
        if msg.pool != self.id {
            return Err(ResourceError::InvalidArgs("message from another pool"));
        }
        Ok(())
    }

    fn bounds(&self, msg: &Message) -> (usize, usize) {
        let base = msg.slot as usize * self.config.block_size as usize;
        (base + msg.offset as usize, base + msg.end as usize)
    }
}
