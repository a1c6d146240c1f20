//! Proxy-port allocator
//!
//! Hands out unique local ports for proxy listeners from a configured
//! range. The allocator tracks only its own hand-outs; whether a port is
//! actually free on the host is discovered by the caller's bind attempt.

use parking_lot::Mutex;
use std::collections::HashSet;

use crate::error::PortError;

/// Base of the default proxy-port range
pub const DEFAULT_PORT_RANGE_BASE: u16 = 48128;

/// Size of the default proxy-port range (48128-65535)
pub const DEFAULT_PORT_RANGE_SIZE: u16 = 17408;

/// An inclusive-from-base port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: u16,
    pub size: u16,
}

impl PortRange {
    #[must_use]
    pub const fn new(base: u16, size: u16) -> Self {
        Self { base, size }
    }

    /// Whether this range is the empty placeholder
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `port` falls inside the range
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.base && (port as u32) < self.base as u32 + self.size as u32
    }
}

impl Default for PortRange {
    /// The default high ephemeral slice used when no range is configured
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_BASE, DEFAULT_PORT_RANGE_SIZE)
    }
}

/// Allocation source for proxy listener ports
pub trait PortAllocator: Send + Sync {
    /// Allocate the next free port. Never returns zero.
    ///
    /// # Errors
    ///
    /// Returns `PortError::Exhausted` when every port in the range is out.
    fn allocate_next(&self) -> Result<u16, PortError>;

    /// Return a port to the pool. Releasing an unallocated port is a no-op.
    fn release(&self, port: u16);
}

struct AllocatorState {
    used: HashSet<u16>,
    /// Offset of the next candidate, so freshly released ports are not
    /// immediately handed back while their sockets may linger in TIME_WAIT
    cursor: u16,
}

/// Range-backed [`PortAllocator`]
pub struct RangePortAllocator {
    range: PortRange,
    state: Mutex<AllocatorState>,
}

impl RangePortAllocator {
    /// Create an allocator over `range`; an empty or zero-based range
    /// selects the default (port zero is never handed out) and a range
    /// running past port 65535 is truncated to fit.
    #[must_use]
    pub fn new(range: PortRange) -> Self {
        let mut range = if range.is_empty() || range.base == 0 {
            PortRange::default()
        } else {
            range
        };
        let max_size = u16::try_from(65536u32 - u32::from(range.base)).unwrap_or(u16::MAX);
        range.size = range.size.min(max_size);
        Self {
            range,
            state: Mutex::new(AllocatorState {
                used: HashSet::new(),
                cursor: 0,
            }),
        }
    }

    /// The range this allocator serves from
    #[must_use]
    pub const fn range(&self) -> PortRange {
        self.range
    }

    /// Number of currently allocated ports
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.state.lock().used.len()
    }
}

impl Default for RangePortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate_next(&self) -> Result<u16, PortError> {
        let mut state = self.state.lock();
        for step in 0..self.range.size {
            let offset = (state.cursor.wrapping_add(step)) % self.range.size;
            let port = self.range.base + offset;
            if state.used.insert(port) {
                state.cursor = (offset + 1) % self.range.size;
                return Ok(port);
            }
        }
        Err(PortError::Exhausted {
            base: self.range.base,
            size: self.range.size,
        })
    }

    fn release(&self, port: u16) {
        self.state.lock().used.remove(&port);
    }
}
