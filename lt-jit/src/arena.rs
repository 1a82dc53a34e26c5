use tracing::debug;

use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::region::Region;

/// Writable code buffer with a cursor. Callers keep offsets, never pointers,
/// because a growable arena moves when it runs out of room.
pub struct Arena {
    region: Region,
    cursor: usize,
    growable: bool,
    max_capacity: usize,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("growable", &self.growable)
            .finish()
    }
}

impl Arena {
    /// A growable arena starting at `capacity` bytes.
    pub fn new(capacity: usize) -> JitResult<Self> {
        Self::from_config(&JitConfig {
            arena_bytes: capacity,
            ..JitConfig::default()
        })
    }

    pub fn fixed(capacity: usize) -> JitResult<Self> {
        Self::from_config(&JitConfig::fixed(capacity))
    }

    pub fn from_config(config: &JitConfig) -> JitResult<Self> {
        if config.arena_bytes == 0 {
            return Err(JitError::InvalidArena("capacity must be non-zero"));
        }
        let region = Region::map(config.arena_bytes)?;
        let max_capacity = if config.growable {
            config.max_arena_bytes.max(region.len())
        } else {
            region.len()
        };
        Ok(Self {
            region,
            cursor: 0,
            growable: config.growable,
            max_capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn offset(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    pub fn is_growable(&self) -> bool {
        self.growable
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Guarantees room for `n` more bytes, growing if allowed.
    pub fn reserve(&mut self, n: usize) -> JitResult<()> {
        let needed = self.cursor.checked_add(n).ok_or(JitError::OutOfSpace {
            requested: n,
            available: self.remaining(),
        })?;
        if needed <= self.capacity() {
            return Ok(());
        }
        if !self.growable || needed > self.max_capacity {
            return Err(JitError::OutOfSpace {
                requested: n,
                available: self.remaining(),
            });
        }
        let target = self
            .capacity()
            .saturating_mul(2)
            .max(needed)
            .min(self.max_capacity);
        let mut grown = Region::map(target)?;
        grown.copy_in(0, self.region.read(0, self.cursor))?;
        debug!(
            from = self.capacity(),
            to = grown.len(),
            used = self.cursor,
            "grew code arena"
        );
        self.region = grown;
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) -> JitResult<()> {
        if bytes.len() > self.remaining() {
            return Err(JitError::OutOfSpace {
                requested: bytes.len(),
                available: self.remaining(),
            });
        }
        self.region.copy_in(self.cursor, bytes)?;
        self.cursor += bytes.len();
        Ok(())
    }

    /// Overwrites already emitted bytes at `at`.
    pub fn patch(&mut self, at: usize, bytes: &[u8]) -> JitResult<()> {
        self.check_written(at, bytes.len())?;
        self.region.copy_in(at, bytes)
    }

    pub fn read(&self, at: usize, len: usize) -> JitResult<&[u8]> {
        self.check_written(at, len)?;
        Ok(self.region.read(at, len))
    }

    pub fn code(&self) -> &[u8] {
        self.region.read(0, self.cursor)
    }

    /// Current base address. Only stable once the arena stops growing.
    pub fn base_address(&self) -> usize {
        self.region.as_ptr() as usize
    }

    pub(crate) fn finalize(mut self) -> JitResult<ExecutableCode> {
        self.region.make_executable(self.cursor)?;
        Ok(ExecutableCode {
            region: self.region,
            len: self.cursor,
        })
    }

    fn check_written(&self, at: usize, len: usize) -> JitResult<()> {
        match at.checked_add(len) {
            Some(end) if end <= self.cursor => Ok(()),
            _ => Err(JitError::InvalidArena("access outside emitted code")),
        }
    }
}

/// Read-execute memory holding finalized code. Dropping it unmaps the code.
pub struct ExecutableCode {
    region: Region,
    len: usize,
}

impl ExecutableCode {
    pub fn as_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.region.read(0, self.len)
    }

    /// Gives up ownership; the mapping stays alive until passed back to
    /// [`ExecutableCode::from_raw`].
    pub fn into_raw(self) -> RawCode {
        let len = self.len;
        let (ptr, mapped) = self.region.into_raw();
        RawCode { ptr, len, mapped }
    }

    /// # Safety
    /// `raw` must come from [`ExecutableCode::into_raw`] and be used once.
    pub unsafe fn from_raw(raw: RawCode) -> Self {
        Self {
            region: unsafe { Region::from_raw(raw.ptr, raw.mapped) },
            len: raw.len,
        }
    }
}

impl std::fmt::Debug for ExecutableCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableCode")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCode {
    pub ptr: *mut u8,
    pub len: usize,
    pub mapped: usize,
}
