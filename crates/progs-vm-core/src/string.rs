//! Program strings
//!
//! A string handle is an `i32` whose range picks the storage:
//!
//! - `0` is the empty string
//! - `>= 0` is an offset into the program's constant blob
//! - `-1 ..= -pool` is a slot of the rotating scratch pool
//! - `< -pool` is a persistent string, live until released

use crate::error::AccessError;

/// Handle to a program string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StringHandle(pub i32);

impl StringHandle {
    /// The empty string
    pub const EMPTY: Self = Self(0);

    /// Whether this is the empty handle
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Which storage a handle addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    /// Offset into the constant blob
    Constant(usize),
    /// Scratch pool slot
    Scratch(usize),
    /// Persistent string slot
    Persistent(usize),
}

/// Constant, scratch and persistent strings of one VM instance
#[derive(Debug, Clone)]
pub struct StringTable {
    constants: Box<[u8]>,
    scratch: Vec<Vec<u8>>,
    scratch_size: usize,
    next_scratch: usize,
    persistent: Vec<Option<Box<[u8]>>>,
    free_persistent: Vec<usize>,
}

impl StringTable {
    /// Create a table over a validated constant blob
    ///
    /// `pool` scratch buffers of `scratch_size` bytes each are allocated up
    /// front; a pool of zero is treated as one.
    pub fn new(constants: &[u8], pool: usize, scratch_size: usize) -> Self {
        let pool = pool.max(1);
        Self {
            constants: constants.into(),
            scratch: (0..pool)
                .map(|_| Vec::with_capacity(scratch_size))
                .collect(),
            scratch_size,
            next_scratch: 0,
            persistent: Vec::new(),
            free_persistent: Vec::new(),
        }
    }

    /// Number of scratch buffers
    pub fn pool_size(&self) -> usize {
        self.scratch.len()
    }

    /// Size of each scratch buffer in bytes
    pub fn scratch_size(&self) -> usize {
        self.scratch_size
    }

    /// Classify a handle without resolving it
    pub fn kind(&self, handle: StringHandle) -> Option<StringKind> {
        let h = handle.0 as i64;
        let pool = self.scratch.len() as i64;
        if h >= 0 {
            let offset = h as usize;
            (offset == 0 || offset < self.constants.len()).then_some(StringKind::Constant(offset))
        } else if -h <= pool {
            Some(StringKind::Scratch((-h - 1) as usize))
        } else {
            let slot = (-h - pool - 1) as usize;
            (slot < self.persistent.len()).then_some(StringKind::Persistent(slot))
        }
    }

    /// Bytes of a string, up to its first NUL
    pub fn resolve(&self, handle: StringHandle) -> Result<&[u8], AccessError> {
        let bytes: &[u8] = match self.kind(handle) {
            Some(StringKind::Constant(offset)) => &self.constants[offset..],
            Some(StringKind::Scratch(slot)) => &self.scratch[slot],
            Some(StringKind::Persistent(slot)) => self.persistent[slot]
                .as_deref()
                .ok_or(AccessError::String(handle.0))?,
            None => return Err(AccessError::String(handle.0)),
        };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(&bytes[..end])
    }

    /// String as text, replacing invalid UTF-8
    pub fn resolve_lossy(&self, handle: StringHandle) -> Result<String, AccessError> {
        self.resolve(handle)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Copy bytes into the next scratch buffer
    ///
    /// The copy stops at the first NUL and is truncated to the buffer size.
    /// The buffer that was written longest ago is overwritten.
    pub fn new_scratch(&mut self, bytes: &[u8]) -> StringHandle {
        let slot = self.next_scratch;
        self.next_scratch = (slot + 1) % self.scratch.len();

        let len = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len())
            .min(self.scratch_size);
        let buffer = &mut self.scratch[slot];
        buffer.clear();
        buffer.extend_from_slice(&bytes[..len]);
        StringHandle(-(slot as i32) - 1)
    }

    /// Copy bytes into a string that lives until [`free_persistent`](Self::free_persistent)
    pub fn alloc_persistent(&mut self, bytes: &[u8]) -> StringHandle {
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let data: Box<[u8]> = bytes[..len].into();
        let slot = match self.free_persistent.pop() {
            Some(slot) => {
                self.persistent[slot] = Some(data);
                slot
            }
            None => {
                self.persistent.push(Some(data));
                self.persistent.len() - 1
            }
        };
        StringHandle(-(self.scratch.len() as i32) - 1 - slot as i32)
    }

    /// Release a persistent string
    pub fn free_persistent(&mut self, handle: StringHandle) -> Result<(), AccessError> {
        match self.kind(handle) {
            Some(StringKind::Persistent(slot)) if self.persistent[slot].is_some() => {
                self.persistent[slot] = None;
                self.free_persistent.push(slot);
                Ok(())
            }
            _ => Err(AccessError::String(handle.0)),
        }
    }

    /// Number of live persistent strings
    pub fn live_persistent(&self) -> usize {
        self.persistent.iter().filter(|s| s.is_some()).count()
    }

    /// Look up a constant string by content
    pub fn find_constant(&self, text: &[u8]) -> Option<StringHandle> {
        if text.is_empty() {
            return Some(StringHandle::EMPTY);
        }
        let mut start = 0;
        for (i, &b) in self.constants.iter().enumerate() {
            if b == 0 {
                if &self.constants[start..i] == text {
                    return Some(StringHandle(start as i32));
                }
                start = i + 1;
            }
        }
        None
    }

    /// Drop every runtime string
    pub fn reset(&mut self) {
        for buffer in &mut self.scratch {
            buffer.clear();
        }
        self.next_scratch = 0;
        self.persistent.clear();
        self.free_persistent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StringTable {
        StringTable::new(b"\0hello\0world\0", 4, 16)
    }

    #[test]
    fn test_constants() {
        let t = table();
        assert_eq!(t.resolve(StringHandle(0)).unwrap(), b"");
        assert_eq!(t.resolve(StringHandle(1)).unwrap(), b"hello");
        assert_eq!(t.resolve(StringHandle(3)).unwrap(), b"llo");
        assert_eq!(t.resolve(StringHandle(7)).unwrap(), b"world");
        assert_eq!(
            t.resolve(StringHandle(13)),
            Err(AccessError::String(13))
        );
    }

    #[test]
    fn test_scratch_round_robin() {
        let mut t = table();
        let first = t.new_scratch(b"one");
        assert_eq!(first, StringHandle(-1));
        assert_eq!(t.resolve(first).unwrap(), b"one");

        let handles: Vec<_> = (0..3).map(|i| t.new_scratch(format!("s{i}").as_bytes())).collect();
        assert_eq!(handles, [StringHandle(-2), StringHandle(-3), StringHandle(-4)]);
        assert_eq!(t.resolve(first).unwrap(), b"one");

        // pool wraps and reuses the oldest buffer
        let wrapped = t.new_scratch(b"five");
        assert_eq!(wrapped, first);
        assert_eq!(t.resolve(first).unwrap(), b"five");
    }

    #[test]
    fn test_scratch_truncates() {
        let mut t = StringTable::new(b"\0", 1, 4);
        let h = t.new_scratch(b"abcdefgh");
        assert_eq!(t.resolve(h).unwrap(), b"abcd");
        let h = t.new_scratch(b"ab\0cd");
        assert_eq!(t.resolve(h).unwrap(), b"ab");
    }

    #[test]
    fn test_persistent_lifecycle() {
        let mut t = table();
        let a = t.alloc_persistent(b"alpha");
        let b = t.alloc_persistent(b"beta");
        assert!(a.0 < -4 && b.0 < -4);
        assert_eq!(t.resolve(a).unwrap(), b"alpha");
        assert_eq!(t.live_persistent(), 2);

        t.free_persistent(a).unwrap();
        assert_eq!(t.resolve(a), Err(AccessError::String(a.0)));
        assert_eq!(t.free_persistent(a), Err(AccessError::String(a.0)));

        let c = t.alloc_persistent(b"gamma");
        assert_eq!(c, a);
        assert_eq!(t.resolve(c).unwrap(), b"gamma");
        assert_eq!(t.resolve(b).unwrap(), b"beta");
    }

    #[test]
    fn test_unknown_negative_handle() {
        let t = table();
        assert_eq!(t.resolve(StringHandle(-5)), Err(AccessError::String(-5)));
        assert_eq!(
            t.resolve(StringHandle(i32::MIN)),
            Err(AccessError::String(i32::MIN))
        );
    }

    #[test]
    fn test_reset_drops_runtime_strings() {
        let mut t = table();
        let s = t.new_scratch(b"tmp");
        let p = t.alloc_persistent(b"keep");
        t.reset();
        assert_eq!(t.resolve(s).unwrap(), b"");
        assert!(t.resolve(p).is_err());
        assert_eq!(t.live_persistent(), 0);
    }

    #[test]
    fn test_empty_handle_without_constants() {
        let strings = StringTable::new(b"", 2, 8);
        assert_eq!(strings.resolve(StringHandle::EMPTY).unwrap(), b"");
        assert_eq!(strings.kind(StringHandle(1)), None);
    }

    #[test]
    fn test_find_constant() {
        let t = table();
        assert_eq!(t.find_constant(b"world"), Some(StringHandle(7)));
        assert_eq!(t.find_constant(b""), Some(StringHandle::EMPTY));
        assert_eq!(t.find_constant(b"nope"), None);
    }
}
