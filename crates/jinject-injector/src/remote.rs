//! Owned resources inside (or pointing at) the target process.

use crate::ops::{OsError, ProcessHandle, ProcessOps, RawHandle, RemoteAddr};

/// Closes an OS handle on drop.
pub(crate) struct ScopedHandle<'a, O: ProcessOps> {
    ops: &'a O,
    raw: RawHandle,
}

impl<'a, O: ProcessOps> ScopedHandle<'a, O> {
    pub(crate) fn new(ops: &'a O, raw: RawHandle) -> Self {
        Self { ops, raw }
    }
}

impl<O: ProcessOps> Drop for ScopedHandle<'_, O> {
    fn drop(&mut self) {
        self.ops.close_handle(self.raw);
    }
}

/// Buffers allocated in the target for one injection.
///
/// Every allocation is freed exactly once, by [`RemoteResource::release`]
/// or on drop, whatever happened in between.
pub(crate) struct RemoteResource<'a, O: ProcessOps> {
    ops: &'a O,
    process: ProcessHandle,
    buffers: Vec<RemoteAddr>,
}

impl<'a, O: ProcessOps> RemoteResource<'a, O> {
    pub(crate) fn new(ops: &'a O, process: ProcessHandle) -> Self {
        Self {
            ops,
            process,
            buffers: Vec::with_capacity(2),
        }
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<RemoteAddr, OsError> {
        let addr = self.ops.alloc(self.process, size)?;
        self.buffers.push(addr);
        Ok(addr)
    }

    /// Write `bytes` at `addr`; a short write is reported as the number of
    /// bytes actually written.
    pub(crate) fn write(&self, addr: RemoteAddr, bytes: &[u8]) -> Result<(), WriteFailure> {
        match self.ops.write(self.process, addr, bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(WriteFailure::Short {
                written: n,
                expected: bytes.len(),
            }),
            Err(e) => Err(WriteFailure::Os(e)),
        }
    }

    /// Free every buffer still held. A second call is a no-op.
    pub(crate) fn release(&mut self) {
        for addr in self.buffers.drain(..) {
            self.ops.free(self.process, addr);
        }
    }
}

impl<O: ProcessOps> Drop for RemoteResource<'_, O> {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
pub(crate) enum WriteFailure {
    Short { written: usize, expected: usize },
    Os(OsError),
}
