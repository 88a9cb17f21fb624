// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Copying hypercall argument records across the privilege boundary.

use hvm_defs::HvmError;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// The guest buffer could not be accessed.
#[derive(Debug, Error)]
#[error("guest access fault")]
pub struct GuestAccessFault;

/// A caller-supplied argument buffer.
pub trait GuestHandle: Send + Sync {
    /// Copies `buf.len()` bytes from the start of the buffer.
    fn read(&self, buf: &mut [u8]) -> Result<(), GuestAccessFault>;

    /// Copies `data` to the start of the buffer.
    fn write(&self, data: &[u8]) -> Result<(), GuestAccessFault>;
}

/// Reads a `T` from the argument buffer. A null buffer is a bad address.
pub(crate) fn copy_from_guest<T: FromBytes + IntoBytes>(
    arg: Option<&dyn GuestHandle>,
) -> Result<T, HvmError> {
    let arg = arg.ok_or(HvmError::BadAddress)?;
    let mut value = T::new_zeroed();
    arg.read(value.as_mut_bytes())
        .map_err(|_| HvmError::BadAddress)?;
    Ok(value)
}

/// Writes `value` back to the argument buffer.
pub(crate) fn copy_to_guest<T: IntoBytes + Immutable>(
    arg: Option<&dyn GuestHandle>,
    value: &T,
) -> Result<(), HvmError> {
    let arg = arg.ok_or(HvmError::BadAddress)?;
    arg.write(value.as_bytes())
        .map_err(|_| HvmError::BadAddress)
}

/// An argument buffer in host memory.
#[derive(Debug, Default)]
pub struct GuestBuffer {
    data: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl GuestBuffer {
    /// Creates a buffer holding `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            ..Default::default()
        }
    }

    /// Creates a buffer holding the bytes of `value`.
    pub fn from_obj<T: IntoBytes + Immutable>(value: &T) -> Self {
        Self::new(value.as_bytes().to_vec())
    }

    /// Reads the buffer as a `T`, or `None` if it is too short.
    pub fn read_obj<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.data.lock()).ok().map(|(v, _)| v)
    }

    /// Makes subsequent reads fault.
    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::Relaxed);
    }

    /// Makes subsequent writes fault.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Relaxed);
    }
}

impl GuestHandle for GuestBuffer {
    fn read(&self, buf: &mut [u8]) -> Result<(), GuestAccessFault> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(GuestAccessFault);
        }
        let data = self.data.lock();
        let src = data.get(..buf.len()).ok_or(GuestAccessFault)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), GuestAccessFault> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(GuestAccessFault);
        }
        let mut buf = self.data.lock();
        let dst = buf.get_mut(..data.len()).ok_or(GuestAccessFault)?;
        dst.copy_from_slice(data);
        Ok(())
    }
}
