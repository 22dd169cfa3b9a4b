// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-length array of `f32` counters mapped into two unrelated processes.
//!
//! Every slot is an `AtomicU32` holding the bit pattern of an `f32`. Updates run a
//! compare-and-swap loop over that bit pattern, so concurrent writers in the agent and the
//! instrumented application never lose an update and never need a lock.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::errors::ShmError;

const SLOT_SIZE: usize = std::mem::size_of::<AtomicU32>();

/// POSIX shared memory object name of the segment created for a monitored PID.
#[must_use]
pub fn segment_name(pid: i32) -> String {
    format!("/tirion-{pid}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backing {
    /// A POSIX shared memory object.
    Shm,
    /// A regular file mapped with `MAP_SHARED`.
    File(PathBuf),
}

#[derive(Debug)]
pub struct SharedCounterArray {
    name: String,
    backing: Backing,
    ptr: NonNull<c_void>,
    map_len: usize,
    count: usize,
    owner: bool,
    closed: bool,
}

// The mapping is only ever accessed through `AtomicU32`.
unsafe impl Send for SharedCounterArray {}
unsafe impl Sync for SharedCounterArray {}

impl SharedCounterArray {
    /// Creates and zeroes a new POSIX shared memory segment for `count` counters.
    ///
    /// The returned handle owns the segment and removes it on [`close`](Self::close).
    pub fn create(name: &str, count: usize) -> Result<Self, ShmError> {
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => ShmError::SegmentExists(name.to_string()),
            errno => io_error(name, errno.into()),
        })?;

        let file = File::from(fd);
        let result = Self::map_new(name, Backing::Shm, &file, count);
        if result.is_err() {
            let _ = mman::shm_unlink(name);
        }
        result
    }

    /// Opens an existing POSIX shared memory segment. The handle never removes it.
    pub fn attach(name: &str, count: usize) -> Result<Self, ShmError> {
        let fd = mman::shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|errno| match errno {
            Errno::ENOENT => ShmError::NotFound(name.to_string()),
            errno => io_error(name, errno.into()),
        })?;

        Self::map_existing(name, Backing::Shm, &File::from(fd), count)
    }

    /// Creates a regular file holding `count` zeroed counters and maps it shared.
    pub fn create_file(path: &Path, count: usize) -> Result<Self, ShmError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => ShmError::SegmentExists(name.clone()),
                _ => io_error(&name, source),
            })?;

        let result = Self::map_new(&name, Backing::File(path.to_path_buf()), &file, count);
        if result.is_err() {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    pub fn attach_file(path: &Path, count: usize) -> Result<Self, ShmError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => ShmError::NotFound(name.clone()),
                _ => io_error(&name, source),
            })?;

        Self::map_existing(&name, Backing::File(path.to_path_buf()), &file, count)
    }

    fn map_new(name: &str, backing: Backing, file: &File, count: usize) -> Result<Self, ShmError> {
        let map_len = map_len(count);
        // A freshly sized object reads as zero, which is also the bit pattern of 0.0f32.
        file.set_len(map_len as u64)
            .map_err(|source| io_error(name, source))?;

        Self::map(name, backing, file, count, map_len, true)
    }

    fn map_existing(
        name: &str,
        backing: Backing,
        file: &File,
        count: usize,
    ) -> Result<Self, ShmError> {
        let expected = count * SLOT_SIZE;
        let actual = file
            .metadata()
            .map_err(|source| io_error(name, source))?
            .len() as usize;
        if actual < expected {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }

        Self::map(name, backing, file, count, map_len(count), false)
    }

    fn map(
        name: &str,
        backing: Backing,
        file: &File,
        count: usize,
        map_len: usize,
        owner: bool,
    ) -> Result<Self, ShmError> {
        let length = NonZeroUsize::new(map_len).ok_or_else(|| {
            io_error(name, io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"))
        })?;

        // SAFETY: a fresh shared mapping of a descriptor we own; the kernel picks the address.
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }
        .map_err(|errno| io_error(name, errno.into()))?;

        debug!("Mapped shared counters {name} with {count} slots");

        Ok(Self {
            name: name.to_string(),
            backing,
            ptr,
            map_len,
            count,
            owner,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn counters(&self) -> &[AtomicU32] {
        if self.closed {
            return &[];
        }
        // SAFETY: the mapping is page aligned, at least `count` slots long and stays mapped
        // until `close`, which needs `&mut self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<AtomicU32>(), self.count) }
    }

    fn slot(&self, index: i32) -> Option<&AtomicU32> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.counters().get(index))
    }

    fn update(&self, index: i32, op: impl Fn(f32) -> f32) -> f32 {
        let Some(slot) = self.slot(index) else {
            return 0.0;
        };
        let previous = match slot.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
            Some(op(f32::from_bits(bits)).to_bits())
        }) {
            Ok(bits) | Err(bits) => bits,
        };
        op(f32::from_bits(previous))
    }

    /// Current value, or `0.0` for an index outside the array.
    pub fn get(&self, index: i32) -> f32 {
        self.slot(index)
            .map_or(0.0, |slot| f32::from_bits(slot.load(Ordering::SeqCst)))
    }

    /// Stores `value` and returns the previous value.
    pub fn set(&self, index: i32, value: f32) -> f32 {
        self.slot(index).map_or(0.0, |slot| {
            f32::from_bits(slot.swap(value.to_bits(), Ordering::SeqCst))
        })
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, index: i32, delta: f32) -> f32 {
        self.update(index, |value| value + delta)
    }

    pub fn sub(&self, index: i32, delta: f32) -> f32 {
        self.update(index, |value| value - delta)
    }

    pub fn inc(&self, index: i32) -> f32 {
        self.add(index, 1.0)
    }

    pub fn dec(&self, index: i32) -> f32 {
        self.sub(index, 1.0)
    }

    /// Copies all values. Each slot is read atomically; slots are not read at one instant.
    pub fn snapshot(&self) -> Vec<f32> {
        self.counters()
            .iter()
            .map(|slot| f32::from_bits(slot.load(Ordering::SeqCst)))
            .collect()
    }

    /// Unmaps the counters and, for the creating handle, removes the segment.
    ///
    /// Calling it again is a no-op. After the first call every accessor returns `0.0`.
    pub fn close(&mut self) -> Result<(), ShmError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // SAFETY: `ptr` and `map_len` come from the successful mmap in `map` and no slice
        // borrowed from the mapping can outlive this `&mut self`.
        let unmapped = unsafe { mman::munmap(self.ptr, self.map_len) }
            .map_err(|errno| io_error(&self.name, errno.into()));

        if self.owner {
            let removed = match &self.backing {
                Backing::Shm => mman::shm_unlink(self.name.as_str())
                    .map_err(|errno| io_error(&self.name, errno.into())),
                Backing::File(path) => {
                    std::fs::remove_file(path).map_err(|source| io_error(&self.name, source))
                }
            };
            debug!("Removed shared counters {}", self.name);
            removed?;
        }

        unmapped
    }
}

impl Drop for SharedCounterArray {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing shared counters: {e}");
        }
    }
}

fn map_len(count: usize) -> usize {
    count.max(1) * SLOT_SIZE
}

fn io_error(name: &str, source: io::Error) -> ShmError {
    ShmError::Io {
        name: name.to_string(),
        source,
    }
}
