// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Memory and disk budgets shared by every queue of a process.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::warn;

/// Budget of one resource (memory or disk).
///
/// Shared between queues through `Arc`; reservations are plain atomic
/// arithmetic and never block.
#[derive(Debug)]
pub struct ResourceManager {
    name:  &'static str,
    total: u64,
    used:  AtomicU64,
}

impl ResourceManager {
    pub const fn new(name: &'static str, total: u64) -> Self {
        Self {
            name,
            total,
            used: AtomicU64::new(0),
        }
    }

    /// Reserves `size` bytes; returns `false` and changes nothing if that
    /// would exceed the total.
    pub fn reserve(&self, size: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|after| *after <= self.total)
            })
            .is_ok()
    }

    /// Returns `size` bytes to the budget.
    pub fn release(&self, size: u64) {
        let result = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(size))
            });
        if let Ok(before) = result
            && before < size
        {
            warn!(resource = self.name, before, size, "Released more than was reserved");
        }
    }

    /// Whether `size` more bytes would currently fit.
    pub fn fits(&self, size: u64) -> bool { self.available() >= size }

    pub fn available(&self) -> u64 { self.total.saturating_sub(self.used()) }

    pub fn used(&self) -> u64 { self.used.load(Ordering::Acquire) }

    pub const fn total(&self) -> u64 { self.total }

    pub const fn name(&self) -> &'static str { self.name }
}

/// RAII reservation against a [`ResourceManager`].
///
/// The reserved bytes are released when the reservation is dropped, unless
/// they were handed over to another reservation first.
#[derive(Debug)]
pub struct ScopedReservation {
    resource: Arc<ResourceManager>,
    size:     u64,
}

impl ScopedReservation {
    /// Reserves `size` bytes, or returns `None` when they do not fit.
    pub fn reserve(resource: &Arc<ResourceManager>, size: u64) -> Option<Self> {
        resource.reserve(size).then(|| Self {
            resource: Arc::clone(resource),
            size,
        })
    }

    /// A reservation holding nothing, to be grown with
    /// [`hand_over`](Self::hand_over).
    pub fn empty(resource: &Arc<ResourceManager>) -> Self {
        Self {
            resource: Arc::clone(resource),
            size:     0,
        }
    }

    pub const fn size(&self) -> u64 { self.size }

    /// Moves the bytes held by `other` into this reservation.
    pub fn hand_over(&mut self, mut other: Self) {
        debug_assert!(Arc::ptr_eq(&self.resource, &other.resource));
        self.size += other.size;
        other.size = 0;
    }

    /// Shrinks the reservation to `new_size`, releasing the difference.
    pub fn reduce(&mut self, new_size: u64) {
        if new_size < self.size {
            self.resource.release(self.size - new_size);
            self.size = new_size;
        }
    }

    /// Grows the reservation to `new_size`; returns `false` when the extra
    /// bytes do not fit.
    pub fn grow(&mut self, new_size: u64) -> bool {
        if new_size <= self.size {
            return true;
        }
        if !self.resource.reserve(new_size - self.size) {
            return false;
        }
        self.size = new_size;
        true
    }
}

impl Drop for ScopedReservation {
    fn drop(&mut self) {
        if self.size > 0 {
            self.resource.release(self.size);
        }
    }
}
