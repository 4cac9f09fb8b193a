//! Global lock coordinating cooperative code with the slot interrupt.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use core::sync::atomic::{AtomicBool, Ordering};

use crate::log::trace;

/// A single lock protecting schedule and neighbour list mutation from
/// non-interrupt code.
///
/// Acquisition never blocks the interrupt side: the slot engine observes
/// `lock_requested` at slot entry and skips the slot instead of contending.
/// The cooperative side sets the request flag, waits for any in-flight slot
/// to finish, then takes the lock. Failure to acquire is returned to the
/// caller, which must back off.
#[derive(Debug)]
pub struct Lock {
    locked: AtomicBool,
    requested: AtomicBool,
    in_slot_operation: AtomicBool,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            in_slot_operation: AtomicBool::new(false),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Take the lock, suspending slot operation. Returns false if already held.
    pub fn acquire(&self) -> bool {
        if self.locked.load(Ordering::Acquire) {
            trace!("failed to take lock");
            return false;
        }

        // Make sure no new slot operation will start
        self.requested.store(true, Ordering::Release);
        // Wait for the end of the current slot operation
        while self.in_slot_operation.load(Ordering::Acquire) {}

        if !self.locked.load(Ordering::Acquire) {
            self.locked.store(true, Ordering::Release);
            self.requested.store(false, Ordering::Release);
            return true;
        }
        false
    }

    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Is a cooperative task waiting for the lock?
    pub fn request_pending(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Mark slot operation entry, called from the timer interrupt only
    pub fn enter_slot_operation(&self) {
        self.in_slot_operation.store(true, Ordering::Release);
    }

    /// Mark slot operation exit, called from the timer interrupt only
    pub fn exit_slot_operation(&self) {
        self.in_slot_operation.store(false, Ordering::Release);
    }

    pub fn in_slot_operation(&self) -> bool {
        self.in_slot_operation.load(Ordering::Acquire)
    }
}
