//! Per-block read/intent/write lock.
//!
//! Waiters are granted strictly in enqueue order: the head of the queue is
//! admitted when compatible with the current holders, and read batches form
//! naturally as consecutive readers each reach the head. Intent is compatible
//! with readers and exclusive with intent/write; an intent holder upgrades to
//! write atomically, ahead of every queued waiter.
//!
//! Each acquisition may carry an in-line callback, invoked the moment the
//! waiter has been enqueued (before the acquiring thread blocks). It runs
//! under the lock's internal mutex and must not reenter this lock.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum LockMode {
    Read,
    Intent,
    Write,
}

struct RwiState {
    readers: u32,
    intent: bool,
    writer: bool,
    upgrade_waiting: bool,
    queue: VecDeque<(u64, LockMode)>,
    next_ticket: u64,
}

impl RwiState {
    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer && !self.upgrade_waiting,
            LockMode::Intent => !self.intent && !self.writer && !self.upgrade_waiting,
            LockMode::Write => {
                self.readers == 0 && !self.intent && !self.writer && !self.upgrade_waiting
            }
        }
    }

    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Intent => self.intent = true,
            LockMode::Write => self.writer = true,
        }
    }
}

pub(crate) struct RwiLock {
    state: Mutex<RwiState>,
    cond: Condvar,
}

impl RwiLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RwiState {
                readers: 0,
                intent: false,
                writer: false,
                upgrade_waiting: false,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the lock is held in `mode`. `in_line` fires once the
    /// waiter is enqueued.
    pub(crate) fn acquire(&self, mode: LockMode, in_line: Option<&mut dyn FnMut()>) {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back((ticket, mode));
        if let Some(callback) = in_line {
            callback();
        }
        loop {
            let head = state.queue.front().copied();
            if head == Some((ticket, mode)) && state.compatible(mode) {
                state.queue.pop_front();
                state.grant(mode);
                // The new head may be compatible too (read batching).
                self.cond.notify_all();
                return;
            }
            self.cond.wait(&mut state);
        }
    }

    pub(crate) fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Read => {
                debug_assert!(state.readers > 0);
                state.readers -= 1;
            }
            LockMode::Intent => {
                debug_assert!(state.intent);
                state.intent = false;
            }
            LockMode::Write => {
                debug_assert!(state.writer);
                state.writer = false;
            }
        }
        self.cond.notify_all();
    }

    /// Atomically turns a held intent lock into a write lock, ahead of every
    /// queued waiter. Blocks until the current readers drain.
    pub(crate) fn upgrade_intent_to_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.intent && !state.writer);
        state.upgrade_waiting = true;
        while state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.intent = false;
        state.upgrade_waiting = false;
        state.writer = true;
    }

    /// Reverses an upgrade when the writer is done writing but keeps the lock.
    pub(crate) fn downgrade_write_to_intent(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer);
        state.writer = false;
        state.intent = true;
        self.cond.notify_all();
    }
}
