use num::{Num, Zero};
use std::sync::Mutex;

use crate::status::RpcError;

// Top-level type aliases
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// Correlation id of one in-flight client call.
pub type CallId = u64;

pub trait SeqId: Zero + PartialEq + Ord + Copy {
    fn inc(self) -> Self;
}

impl<T: Num + Ord + Copy> SeqId for T {
    fn inc(self) -> Self {
        self + Self::one()
    }
}

/// Hands out monotonically increasing ids, starting from zero.
#[derive(Debug)]
pub struct Sequencer<SI: SeqId = CallId> {
    next: Mutex<SI>,
}

impl<SI: SeqId> Sequencer<SI> {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(SI::zero()),
        }
    }

    pub fn next(&self) -> SI {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let id = *next;
        *next = id.inc();
        id
    }
}

impl<SI: SeqId> Default for Sequencer<SI> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn sequencer_counts_from_zero() {
    let ids = Sequencer::<u16>::new();
    assert!(ids.next() == 0);
    assert!(ids.next() == 1);
    assert!(ids.next() == 2);
}
