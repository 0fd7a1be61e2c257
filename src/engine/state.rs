use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle of a single task instantiation.
///
/// ```text
/// Pending -> Ready -> Running -> Succeeded
///    |         |         |----> Failed
///    |         |         \----> Cancelled (recipe stopped on request)
///    |         \--------------> Cancelled
///    \------------------------> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Status {
    Pending = 0,
    Ready = 1,
    Running = 2,
    Succeeded = 3,
    Failed = 4,
    Cancelled = 5,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Pending,
            1 => Status::Ready,
            2 => Status::Running,
            3 => Status::Succeeded,
            4 => Status::Failed,
            _ => Status::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Cancelled)
    }

    fn can_become(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Pending, Ready | Failed | Cancelled)
                | (Ready, Running | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Pending => "pending",
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Per-instantiation state cells. Each transition is a single compare and
/// swap, so a cell is only ever moved forward by one actor.
#[derive(Debug)]
pub(crate) struct StateTable {
    cells: Vec<AtomicU8>,
}

impl StateTable {
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len)
                .map(|_| AtomicU8::new(Status::Pending as u8))
                .collect(),
        }
    }

    pub fn get(&self, index: usize) -> Status {
        Status::from_u8(self.cells[index].load(Ordering::Acquire))
    }

    /// Moves the cell from `from` to `to`. Returns `false` when the cell was
    /// not in `from` or the transition is not part of the lifecycle.
    pub fn transition(&self, index: usize, from: Status, to: Status) -> bool {
        if !from.can_become(to) {
            return false;
        }

        self.cells[index]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn snapshot(&self) -> Vec<Status> {
        (0..self.cells.len()).map(|i| self.get(i)).collect()
    }
}

/// Cooperative cancellation flag shared between the caller, the scheduler
/// and running recipes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
