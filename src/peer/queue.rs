use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::peer::Bitfield;

/// A piece nobody has delivered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pieces: VecDeque<PieceWork>,
    closed: bool,
}

/// FIFO of outstanding pieces shared by every download worker. A worker only
/// ever takes a piece its peer has; failed pieces go back on the tail.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(pieces: impl IntoIterator<Item = PieceWork>) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState { pieces: pieces.into_iter().collect(), closed: false }),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, work: PieceWork) {
        self.state.lock().await.pieces.push_back(work);
        self.notify.notify_waiters();
    }

    /// Removes the first queued piece that `bitfield` has. Parks until the
    /// queue changes when nothing matches; `None` once the queue is closed.
    pub async fn next_for(&self, bitfield: &Bitfield) -> Option<PieceWork> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(pos) = state.pieces.iter().position(|w| bitfield.has_piece(w.index as usize)) {
                    return state.pieces.remove(pos);
                }
            }
            notified.await;
        }
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pieces.len()
    }
}
