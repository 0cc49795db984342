use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// FIFO queue drained by one caller at a time.
///
/// Producers push under their own ordering lock and learn whether they became
/// the drainer. Whoever drains keeps popping until the queue is empty, so
/// items pushed while draining (even from inside the drain itself) are handed
/// over in push order without anyone waiting on a lock.
pub(crate) struct DrainQueue<T> {
    state: Mutex<DrainState<T>>,
}

struct DrainState<T> {
    items: VecDeque<T>,
    draining: bool,
}

impl<T> Default for DrainQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(DrainState {
                items: VecDeque::new(),
                draining: false,
            }),
        }
    }
}

impl<T> DrainQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `items`; returns `true` when the caller must now drain.
    pub(crate) fn push_all(&self, items: impl IntoIterator<Item = T>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.items.extend(items);
        if state.draining || state.items.is_empty() {
            return false;
        }
        state.draining = true;
        true
    }

    /// Next item for the drainer. `None` ends the drain and releases the role.
    pub(crate) fn next(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let item = state.items.pop_front();
        if item.is_none() {
            state.draining = false;
        }
        item
    }
}
