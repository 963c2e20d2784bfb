//! Bounded hand-off queue between connection tasks and `accept` callers.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::endpoint::ConnectError;

pub(crate) struct Queue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    err: Option<ConnectError>,
}

impl<T> Queue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                capacity,
                err: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item, failing when the queue is full or closed
    pub(crate) fn put(&self, x: T) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.err.is_some() || state.items.len() >= state.capacity {
            return false;
        }
        state.items.push_back(x);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_full(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.err.is_some() || state.items.len() >= state.capacity
    }

    /// Remove the next item, waiting until one arrives, the queue is closed,
    /// or the caller cancels
    pub(crate) async fn get(&self, cancel: &CancellationToken) -> Result<T, ConnectError> {
        loop {
            // Register for wakeups before inspecting state, so a put or
            // close landing in between is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(x) = state.items.pop_front() {
                    return Ok(x);
                }
                if let Some(err) = &state.err {
                    return Err(err.clone());
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            }
        }
    }

    /// Fail all pending and future `get` calls with `err`
    ///
    /// Items already queued are dropped; their connections are being torn
    /// down by whoever closed the queue.
    pub(crate) fn close(&self, err: ConnectError) {
        let mut state = self.state.lock().unwrap();
        if state.err.is_none() {
            state.err = Some(err);
            state.items.clear();
        }
        drop(state);
        self.notify.notify_waiters();
    }
}
