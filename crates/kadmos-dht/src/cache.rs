//! Correlated-request cache
//!
//! Maps in-flight request ids to response callbacks with deadlines. The
//! listener dispatches inbound responses through here; a sweeper task
//! expires entries whose deadline has passed with `RequestTimeout`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::trace;

use crate::error::{DhtError, DhtResult};
use crate::node::Key;
use crate::protocol::Event;

/// A response handler. Invoked once per correlated event (a request may
/// legitimately receive several chunked responses); returning true
/// retires the entry.
pub type ResponseCallback = Box<dyn FnMut(DhtResult<&Event>) -> bool + Send>;

struct Pending {
    deadline: Instant,
    callback: ResponseCallback,
}

/// Pending requests keyed by their 32-byte request id
pub struct RequestCache {
    requests: Mutex<HashMap<Key, Pending>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Register a callback for a request id. Any previous entry under
    /// the same id is replaced.
    pub fn set(&self, id: &Key, deadline: Instant, callback: ResponseCallback) {
        self.requests
            .lock()
            .unwrap()
            .insert(*id, Pending { deadline, callback });
    }

    /// Drop a pending entry without invoking it, e.g. when the request
    /// could not be written to the socket
    pub fn remove(&self, id: &Key) -> bool {
        self.requests.lock().unwrap().remove(id).is_some()
    }

    /// Deliver a correlated event (or terminal error) to the pending
    /// callback. The callback runs without the cache lock held; it is
    /// re-registered when it reports more responses are expected.
    pub fn dispatch(&self, id: &Key, result: DhtResult<&Event>) {
        let entry = self.requests.lock().unwrap().remove(id);

        let Some(mut pending) = entry else {
            trace!(id = %hex::encode(&id[..6]), "response for unknown request");
            return;
        };

        let done = (pending.callback)(result);

        if !done {
            let mut requests = self.requests.lock().unwrap();
            // a replacement registered while the callback ran wins
            requests.entry(*id).or_insert(pending);
        }
    }

    /// Expire every entry past its deadline, delivering `RequestTimeout`
    /// to each callback. Returns the number of entries expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();

        let expired: Vec<(Key, Pending)> = {
            let mut requests = self.requests.lock().unwrap();
            let ids: Vec<Key> = requests
                .iter()
                .filter(|(_, pending)| now >= pending.deadline)
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| requests.remove(&id).map(|pending| (id, pending)))
                .collect()
        };

        let count = expired.len();

        for (id, mut pending) in expired {
            trace!(id = %hex::encode(&id[..6]), "request timed out");
            (pending.callback)(Err(DhtError::RequestTimeout));
        }

        count
    }

    /// The number of requests currently awaiting responses
    pub fn len(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().unwrap().is_empty()
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}
