use std::collections::HashMap;
use std::sync::{Arc, Condvar, LazyLock, Mutex};

/// The lock and wait channel shared by every in-process instance of one
/// semaphore name. Entries are never removed for the life of the process.
pub(crate) struct NameLock {
    pub mutex: Mutex<()>,
    pub waiters: Condvar,
}

static LOCKS: LazyLock<Mutex<HashMap<String, Arc<NameLock>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Canonical lock for `name`. Two instances of the same name get the same
/// lock, so release can wake in-process waiters without a database roundtrip.
pub(crate) fn lock_for(name: &str) -> Arc<NameLock> {
    let mut locks = LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks
        .entry(name.to_string())
        .or_insert_with(|| {
            Arc::new(NameLock {
                mutex: Mutex::new(()),
                waiters: Condvar::new(),
            })
        })
        .clone()
}
