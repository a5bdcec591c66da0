//! Blocking connection pool for transports whose client library is
//! synchronous (SFTP).
//!
//! A [`SessionHandle`] borrows at most one connection from the pool and keeps
//! it while its depth counter is above zero, so code that already holds the
//! connection can acquire it again (recursive listing, for instance) without
//! waiting on itself.

use sealsnap_core::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::debug;

/// Opens new connections for a [`SessionPool`].
pub trait Connect: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn connect(&self) -> Result<Self::Conn>;
}

struct PoolState<T> {
    idle: Vec<T>,
    /// Connections currently alive, idle or borrowed.
    open: usize,
}

pub struct SessionPool<C: Connect> {
    connector: C,
    max_sessions: usize,
    state: Mutex<PoolState<C::Conn>>,
    available: Condvar,
}

impl<C: Connect> SessionPool<C> {
    pub fn new(connector: C, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            connector,
            max_sessions: max_sessions.max(1),
            state: Mutex::new(PoolState { idle: Vec::new(), open: 0 }),
            available: Condvar::new(),
        })
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn handle(self: &Arc<Self>) -> SessionHandle<C> {
        SessionHandle {
            pool: self.clone(),
            conn: None,
            depth: 0,
        }
    }

    /// Number of connections opened and not discarded.
    pub fn open_sessions(&self) -> usize {
        self.lock().open
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C::Conn>> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Takes an idle connection, opens a new one if below the limit, or waits.
    fn checkout(&self) -> Result<C::Conn> {
        let mut state = self.lock();

        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(conn);
            }
            if state.open < self.max_sessions {
                state.open += 1;
                break;
            }

            state = match self.available.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        drop(state);

        match self.connector.connect() {
            Ok(conn) => {
                debug!("Opened new transport session");
                Ok(conn)
            }
            Err(err) => {
                self.forget();
                Err(err)
            }
        }
    }

    fn checkin(&self, conn: C::Conn) {
        self.lock().idle.push(conn);
        self.available.notify_one();
    }

    fn forget(&self) {
        self.lock().open -= 1;
        self.available.notify_one();
    }
}

/// Per-task access to one pooled connection.
pub struct SessionHandle<C: Connect> {
    pool: Arc<SessionPool<C>>,
    conn: Option<C::Conn>,
    depth: usize,
}

impl<C: Connect> SessionHandle<C> {
    /// Returns the connection held by this handle, checking one out of the
    /// pool first if needed. Every call must be paired with [`Self::release`].
    pub fn acquire(&mut self) -> Result<&mut C::Conn> {
        if self.conn.is_none() {
            self.conn = Some(self.pool.checkout()?);
        }
        self.depth += 1;

        self.conn
            .as_mut()
            .ok_or_else(|| Error::Transport("Lost pooled session".to_string()))
    }

    /// Gives the connection back to the pool once the outermost acquisition
    /// is released.
    pub fn release(&mut self) {
        self.depth = self.depth.saturating_sub(1);

        if self.depth == 0 {
            if let Some(conn) = self.conn.take() {
                self.pool.checkin(conn);
            }
        }
    }

    /// Drops a broken connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.depth = 0;

        if self.conn.take().is_some() {
            self.pool.forget();
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<C: Connect> Drop for SessionHandle<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Dummy {
        connects: AtomicUsize,
        fail: bool,
    }

    impl Connect for Dummy {
        type Conn = usize;

        fn connect(&self) -> Result<usize> {
            if self.fail {
                return Err(Error::Transport("connection refused".to_string()));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn test_reentrant_acquire_reuses_session() {
        let pool = SessionPool::new(Dummy::default(), 1);
        let mut handle = pool.handle();

        let first = *handle.acquire().unwrap();
        let second = *handle.acquire().unwrap();
        assert_eq!(first, second);
        assert_eq!(handle.depth(), 2);

        handle.release();
        assert_eq!(pool.lock().idle.len(), 0);
        handle.release();
        assert_eq!(pool.lock().idle.len(), 1);

        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waits_for_free_session() {
        let pool = SessionPool::new(Dummy::default(), 1);

        let mut handle = pool.handle();
        handle.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut handle = pool.handle();
                let conn = *handle.acquire().unwrap();
                handle.release();
                conn
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        handle.release();
        assert_eq!(waiter.join().unwrap(), 0);
        assert_eq!(pool.open_sessions(), 1);
    }

    #[test]
    fn test_drop_returns_session() {
        let pool = SessionPool::new(Dummy::default(), 2);

        {
            let mut handle = pool.handle();
            handle.acquire().unwrap();
        }

        assert_eq!(pool.lock().idle.len(), 1);
    }

    #[test]
    fn test_discard_and_failed_connect_free_slots() {
        let pool = SessionPool::new(Dummy::default(), 1);

        let mut handle = pool.handle();
        handle.acquire().unwrap();
        handle.discard();
        assert_eq!(pool.open_sessions(), 0);

        let failing = SessionPool::new(
            Dummy {
                fail: true,
                ..Default::default()
            },
            1,
        );
        assert!(failing.handle().acquire().is_err());
        assert_eq!(failing.open_sessions(), 0);
    }
}
