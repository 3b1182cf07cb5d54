//! Admission policy for inbound connections.
//!
//! At most one connection waits at a time. While the coordinator is busy
//! it is retried on a timer until it gets in or runs out of attempts; a
//! second connection arriving meanwhile is turned away.

use std::time::Duration;

use tokio::time::Instant;

/// What to do with a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict<T> {
    /// Serve it now.
    Accept(T),
    /// Close it.
    Reject(T),
    /// It is waiting; `attempts` tries so far.
    Queued { attempts: u32 },
}

struct Waiting<T> {
    conn: T,
    attempts: u32,
    retry_at: Instant,
}

/// Accept / queue / reject state machine, generic over the connection.
pub struct Admission<T> {
    waiting: Option<Waiting<T>>,
    interval: Duration,
    limit: u32,
}

impl<T> Admission<T> {
    pub fn new(interval: Duration, limit: u32) -> Self {
        Self {
            waiting: None,
            interval,
            limit: limit.max(1),
        }
    }

    /// A new connection arrived. `busy` is whether anything would stop it
    /// from being served right now.
    pub fn incoming(&mut self, conn: T, busy: bool) -> Verdict<T> {
        if self.waiting.is_some() {
            return Verdict::Reject(conn);
        }
        if !busy {
            return Verdict::Accept(conn);
        }
        self.waiting = Some(Waiting {
            conn,
            attempts: 1,
            retry_at: Instant::now() + self.interval,
        });
        Verdict::Queued { attempts: 1 }
    }

    /// The retry timer fired. Returns `None` when nothing is waiting.
    pub fn retry(&mut self, busy: bool) -> Option<Verdict<T>> {
        let mut waiting = self.waiting.take()?;
        if !busy {
            return Some(Verdict::Accept(waiting.conn));
        }
        if waiting.attempts >= self.limit {
            return Some(Verdict::Reject(waiting.conn));
        }
        waiting.attempts += 1;
        waiting.retry_at = Instant::now() + self.interval;
        let attempts = waiting.attempts;
        self.waiting = Some(waiting);
        Some(Verdict::Queued { attempts })
    }

    /// When the waiting connection should be retried.
    pub fn next_retry(&self) -> Option<Instant> {
        self.waiting.as_ref().map(|w| w.retry_at)
    }

    /// The waiting connection and its attempt count.
    pub fn waiting(&self) -> Option<(&T, u32)> {
        self.waiting.as_ref().map(|w| (&w.conn, w.attempts))
    }

    /// Removes the waiting connection, e.g. on shutdown.
    pub fn take(&mut self) -> Option<T> {
        self.waiting.take().map(|w| w.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission() -> Admission<&'static str> {
        Admission::new(Duration::from_secs(1), 3)
    }

    #[test]
    fn idle_accepts_immediately() {
        let mut a = admission();
        assert_eq!(a.incoming("peer", false), Verdict::Accept("peer"));
        assert!(a.next_retry().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_queues_and_a_second_connection_is_rejected() {
        let mut a = admission();
        let start = Instant::now();
        assert_eq!(a.incoming("first", true), Verdict::Queued { attempts: 1 });
        assert_eq!(a.next_retry(), Some(start + Duration::from_secs(1)));

        // Even when idle, a second connection does not jump the queue.
        assert_eq!(a.incoming("second", false), Verdict::Reject("second"));
        assert_eq!(a.waiting(), Some((&"first", 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_limit() {
        let mut a = admission();
        a.incoming("peer", true);
        assert_eq!(a.retry(true), Some(Verdict::Queued { attempts: 2 }));
        assert_eq!(a.retry(true), Some(Verdict::Queued { attempts: 3 }));
        assert_eq!(a.retry(true), Some(Verdict::Reject("peer")));
        assert_eq!(a.retry(true), None);
        assert!(a.next_retry().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_accepts_once_idle() {
        let mut a = admission();
        a.incoming("peer", true);
        a.retry(true);
        assert_eq!(a.retry(false), Some(Verdict::Accept("peer")));
        assert!(a.take().is_none());
    }
}
