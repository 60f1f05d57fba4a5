//! The transaction clock.
//!
//! Transaction ids and timestamps are process-wide shared state. They come
//! from one [`TxSequencer`], created at startup from the backend's latest
//! recorded transaction and handed to every writer.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::version::{TxId, TxStamp};

/// Wall-clock source; swapped for [`ManualClock`] in tests.
pub trait Clock: Send + Sync + 'static {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self { Self { now: Mutex::new(start) } }

  pub fn set(&self, t: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner) = t;
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> { *self.now.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// Hands out strictly increasing transaction stamps.
///
/// Timestamps follow the wall clock but never repeat or go backwards: if the
/// clock has not advanced past the previous stamp, the next stamp is one
/// microsecond later.
pub struct TxSequencer {
  clock: Arc<dyn Clock>,
  last:  Mutex<Option<TxStamp>>,
}

impl TxSequencer {
  /// `last` is the most recent stamp already persisted, if any.
  pub fn new(clock: Arc<dyn Clock>, last: Option<TxStamp>) -> Self {
    Self { clock, last: Mutex::new(last) }
  }

  fn after(&self, prev: Option<TxStamp>) -> TxStamp {
    let now = self.clock.now();
    match prev {
      Some(prev) => TxStamp {
        tx_id:        TxId(prev.tx_id.0 + 1),
        tx_timestamp: now.max(prev.tx_timestamp + Duration::microseconds(1)),
      },
      None => TxStamp { tx_id: TxId(1), tx_timestamp: now },
    }
  }

  pub fn next(&self) -> TxStamp {
    let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
    let stamp = self.after(*last);
    *last = Some(stamp);
    stamp
  }

  /// The stamp [`TxSequencer::next`] would hand out now, without taking it.
  pub fn peek(&self) -> TxStamp { self.after(self.last()) }

  /// Current wall-clock time; the default `valid_at` of current-state reads.
  pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

  pub fn last(&self) -> Option<TxStamp> {
    *self.last.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl std::fmt::Debug for TxSequencer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TxSequencer").field("last", &self.last()).finish()
  }
}
