//! Free-list of reusable records
//!
//! Records are handed out boxed so ownership moves between stages without
//! copying. Returning a record resets it; the pool keeps at most
//! [`MAX_POOLED`] spare records and lets the rest drop.

use super::record::TimeSeriesBinary;
use parking_lot::{const_mutex, Mutex};

/// Upper bound on spare records kept for reuse.
pub const MAX_POOLED: usize = 16_384;

static POOL: Mutex<Vec<Box<TimeSeriesBinary>>> = const_mutex(Vec::new());

/// Take a cleared record from the pool, allocating if it is empty.
pub fn get_series() -> Box<TimeSeriesBinary> {
    POOL.lock().pop().unwrap_or_default()
}

/// Reset a record and return it to the pool.
pub fn put_series(mut series: Box<TimeSeriesBinary>) {
    series.reset();
    let mut pool = POOL.lock();
    if pool.len() < MAX_POOLED {
        pool.push(series);
    }
}

/// Return every record in `series` to the pool.
pub fn put_series_slice(series: Vec<Box<TimeSeriesBinary>>) {
    for s in series {
        put_series(s);
    }
}

/// Number of spare records currently held.
pub fn pooled() -> usize {
    POOL.lock().len()
}
