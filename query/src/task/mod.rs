//! Background timers used by queries, observers and mutations: garbage
//! collection, stale timeouts and refetch intervals.

pub(crate) mod timer;
