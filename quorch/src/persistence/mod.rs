/// PostgreSQL persistence for continuation records.
///
/// This module provides `PostgresContinuationStore`, a PostgreSQL-backed
/// implementation of the [`ContinuationStore`](crate::continuation::ContinuationStore)
/// trait that lets suspended executions survive a restart.
pub mod postgres;

pub use postgres::PostgresContinuationStore;
