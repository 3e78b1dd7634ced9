//! Worker pool: the dispatcher, its capacity index, and the workers.
//!
//! - [`manager`] - [`Dispatcher`](manager::Dispatcher): selection,
//!   reconciliation, growth and drain.
//! - [`index`] - [`PoolIndex`](index::PoolIndex): workers bucketed by last
//!   known free capacity.
//! - [`worker`] - [`Worker`](worker::Worker): per-worker capacity and mailbox
//!   loop.

pub mod index;
pub mod manager;
pub mod worker;
