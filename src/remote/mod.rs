//! Remote tier plumbing.
//!
//! - [`adapter`]: the `RemoteStore` contract and an in-memory implementation
//! - [`tier`]: `RemoteTier`, which binds a store to one cache instance

pub mod adapter;
pub mod tier;
