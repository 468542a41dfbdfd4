#![forbid(unsafe_code)]

//! Keyword crawler that partitions a date range into weekly windows, searches
//! each window, filters candidates and hands matches to an external fetch tool
//! and encoder. Completed work is tracked in a ledger so reruns are cheap.

pub mod acquire;
pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod credential;
pub mod error;
pub mod filter;
pub mod finalize;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod provider;
pub mod retry;
pub mod search;
pub mod timetext;
pub mod window;

#[cfg(test)]
pub(crate) mod testutil;
