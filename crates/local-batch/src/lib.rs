//! Run "remote" jobs as normal processes on the local system. This is
//! generally only useful for development and single-machine deployments; a
//! production install implements the batch-client port over the site's
//! actual submission system instead.

pub mod client;

pub use client::LocalBatchClient;
