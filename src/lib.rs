//! Brezza fetches and caches the remote assets a static blog build needs:
//! Open Graph metadata for link cards, intrinsic image dimensions, and
//! ThumbHash placeholders. Every pipeline is backed by a persistent on-disk
//! cache with per-pipeline TTLs, so repeated builds only touch the network
//! for URLs that are new or stale.

pub mod cache;
pub mod config;
pub mod infra;
pub mod pipeline;
mod util;
