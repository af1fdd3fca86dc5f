//! Placement validation for pdes-core.
//!
//! The kernel tags every NUMA block with a node and binds its pages with
//! `mbind`. Binding can silently fall back (no privileges, cgroups, a
//! single-node host), so this crate checks where the pages really ended up.

pub mod placement;

pub use placement::{
    page_size, pages_of, query_pages, verify_block, verify_manager, verify_region, PlacementError,
    PlacementReport,
};
