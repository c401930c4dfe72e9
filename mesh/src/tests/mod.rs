//! Internal tests module
//!
//! Multi-node scenarios that exercise several components together. They run
//! crate-internal so they can reach private helpers.

pub(crate) mod test_utils;
