//! Core contract types shared across stage boundaries.

pub mod traits;
pub mod types;
