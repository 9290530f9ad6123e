//! Concrete sources and sinks for the collaborator traits.

pub mod sinks;
pub mod sources;
