//! Pipeline coordination core: bounded transport, work offloading,
//! and stage orchestration.

pub mod channel;
pub mod offload;
pub mod pipeline;
