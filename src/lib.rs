pub mod config;
pub mod measurement;
pub mod pipeline;
pub mod queue;
pub mod reporter;
pub mod sampler;
pub mod sensor;
pub mod stats;
pub mod store;
