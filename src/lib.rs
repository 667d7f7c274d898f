// Stowage - a unified caching facade for Rust
//
// This library re-exports the cache facade and its backends so applications
// can depend on a single crate and pick backends through features.

// Re-export the cache crate
pub use stowage_cache::*;

// Keep the crate itself reachable under its own name
pub use stowage_cache as cache;

// Prelude for common imports
pub mod prelude {
    pub use stowage_cache::prelude::*;
    pub use stowage_cache::{TagValue, from_value, to_value};
}
