//! Merged-group kinds: per-entity-kind field recipes.
//!
//! Each kind wraps a [`MergedGroup`](crate::merge::MergedGroup) with the
//! role-specific knowledge of which fields its shared body needs: the
//! archetype's configuration decides the recipe, the members supply the
//! values.

pub mod population;
pub mod projection;

pub use population::{DelayAdvanceGroup, PopulationGroup};
pub use projection::{ConnectivityInitGroup, InflowDelayAdvanceGroup, ProjectionGroup, ProjectionRole};
