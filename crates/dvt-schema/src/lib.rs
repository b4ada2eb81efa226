//! Schema descriptor and dependency-tier planning.
//!
//! The descriptor names each entity's reference fields and the many-to-many
//! relationships; [TierPlan::build] turns that into an import plan where
//! every reference either resolves by tier order or is deferred to the
//! second pass.

mod descriptor;
mod tier;

pub use descriptor::{
    EntityDescriptor, FieldDescriptor, RelationshipDescriptor, SchemaDescriptor,
};
pub use tier::TierPlan;
