// ============================================================================
// Schema Registry
// ============================================================================
//
// Class descriptors are compiled once into a registry; everything else
// consumes the classified fields as static data.
//
// ============================================================================

pub mod ddl;
pub mod descriptor;
pub mod registry;

pub use descriptor::{
    ClassDescriptor, CollectionKind, Constructor, FieldDescriptor, FieldKind, ELEMENT_COLUMN,
    ID_COLUMN, KEY_COLUMN, OWNER_COLUMN, POSITION_COLUMN, VALUE_COLUMN,
};
pub use registry::{RegistryBuilder, SchemaRegistry};
