// ============================================================================
// Domain objects
// ============================================================================
//
// Objects are dynamic: a class name, an id, and a map of field values whose
// shapes follow the class's field descriptors.
//
// ============================================================================

pub mod domain;
pub mod field;
pub mod handle;
pub mod record;
pub mod validity;

pub use domain::DomainObject;
pub use field::{FieldValue, ObjectRef};
pub use handle::ObjectHandle;
pub use record::ObjectRecord;
pub use validity::{FieldIssue, Severity, Validity};

/// Object identity, unique within a class family (a root class and its
/// subclasses).
pub type ObjectId = i64;
