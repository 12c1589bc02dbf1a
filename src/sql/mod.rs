// ============================================================================
// Typed SQL statements
// ============================================================================
//
// The engine never concatenates SQL: it builds statement values that a
// backend executes directly. `Display` renders them as SQL text for logs.
//
// ============================================================================

pub mod filter;
pub mod result;
pub mod statement;

pub use filter::{ColumnRef, CompareOp, Filter};
pub use result::ResultSet;
pub use statement::{
    DeleteStatement, InsertStatement, Join, OrderBy, SelectStatement, UpdateStatement,
};
