pub mod error;
pub mod types;
pub mod value;

pub use error::{ConstraintKind, ConstraintViolation, OrmError, Result, Violation};
pub use types::{ColumnMeta, ForeignKeyRef, Row, TableMeta};
pub use value::{DataType, Value};
