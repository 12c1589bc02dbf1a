// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Backend transactions keep an undo log of row-level changes.
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::Change;
pub use state::{Transaction, TransactionId};
