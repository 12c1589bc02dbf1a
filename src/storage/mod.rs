pub mod memory;
pub mod table;

pub use memory::MemoryDatabase;
pub use table::Table;
