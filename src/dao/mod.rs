pub mod builders;
pub mod class_dao;

// Re-export main types
pub use builders::TextQuery;
pub use class_dao::{ClassQueries, ClassRepository};
