//! Database connection and initialization.

pub use ccfleet_core::db::DatabaseError;

ccfleet_core::define_database!(Database);
