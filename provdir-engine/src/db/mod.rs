//! Repositories over the directory store
//!
//! Functions take any `SqliteExecutor` (pool, connection or transaction) unless they need
//! several statements on one connection, in which case they take `&mut SqliteConnection`.

pub mod acceptances;
pub mod conflicts;
pub mod discrepancies;
pub mod locations;
pub mod observations;
pub mod plans;
pub mod providers;
pub mod runs;
pub mod settings;
pub mod verifications;
