//! Compiled-in migrations
//!
//! New built-ins are appended to [`migrations`]; manifests in the discovery
//! directory cover everything that is just a list of shell steps.

mod postgresql;

pub use postgresql::PostgresqlUpgrade;

use crate::migration::{Migration, MigrationError};

/// Every built-in migration, in no particular order
pub fn migrations() -> Result<Vec<Box<dyn Migration>>, MigrationError> {
    Ok(vec![Box::new(PostgresqlUpgrade::new()?)])
}
