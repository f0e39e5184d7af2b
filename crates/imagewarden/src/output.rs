//! Output sinks for audit results.

pub(crate) mod csv;
pub(crate) mod plain;
