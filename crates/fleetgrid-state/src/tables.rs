//! redb table definitions for the snapshot store.
//!
//! Each table uses `&str` keys (the record id) and `&[u8]` values holding the
//! JSON-serialized record.

use redb::TableDefinition;

/// Instance records keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Task records keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Service specs keyed by service name.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");
