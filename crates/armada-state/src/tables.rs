//! redb table definitions.

use redb::TableDefinition;

/// Workflows keyed by `{workflow_id}`.
pub const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");

/// Status transitions keyed by `{workflow_id}:{seq:08}`.
pub const TRANSITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transitions");
