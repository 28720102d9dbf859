mod base;
mod v1_to_v2;

pub use base::CREATE_SCHEMA_SQL;
#[cfg(test)]
pub use base::V1_SCHEMA_SQL;
use v1_to_v2::UPGRADE_1_TO_2_SQL;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// One forward step of the metadata schema. `sql` runs inside an immediate
/// transaction; the runner bumps `schema_version` in the same transaction.
pub struct Migration {
    pub from_version: u32,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    from_version: 1,
    sql: UPGRADE_1_TO_2_SQL,
}];
