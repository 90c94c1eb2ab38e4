//! Database migrations.

pub use sea_orm_migration::*;

mod m20261019_000001_create_import_job_table;
mod m20261019_000002_create_configuration_table;
mod m20261019_000003_create_import_entity_table;
mod m20261019_000004_create_tracker_table;
mod m20261019_000005_create_batch_tracker_table;
mod m20261019_000006_create_failure_table;
mod m20261019_000007_create_export_table;
mod m20261019_000008_create_export_batch_table;
mod m20261019_000009_create_export_upload_table;
mod m20261019_000010_create_portable_route_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261019_000001_create_import_job_table::Migration),
            Box::new(m20261019_000002_create_configuration_table::Migration),
            Box::new(m20261019_000003_create_import_entity_table::Migration),
            Box::new(m20261019_000004_create_tracker_table::Migration),
            Box::new(m20261019_000005_create_batch_tracker_table::Migration),
            Box::new(m20261019_000006_create_failure_table::Migration),
            Box::new(m20261019_000007_create_export_table::Migration),
            Box::new(m20261019_000008_create_export_batch_table::Migration),
            Box::new(m20261019_000009_create_export_upload_table::Migration),
            Box::new(m20261019_000010_create_portable_route_table::Migration),
        ]
    }
}
