//! # Statements module
//!
//! This module provide the ordered statements that set up the black duck
//! databases, roles and server tuning.

use crate::svc::database::Credentials;

pub const PING: &str = "SELECT 1;";

/// yields a row once the `bdio` database carries its own settings, the last
/// per-database step of the initialization
pub const INITIALIZED: &str = "SELECT d.datname FROM pg_catalog.pg_db_role_setting s \
     JOIN pg_catalog.pg_database d ON d.oid = s.setdatabase WHERE d.datname='bdio';";

pub const DATABASES: [&str; 3] = ["bds_hub", "bds_hub_report", "bdio"];

// -----------------------------------------------------------------------------
// Batch structure

/// statements to execute in order on a single database
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Batch {
    pub database: &'static str,
    pub statements: Vec<String>,
}

impl Batch {
    fn new(database: &'static str, statements: impl IntoIterator<Item = String>) -> Self {
        Self {
            database,
            statements: statements.into_iter().collect(),
        }
    }
}

/// quotes a string literal, doubling embedded single quotes
pub fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// returns the initialization batches of a fresh database server
pub fn initialization(credentials: &Credentials) -> Vec<Batch> {
    let mut roles = vec![
        format!("ALTER USER blackduck WITH password {};", literal(&credentials.admin)),
        "GRANT blackduck TO postgres;".to_string(),
    ];
    roles.extend(DATABASES.iter().map(|database| {
        format!("CREATE DATABASE {database} owner blackduck TEMPLATE template0 ENCODING SQL_ASCII;")
    }));
    roles.extend([
        "CREATE USER blackduck_user;".to_string(),
        format!("ALTER USER blackduck_user WITH password {};", literal(&credentials.user)),
        "CREATE USER blackduck_reporter;".to_string(),
    ]);

    let hub = [
        "CREATE EXTENSION pgcrypto;",
        "CREATE SCHEMA st AUTHORIZATION blackduck;",
        "GRANT USAGE ON SCHEMA st TO blackduck_user;",
        "GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON ALL TABLES IN SCHEMA st TO blackduck_user;",
        "GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA st to blackduck_user;",
        "ALTER DEFAULT PRIVILEGES IN SCHEMA st GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON TABLES TO blackduck_user;",
        "ALTER DEFAULT PRIVILEGES IN SCHEMA st GRANT ALL PRIVILEGES ON SEQUENCES TO blackduck_user;",
    ];

    let report = [
        "GRANT SELECT ON ALL TABLES IN SCHEMA public TO blackduck_reporter;",
        "ALTER DEFAULT PRIVILEGES FOR ROLE blackduck IN SCHEMA public GRANT SELECT ON TABLES TO blackduck_reporter;",
        "GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON ALL TABLES IN SCHEMA public TO blackduck_user;",
        "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT SELECT, INSERT, UPDATE, TRUNCATE, DELETE, REFERENCES ON TABLES TO blackduck_user;",
        "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL PRIVILEGES ON SEQUENCES TO blackduck_user;",
    ];

    let bdio = [
        "GRANT ALL PRIVILEGES ON DATABASE bdio TO blackduck_user;",
        "ALTER DATABASE bdio SET standard_conforming_strings TO ON;",
    ];

    vec![
        Batch::new("postgres", roles),
        Batch::new("bds_hub", hub.map(ToString::to_string)),
        Batch::new("bds_hub_report", report.map(ToString::to_string)),
        Batch::new("bdio", bdio.map(ToString::to_string)),
        Batch::new("postgres", tuning()),
    ]
}

fn tuning() -> Vec<String> {
    [
        ("autovacuum", "on"),
        ("autovacuum_max_workers", "20"),
        ("autovacuum_vacuum_cost_limit", "2000"),
        ("autovacuum_vacuum_cost_delay", "10ms"),
        ("checkpoint_completion_target", "0.8"),
        ("max_wal_size", "8GB"),
        ("checkpoint_timeout", "30min"),
        ("constraint_exclusion", "partition"),
        ("default_statistics_target", "100"),
        ("effective_cache_size", "256MB"),
        ("escape_string_warning", "off"),
        ("log_destination", "stderr"),
        ("log_directory", "pg_log"),
        ("log_filename", "postgresql_%a.log"),
        ("log_line_prefix", "%m %p "),
        ("log_rotation_age", "1440"),
        ("log_truncate_on_rotation", "on"),
        ("logging_collector", "on"),
        ("maintenance_work_mem", "32MB"),
        ("max_connections", "300"),
        ("max_locks_per_transaction", "256"),
        ("random_page_cost", "4.0"),
        ("shared_buffers", "1024MB"),
        ("standard_conforming_strings", "off"),
        ("temp_buffers", "16MB"),
        ("work_mem", "32MB"),
    ]
    .into_iter()
    .map(|(parameter, value)| format!("ALTER SYSTEM SET {parameter} = {};", literal(value)))
    .collect()
}

/// returns the statements giving the cloned roles the instance's own passwords
pub fn credentials(credentials: &Credentials) -> Vec<String> {
    vec![
        format!("ALTER USER postgres WITH password {};", literal(&credentials.postgres)),
        format!("ALTER USER blackduck WITH password {};", literal(&credentials.admin)),
        format!("ALTER USER blackduck_user WITH password {};", literal(&credentials.user)),
    ]
}
