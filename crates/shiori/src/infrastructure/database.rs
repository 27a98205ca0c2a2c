use std::{ops::Deref, time::Duration};

use anyhow::{Context, anyhow};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};

use super::config::Config;

/// Shared handle to the library database.
#[derive(Clone)]
pub struct Pool(SqlitePool);

impl From<SqlitePool> for Pool {
    fn from(pool: SqlitePool) -> Self {
        Self(pool)
    }
}

impl Deref for Pool {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub create: bool,
    pub max_connections: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            create: true,
            max_connections: 4,
        }
    }
}

impl From<&Config> for DatabaseOptions {
    fn from(config: &Config) -> Self {
        Self {
            create: config.create_database,
            max_connections: config.database_connections.max(1),
        }
    }
}

/// Open the database configured in `config` and bring its schema up to date.
pub async fn open_database(config: &Config) -> Result<Pool, anyhow::Error> {
    connect(&config.database_path, &DatabaseOptions::from(config)).await
}

pub async fn establish_connection(
    database_path: &str,
    create: bool,
) -> Result<Pool, anyhow::Error> {
    connect(
        database_path,
        &DatabaseOptions {
            create,
            ..Default::default()
        },
    )
    .await
}

async fn connect(database_path: &str, options: &DatabaseOptions) -> Result<Pool, anyhow::Error> {
    let opts = SqliteConnectOptions::new()
        .create_if_missing(options.create)
        .filename(database_path)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .idle_timeout(Duration::from_secs(60))
        .connect_with(opts)
        .await
        .with_context(|| format!("cannot open database {database_path}"))?;

    match sqlx::migrate!("./migrations").run(&pool).await {
        Ok(()) => debug!("database {database_path} is up to date"),
        Err(MigrateError::VersionMismatch(version)) => {
            warn!("migration {version} of {database_path} was modified after it was applied")
        }
        Err(MigrateError::VersionMissing(version)) => {
            return Err(anyhow!(
                "database {database_path} has migration {version} unknown to this build of shiori"
            ));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Pool(pool))
}
