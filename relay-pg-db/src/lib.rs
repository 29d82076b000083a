// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL connection pooling for the relay.
//!
//! Wraps a bb8 pool of async diesel connections. Instances of [`Db`] are
//! cheap to clone and share access to the same pool.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::anyhow;
use diesel::migration::{Migration, MigrationSource, MigrationVersion};
use diesel::pg::Pg;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use diesel_migrations::EmbeddedMigrations;
use tracing::info;
use url::Url;

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    // Number of connections to keep in the pool.
    #[arg(long, default_value_t = Self::default().db_connection_pool_size)]
    pub db_connection_pool_size: u32,

    // Time spent waiting for a connection from the pool to become available,
    // in milliseconds.
    #[arg(long, default_value_t = Self::default().db_connection_timeout_ms)]
    pub db_connection_timeout_ms: u64,
}

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_connection_pool_size: 20,
            db_connection_timeout_ms: 60_000,
        }
    }
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
    database_url: String,
}

// Wrapper over the pooled connection so callers do not depend on bb8 types.
pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl Db {
    // Construct a new DB connection pool talking to the database at
    // `database_url`. Clones share the same pool.
    pub async fn for_write(database_url: Url, args: DbArgs) -> anyhow::Result<Self> {
        let pool = pool(database_url.clone(), args).await?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    // Retrieves a connection from the pool. Fails with a timeout if no
    // connection becomes available within [DbArgs::connection_timeout].
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        Ok(Connection(self.pool.get().await?))
    }

    // Run embedded migrations on a dedicated (non-pooled) connection.
    // Diesel's migration harness is blocking, so the work is moved onto a
    // blocking thread via `AsyncConnectionWrapper`.
    pub async fn run_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        use diesel_migrations::MigrationHarness;

        info!("Running migrations ...");
        let conn = AsyncPgConnection::establish(&self.database_url).await?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();

        // Adapter: run_pending_migrations wants the source by value.
        struct Migrations(&'static EmbeddedMigrations);
        impl MigrationSource<Pg> for Migrations {
            fn migrations(&self) -> diesel::migration::Result<Vec<Box<dyn Migration<Pg>>>> {
                self.0.migrations()
            }
        }

        let finished_migrations = tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(Migrations(migrations))
                .map(|versions| versions.iter().map(MigrationVersion::as_owned).collect())
        })
        .await?
        .map_err(|e| anyhow!("Failed to run migrations: {e:?}"))?;

        info!("Migrations complete.");
        Ok(finished_migrations)
    }
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

async fn pool(database_url: Url, args: DbArgs) -> anyhow::Result<Pool<AsyncPgConnection>> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url.as_str());

    Ok(Pool::builder()
        .max_size(args.db_connection_pool_size)
        .connection_timeout(args.connection_timeout())
        .build(manager)
        .await?)
}
