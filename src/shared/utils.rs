use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::{Connection, PgConnection};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn establish_pg_connection(database_url: &str) -> Result<PgConnection> {
    PgConnection::establish(database_url)
        .with_context(|| format!("Failed to connect to database at {}", database_url))
}

pub fn create_conn(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .build(manager)
        .with_context(|| format!("Failed to build connection pool for {}", database_url))
}

/// Run database migrations
pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS).map_err(
        |e| -> Box<dyn std::error::Error + Send + Sync> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Migration error: {}", e),
            ))
        },
    )?;
    Ok(())
}
