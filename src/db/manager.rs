use std::sync::Arc;

use tracing::info;

use crate::config::{DatabaseConfig, DbType};
use crate::db::memory::MemoryStore;
use crate::db::{
    DatabaseError, MessageStore, PortalStore, PuppetStore, ReactionStore, ThreadStore, UserStore,
};

#[cfg(feature = "postgres")]
use crate::db::postgres::{self, PostgresStore};
#[cfg(feature = "sqlite")]
use crate::db::sqlite::{self, SqliteStore};
#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::r2d2::{self, ConnectionManager};

#[derive(Clone)]
enum Backend {
    Memory,
    #[cfg(feature = "postgres")]
    Postgres(Arc<PostgresStore>),
    #[cfg(feature = "sqlite")]
    Sqlite(Arc<SqliteStore>),
}

#[derive(Clone)]
pub struct DatabaseManager {
    backend: Backend,
    portal_store: Arc<dyn PortalStore>,
    puppet_store: Arc<dyn PuppetStore>,
    user_store: Arc<dyn UserStore>,
    message_store: Arc<dyn MessageStore>,
    thread_store: Arc<dyn ThreadStore>,
    reaction_store: Arc<dyn ReactionStore>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        match config.db_type() {
            DbType::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager =
                    ConnectionManager::<diesel::pg::PgConnection>::new(config.connection_string());
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections().unwrap_or(10))
                    .min_idle(Some(config.min_connections().unwrap_or(1)))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;
                let store = Arc::new(PostgresStore::new(pool));
                Ok(Self::with_store(Backend::Postgres(store.clone()), store))
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is not configured".to_string())
                })?;
                let manager = ConnectionManager::<diesel::sqlite::SqliteConnection>::new(path);
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections().unwrap_or(1))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;
                let store = Arc::new(SqliteStore::new(pool));
                Ok(Self::with_store(Backend::Sqlite(store.clone()), store))
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Backend::Memory, Arc::new(MemoryStore::new()))
    }

    fn with_store<S>(backend: Backend, store: Arc<S>) -> Self
    where
        S: PortalStore
            + PuppetStore
            + UserStore
            + MessageStore
            + ThreadStore
            + ReactionStore
            + 'static,
    {
        Self {
            backend,
            portal_store: store.clone(),
            puppet_store: store.clone(),
            user_store: store.clone(),
            message_store: store.clone(),
            thread_store: store.clone(),
            reaction_store: store,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match &self.backend {
            Backend::Memory => Ok(()),
            #[cfg(feature = "postgres")]
            Backend::Postgres(store) => {
                store
                    .run(|conn| run_statements(conn, postgres::MIGRATIONS))
                    .await?;
                info!("postgres schema is up to date");
                Ok(())
            }
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(store) => {
                store
                    .run(|conn| run_statements(conn, sqlite::MIGRATIONS))
                    .await?;
                info!("sqlite schema is up to date");
                Ok(())
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory => "memory",
            #[cfg(feature = "postgres")]
            Backend::Postgres(_) => "postgres",
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(_) => "sqlite",
        }
    }

    pub fn portal_store(&self) -> Arc<dyn PortalStore> {
        self.portal_store.clone()
    }

    pub fn puppet_store(&self) -> Arc<dyn PuppetStore> {
        self.puppet_store.clone()
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn thread_store(&self) -> Arc<dyn ThreadStore> {
        self.thread_store.clone()
    }

    pub fn reaction_store(&self) -> Arc<dyn ReactionStore> {
        self.reaction_store.clone()
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
fn run_statements<C>(conn: &mut C, statements: &[&str]) -> Result<(), DatabaseError>
where
    C: diesel::Connection,
    diesel::query_builder::SqlQuery: diesel::query_dsl::methods::ExecuteDsl<C>,
{
    for statement in statements {
        diesel::sql_query(*statement)
            .execute(conn)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    }
    Ok(())
}
