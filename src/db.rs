use std::fmt;
use std::time::Duration;

use anyhow::bail;
use sqlx::postgres::{PgPool, PgPoolOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseProvider {
    Postgres,
    SqlServer,
    MySql,
    Oracle,
}

impl DatabaseProvider {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "npgsql" => Ok(Self::Postgres),
            "sqlserver" | "mssql" => Ok(Self::SqlServer),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "oracle" => Ok(Self::Oracle),
            other => bail!("unknown DATABASE_PROVIDER: {other}"),
        }
    }
}

impl fmt::Display for DatabaseProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Postgres => "postgres",
            Self::SqlServer => "sqlserver",
            Self::MySql => "mysql",
            Self::Oracle => "oracle",
        };
        f.write_str(name)
    }
}

/// Opens the pool for the configured provider.
pub async fn connect(provider: DatabaseProvider, database_url: &str) -> anyhow::Result<PgPool> {
    tracing::info!(%provider, "selecting database provider");
    match provider {
        DatabaseProvider::Postgres => connect_pg(database_url).await,
        other => bail!("database provider {other} is not supported by this build (postgres only)"),
    }
}

async fn connect_pg(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_aliases_resolve() {
        assert_eq!(DatabaseProvider::parse("Npgsql").unwrap(), DatabaseProvider::Postgres);
        assert_eq!(DatabaseProvider::parse(" MSSQL ").unwrap(), DatabaseProvider::SqlServer);
        assert_eq!(DatabaseProvider::parse("mariadb").unwrap(), DatabaseProvider::MySql);
        assert_eq!(DatabaseProvider::parse("oracle").unwrap(), DatabaseProvider::Oracle);
        assert!(DatabaseProvider::parse("sqlite").is_err());
    }

    #[tokio::test]
    async fn unsupported_provider_is_rejected_before_connecting() {
        let err = connect(DatabaseProvider::Oracle, "oracle://nowhere")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
