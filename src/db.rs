use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::config::Config;

/// Connects to Postgres with the pool ceilings the pipeline assumes
/// (25 open, 5 idle).
pub async fn connect(config: &Config) -> Result<PgPool> {
    let options = PgConnectOptions::new()
        .host(&config.db_host)
        .port(config.db_port)
        .username(&config.db_user)
        .password(&config.db_password)
        .database(&config.db_name);

    let pool = PgPoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .connect_with(options)
        .await
        .with_context(|| {
            format!(
                "connect to postgres at {}:{}/{}",
                config.db_host, config.db_port, config.db_name
            )
        })?;

    Ok(pool)
}
