use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio_postgres::config::Host;

use crate::error::NodeCallError;

/// Application name reported to the server for every connection.
const APPLICATION_NAME: &str = "cascade";

/// Maximum number of pooled connections per node location.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// How long an idle pooled connection is kept around.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Parses a node location into sqlx connect options.
///
/// Locations are registered in the cascade as libpq connection strings, either in the
/// `key=value` form (`dbname=app host=10.0.0.1 port=5432`) or as a `postgres://` URL. The
/// `tokio-postgres` parser understands both.
pub fn location_to_options(location: &str) -> Result<PgConnectOptions, NodeCallError> {
    let config = tokio_postgres::Config::from_str(location).map_err(|err| {
        NodeCallError::InvalidLocation {
            location: location.to_string(),
            reason: err.to_string(),
        }
    })?;

    let mut options = PgConnectOptions::new_without_pgpass().application_name(APPLICATION_NAME);

    match config.get_hosts().first() {
        Some(Host::Tcp(host)) => options = options.host(host),
        #[cfg(unix)]
        Some(Host::Unix(path)) => options = options.socket(path),
        None => {}
    }
    if let Some(port) = config.get_ports().first() {
        options = options.port(*port);
    }
    if let Some(user) = config.get_user() {
        options = options.username(user);
    }
    if let Some(password) = config.get_password() {
        let password = String::from_utf8_lossy(password);
        options = options.password(&password);
    }
    if let Some(dbname) = config.get_dbname() {
        options = options.database(dbname);
    }

    Ok(options)
}

/// Creates a lazily connecting pool for the node reachable at `location`.
///
/// No connection is opened until the first query, so an unreachable node surfaces as a
/// connection error on first use rather than here.
pub fn connect_location_lazy(location: &str) -> Result<PgPool, NodeCallError> {
    let options = location_to_options(location)?;

    let pool = PgPoolOptions::new()
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(options);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_key_value_location() {
        let options = location_to_options("dbname=app host=db1 port=6432 user=repl").unwrap();
        assert_eq!(options.get_host(), "db1");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_database(), Some("app"));
        assert_eq!(options.get_username(), "repl");
    }

    #[test]
    fn test_parses_url_location() {
        let options = location_to_options("postgres://repl@db2:5433/app").unwrap();
        assert_eq!(options.get_host(), "db2");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("app"));
    }

    #[test]
    fn test_rejects_garbage_location() {
        assert!(location_to_options("port=notanumber").is_err());
    }
}
