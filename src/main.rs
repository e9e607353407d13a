use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hostdb::config::GlobalConfig;
use hostdb::error::Result;
use hostdb::interface::HostDb;
use hostdb::observability::init_logging;
use hostdb::persist::{PersistenceMode, SqliteStorage};
use hostdb::server::router;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GlobalConfig::load()?;
    init_logging(config.hostdb.debug);

    let mode = match &config.sqlite.path {
        Some(path) => PersistenceMode::File(path.clone()),
        None => PersistenceMode::InMemory,
    };
    info!(?mode, "opening storage");
    let storage = SqliteStorage::new(mode, Duration::from_millis(config.sqlite.busy_timeout_ms))?;
    let hostdb = Arc::new(HostDb::new(Arc::new(storage), config.api.v0.clone()));

    let address = format!("{}:{}", config.hostdb.host, config.hostdb.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, version = env!("CARGO_PKG_VERSION"), "hostdb listening");
    axum::serve(listener, router(hostdb).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
