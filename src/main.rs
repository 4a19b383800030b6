use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use avl_recorder::config::AppConfig;
use avl_recorder::database::{Db, DbBuilder, DbDropGuard};
use avl_recorder::http;
use avl_recorder::rawlog::RawLog;
use avl_recorder::tcp::{self, SessionMap};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::load()?;
    config.validate()?;

    // The TCP core must keep running with no healthy store: degraded
    // mode accepts devices and captures raw frames only.
    let store: Option<(DbDropGuard, Db)> = match DbBuilder::new()
        .path(config.database.path.clone())
        .flush_interval(config.database.flush_interval)
        .build()
    {
        Ok(guard) => {
            let db = guard.db();
            Some((guard, db))
        }
        Err(e) => {
            error!("Store unavailable, continuing degraded: {}", e);
            None
        }
    };

    let rawlog = RawLog::new(config.logs.directory.clone());
    let sessions = SessionMap::new();

    let tcp_task = tokio::spawn(tcp::run_tcp_server(
        config.tcp.clone(),
        store.as_ref().map(|(_, db)| db.clone()),
        rawlog.clone(),
        sessions.clone(),
    ));

    let http_task = match &store {
        Some((_, db)) => Some(tokio::spawn(http::run_http_server(
            config.http.clone(),
            db.clone(),
        ))),
        None => {
            warn!("HTTP API disabled: no store");
            None
        }
    };

    tokio::select! {
        result = tcp_task => {
            // A dead TCP listener is fatal; the process exits non-zero.
            result??;
        }
        result = async {
            match http_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    rawlog.flush();
    if let Some((guard, db)) = store {
        if let Err(e) = db.flush() {
            error!("Final flush failed: {}", e);
        }
        drop(guard);
    }

    Ok(())
}
