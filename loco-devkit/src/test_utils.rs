/*!
Helpers communs : logging des tests et serveurs axum éphémères
*/

use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Init du logging pour les tests (idempotent)
pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Sert `router` sur 127.0.0.1 avec un port libre, en tâche de fond
pub async fn serve(router: Router) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            log::error!("stub server on {addr} stopped: {e}");
        }
    });
    log::debug!("stub server listening on {addr}");
    Ok(addr)
}
