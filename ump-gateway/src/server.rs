use std::future::Future;

use axum::Router;
use eyre::Result;

/// Bind and serve the gateway router until the shutdown future resolves.
pub async fn serve<F>(app: Router, bind: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
