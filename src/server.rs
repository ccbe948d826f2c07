/// Server bootstrap
use crate::api;
use crate::context::AppContext;
use crate::error::{PdsError, PdsResult};

pub async fn serve(ctx: AppContext) -> PdsResult<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.service.port);
    let app = api::router(ctx);

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| PdsError::Internal(format!("server error: {}", e)))?;

    Ok(())
}
