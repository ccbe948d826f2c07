/// Background maintenance loops: expired legacy tokens, expired
/// authorization requests, and event retention.
use crate::context::AppContext;
use std::sync::Arc;
use std::time::Duration;

const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PAR_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const EVENT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct JobScheduler {
    ctx: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Spawn every loop; they run for the life of the process.
    pub fn start(self: Arc<Self>) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TOKEN_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                match ctx.sessions.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("reaped {} expired legacy tokens", n),
                    Err(e) => tracing::warn!("token sweep failed: {}", e),
                }
            }
        });

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PAR_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                match ctx.oauth_provider.cleanup_expired_requests().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("reaped {} expired authorization requests", n),
                    Err(e) => tracing::warn!("authorization request sweep failed: {}", e),
                }
            }
        });

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVENT_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let retention = ctx.sequencer.config().retention;
                match ctx.sequencer.persister().cleanup_old_events(retention).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("dropped {} events past retention", n),
                    Err(e) => tracing::warn!("event retention sweep failed: {}", e),
                }
            }
        });
    }
}
