use meridian_pds::{config::ServerConfig, context::AppContext, error::PdsResult, jobs, server};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> PdsResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meridian_pds=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    let config = ServerConfig::from_env()?;
    let ctx = AppContext::new(config).await?;

    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::new(ctx.clone())));
    scheduler.start();

    server::serve(ctx).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
   __  ___        _    ___
  /  |/  /__ ____(_)__/ (_)__ ____
 / /|_/ / -_) __/ / _  / / _ `/ _ \
/_/  /_/\__/_/ /_/\_,_/_/\_,_/_//_/

        AT Protocol Personal Data Server v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
