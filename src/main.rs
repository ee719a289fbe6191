use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_form_service::{Cli, bootstrap, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    #[cfg(feature = "tch-backend")]
    let (config, registry) = {
        use llm_form_service::model::tch_backend::{TchLoader, TchProbe};
        bootstrap(&cli, &TchProbe, &TchLoader)?
    };
    #[cfg(not(feature = "tch-backend"))]
    let (config, registry) = {
        use llm_form_service::{device::NoAccelerators, model::NoBackend};
        bootstrap(&cli, &NoAccelerators, &NoBackend)?
    };

    let config = Arc::new(config);
    let router = build_router(config.clone(), Arc::new(registry));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "web form ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
