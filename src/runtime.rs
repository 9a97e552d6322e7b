use crate::{
    app::{AppState, build_router},
    auth::AuthHook,
    config::Config,
    error::RegistryError,
    observability,
    storage::{Store, StoreOptions},
};
use axum::{http::StatusCode, serve::ListenerExt};
use std::sync::Arc;
use tracing::instrument;

#[instrument(skip(config, auth_hook))]
pub async fn build_state(
    config: &Config,
    auth_hook: Option<Arc<dyn AuthHook>>,
) -> Result<AppState, RegistryError> {
    let store = Arc::new(Store::open_with_options(config, StoreOptions { auth_hook }).await?);

    Ok(AppState {
        store,
        upload: config.upload.clone(),
        max_body_size: config.max_body_size,
        url_prefix: config.url_prefix.clone(),
    })
}

pub async fn run(
    config: Config,
    auth_hook: Option<Arc<dyn AuthHook>>,
) -> Result<(), RegistryError> {
    let bind = config.bind;
    let data_dir = config.data_dir.display().to_string();
    let state = build_state(&config, auth_hook).await?;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?.tap_io(|tcp| {
        if let Err(err) = tcp.set_nodelay(true) {
            tracing::warn!(error = %err, "failed to set TCP_NODELAY");
        }
    });

    tracing::info!(
        bind = %bind,
        data_dir,
        url_prefix = config.url_prefix,
        allow_version_overwrite = config.upload.allow_version_overwrite,
        atomic_uploads = config.upload.atomic,
        "rustpypi listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|_| RegistryError::Internal)
}

pub fn init_tracing(config: &Config) {
    let default_level = startup_log_level(config).to_string();
    let tracing_settings = observability::init_from_env(&default_level);
    tracing::debug!(
        log_filter = tracing_settings.filter,
        log_format = tracing_settings.log_format.as_str(),
        "initialized tracing subscriber"
    );
}

pub async fn run_standalone(config: Config) -> Result<(), RegistryError> {
    init_tracing(&config);
    run(config, None).await
}

pub async fn run_from_env() -> Result<(), RegistryError> {
    let config = Config::from_env().map_err(|err| {
        RegistryError::http(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("invalid runtime configuration: {err}"),
        )
    })?;
    run_standalone(config).await
}

/// Creates a local user in the configured data directory without serving.
pub async fn add_user(config: &Config, username: &str, password: &str) -> Result<(), RegistryError> {
    init_tracing(config);
    let store = Store::open(config).await?;
    store.create_user(username, password).await?;
    tracing::info!(username, data_dir = %config.data_dir.display(), "user created");
    Ok(())
}

fn startup_log_level(config: &Config) -> &str {
    config.log_level.as_str()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                let _ = sigterm.recv().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::{build_state, startup_log_level};
    use crate::config::Config;

    #[test]
    fn startup_log_level_uses_config_value() {
        let mut cfg = Config::defaults();
        cfg.log_level = "debug".to_string();
        assert_eq!(startup_log_level(&cfg), "debug");
    }

    #[tokio::test]
    async fn state_carries_upload_policy() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut cfg = Config::for_data_dir(dir.path());
        cfg.upload.allow_version_overwrite = true;
        cfg.url_prefix = "/pypi".to_string();

        let state = build_state(&cfg, None).await.expect("state");
        assert!(state.upload.allow_version_overwrite);
        assert!(!state.upload.atomic);
        assert_eq!(state.url_prefix, "/pypi");
        assert!(dir.path().join("distributions").is_dir());
    }
}
