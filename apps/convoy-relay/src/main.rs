use std::net::SocketAddr;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use convoy_relay::config::Config;
use convoy_relay::{build_router, build_state};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(target: "relay", error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let app = build_router(build_state(&config));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(target: "relay", %addr, tls = config.ssl_enabled, policy = ?config.duplicate_policy, "relay listening");

    if config.ssl_enabled {
        let (cert, key) = (
            config.ssl_cert_path.expect("checked by Config::from_env"),
            config.ssl_key_path.expect("checked by Config::from_env"),
        );
        let tls = match axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await {
            Ok(tls) => tls,
            Err(err) => {
                error!(target: "relay", error = %err, "failed to load TLS material");
                std::process::exit(1);
            }
        };
        if let Err(err) = axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
        {
            error!(target: "relay", error = %err, "server terminated");
            std::process::exit(2);
        }
    } else {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(target: "relay", error = %err, "failed to bind");
                std::process::exit(1);
            }
        };
        if let Err(err) = axum::serve(listener, app).await {
            error!(target: "relay", error = %err, "server terminated");
            std::process::exit(2);
        }
    }
}
