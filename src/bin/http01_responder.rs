//! The HTTP-01 challenge responder (spec §6): a standalone collaborator
//! process that answers `/.well-known/acme-challenge/<token>` by reading
//! the key authorization the drive state machine wrote to the store.
//! Grounded in the teacher's `acme/http01.rs` poem server, generalized
//! from an in-memory `ChallengeStore` to the on-disk store so the
//! responder and the driving CLI can run as separate processes sharing
//! only the store directory.

use std::sync::Arc;

use acmemd::config::Settings;
use acmemd::store::{FsStore, Group, Store, VType};
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::web::{Data, Path};
use poem::{EndpointExt, Route, Server, handler};
use tracing_subscriber::EnvFilter;

#[handler]
async fn http01_challenge(
    req: &poem::Request,
    Path(token): Path<String>,
    Data(store): Data<&Arc<FsStore>>,
) -> (StatusCode, String) {
    let Some(domain) = host_domain(req) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header".to_string());
    };

    match store.load(Group::Challenges, &domain, "http-01", VType::Text).await {
        Ok(value) => {
            let key_auth = value.into_text().unwrap_or_default();
            if key_auth.is_empty() || !key_auth.starts_with(&format!("{token}.")) {
                (StatusCode::NOT_FOUND, "Not Found".to_string())
            } else {
                (StatusCode::OK, key_auth)
            }
        }
        Err(err) if err.is_not_found() => (StatusCode::NOT_FOUND, "Not Found".to_string()),
        Err(err) => {
            tracing::error!(domain = %domain, error = %err, "challenge lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
        }
    }
}

/// The validating CA connects to this domain's authority, so `Host`
/// carries the domain the challenge was issued for (stripped of a
/// `:port` suffix if present).
fn host_domain(req: &poem::Request) -> Option<String> {
    req.headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_lowercase())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("ACMEMD_CONFIG").ok().map(std::path::PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).expect("could not load configuration");

    let store = Arc::new(
        FsStore::open(&settings.store_dir)
            .await
            .expect("could not open store"),
    );

    let app = Route::new()
        .at(
            "/.well-known/acme-challenge/:token",
            poem::get(http01_challenge),
        )
        .data(store);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.http01_port));
    tracing::info!(%addr, "starting HTTP-01 challenge responder");
    if let Err(err) = Server::new(TcpListener::bind(addr)).run(app).await {
        tracing::error!(error = %err, "HTTP-01 responder server failed");
    }
}
