//! WiFi resilience state machine and configuration portal.
//!
//! Constrained deployments reach the network over an unreliable WiFi
//! link. This module keeps the device reachable: it tries to join the
//! configured station network within a timeout, and on failure falls
//! back to serving its own access point with a minimal portal where an
//! operator can submit new credentials. The state machine is fully
//! independent of PLC polling; the bus keeps running in every mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Form, State};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::Router;
use bridge_config::NetworkSettings;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{BridgeError, Result};

/// Platform hooks for WiFi control.
///
/// The deployment supplies the real implementation (wpa_supplicant,
/// ESP radio, ...); tests supply a mock.
#[async_trait]
pub trait WifiControl: Send + Sync {
    /// Associate with a station network; resolves to the leased IP.
    async fn join(&self, ssid: &str, password: &str) -> Result<String>;

    /// Drop the station association.
    async fn leave(&self) -> Result<()>;

    /// Resolves when an established station link goes down.
    async fn wait_for_disconnect(&self);

    async fn start_access_point(&self, ssid: &str, password: &str) -> Result<()>;

    async fn stop_access_point(&self) -> Result<()>;
}

/// Station credentials under test or in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

/// Externally visible network state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkMode {
    Connecting { ssid: String, attempt: u32 },
    Station { ip_address: String },
    AccessPointFallback { portal_active: bool },
}

const CREDENTIALS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS network_credentials (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
"#;

/// Credentials last accepted through the portal, if any.
pub async fn load_stored_credentials(pool: &SqlitePool) -> Result<Option<Credentials>> {
    sqlx::query(CREDENTIALS_TABLE).execute(pool).await?;

    let ssid: Option<String> =
        sqlx::query_scalar("SELECT value FROM network_credentials WHERE key = 'wifi_ssid'")
            .fetch_optional(pool)
            .await?;
    let password: Option<String> =
        sqlx::query_scalar("SELECT value FROM network_credentials WHERE key = 'wifi_password'")
            .fetch_optional(pool)
            .await?;

    Ok(match ssid {
        Some(ssid) if !ssid.is_empty() => Some(Credentials {
            ssid,
            password: password.unwrap_or_default(),
        }),
        _ => None,
    })
}

pub async fn save_credentials(pool: &SqlitePool, credentials: &Credentials) -> Result<()> {
    sqlx::query(CREDENTIALS_TABLE).execute(pool).await?;

    for (key, value) in [
        ("wifi_ssid", &credentials.ssid),
        ("wifi_password", &credentials.password),
    ] {
        sqlx::query(
            r#"
            INSERT INTO network_credentials (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Network resilience supervisor.
pub struct NetWatch {
    wifi: Arc<dyn WifiControl>,
    pool: SqlitePool,
    settings: NetworkSettings,
    mode: RwLock<NetworkMode>,
    credentials_tx: mpsc::Sender<Credentials>,
    credentials_rx: Mutex<Option<mpsc::Receiver<Credentials>>>,
}

impl NetWatch {
    pub fn new(wifi: Arc<dyn WifiControl>, pool: SqlitePool, settings: NetworkSettings) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let initial = NetworkMode::Connecting {
            ssid: settings.wifi_ssid.clone(),
            attempt: 0,
        };
        Self {
            wifi,
            pool,
            settings,
            mode: RwLock::new(initial),
            credentials_tx: tx,
            credentials_rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn mode(&self) -> NetworkMode {
        self.mode.read().await.clone()
    }

    /// Submission side of the portal channel. Exposed so the portal
    /// handler (and tests) can feed new credentials into the machine.
    pub fn credentials_sender(&self) -> mpsc::Sender<Credentials> {
        self.credentials_tx.clone()
    }

    /// Spawn the supervisor; runs until the token is cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let watch = self;
        tokio::spawn(async move {
            if let Err(e) = watch.run(cancel).await {
                error!("Network supervisor stopped with error: {}", e);
            }
        })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .credentials_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| BridgeError::Transport("Network supervisor already started".into()))?;

        // Portal-submitted credentials outlive the configured ones
        let mut credentials = match load_stored_credentials(&self.pool).await? {
            Some(stored) => Some(stored),
            None if !self.settings.wifi_ssid.is_empty() => Some(Credentials {
                ssid: self.settings.wifi_ssid.clone(),
                password: self.settings.wifi_password.clone(),
            }),
            None => None,
        };
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if let Some(creds) = credentials.clone() {
                *self.mode.write().await = NetworkMode::Connecting {
                    ssid: creds.ssid.clone(),
                    attempt,
                };
                attempt += 1;
                info!("Joining WiFi network '{}' (attempt {})", creds.ssid, attempt);

                let window = Duration::from_millis(self.settings.wifi_connect_timeout_ms);
                let joined = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    result = tokio::time::timeout(
                        window,
                        self.wifi.join(&creds.ssid, &creds.password),
                    ) => result,
                };

                match joined {
                    Ok(Ok(ip)) => {
                        info!("Station mode up with address {}", ip);
                        *self.mode.write().await = NetworkMode::Station { ip_address: ip };

                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = self.wifi.leave().await;
                                return Ok(());
                            }
                            _ = self.wifi.wait_for_disconnect() => {
                                warn!("Station link lost, reconnecting");
                                let _ = self.wifi.leave().await;
                                continue;
                            }
                        }
                    }
                    Ok(Err(e)) => warn!("WiFi join rejected: {}", e),
                    Err(_) => warn!(
                        "WiFi join timed out after {}ms",
                        self.settings.wifi_connect_timeout_ms
                    ),
                }
                let _ = self.wifi.leave().await;
            }

            // Fallback: serve our own AP and wait for new credentials
            match self.enter_fallback(&cancel, &mut rx).await? {
                Some(submitted) => {
                    save_credentials(&self.pool, &submitted).await?;
                    attempt = 0;
                    credentials = Some(submitted);
                }
                None => return Ok(()),
            }
        }
    }

    /// Serve the AP and portal until credentials arrive or shutdown.
    async fn enter_fallback(
        &self,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<Credentials>,
    ) -> Result<Option<Credentials>> {
        info!(
            "Entering access-point fallback, SSID '{}'",
            self.settings.ap_ssid
        );
        self.wifi
            .start_access_point(&self.settings.ap_ssid, &self.settings.ap_password)
            .await?;

        let portal_cancel = cancel.child_token();
        let portal = match serve_portal(
            &self.settings.portal_listen,
            self.credentials_tx.clone(),
            self.settings.ap_ssid.clone(),
            portal_cancel.clone(),
        )
        .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                // AP still works for association; the operator just
                // cannot reach the form
                error!("Configuration portal failed to start: {}", e);
                None
            }
        };

        *self.mode.write().await = NetworkMode::AccessPointFallback {
            portal_active: portal.is_some(),
        };

        let submitted = tokio::select! {
            _ = cancel.cancelled() => None,
            creds = rx.recv() => creds,
        };

        portal_cancel.cancel();
        if let Some(portal) = portal {
            let _ = portal.await;
        }
        self.wifi.stop_access_point().await?;
        Ok(submitted)
    }
}

#[derive(Clone)]
struct PortalState {
    submit: mpsc::Sender<Credentials>,
    ap_ssid: String,
}

async fn serve_portal(
    listen: &str,
    submit: mpsc::Sender<Credentials>,
    ap_ssid: String,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| BridgeError::Transport(format!("Portal bind on {listen} failed: {e}")))?;
    info!("Configuration portal listening on {}", listen);

    let app = Router::new()
        .route("/", get(portal_page))
        .route("/configure", post(portal_configure))
        .with_state(PortalState { submit, ap_ssid });

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("Configuration portal error: {}", e);
        }
    }))
}

async fn portal_page(State(state): State<PortalState>) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>PLC Bridge Setup</title></head>
<body>
<h1>PLC Bridge Setup</h1>
<p>The bridge could not join its WiFi network and is serving the
fallback access point <b>{}</b>. Enter new station credentials:</p>
<form method="post" action="/configure">
  <label>SSID <input name="ssid" required></label><br>
  <label>Password <input name="password" type="password"></label><br>
  <button type="submit">Connect</button>
</form>
</body>
</html>"#,
        state.ap_ssid
    ))
}

async fn portal_configure(
    State(state): State<PortalState>,
    Form(credentials): Form<Credentials>,
) -> impl IntoResponse {
    if credentials.ssid.trim().is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Html("<p>SSID must not be empty.</p>".to_string()),
        );
    }

    match state.submit.send(credentials).await {
        Ok(()) => (
            axum::http::StatusCode::OK,
            Html(
                "<p>Credentials accepted. The bridge is leaving the \
                 setup network to try them now.</p>"
                    .to_string(),
            ),
        ),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Html("<p>The bridge is shutting down.</p>".to_string()),
        ),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Scripted WiFi mock: `accept` decides whether a join succeeds;
    /// joins that would fail hang until the timeout fires.
    struct MockWifi {
        accept: StdMutex<Vec<String>>,
        joins: StdMutex<Vec<String>>,
        ap_running: StdMutex<bool>,
        drop_link: Notify,
    }

    impl MockWifi {
        fn accepting(ssids: &[&str]) -> Self {
            Self {
                accept: StdMutex::new(ssids.iter().map(|s| s.to_string()).collect()),
                joins: StdMutex::new(Vec::new()),
                ap_running: StdMutex::new(false),
                drop_link: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl WifiControl for MockWifi {
        async fn join(&self, ssid: &str, _password: &str) -> Result<String> {
            self.joins.lock().unwrap().push(ssid.to_string());
            if self.accept.lock().unwrap().iter().any(|s| s == ssid) {
                Ok("192.168.1.50".to_string())
            } else {
                // Unreachable network: no answer until the caller
                // gives up
                std::future::pending().await
            }
        }

        async fn leave(&self) -> Result<()> {
            Ok(())
        }

        async fn wait_for_disconnect(&self) {
            self.drop_link.notified().await;
        }

        async fn start_access_point(&self, _ssid: &str, _password: &str) -> Result<()> {
            *self.ap_running.lock().unwrap() = true;
            Ok(())
        }

        async fn stop_access_point(&self) -> Result<()> {
            *self.ap_running.lock().unwrap() = false;
            Ok(())
        }
    }

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn settings(ssid: &str) -> NetworkSettings {
        NetworkSettings {
            wifi_ssid: ssid.to_string(),
            wifi_password: "secret".to_string(),
            // Portal on an ephemeral local port for tests
            portal_listen: "127.0.0.1:0".to_string(),
            wifi_connect_timeout_ms: 200,
            ..NetworkSettings::default()
        }
    }

    async fn wait_for_mode<F: Fn(&NetworkMode) -> bool>(watch: &NetWatch, accept: F) {
        for _ in 0..100 {
            if accept(&watch.mode().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("mode never reached, last: {:?}", watch.mode().await);
    }

    #[tokio::test]
    async fn successful_join_reaches_station_mode() {
        let wifi = Arc::new(MockWifi::accepting(&["plant-net"]));
        let watch = Arc::new(NetWatch::new(
            Arc::clone(&wifi) as Arc<dyn WifiControl>,
            memory_pool().await,
            settings("plant-net"),
        ));
        let cancel = CancellationToken::new();
        let task = Arc::clone(&watch).spawn(cancel.clone());

        wait_for_mode(&watch, |m| {
            matches!(m, NetworkMode::Station { ip_address } if ip_address == "192.168.1.50")
        })
        .await;

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn join_timeout_falls_back_to_access_point() {
        let wifi = Arc::new(MockWifi::accepting(&[]));
        let watch = Arc::new(NetWatch::new(
            Arc::clone(&wifi) as Arc<dyn WifiControl>,
            memory_pool().await,
            settings("unreachable-net"),
        ));
        let cancel = CancellationToken::new();
        let task = Arc::clone(&watch).spawn(cancel.clone());

        wait_for_mode(&watch, |m| {
            matches!(m, NetworkMode::AccessPointFallback { .. })
        })
        .await;
        assert!(*wifi.ap_running.lock().unwrap());

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn portal_credentials_restart_connecting_with_reset_counter() {
        let wifi = Arc::new(MockWifi::accepting(&["new-net"]));
        let pool = memory_pool().await;
        let watch = Arc::new(NetWatch::new(
            Arc::clone(&wifi) as Arc<dyn WifiControl>,
            pool.clone(),
            settings("wrong-net"),
        ));
        let cancel = CancellationToken::new();
        let task = Arc::clone(&watch).spawn(cancel.clone());

        wait_for_mode(&watch, |m| {
            matches!(m, NetworkMode::AccessPointFallback { .. })
        })
        .await;

        // Operator submits working credentials through the portal path
        watch
            .credentials_sender()
            .send(Credentials {
                ssid: "new-net".to_string(),
                password: "better-secret".to_string(),
            })
            .await
            .unwrap();

        wait_for_mode(&watch, |m| matches!(m, NetworkMode::Station { .. })).await;

        // Attempt counter was reset for the new credentials
        let joins = wifi.joins.lock().unwrap().clone();
        assert_eq!(joins.last().map(String::as_str), Some("new-net"));
        assert!(!*wifi.ap_running.lock().unwrap());

        // And they were persisted for the next boot
        let stored = load_stored_credentials(&pool).await.unwrap().unwrap();
        assert_eq!(stored.ssid, "new-net");

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn no_configured_credentials_goes_straight_to_fallback() {
        let wifi = Arc::new(MockWifi::accepting(&[]));
        let watch = Arc::new(NetWatch::new(
            Arc::clone(&wifi) as Arc<dyn WifiControl>,
            memory_pool().await,
            settings(""),
        ));
        let cancel = CancellationToken::new();
        let task = Arc::clone(&watch).spawn(cancel.clone());

        wait_for_mode(&watch, |m| {
            matches!(m, NetworkMode::AccessPointFallback { .. })
        })
        .await;
        assert!(wifi.joins.lock().unwrap().is_empty());

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn stored_credentials_survive_restart() {
        let pool = memory_pool().await;
        save_credentials(
            &pool,
            &Credentials {
                ssid: "persisted".to_string(),
                password: "pw12345678".to_string(),
            },
        )
        .await
        .unwrap();

        let loaded = load_stored_credentials(&pool).await.unwrap().unwrap();
        assert_eq!(loaded.ssid, "persisted");
        assert_eq!(loaded.password, "pw12345678");
    }

    #[tokio::test]
    async fn portal_form_handler_validates_ssid() {
        let (tx, mut rx) = mpsc::channel(1);
        let state = PortalState {
            submit: tx,
            ap_ssid: "setup".to_string(),
        };

        let response = portal_configure(
            State(state.clone()),
            Form(Credentials {
                ssid: "  ".to_string(),
                password: String::new(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);

        let response = portal_configure(
            State(state),
            Form(Credentials {
                ssid: "plant-net".to_string(),
                password: "pw".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().ssid, "plant-net");
    }

    #[test]
    fn network_mode_serializes_with_mode_tag() {
        let station = NetworkMode::Station {
            ip_address: "192.168.1.50".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&station).unwrap(),
            serde_json::json!({ "mode": "station", "ip_address": "192.168.1.50" })
        );

        let fallback = NetworkMode::AccessPointFallback {
            portal_active: true,
        };
        assert_eq!(
            serde_json::to_value(&fallback).unwrap(),
            serde_json::json!({ "mode": "access_point_fallback", "portal_active": true })
        );
    }
}
