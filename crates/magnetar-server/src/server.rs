use crate::download::download_snapshot;
use crate::rpc::rpc_handler;
use axum::routing::post;
use axum::Router;
use magnetar_store::ImageStore;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Bound on connection draining at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// API server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to listen on
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:19999".parse().unwrap(),
        }
    }
}

/// HTTP surface of the image store
pub struct ApiServer {
    config: Config,
    store: Arc<ImageStore>,
}

impl ApiServer {
    pub fn new(config: Config, store: Arc<ImageStore>) -> Self {
        Self { config, store }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        Router::new()
            .route("/_magnetar_rpc", post(rpc_handler))
            .route("/snapshots/download", post(download_snapshot))
            .layer(TraceLayer::new_for_http())
            .with_state(self.store.clone())
    }

    /// Run the server, shutting down when `token` is cancelled
    ///
    /// Open connections get at most five seconds to drain.
    pub async fn run(self, token: CancellationToken) -> Result<(), std::io::Error> {
        let app = self.build_router();

        info!("Starting API server on {}", self.config.listen_addr);
        let listener = TcpListener::bind(self.config.listen_addr).await?;

        let drain_token = token.clone();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            drain_token.cancelled().await;
        });

        tokio::select! {
            result = server.into_future() => result,
            _ = async {
                token.cancelled().await;
                tokio::time::sleep(DRAIN_TIMEOUT).await;
            } => {
                info!("API server drain timeout elapsed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magnetar_store::Config as StoreConfig;
    use magnetar_zfs::{DatasetOptions, DatasetProvider, MockProvider};
    use serde_json::{json, Value};

    struct TestServer {
        url: String,
        provider: Arc<MockProvider>,
        client: reqwest::Client,
        _tempdir: tempfile::TempDir,
    }

    impl TestServer {
        async fn rpc(&self, method: &str, params: Value) -> Value {
            let body = json!({
                "method": method,
                "params": [params],
                "id": 1,
            });
            let response = self
                .client
                .post(format!("{}/_magnetar_rpc", self.url))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            response.json().await.unwrap()
        }
    }

    async fn test_server() -> TestServer {
        let tempdir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new("test", 1 << 30));

        let mut config = StoreConfig::new("127.0.0.1:1", "test");
        config.image_dir = Some(tempdir.path().to_path_buf());
        let store = Arc::new(
            ImageStore::create(config, provider.clone()).await.unwrap(),
        );

        let server = ApiServer::new(Config::default(), store);
        let app = server.build_router();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            url: format!("http://{}", addr),
            provider,
            client: reqwest::Client::new(),
            _tempdir: tempdir,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:19999");
    }

    #[tokio::test]
    async fn test_volume_rpc_round_trip() {
        let server = test_server().await;

        let response = server
            .rpc("ImageStore.CreateVolume", json!({"id": "v1", "size": 64}))
            .await;
        assert_eq!(response["error"], Value::Null);
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["volumes"][0]["id"], "test/v1");
        assert_eq!(response["result"]["volumes"][0]["size"], 64);
        assert_eq!(
            response["result"]["volumes"][0]["device"],
            "/dev/zvol/test/v1"
        );

        let response = server
            .rpc("ImageStore.ListVolumes", json!({}))
            .await;
        assert_eq!(response["error"], Value::Null);
        assert_eq!(
            response["result"]["volumes"].as_array().unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rpc_error_is_a_string() {
        let server = test_server().await;

        let response = server
            .rpc("ImageStore.GetVolume", json!({"id": "missing"}))
            .await;
        assert_eq!(response["result"], Value::Null);
        assert!(response["error"].as_str().unwrap().contains("not found"));

        let response = server.rpc("ImageStore.Bogus", json!({})).await;
        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("unknown method"));
    }

    #[tokio::test]
    async fn test_rpc_malformed_body() {
        let server = test_server().await;
        let response = server
            .client
            .post(format!("{}/_magnetar_rpc", server.url))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let envelope: Value = response.json().await.unwrap();
        assert_eq!(envelope["result"], Value::Null);
        assert!(envelope["error"].as_str().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_guest_rpc_requires_guest() {
        let server = test_server().await;
        let response = server.rpc("ImageStore.VerifyDisks", json!({})).await;
        assert!(response["error"].as_str().unwrap().contains("need a guest"));
    }

    #[tokio::test]
    async fn test_image_rpc_uses_catalog() {
        let server = test_server().await;

        let response = server.rpc("ImageStore.ListImages", json!({})).await;
        assert_eq!(response["result"]["images"], json!([]));

        let response = server
            .rpc("ImageStore.GetImage", json!({"id": "missing"}))
            .await;
        assert!(response["error"].as_str().unwrap().contains("not found"));
    }

    async fn create_snapshot(server: &TestServer) -> String {
        server
            .provider
            .create_volume("test/vol", 4 * 1024 * 1024, &DatasetOptions::new())
            .await
            .unwrap();
        let response = server
            .rpc(
                "ImageStore.CreateSnapshot",
                json!({"id": "vol", "dest": "snap"}),
            )
            .await;
        assert_eq!(response["error"], Value::Null);
        response["result"]["snapshots"][0]["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_snapshot_rpc_and_download() {
        let server = test_server().await;
        let full_id = create_snapshot(&server).await;
        assert_eq!(full_id, "test/vol@snap");

        // The API works on pool-relative ids
        let response = server
            .client
            .post(format!("{}/snapshots/download", server.url))
            .json(&json!({"id": "vol@snap"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/octet-stream"
        );
        let payload = response.bytes().await.unwrap();
        assert!(!payload.is_empty());

        // The stream re-imports cleanly
        let imported = server
            .provider
            .receive_snapshot(
                Box::new(std::io::Cursor::new(payload.to_vec())),
                "test/images/reimported",
            )
            .await
            .unwrap();
        assert_eq!(imported.name, "test/images/reimported");
    }

    #[tokio::test]
    async fn test_download_status_mapping() {
        let server = test_server().await;
        create_snapshot(&server).await;

        // Empty id
        let response = server
            .client
            .post(format!("{}/snapshots/download", server.url))
            .json(&json!({"id": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        // Unknown snapshot
        let response = server
            .client
            .post(format!("{}/snapshots/download", server.url))
            .json(&json!({"id": "vol@nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        // A dataset that is not a snapshot
        let response = server
            .client
            .post(format!("{}/snapshots/download", server.url))
            .json(&json!({"id": "vol"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
