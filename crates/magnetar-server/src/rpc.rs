use axum::extract::State;
use axum::Json;
use magnetar_store::{Guest, Image, ImageStore, Snapshot, StoreError, Volume};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// JSON-RPC 1.0 request envelope
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

/// JSON-RPC 1.0 response envelope
#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcResponse {
    pub result: Value,
    pub error: Option<String>,
    pub id: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ImageRequest {
    pub id: String,
    pub dest: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct SnapshotRequest {
    pub id: String,
    pub dest: String,
    pub recursive: bool,
    #[serde(rename = "destroyMoreRecent")]
    pub destroy_more_recent: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct VolumeRequest {
    pub id: String,
    pub size: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct GuestRequest {
    pub guest: Option<Guest>,
}

#[derive(Debug, Serialize)]
struct ImageResponse {
    images: Vec<Image>,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    snapshots: Vec<Snapshot>,
}

#[derive(Debug, Serialize)]
struct VolumeResponse {
    volumes: Vec<Volume>,
}

#[derive(Debug, Serialize)]
struct GuestResponse {
    guest: Guest,
}

/// Single JSON-RPC endpoint handler
pub(crate) async fn rpc_handler(
    State(store): State<Arc<ImageStore>>,
    body: bytes::Bytes,
) -> Json<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return Json(JsonRpcResponse {
                result: Value::Null,
                error: Some(format!("malformed request: {}", err)),
                id: Value::Null,
            });
        }
    };

    debug!("RPC call: {}", request.method);
    let params = request.params.into_iter().next().unwrap_or(Value::Null);

    let (result, error) = match dispatch(&store, &request.method, params).await {
        Ok(result) => (result, None),
        Err(err) => (Value::Null, Some(err.to_string())),
    };

    Json(JsonRpcResponse {
        result,
        error,
        id: request.id,
    })
}

fn parse_params<T: DeserializeOwned + Default>(params: Value) -> Result<T, StoreError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params)
        .map_err(|e| StoreError::invalid_argument(format!("bad params: {}", e)))
}

fn to_value<T: Serialize>(response: T) -> Result<Value, StoreError> {
    serde_json::to_value(response).map_err(|e| StoreError::internal(e.to_string()))
}

fn need_guest(request: GuestRequest) -> Result<Guest, StoreError> {
    request
        .guest
        .ok_or_else(|| StoreError::invalid_argument("need a guest"))
}

async fn dispatch(store: &ImageStore, method: &str, params: Value) -> Result<Value, StoreError> {
    match method {
        "ImageStore.RequestImage" => {
            let request: ImageRequest = parse_params(params)?;
            let image = store.request_image(&request.id).await?;
            to_value(ImageResponse {
                images: vec![image],
            })
        }
        "ImageStore.ListImages" => {
            let images = store.list_images().await?;
            to_value(ImageResponse { images })
        }
        "ImageStore.GetImage" => {
            let request: ImageRequest = parse_params(params)?;
            let image = store.get_image(&request.id).await?;
            to_value(ImageResponse {
                images: vec![image],
            })
        }
        "ImageStore.DeleteImage" => {
            let request: ImageRequest = parse_params(params)?;
            let image = store.delete_image(&request.id).await?;
            to_value(ImageResponse {
                images: vec![image],
            })
        }
        "ImageStore.CloneImage" => {
            let request: ImageRequest = parse_params(params)?;
            let volume = store.clone_image(&request.id, &request.dest).await?;
            to_value(VolumeResponse {
                volumes: vec![volume],
            })
        }
        "ImageStore.CreateSnapshot" => {
            let request: SnapshotRequest = parse_params(params)?;
            let snapshots = store
                .create_snapshot(&request.id, &request.dest, request.recursive)
                .await?;
            to_value(SnapshotResponse { snapshots })
        }
        "ImageStore.GetSnapshot" => {
            let request: SnapshotRequest = parse_params(params)?;
            let snapshot = store.get_snapshot(&request.id).await?;
            to_value(SnapshotResponse {
                snapshots: vec![snapshot],
            })
        }
        "ImageStore.ListSnapshots" => {
            let request: SnapshotRequest = parse_params(params)?;
            let snapshots = store.list_snapshots(&request.id).await?;
            to_value(SnapshotResponse { snapshots })
        }
        "ImageStore.DeleteSnapshot" => {
            let request: SnapshotRequest = parse_params(params)?;
            let snapshots = store
                .delete_snapshot(&request.id, request.recursive)
                .await?;
            to_value(SnapshotResponse { snapshots })
        }
        "ImageStore.RollbackSnapshot" => {
            let request: SnapshotRequest = parse_params(params)?;
            let snapshots = store
                .rollback_snapshot(&request.id, request.destroy_more_recent)
                .await?;
            to_value(SnapshotResponse { snapshots })
        }
        "ImageStore.ListVolumes" => {
            let volumes = store.list_volumes().await?;
            to_value(VolumeResponse { volumes })
        }
        "ImageStore.CreateVolume" => {
            let request: VolumeRequest = parse_params(params)?;
            let volume = store.create_volume(&request.id, request.size).await?;
            to_value(VolumeResponse {
                volumes: vec![volume],
            })
        }
        "ImageStore.GetVolume" => {
            let request: VolumeRequest = parse_params(params)?;
            let volume = store.get_volume(&request.id).await?;
            to_value(VolumeResponse {
                volumes: vec![volume],
            })
        }
        "ImageStore.DeleteDataset" => {
            let request: VolumeRequest = parse_params(params)?;
            let volume = store.delete_dataset(&request.id).await?;
            to_value(VolumeResponse {
                volumes: vec![volume],
            })
        }
        "ImageStore.VerifyDisks" => {
            let request: GuestRequest = parse_params(params)?;
            let guest = store.verify_disks(need_guest(request)?).await?;
            to_value(GuestResponse { guest })
        }
        "ImageStore.CreateGuestDisks" => {
            let request: GuestRequest = parse_params(params)?;
            let guest = store.create_guest_disks(need_guest(request)?).await?;
            to_value(GuestResponse { guest })
        }
        "ImageStore.DeleteGuestsDisks" => {
            let request: GuestRequest = parse_params(params)?;
            let guest = store.delete_guests_disks(need_guest(request)?).await?;
            to_value(GuestResponse { guest })
        }
        _ => Err(StoreError::invalid_argument(format!(
            "unknown method: {}",
            method
        ))),
    }
}
