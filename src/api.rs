use std::sync::{Arc, OnceLock};

use pose_pvt::models::{WhichModel, load_model};
use pose_pvt::models::pose_pvt::generate::PosePvtModel;
use pose_pvt::utils::heatmap_utils::Keypoint;
use pose_pvt::utils::img_utils::get_image;
use rocket::serde::{Deserialize, Serialize, json::Json};
use rocket::{
    get,
    http::{ContentType, Status},
    post,
};
use tokio::sync::RwLock;

static MODEL: OnceLock<Arc<RwLock<PosePvtModel>>> = OnceLock::new();

pub fn init(model_type: WhichModel, path: String) -> anyhow::Result<()> {
    let model = load_model(model_type, &path)?;
    tracing::info!("{} ready, weights from {}", model.model_name(), path);
    MODEL.get_or_init(|| Arc::new(RwLock::new(model)));
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub(crate) struct KeypointsRequest {
    /// http(s) urls, file urls or base64 data uris
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub(crate) struct KeypointsResponse {
    model: String,
    keypoints: Vec<Vec<Keypoint>>,
}

fn estimate(model: &PosePvtModel, req: KeypointsRequest) -> anyhow::Result<KeypointsResponse> {
    let imgs = req
        .images
        .iter()
        .map(|url| get_image(url))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let keypoints = model.inference(&imgs)?;
    Ok(KeypointsResponse {
        model: model.model_name().to_string(),
        keypoints,
    })
}

#[post("/keypoints", data = "<req>")]
pub(crate) async fn keypoints(req: Json<KeypointsRequest>) -> (Status, (ContentType, String)) {
    let Some(model_ref) = MODEL.get().cloned() else {
        return (
            Status::ServiceUnavailable,
            (ContentType::Text, "model not init".to_string()),
        );
    };
    let guard = model_ref.read().await;
    match estimate(&guard, req.into_inner()) {
        Ok(res) => match serde_json::to_string(&res) {
            Ok(body) => (Status::Ok, (ContentType::JSON, body)),
            Err(e) => (Status::InternalServerError, (ContentType::Text, e.to_string())),
        },
        Err(e) => {
            tracing::warn!("keypoint request failed: {e}");
            (Status::InternalServerError, (ContentType::Text, e.to_string()))
        }
    }
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub(crate) struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[get("/health")]
pub(crate) async fn health() -> (Status, Json<HealthResponse>) {
    if MODEL.get().is_some() {
        let response = HealthResponse {
            status: "ok".to_string(),
            error: None,
        };
        (Status::Ok, Json(response))
    } else {
        let response = HealthResponse {
            status: "unhealthy".to_string(),
            error: Some("model not initialized".to_string()),
        };
        (Status::ServiceUnavailable, Json(response))
    }
}
