//! Router tests against a stand-in model. No weights or GPU needed.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::{prelude::BASE64_STANDARD, Engine};
use dalle_core::{GenerationRequest, ModelLike};
use dalle_server::{router, AppState};
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tower::ServiceExt;

/// Paints every requested image a different flat color and records requests.
#[derive(Default)]
struct FlatColorModel {
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ModelLike for FlatColorModel {
    fn run(&self, request: GenerationRequest) -> Result<Vec<DynamicImage>> {
        let n = request.num_images;
        self.requests.lock().unwrap().push(request);
        Ok((0..n)
            .map(|i| {
                let shade = (i * 40 % 256) as u8;
                DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb([shade, 100, 200])))
            })
            .collect())
    }
}

struct FailingModel;

impl ModelLike for FailingModel {
    fn run(&self, _request: GenerationRequest) -> Result<Vec<DynamicImage>> {
        bail!("out of device memory")
    }
}

fn app_with(model: Arc<dyn ModelLike>, max_images: Option<u32>) -> Router {
    router(AppState { model, max_images })
}

fn dalle_request(body: serde_json::Value) -> Request<Body> {
    Request::post("/dalle")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_check_reports_success() {
    let app = app_with(Arc::new(FlatColorModel::default()), None);
    let resp = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, serde_json::json!({"success": true}));
}

#[tokio::test]
async fn single_image_is_a_256px_jpeg() {
    let app = app_with(Arc::new(FlatColorModel::default()), None);
    let resp = app
        .oneshot(dalle_request(serde_json::json!({"text": "sunset", "num_images": 1})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let images = json_body(resp).await;
    let images = images.as_array().unwrap();
    assert_eq!(images.len(), 1);

    let bytes = BASE64_STANDARD.decode(images[0].as_str().unwrap()).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (256, 256));
}

#[tokio::test]
async fn returns_as_many_images_as_requested() {
    let model = Arc::new(FlatColorModel::default());
    let app = app_with(model.clone(), None);
    let resp = app
        .oneshot(dalle_request(serde_json::json!({"text": "sunset", "num_images": 4})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await.as_array().unwrap().len(), 4);

    let requests = model.requests.lock().unwrap();
    assert_eq!(requests.as_slice(), &[GenerationRequest::new("sunset", 4)]);
}

#[tokio::test]
async fn body_is_parsed_without_content_type() {
    let app = app_with(Arc::new(FlatColorModel::default()), None);
    let resp = app
        .oneshot(
            Request::post("/dalle")
                .body(Body::from(r#"{"text": "the moon", "num_images": 2}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn seed_is_forwarded_to_the_model() {
    let model = Arc::new(FlatColorModel::default());
    let app = app_with(model.clone(), None);
    let resp = app
        .oneshot(dalle_request(
            serde_json::json!({"text": "sunset", "num_images": 1, "seed": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(model.requests.lock().unwrap()[0].seed, Some(42));
}

#[tokio::test]
async fn zero_images_is_an_empty_list() {
    let app = app_with(Arc::new(FlatColorModel::default()), None);
    let resp = app
        .oneshot(dalle_request(serde_json::json!({"text": "sunset", "num_images": 0})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, serde_json::json!([]));
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    for body in [
        serde_json::json!({"num_images": 1}),
        serde_json::json!({"text": "sunset"}),
        serde_json::json!({"text": "sunset", "num_images": "many"}),
    ] {
        let model = Arc::new(FlatColorModel::default());
        let app = app_with(model.clone(), None);
        let resp = app.oneshot(dalle_request(body.clone())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
        let error = json_body(resp).await;
        assert!(error["error"].as_str().unwrap().starts_with("invalid request"));
        assert!(model.requests.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let app = app_with(Arc::new(FlatColorModel::default()), None);
    let resp = app
        .oneshot(Request::post("/dalle").body(Body::from("{not json")).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn image_limit_is_enforced_when_configured() {
    let model = Arc::new(FlatColorModel::default());
    let app = app_with(model.clone(), Some(2));
    let resp = app
        .clone()
        .oneshot(dalle_request(serde_json::json!({"text": "sunset", "num_images": 3})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(model.requests.lock().unwrap().is_empty());

    let resp = app
        .oneshot(dalle_request(serde_json::json!({"text": "sunset", "num_images": 2})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn generation_failures_are_server_errors() {
    let app = app_with(Arc::new(FailingModel), None);
    let resp = app
        .oneshot(dalle_request(serde_json::json!({"text": "sunset", "num_images": 1})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let error = json_body(resp).await;
    assert!(error["error"].as_str().unwrap().contains("out of device memory"));
}

#[tokio::test]
async fn cors_is_open() {
    let app = app_with(Arc::new(FlatColorModel::default()), None);
    let resp = app
        .oneshot(
            Request::get("/")
                .header(header::ORIGIN, "http://example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
}
