use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use crate::error::FirmwareError;
use crate::manager::FirmwareManager;
use crate::manager::models::{Decision, StatusReport};
use crate::registry::ManagerRegistry;

type SharedRegistry = Arc<ManagerRegistry>;
type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Debug, Serialize)]
struct DeviceSummary {
    name: String,
    repository: String,
    asset: String,
    current_version: Option<String>,
    is_checking: bool,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    message: String,
}

pub fn router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/api/firmware", get(list_devices))
        .route("/api/firmware/{device}/status", get(status))
        .route("/api/firmware/{device}/check-update", post(check_update))
        .route("/api/firmware/{device}/download", post(download))
        .route("/api/firmware/{device}/binary", get(binary))
        .with_state(registry)
}

fn manager_for(
    registry: &ManagerRegistry,
    device: &str,
) -> Result<Arc<FirmwareManager>, ApiError> {
    registry.get(device).cloned().ok_or_else(|| {
        warn!("http: unknown device type '{device}'");
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown device type '{device}'") })),
        )
    })
}

async fn list_devices(State(registry): State<SharedRegistry>) -> Json<Vec<DeviceSummary>> {
    let devices = registry
        .names()
        .filter_map(|name| registry.get(name))
        .map(|manager| DeviceSummary {
            name: manager.name().to_owned(),
            repository: manager.device().repository(),
            asset: manager.device().asset.clone(),
            current_version: manager.current_version(),
            is_checking: manager.is_in_progress(),
        })
        .collect();
    Json(devices)
}

async fn status(
    State(registry): State<SharedRegistry>,
    Path(device): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    let manager = manager_for(&registry, &device)?;
    Ok(Json(manager.get_status().await))
}

async fn check_update(
    State(registry): State<SharedRegistry>,
    Path(device): Path<String>,
) -> Result<Json<Decision>, ApiError> {
    let manager = manager_for(&registry, &device)?;
    info!("http: forced update check for {device}");
    Ok(Json(manager.check_for_update(true).await))
}

async fn download(
    State(registry): State<SharedRegistry>,
    Path(device): Path<String>,
) -> Result<(StatusCode, Json<DownloadResponse>), ApiError> {
    let manager = manager_for(&registry, &device)?;
    info!("http: download requested for {device}");
    let (code, success, message) = match manager.download_latest(None).await {
        Ok(message) => (StatusCode::OK, true, message),
        Err(err @ FirmwareError::AlreadyInProgress) => {
            (StatusCode::CONFLICT, false, err.to_string())
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, false, err.to_string()),
    };
    Ok((code, Json(DownloadResponse { success, message })))
}

async fn binary(
    State(registry): State<SharedRegistry>,
    Path(device): Path<String>,
) -> Result<Response, ApiError> {
    let manager = manager_for(&registry, &device)?;
    let path = manager.store().artifact_path();
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let filename = format!("attachment; filename=\"{}\"", manager.device().asset);
            Ok((
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
                    (header::CONTENT_DISPOSITION, filename),
                ],
                bytes,
            )
                .into_response())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no cached firmware for '{device}'") })),
        )),
        Err(err) => {
            warn!("http: failed to read {}: {err}", path.display());
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("failed to read cached firmware: {err}") })),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevicesConfig, ServiceSettings};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn app(dir: &TempDir) -> Router {
        let config = DevicesConfig::parse(
            r#"{"devices":[{"name":"esp32","owner":"your-org","repo":"fw","asset":"fw.bin"}]}"#,
        )
        .expect("config");
        let registry =
            ManagerRegistry::build(&config, &ServiceSettings::new(dir.path().into())).await;
        router(Arc::new(registry))
    }

    async fn upstream_app(dir: &TempDir, server: &MockServer) -> Router {
        let config = DevicesConfig::parse(
            r#"{"devices":[{"name":"esp32","owner":"acme","repo":"bot-fw","asset":"fw.bin"}]}"#,
        )
        .expect("config");
        let mut settings = ServiceSettings::new(dir.path().into());
        settings.api_base = server.uri();
        router(Arc::new(ManagerRegistry::build(&config, &settings).await))
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        for (method, uri) in [
            ("GET", "/api/firmware/stm32/status"),
            ("POST", "/api/firmware/stm32/check-update"),
            ("POST", "/api/firmware/stm32/download"),
            ("GET", "/api/firmware/stm32/binary"),
        ] {
            let (status, body) = send(app(&dir).await, method, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
            let body: serde_json::Value = serde_json::from_slice(&body).expect("json");
            assert!(body["error"].as_str().is_some_and(|e| e.contains("stm32")));
        }
    }

    #[tokio::test]
    async fn status_reports_reason_instead_of_failing() {
        let dir = TempDir::new().expect("tempdir");
        let (status, body) = send(app(&dir).await, "GET", "/api/firmware/esp32/status").await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(report["device_type"], "esp32");
        assert_eq!(report["local_exists"], false);
        assert_eq!(report["needs_update"], false);
        assert!(report["reason"].as_str().is_some_and(|r| r.starts_with("configuration error")));
    }

    #[tokio::test]
    async fn failed_download_is_server_error() {
        let dir = TempDir::new().expect("tempdir");
        let (status, body) = send(app(&dir).await, "POST", "/api/firmware/esp32/download").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn second_download_while_first_runs_is_conflict() {
        let dir = TempDir::new().expect("tempdir");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/bot-fw/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tag_name": "v3.1.0",
                "published_at": "2026-05-01T08:00:00Z",
                "body": "",
                "prerelease": false,
                "assets": [{
                    "name": "fw.bin",
                    "browser_download_url": format!("{}/download/fw.bin", server.uri()),
                    "size": 16
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/fw.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![7u8; 16])
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let app = upstream_app(&dir, &server).await;
        let uri = "/api/firmware/esp32/download";
        let ((first, first_body), (second, second_body)) = tokio::join!(
            send(app.clone(), "POST", uri),
            send(app.clone(), "POST", uri),
        );

        let mut codes = [first, second];
        codes.sort();
        assert_eq!(codes, [StatusCode::OK, StatusCode::CONFLICT]);
        let conflict = if first == StatusCode::CONFLICT {
            first_body
        } else {
            second_body
        };
        let body: serde_json::Value = serde_json::from_slice(&conflict).expect("json");
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().is_some_and(|m| m.contains("in progress")));
        assert_eq!(
            std::fs::read(dir.path().join("esp32").join("fw.bin")).expect("artifact"),
            vec![7u8; 16]
        );
    }

    #[tokio::test]
    async fn serves_cached_binary() {
        let dir = TempDir::new().expect("tempdir");
        let (status, _) = send(app(&dir).await, "GET", "/api/firmware/esp32/binary").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        std::fs::create_dir_all(dir.path().join("esp32")).expect("dir");
        std::fs::write(dir.path().join("esp32").join("fw.bin"), b"\x01\x02\x03").expect("seed");
        let (status, body) = send(app(&dir).await, "GET", "/api/firmware/esp32/binary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"\x01\x02\x03");
    }

    #[tokio::test]
    async fn lists_configured_devices() {
        let dir = TempDir::new().expect("tempdir");
        let (status, body) = send(app(&dir).await, "GET", "/api/firmware").await;
        assert_eq!(status, StatusCode::OK);
        let devices: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(devices[0]["name"], "esp32");
        assert_eq!(devices[0]["repository"], "your-org/fw");
    }
}
