use std::path::{Path, PathBuf};

use axum::{
    Router,
    extract::{Path as UrlPath, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct ApiState {
    output_dir: PathBuf,
}

pub(crate) fn router(output_dir: PathBuf) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/hls/{file}", get(hls_file))
        .with_state(ApiState { output_dir })
}

pub(crate) fn start_api_server(listen: String, output_dir: PathBuf, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = router(output_dir);

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("bind {} failed: {}", listen, e);
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index(State(state): State<ApiState>) -> impl IntoResponse {
    let mut manifests = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&state.output_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".m3u8") {
                manifests.push(name);
            }
        }
    }
    manifests.sort();
    manifests
        .iter()
        .map(|name| format!("/hls/{}\n", name))
        .collect::<String>()
}

fn content_type(name: &str) -> &'static str {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("aac") => "audio/aac",
        Some("h264") => "video/h264",
        _ => "application/octet-stream",
    }
}

async fn hls_file(
    State(state): State<ApiState>,
    UrlPath(file): UrlPath<String>,
) -> impl IntoResponse {
    if file.contains('/') || file.contains("..") {
        return Err(StatusCode::BAD_REQUEST);
    }
    match tokio::fs::read(state.output_dir.join(&file)).await {
        Ok(body) => Ok((
            [
                (header::CONTENT_TYPE, content_type(&file)),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("1.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type("10.ts"), "video/mp2t");
        assert_eq!(content_type("x"), "application/octet-stream");
    }
}
