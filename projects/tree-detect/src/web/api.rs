use crate::error::{DetectError, NormalizeError};
use crate::pipeline::predictor::{PredictOptions, PredictedItem};
use crate::pipeline::types::{Detection, MediaKind, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::run_context::{sanitize_file_name, RunSummary};
use crate::video::normalize::{normalize_video, NormalizeReport};
use crate::video::VideoBackend;
use crate::web::error::{ApiError, ApiResult};
use crate::web::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Query, Request, State},
    http::{header, HeaderValue, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::services::ServeFile;

/// Raw fields of a detection request, as read from the multipart body.
#[derive(Debug, Default)]
pub struct DetectForm {
    pub file: Option<(String, Bytes)>,
    pub folder: Option<String>,
    pub conf: Option<String>,
    pub vid_stride: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum RequestSource {
    Upload { file_name: String, bytes: Bytes },
    Folder(PathBuf),
}

/// An upload wins over a folder; neither (or an empty upload and an unusable
/// folder) is a missing-input error. Uploads outside the extension allow-list
/// are refused here, before anything reaches the disk.
pub fn resolve_request_source(
    file: Option<(String, Bytes)>,
    folder: Option<&str>,
) -> Result<RequestSource, DetectError> {
    if let Some((name, bytes)) = file {
        if let Some(file_name) = sanitize_file_name(&name) {
            if !bytes.is_empty() {
                if MediaKind::from_path(Path::new(&file_name)).is_none() {
                    return Err(DetectError::UnsupportedFile(file_name.into()));
                }
                return Ok(RequestSource::Upload { file_name, bytes });
            }
        }
    }

    match folder.map(str::trim).filter(|f| !f.is_empty()) {
        Some(folder) if Path::new(folder).exists() => Ok(RequestSource::Folder(folder.into())),
        _ => Err(DetectError::MissingInput),
    }
}

fn parse_field<T: std::str::FromStr>(
    name: &str,
    raw: Option<&str>,
    default: T,
) -> Result<T, DetectError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| DetectError::InvalidOptions(format!("{} is not valid: {:?}", name, value))),
    }
}

/// File name offered for an artifact download.
pub fn download_name(name: &str) -> String {
    let base = sanitize_file_name(name).unwrap_or_else(|| "result".to_string());
    let safe: String = base
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .map(|c| if c == '"' { '_' } else { c })
        .collect();
    format!("detected_{}", safe)
}

#[derive(Serialize, Debug)]
pub struct ItemView {
    pub file_name: String,
    pub kind: MediaKind,
    pub frames: usize,
    pub detection_count: usize,
    pub detections: Vec<Detection>,
    pub preview_url: Option<String>,
    pub download_url: Option<String>,
    pub normalized: Option<NormalizeReport>,
}

#[derive(Serialize, Debug)]
pub struct DetectResponse {
    pub message: String,
    pub run_dir: String,
    pub items: Vec<ItemView>,
    pub warnings: Vec<String>,
}

async fn read_form(mut multipart: Multipart) -> ApiResult<DetectForm> {
    let mut form = DetectForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;
                form.file = Some((file_name, bytes));
            }
            "folder" | "conf" | "vid_stride" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read {}: {}", name, e)))?;
                match name.as_str() {
                    "folder" => form.folder = Some(text),
                    "conf" => form.conf = Some(text),
                    _ => form.vid_stride = Some(text),
                }
            }
            other => tracing::debug!("Ignoring multipart field {:?}", other),
        }
    }
    Ok(form)
}

/// Re-encoder used for annotated videos; swapped out in tests.
pub type Normalizer =
    dyn Fn(&Path, &Path, VideoBackend) -> Result<NormalizeReport, NormalizeError> + Sync;

pub async fn detect_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<DetectResponse>> {
    let form = read_form(multipart).await?;

    let response =
        tokio::task::spawn_blocking(move || handle_detect(&state, form, &normalize_video))
            .await
            .map_err(|e| ApiError::internal(format!("Detection task failed: {}", e)))??;

    Ok(Json(response))
}

/// Validate the form, then run the blocking part of the request.
pub fn handle_detect(
    state: &AppState,
    form: DetectForm,
    normalize: &Normalizer,
) -> ApiResult<DetectResponse> {
    let conf = parse_field("conf", form.conf.as_deref(), state.args.conf)?;
    let vid_stride = parse_field("vid_stride", form.vid_stride.as_deref(), state.args.vid_stride)?;
    let source = resolve_request_source(form.file, form.folder.as_deref())?;

    let opts = PredictOptions {
        conf,
        save: true,
        project: state.workspace.project_dir.clone(),
        name: state.workspace.run_name.clone(),
        vid_stride,
    };

    run_detection(state, source, &opts, normalize)
}

/// Blocking part of a request: store the upload, predict, re-encode videos.
fn run_detection(
    state: &AppState,
    source: RequestSource,
    opts: &PredictOptions,
    normalize: &Normalizer,
) -> ApiResult<DetectResponse> {
    let (source_path, uploaded) = match source {
        RequestSource::Upload { file_name, bytes } => {
            let path = state
                .workspace
                .save_upload(&file_name, &bytes)
                .map_err(|e| ApiError::internal(format!("Failed to store upload: {:#}", e)))?;
            (path, Some(file_name))
        }
        RequestSource::Folder(path) => (path, None),
    };

    let prediction = state.predictor.predict(&source_path, opts)?;

    // An upload must come back as exactly its own result.
    let selected: Vec<&PredictedItem> = match &uploaded {
        Some(name) => vec![prediction.item_for(name)?],
        None => prediction.items.iter().collect(),
    };

    let mut warnings = Vec::new();
    let mut items = Vec::with_capacity(selected.len());
    for item in selected {
        let mut artifact = item.output.clone();
        let mut normalized = None;

        if item.kind == MediaKind::Video {
            if let Some(raw) = &item.output {
                let dst = raw.with_extension("mp4");
                match normalize(raw, &dst, state.args.video_backend) {
                    Ok(report) => {
                        artifact = Some(dst);
                        normalized = Some(report);
                    }
                    Err(e) => {
                        tracing::warn!("Re-encode of {} failed: {}", raw.display(), e);
                        warnings.push(format!(
                            "{}: re-encode failed ({}); offering the raw annotated video instead.",
                            item.file_name, e
                        ));
                    }
                }
            }
        }

        let rel = artifact
            .as_deref()
            .and_then(|p| state.workspace.output_relative(p));
        let preview_url = rel.as_deref().map(|r| {
            let encoded: Vec<String> = r
                .split('/')
                .map(|seg| urlencoding::encode(seg).into_owned())
                .collect();
            format!("/outputs/{}", encoded.join("/"))
        });
        let download_url = rel.as_deref().zip(artifact.as_deref()).map(|(r, p)| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| item.file_name.clone());
            format!(
                "/api/download?path={}&name={}",
                urlencoding::encode(r),
                urlencoding::encode(&name)
            )
        });

        items.push(ItemView {
            file_name: item.file_name.clone(),
            kind: item.kind,
            frames: item.frames,
            detection_count: item.detection_count,
            detections: item.detections.clone(),
            preview_url,
            download_url,
            normalized,
        });
    }

    let run_dir = prediction.run_dir.display().to_string();
    let message = if uploaded.is_some() {
        "Detection complete.".to_string()
    } else {
        format!("Results saved in folder: {}", run_dir)
    };

    Ok(DetectResponse {
        message,
        run_dir,
        items,
        warnings,
    })
}

pub async fn get_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RunSummary>>> {
    let runs = state
        .workspace
        .list_runs()
        .map_err(|e| ApiError::internal(format!("Failed to list runs: {:#}", e)))?;
    Ok(Json(runs))
}

#[derive(Serialize)]
pub struct ConfigView {
    pub conf: f32,
    pub vid_stride: usize,
    pub image_extensions: &'static [&'static str],
    pub video_extensions: &'static [&'static str],
    pub run_dir: String,
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigView> {
    Json(ConfigView {
        conf: state.args.conf,
        vid_stride: state.args.vid_stride,
        image_extensions: IMAGE_EXTENSIONS,
        video_extensions: VIDEO_EXTENSIONS,
        run_dir: state.workspace.run_dir().display().to_string(),
    })
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub path: String,
    pub name: Option<String>,
}

pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
    request: Request,
) -> ApiResult<Response<Body>> {
    let path = state
        .workspace
        .resolve_download(&query.path)
        .ok_or_else(|| ApiError::not_found(format!("No such artifact: {}", query.path)))?;

    let name = query.name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let disposition = format!("attachment; filename=\"{}\"", download_name(&name));
    let disposition =
        HeaderValue::from_str(&disposition).map_err(|e| ApiError::internal(e.to_string()))?;

    // ServeFile streams from disk and sets the content type and length.
    let mut serve = ServeFile::new(&path);
    let response = serve
        .try_call(request)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to read {}: {}", path.display(), e)))?;

    let mut response = response.map(Body::new);
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}
