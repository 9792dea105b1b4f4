use std::collections::HashMap;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task;
use tracing::{error, info, warn};

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::files::{self, CreateFile, FileFilters, FilePatch, FileView, RemoveOutcome};
use crate::media;
use crate::pagination::{Item, Page, PageOptions};
use crate::state::AppState;
use crate::storage::{relative_key, sanitize_filename};

const UPLOAD_DIR: &str = "uploads";
const IMAGE_DIR: &str = "images";

pub async fn list_files(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Json<Page<FileView>>> {
    let options = PageOptions::from_query(&query)?;
    let filters = FileFilters::from_query(&query)?;

    let (mut conn, acting) = state.db_as(&user)?;
    let page = files::find_all(&mut conn, &options, &filters, Some(&acting))?;
    Ok(Json(page))
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<i32>,
) -> AppResult<Json<Item<FileView>>> {
    let mut conn = state.db()?;
    let data = files::find_one(&mut conn, file_id)?;
    Ok(Json(Item { data }))
}

pub async fn update_file(
    State(state): State<AppState>,
    Path(file_id): Path<i32>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<Item<FileView>>> {
    let patch = FilePatch::from_json(&body)?;

    let (mut conn, acting) = state.db_as(&user)?;
    let data = files::update(&mut conn, file_id, patch, &acting)?;
    Ok(Json(Item { data }))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<i32>,
    user: AuthenticatedUser,
) -> AppResult<Json<RemoveOutcome>> {
    let (mut conn, acting) = state.db_as(&user)?;
    let outcome = files::remove(&mut conn, state.storage.as_ref(), file_id, &acting).await?;
    Ok(Json(outcome))
}

struct UploadedPart {
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct UploadForm {
    file: Option<UploadedPart>,
    images: Vec<UploadedPart>,
    name: Option<String>,
    filetype_id: Option<i32>,
    topic_id: Option<i32>,
    subject_id: Option<i32>,
    parent_id: Option<i32>,
}

fn parse_form_id(field: &str, value: &str) -> AppResult<Option<i32>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    trimmed
        .parse::<i32>()
        .map(Some)
        .map_err(|_| AppError::bad_request(format!("{field} must be an integer")))
}

async fn read_upload_form(multipart: &mut Multipart) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let field_name = field.name().map(|n| n.to_string());
        match field_name.as_deref() {
            Some(part @ ("file" | "images")) => {
                let part = part.to_string();
                let file_name = field.file_name().map(|n| n.to_string());
                let content_type = field.content_type().map(|mime| mime.to_string());
                let bytes = field.bytes().await.map_err(|err| {
                    error!(error = %err, field = %part, "failed to read upload bytes");
                    AppError::bad_request(format!("failed to read {part} bytes: {err}"))
                })?;
                let uploaded = UploadedPart {
                    file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                };
                if part == "file" {
                    form.file = Some(uploaded);
                } else {
                    form.images.push(uploaded);
                }
            }
            Some(key @ ("name" | "filetypeId" | "topicId" | "subjectId" | "parentId")) => {
                let key = key.to_string();
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("invalid {key} field: {err}"))
                })?;
                match key.as_str() {
                    "name" => form.name = Some(value),
                    "filetypeId" => form.filetype_id = parse_form_id(&key, &value)?,
                    "topicId" => form.topic_id = parse_form_id(&key, &value)?,
                    "subjectId" => form.subject_id = parse_form_id(&key, &value)?,
                    _ => form.parent_id = parse_form_id(&key, &value)?,
                }
            }
            _ => {}
        }
    }

    Ok(form)
}

fn is_pdf(part: &UploadedPart) -> bool {
    if part.content_type.as_deref() == Some("application/pdf") {
        return true;
    }
    part.file_name
        .as_deref()
        .and_then(|name| mime_guess::from_path(name).first())
        .map(|mime| mime.essence_str() == "application/pdf")
        .unwrap_or(false)
}

async fn convert_stored_pdf(state: &AppState, key: &str) -> AppResult<Vec<String>> {
    let pdf_path = state
        .storage
        .resolve(key)
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    let public_root = state.public_root().to_path_buf();

    task::spawn_blocking(move || media::convert_pdf_to_images(&pdf_path, &public_root))
        .await
        .map_err(|err| AppError::internal(format!("pdf conversion task failed: {err}")))?
        .map_err(AppError::from)
}

/// Removes keys written for an upload whose record could not be created.
async fn discard_stored(state: &AppState, keys: &[String]) {
    for key in keys {
        if let Err(err) = state.storage.delete_object(key).await {
            warn!(path = %key, error = %err, "failed to remove rejected upload");
        }
    }
}

/// Writes the original, PDF pages and resized images, then creates the
/// record. Every key written to storage is pushed to `written` as soon as
/// it exists.
async fn store_upload(
    state: &AppState,
    user: &AuthenticatedUser,
    form: UploadForm,
    name: String,
    written: &mut Vec<String>,
) -> AppResult<FileView> {
    let timestamp = Utc::now().timestamp_millis();
    let mut stored_path: Option<String> = None;
    let mut image_paths: Vec<String> = Vec::new();

    if let Some(part) = form.file.as_ref() {
        let original = part.file_name.as_deref().unwrap_or("upload");
        let key = format!("{UPLOAD_DIR}/{timestamp}_{}", sanitize_filename(original));
        state.storage.put_object(&key, part.bytes.clone()).await?;
        written.push(key.clone());

        if is_pdf(part) {
            let pages = convert_stored_pdf(state, &key).await?;
            written.extend(pages.iter().cloned());
            image_paths.extend(pages);
        }
        stored_path = Some(key);
    }

    for (index, part) in form.images.into_iter().enumerate() {
        let key = format!("{IMAGE_DIR}/{timestamp}_{}.jpg", index + 1);
        let destination = state.storage.resolve(&key)?;
        let resized = task::spawn_blocking(move || media::resize_image(&part.bytes, &destination))
            .await
            .map_err(|err| AppError::internal(format!("image resize task failed: {err}")))?;
        match resized {
            Some(path) => {
                let key = relative_key(state.public_root(), &path)?;
                written.push(key.clone());
                image_paths.push(key);
            }
            None => warn!(image = index + 1, "skipping image that could not be resized"),
        }
    }

    let dto = CreateFile {
        name,
        path: stored_path,
        filetype_id: form.filetype_id,
        topic_id: form.topic_id,
        subject_id: form.subject_id,
        parent_id: form.parent_id,
    };

    let (mut conn, acting) = state.db_as(user)?;
    files::create(&mut conn, dto, image_paths, &acting)
}

pub async fn upload_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<Item<FileView>>)> {
    let form = read_upload_form(&mut multipart).await?;

    let name = form
        .name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| form.file.as_ref().and_then(|part| part.file_name.clone()))
        .ok_or_else(|| AppError::bad_request("name is required"))?;

    if form.file.as_ref().is_some_and(|part| part.bytes.is_empty()) {
        return Err(AppError::bad_request("file field must not be empty"));
    }

    let mut written = Vec::new();
    let data = match store_upload(&state, &user, form, name, &mut written).await {
        Ok(data) => data,
        Err(err) => {
            warn!(
                user_id = user.user_id,
                discarded = written.len(),
                error = %err,
                "file upload rejected"
            );
            discard_stored(&state, &written).await;
            return Err(err);
        }
    };

    info!(
        file_id = data.id,
        images = data.images.len(),
        user_id = user.user_id,
        "file upload succeeded"
    );

    Ok((StatusCode::CREATED, Json(Item { data })))
}

#[derive(Deserialize)]
pub struct ConvertPdfRequest {
    pub path: String,
}

#[derive(Serialize)]
pub struct ConvertPdfResponse {
    pub images: Vec<String>,
}

pub async fn convert_pdf(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(payload): Json<ConvertPdfRequest>,
) -> AppResult<Json<Item<ConvertPdfResponse>>> {
    let key = payload.path.trim();
    if key.is_empty() {
        return Err(AppError::bad_request("path is required"));
    }

    let images = match convert_stored_pdf(&state, key).await {
        Ok(images) => images,
        Err(err) => {
            error!(path = %key, error = %err, "pdf conversion request failed");
            return Err(err);
        }
    };

    Ok(Json(Item {
        data: ConvertPdfResponse { images },
    }))
}
