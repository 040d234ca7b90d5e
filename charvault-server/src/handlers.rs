use actix_web::{web, HttpResponse};
use charvault::{BatchFileOperation, KbError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::AppState;

/// Configure all API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            // Status
            .route("/status", web::get().to(status))
            // Characters
            .route("/characters", web::get().to(list_characters))
            .route("/characters", web::post().to(create_character))
            .route("/characters/{name}/export", web::get().to(export_character))
            // Documents
            .route("/files", web::get().to(list_files))
            .route("/files", web::post().to(create_file))
            .route("/files/{filename:.*}", web::get().to(get_file))
            .route("/files/{filename:.*}", web::put().to(update_file))
            .route("/files/{filename:.*}", web::delete().to(delete_file))
            .route("/duplicate", web::post().to(duplicate_file))
            .route("/validate", web::post().to(validate))
            // Catalog
            .route("/types", web::get().to(list_types))
            .route("/types/{type_name}/schema", web::get().to(get_schema))
            .route("/types/{type_name}/template", web::get().to(get_template))
            // Backups
            .route("/backups", web::get().to(list_backups))
            .route("/backups/{backup_id}/restore", web::post().to(restore_backup))
            // Conflicts, export/import, batch
            .route("/conflicts/{filename:.*}", web::get().to(check_conflicts))
            .route("/export/{filename:.*}", web::get().to(export_file))
            .route("/import", web::post().to(import))
            .route("/batch", web::post().to(batch)),
    );
}

// ── Helpers ─────────────────────────────────────────────────────────

fn ok_json<T: Serialize>(value: T) -> HttpResponse {
    HttpResponse::Ok().json(value)
}

fn created_json<T: Serialize>(value: T) -> HttpResponse {
    HttpResponse::Created().json(value)
}

fn respond<T: Serialize>(result: charvault::Result<T>) -> HttpResponse {
    match result {
        Ok(v) => ok_json(v),
        Err(e) => err_response(e),
    }
}

fn err_response(e: KbError) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match &e {
        KbError::NotFound(_) => HttpResponse::NotFound().json(body),
        KbError::Conflict(_) => HttpResponse::Conflict().json(body),
        KbError::ValidationFailed(result) => HttpResponse::UnprocessableEntity().json(serde_json::json!({
            "error": e.to_string(),
            "validation": result,
        })),
        KbError::Malformed(_) | KbError::InvalidFilename { .. } | KbError::UnknownType(_) => {
            HttpResponse::BadRequest().json(body)
        }
        KbError::ServiceUnavailable(_) => HttpResponse::ServiceUnavailable().json(body),
        _ => {
            log::error!("Internal error: {e}");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error"
            }))
        }
    }
}

// ── Status & characters ─────────────────────────────────────────────

async fn status(state: web::Data<AppState>) -> HttpResponse {
    respond(state.store.status())
}

async fn list_characters(state: web::Data<AppState>) -> HttpResponse {
    respond(state.store.list_characters())
}

#[derive(Deserialize)]
struct NewCharacterBody {
    name: String,
    #[serde(default)]
    sections: BTreeMap<String, Value>,
}

async fn create_character(state: web::Data<AppState>, body: web::Json<NewCharacterBody>) -> HttpResponse {
    match state.store.create_character(&body.name, &body.sections) {
        Ok(report) if report.all_succeeded() => created_json(report),
        Ok(report) => ok_json(report),
        Err(e) => err_response(e),
    }
}

async fn export_character(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.export_character(&path))
}

// ── Documents ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    prefix: Option<String>,
}

async fn list_files(state: web::Data<AppState>, query: web::Query<ListQuery>) -> HttpResponse {
    respond(state.store.list_files(query.prefix.as_deref()))
}

async fn get_file(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.get_file(&path))
}

#[derive(Deserialize)]
struct CreateBody {
    filename: String,
    content: Value,
}

async fn create_file(state: web::Data<AppState>, body: web::Json<CreateBody>) -> HttpResponse {
    let body = body.into_inner();
    match state.store.create_file(&body.filename, body.content) {
        Ok(doc) => created_json(doc),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct UpdateBody {
    content: Value,
    expected_version: Option<u64>,
}

async fn update_file(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let result = match body.expected_version {
        Some(version) => state.store.update_file_versioned(&path, body.content, version),
        None => state.store.update_file(&path, body.content),
    };
    respond(result)
}

async fn delete_file(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.store.delete_file(&path) {
        Ok(backup) => ok_json(serde_json::json!({ "ok": true, "deleted": path.as_str(), "backup": backup })),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct DuplicateBody {
    filename: String,
    new_filename: String,
}

async fn duplicate_file(state: web::Data<AppState>, body: web::Json<DuplicateBody>) -> HttpResponse {
    match state.store.duplicate_file(&body.filename, &body.new_filename) {
        Ok(doc) => created_json(doc),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize)]
struct ValidateBody {
    /// Type name or filename
    target: String,
    content: Value,
}

async fn validate(state: web::Data<AppState>, body: web::Json<ValidateBody>) -> HttpResponse {
    respond(state.store.validate_content(&body.target, &body.content))
}

// ── Catalog ─────────────────────────────────────────────────────────

async fn list_types(state: web::Data<AppState>) -> HttpResponse {
    let types: BTreeMap<String, String> = state
        .store
        .catalog()
        .supported_types()
        .into_iter()
        .map(|(file_name, doc_type)| (doc_type.as_str().to_string(), file_name))
        .collect();
    ok_json(types)
}

async fn get_schema(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.catalog().schema(&path))
}

async fn get_template(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.catalog().template(&path))
}

// ── Backups ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BackupQuery {
    filename: Option<String>,
}

async fn list_backups(state: web::Data<AppState>, query: web::Query<BackupQuery>) -> HttpResponse {
    respond(state.store.list_backups(query.filename.as_deref()))
}

async fn restore_backup(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.restore_backup(&path))
}

// ── Conflicts, export/import, batch ─────────────────────────────────

async fn check_conflicts(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.check_conflicts(&path))
}

async fn export_file(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    respond(state.store.export_file(&path))
}

#[derive(Deserialize)]
struct ImportQuery {
    name: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

/// The body is taken as raw text so unparseable payloads surface as
/// `Malformed` rather than a framework error.
async fn import(state: web::Data<AppState>, query: web::Query<ImportQuery>, body: String) -> HttpResponse {
    respond(state.store.import_payload(&body, query.name.as_deref(), query.overwrite))
}

#[derive(Deserialize)]
struct BatchQuery {
    #[serde(default)]
    atomic: bool,
}

async fn batch(
    state: web::Data<AppState>,
    query: web::Query<BatchQuery>,
    body: web::Json<Vec<BatchFileOperation>>,
) -> HttpResponse {
    let operations = body.into_inner();
    let report = if query.atomic {
        state.store.execute_batch_atomic(operations)
    } else {
        state.store.execute_batch(operations)
    };
    ok_json(report)
}
