//! Student CRUD.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use rollcall_engine::Student;
use serde::Deserialize;

use crate::app::AppState;
use crate::routes::{AppError, Result};
use crate::writer::Committed;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub class_name: Option<String>,
}

/// Create student routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/students", get(list_handler)).route(
        "/students/{id}",
        get(get_handler).put(put_handler).delete(delete_handler),
    )
}

/// GET /students?className=
async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Student>>> {
    let mut students = state.service.list_students(query.class_name.as_deref())?;
    students.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(students))
}

/// GET /students/{id}
async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Student>> {
    state
        .service
        .get_student(&id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("student '{}'", id)))
}

/// PUT /students/{id}
async fn put_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(student): Json<Student>,
) -> Result<Json<Committed>> {
    if student.id != id {
        return Err(AppError::BadRequest(format!(
            "body id '{}' does not match path id '{}'",
            student.id, id
        )));
    }
    Ok(Json(state.service.save_student(&student)?))
}

/// DELETE /students/{id}
async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.service.delete_student(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
