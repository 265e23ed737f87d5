use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    error::{PipelineError, StoreError},
    lessons::LessonService,
    models::{
        CreateAccountRequest, CreateAccountResponse, CreateLessonRequest, CreateLessonResponse, DeleteResponse, LessonsResponse, LoginRequest, LoginResponse,
        StepsResponse,
    },
    pdf::generate_pdf,
    store::{role_name, LessonStore},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LessonStore>,
    pub lessons: Arc<LessonService>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/createAccount", post(create_account))
        .route("/createLesson", post(create_lesson))
        .route("/getLessons", get(get_lessons))
        .route("/getSteps/:lesson_id", get(get_steps))
        .route("/lessons/:lesson_id", delete(delete_lesson))
        .route("/lessons/:lesson_id/pdf", get(export_pdf))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::LessonNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::EmailTaken(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_failure(e: StoreError) -> Response {
    error!("❌ Store error: {}", e);
    (store_status(&e), Json(serde_json::json!({ "success": false, "message": e.to_string() }))).into_response()
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    match state.store.verify_user(&body.username, &body.password).await {
        Ok(Some(user)) => {
            info!("🔑 {} logged in", user.email);
            Json(LoginResponse { success: true, role: Some(role_name(user.role).to_string()), message: None }).into_response()
        }
        Ok(None) => {
            warn!("⚠️ Rejected login for {}", body.username);
            (
                StatusCode::UNAUTHORIZED,
                Json(LoginResponse { success: false, role: None, message: Some("Invalid credentials".into()) }),
            )
                .into_response()
        }
        Err(e) => store_failure(e),
    }
}

pub async fn create_account(State(state): State<AppState>, Json(body): Json<CreateAccountRequest>) -> Response {
    if body.email.trim().is_empty() || body.password.is_empty() {
        let message = Some("email and password are required".to_string());
        return (StatusCode::BAD_REQUEST, Json(CreateAccountResponse { success: false, user: None, message })).into_response();
    }
    match state.store.create_account(body.email.trim(), &body.password, &body.name, body.role).await {
        Ok(user) => {
            info!("👤 Registered {} as {}", user.email, role_name(user.role));
            Json(CreateAccountResponse { success: true, user: Some(user), message: None }).into_response()
        }
        Err(e) => {
            warn!("⚠️ Account creation for {} failed: {}", body.email, e);
            let message = Some(e.to_string());
            (store_status(&e), Json(CreateAccountResponse { success: false, user: None, message })).into_response()
        }
    }
}

pub async fn create_lesson(State(state): State<AppState>, Json(body): Json<CreateLessonRequest>) -> (StatusCode, Json<CreateLessonResponse>) {
    if body.title.trim().is_empty() || body.topic.trim().is_empty() || body.level.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(CreateLessonResponse {
                success: false,
                lesson_id: None,
                phase: None,
                message: Some("title, topic and level are required".into()),
            }),
        );
    }

    match state.lessons.create_lesson(&body).await {
        Ok(created) => (
            StatusCode::OK,
            Json(CreateLessonResponse { success: true, lesson_id: Some(created.lesson_id), phase: None, message: None }),
        ),
        Err(e) => {
            error!("❌ Lesson creation failed during {}: {}", e.phase(), e);
            let status = match e {
                PipelineError::Steps(_) => StatusCode::BAD_GATEWAY,
                PipelineError::Images(_) | PipelineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(CreateLessonResponse {
                    success: false,
                    lesson_id: None,
                    phase: Some(e.phase().to_string()),
                    message: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn get_lessons(State(state): State<AppState>) -> Response {
    match state.store.list_lessons().await {
        Ok(lessons) => Json(LessonsResponse { lessons }).into_response(),
        Err(e) => store_failure(e),
    }
}

pub async fn get_steps(Path(lesson_id): Path<i64>, State(state): State<AppState>) -> Response {
    match state.store.get_steps(lesson_id).await {
        Ok(steps) => Json(StepsResponse { lesson_id, steps }).into_response(),
        Err(e) => store_failure(e),
    }
}

pub async fn delete_lesson(Path(lesson_id): Path<i64>, State(state): State<AppState>) -> Response {
    match state.store.delete_lesson(lesson_id).await {
        Ok(()) => Json(DeleteResponse { success: true }).into_response(),
        Err(e) => store_failure(e),
    }
}

pub async fn export_pdf(Path(lesson_id): Path<i64>, State(state): State<AppState>) -> Response {
    let lesson = match state.store.get_lesson(lesson_id).await {
        Ok(lesson) => lesson,
        Err(e) => return store_failure(e),
    };
    let steps = match state.store.get_steps(lesson_id).await {
        Ok(steps) => steps,
        Err(e) => return store_failure(e),
    };

    match generate_pdf(&lesson, &steps) {
        Ok(pdf_bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
            if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename=\"lesson_{}.pdf\"", lesson_id)) {
                headers.insert(header::CONTENT_DISPOSITION, disposition);
            }
            (StatusCode::OK, headers, pdf_bytes).into_response()
        }
        Err(e) => {
            error!("❌ PDF export failed for lesson {}: {}", lesson_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
