use std::sync::Arc;

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder};
use rocket::serde::json::{self, json, Json, Value};
use rocket::tokio::task;
use rocket::{Build, Rocket, State};
use serde::Serialize;

use crate::actions::{Action, ActionInfo, NUM_ACTIONS};
use crate::coach::{Coach, DecisionRequest, FeedbackOutcome, FeedbackRequest, Health, Recommendation, Statistics};
use crate::error::CoachError;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Who may call the write endpoints. With no key configured everyone may.
pub struct ApiKeyPolicy(Option<String>);

impl ApiKeyPolicy {
    pub fn new(api_key: Option<String>) -> Self {
        Self(api_key)
    }

    fn allows(&self, presented: Option<&str>) -> bool {
        match &self.0 {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }
}

/// Request guard for endpoints that mutate the model.
pub struct WriteAccess;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WriteAccess {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let presented = req.headers().get_one(API_KEY_HEADER);
        let allowed = match req.rocket().state::<ApiKeyPolicy>() {
            Some(policy) => policy.allows(presented),
            None => true,
        };
        if allowed {
            Outcome::Success(WriteAccess)
        } else {
            log::warn!("[API] Rejected {} {}: bad or missing API key", req.method(), req.uri());
            Outcome::Error((Status::Unauthorized, ()))
        }
    }
}

/// Successful responses carry `"success": true` next to their payload.
#[derive(Serialize)]
pub struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

impl<T> Success<T> {
    fn new(body: T) -> Json<Self> {
        Json(Self {
            success: true,
            body,
        })
    }
}

/// Error responses: `{"success": false, "error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: Status,
    message: String,
}

impl ApiError {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<CoachError> for ApiError {
    fn from(e: CoachError) -> Self {
        let status = match e {
            CoachError::Validation(_) | CoachError::NotFound(_) => Status::BadRequest,
            CoachError::Persistence(_) => Status::InternalServerError,
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<json::Error<'_>> for ApiError {
    fn from(e: json::Error<'_>) -> Self {
        ApiError::new(Status::BadRequest, format!("Invalid JSON payload: {}", e))
    }
}

impl From<task::JoinError> for ApiError {
    fn from(e: task::JoinError) -> Self {
        log::error!("[API] Worker task failed: {}", e);
        ApiError::new(Status::InternalServerError, "Internal error")
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let body = json!({ "success": false, "error": self.message });
        (self.status, Json(body)).respond_to(req)
    }
}

type ApiResult<T> = Result<Json<Success<T>>, ApiError>;

#[get("/")]
fn index() -> Json<Value> {
    Json(json!({
        "service": "SkillQuest RL API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "GET /": "This documentation",
            "GET /health": "Health check",
            "GET /actions": "List all available actions",
            "POST /predict": "Get an action recommendation (returns recommendation_id + expires_at)",
            "POST /feedback": "Report recommendation_id and engaged=true if the learner engaged",
            "GET /stats": "Get model statistics",
            "POST /save": "Save the current model checkpoint",
        }
    }))
}

#[get("/health")]
fn health(coach: &State<Arc<Coach>>) -> Json<Health> {
    Json(coach.health())
}

#[derive(Serialize)]
pub struct ActionList {
    total_actions: usize,
    actions: Vec<ActionInfo>,
}

#[get("/actions")]
fn actions() -> Json<Success<ActionList>> {
    Success::new(ActionList {
        total_actions: NUM_ACTIONS,
        actions: Action::ALL.iter().map(|a| a.info()).collect(),
    })
}

#[post("/predict", data = "<request>")]
fn predict(
    coach: &State<Arc<Coach>>,
    request: Result<Json<DecisionRequest>, json::Error<'_>>,
) -> ApiResult<Recommendation> {
    let request = request?;
    let recommendation = coach.recommend(&request)?;
    Ok(Success::new(recommendation))
}

#[post("/feedback", data = "<request>")]
async fn feedback(
    _access: WriteAccess,
    coach: &State<Arc<Coach>>,
    request: Result<Json<FeedbackRequest>, json::Error<'_>>,
) -> ApiResult<FeedbackOutcome> {
    let request = request?.into_inner();
    let recommendation_id = request
        .recommendation_id
        .ok_or_else(|| CoachError::Validation("recommendation_id is required".to_string()))?;
    let engaged = request.engaged.unwrap_or(true);

    // Training holds the learning lock; keep it off the async workers.
    let coach = Arc::clone(coach.inner());
    let outcome =
        task::spawn_blocking(move || coach.feedback(&recommendation_id, engaged)).await??;
    log::info!(
        "[API] Feedback for {} (engaged={}) trained={}",
        outcome.recommendation_id,
        outcome.engaged,
        outcome.training_performed
    );
    Ok(Success::new(outcome))
}

#[get("/stats")]
fn stats(coach: &State<Arc<Coach>>) -> Json<Success<Statistics>> {
    let stats = coach.stats();
    log::debug!(
        "[STATS] epsilon={} memory={}/{} pending={}",
        stats.model.epsilon,
        stats.model.memory_size,
        stats.model.memory_capacity,
        stats.pending_recommendations
    );
    Success::new(stats)
}

#[derive(Serialize)]
pub struct Saved {
    message: String,
}

#[post("/save")]
async fn save(_access: WriteAccess, coach: &State<Arc<Coach>>) -> ApiResult<Saved> {
    let coach = Arc::clone(coach.inner());
    let path = task::spawn_blocking(move || coach.save()).await??;
    Ok(Success::new(Saved {
        message: format!("Model saved to {}", path),
    }))
}

fn error_body(message: &str) -> Json<Value> {
    Json(json!({ "success": false, "error": message }))
}

#[catch(400)]
fn bad_request() -> Json<Value> {
    error_body("Bad request")
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    error_body("Unauthorized")
}

#[catch(404)]
fn not_found(req: &Request) -> Json<Value> {
    error_body(&format!("No route for {} {}", req.method(), req.uri()))
}

#[catch(422)]
fn unprocessable() -> Json<Value> {
    error_body("Malformed request payload")
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    error_body("Internal error")
}

/// Mounts the coach's routes on `rocket`.
pub fn build(rocket: Rocket<Build>, coach: Arc<Coach>) -> Rocket<Build> {
    let policy = ApiKeyPolicy::new(coach.config().api_key.clone());
    rocket
        .manage(coach)
        .manage(policy)
        .mount(
            "/",
            routes![index, health, actions, predict, feedback, stats, save],
        )
        .register(
            "/",
            catchers![
                bad_request,
                unauthorized,
                not_found,
                unprocessable,
                internal_error
            ],
        )
}
