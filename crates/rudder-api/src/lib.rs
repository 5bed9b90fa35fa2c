//! rudder-api — REST API for Rudder.
//!
//! Command intake and read model over the [`Scheduler`]. Every response
//! uses the `{ success, data?, error? }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/applications` | List applications |
//! | POST | `/api/v1/applications` | Register or update an application |
//! | GET | `/api/v1/applications/{id}` | Application with its evaluation record |
//! | DELETE | `/api/v1/applications/{id}` | Soft-delete an application |
//! | POST | `/api/v1/applications/{id}/sync` | Re-evaluate now |
//! | GET | `/api/v1/applications/{id}/deployments` | Deployment history, newest first |
//! | POST | `/api/v1/applications/{id}/deployments` | Trigger a deployment |
//! | GET | `/api/v1/deployments/{id}` | Deployment details |
//! | POST | `/api/v1/deployments/{id}/stages/{ordinal}/approve` | Approve a stage |
//! | POST | `/api/v1/deployments/{id}/cancel` | Cancel a deployment |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use rudder_scheduler::Scheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
}

/// Build the complete API router.
pub fn build_router(scheduler: Scheduler) -> Router {
    let api_state = ApiState { scheduler };

    let api_routes = Router::new()
        .route(
            "/applications",
            get(handlers::list_applications).post(handlers::register_application),
        )
        .route(
            "/applications/{id}",
            get(handlers::get_application).delete(handlers::remove_application),
        )
        .route("/applications/{id}/sync", post(handlers::sync_application))
        .route(
            "/applications/{id}/deployments",
            get(handlers::list_deployments).post(handlers::trigger_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route(
            "/deployments/{id}/stages/{ordinal}/approve",
            post(handlers::approve_stage),
        )
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
