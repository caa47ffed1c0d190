use crate::hub;
use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod appointment_type_routes;
pub mod auth_routes;
pub mod branch_routes;
pub mod client_routes;
pub mod dashboard_routes;
pub mod holiday_routes;
pub mod notification_routes;
pub mod role_routes;
pub mod template_routes;
pub mod theme_routes;
pub mod user_routes;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(role_routes::router())
        .merge(branch_routes::router())
        .merge(client_routes::router())
        .merge(appointment_routes::router())
        .merge(holiday_routes::router())
        .merge(theme_routes::router())
        .merge(dashboard_routes::router());

    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/users", user_routes::router())
        .nest("/api/v1/appointment_types", appointment_type_routes::router())
        .nest("/api/v1/notification_templates", template_routes::router())
        .nest("/api/v1/notifications", notification_routes::router())
        .nest("/api/v1", api)
        .merge(hub::router())
        .with_state(state)
}
