//! Health and metrics endpoints

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};
use health_registry::HealthRegistry;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::info;

pub struct HealthState {
    pub registry: Arc<HealthRegistry>,
}

async fn health_summary(state: web::Data<HealthState>) -> HttpResponse {
    let report = state.registry.check_all().await;
    if report.is_ready() {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"alive": true}))
}

async fn readiness_check(state: web::Data<HealthState>) -> HttpResponse {
    let report = state.registry.check_all().await;
    let body = serde_json::json!({
        "ready": report.is_ready(),
        "status": report.status,
    });

    if report.is_ready() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

/// Register the health and metrics routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_summary))
        .route("/health/live", web::get().to(liveness_check))
        .route("/health/ready", web::get().to(readiness_check))
        .route("/metrics", web::get().to(serve_metrics));
}

/// Bind the health server. The returned [`Server`] must be awaited or spawned.
pub fn serve(listen_address: &str, registry: Arc<HealthRegistry>) -> std::io::Result<Server> {
    let state = web::Data::new(HealthState { registry });
    info!("Starting health server on {}", listen_address);

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .workers(1)
        .disable_signals()
        .bind(listen_address)?
        .run();
    Ok(server)
}
