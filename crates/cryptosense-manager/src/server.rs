//! HTTP surface of the control plane.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use cryptosense_core::wire::{
    AdminSettings, AirGappedExport, Command, CommandResponse, CreatePendingRequest,
    DiscoveryBatch, ErrorBody, RegistrationRequest, SensorHealth,
};

use crate::error::{ManagerError, Result};
use crate::service::ControlPlane;

/// Largest request body accepted, sized for air-gapped exports.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

fn with_state(
    state: Arc<ControlPlane>,
) -> impl Filter<Extract = (Arc<ControlPlane>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn reject(e: ManagerError) -> Rejection {
    warp::reject::custom(e)
}

/// All manager routes, with errors rendered as JSON bodies.
pub fn routes(
    state: Arc<ControlPlane>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "ok",
            "service": "cryptosense-manager",
            "version": env!("CARGO_PKG_VERSION"),
        }))
    });

    // ── Sensor-facing ─────────────────────────────────────────────

    let register = warp::path!("api" / "v1" / "sensors" / "register")
        .and(warp::post())
        .and(json_body())
        .and(warp::addr::remote())
        .and(with_state(state.clone()))
        .and_then(
            |req: RegistrationRequest, remote: Option<SocketAddr>, state: Arc<ControlPlane>| async move {
                let response = state
                    .register(&req, remote.map(|a| a.ip()))
                    .map_err(|e| {
                        tracing::warn!(name = %req.name, code = e.code(), error = %e, "Registration rejected");
                        reject(e)
                    })?;
                Ok::<_, Rejection>(warp::reply::json(&response))
            },
        );

    let heartbeat = warp::path!("api" / "v1" / "sensors" / String / "heartbeat")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(
            |sensor_id: String, health: SensorHealth, state: Arc<ControlPlane>| async move {
                let commands = state.heartbeat(&sensor_id, health).map_err(reject)?;
                Ok::<_, Rejection>(warp::reply::json(&commands))
            },
        );

    let poll = warp::path!("api" / "v1" / "sensors" / String / "commands")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|sensor_id: String, state: Arc<ControlPlane>| {
            warp::reply::json(&state.poll(&sensor_id))
        });

    let ack = warp::path!("api" / "v1" / "sensors" / String / "commands" / String / "ack")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(
            |sensor_id: String,
             command_id: String,
             response: CommandResponse,
             state: Arc<ControlPlane>| async move {
                state
                    .acknowledge(&sensor_id, &command_id, response)
                    .map_err(reject)?;
                Ok::<_, Rejection>(warp::reply::json(&serde_json::json!({ "status": "acknowledged" })))
            },
        );

    let discoveries = warp::path!("api" / "v1" / "sensors" / String / "discoveries")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(
            |sensor_id: String, batch: DiscoveryBatch, state: Arc<ControlPlane>| async move {
                let receipt = state.submit_discoveries(&sensor_id, batch).map_err(reject)?;
                Ok::<_, Rejection>(warp::reply::json(&receipt))
            },
        );

    let exports = warp::path!("api" / "v1" / "sensors" / String / "exports")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(
            |sensor_id: String, upload: AirGappedExport, state: Arc<ControlPlane>| async move {
                let receipt = state.submit_export(&sensor_id, upload).map_err(reject)?;
                Ok::<_, Rejection>(warp::reply::json(&receipt))
            },
        );

    // ── Operator-facing ───────────────────────────────────────────

    let pending_create = warp::path!("api" / "v1" / "sensors" / "pending")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(|req: CreatePendingRequest, state: Arc<ControlPlane>| async move {
            let created = state.create_pending(req).map_err(reject)?;
            Ok::<_, Rejection>(warp::reply::with_status(
                warp::reply::json(&created),
                StatusCode::CREATED,
            ))
        });

    let pending_list = warp::path!("api" / "v1" / "sensors" / "pending")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<ControlPlane>| warp::reply::json(&state.list_pending()));

    let pending_delete = warp::path!("api" / "v1" / "sensors" / "pending" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(|key: String, state: Arc<ControlPlane>| async move {
            let removed = state.delete_pending(&key).map_err(reject)?;
            Ok::<_, Rejection>(warp::reply::json(&removed))
        });

    let settings_get = warp::path!("api" / "v1" / "admin" / "settings")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<ControlPlane>| warp::reply::json(&state.settings()));

    let settings_put = warp::path!("api" / "v1" / "admin" / "settings")
        .and(warp::put())
        .and(json_body())
        .and(with_state(state.clone()))
        .and_then(|settings: AdminSettings, state: Arc<ControlPlane>| async move {
            let updated = state.update_settings(settings).map_err(reject)?;
            Ok::<_, Rejection>(warp::reply::json(&updated))
        });

    let enqueue = warp::path!("api" / "v1" / "sensors" / String / "commands")
        .and(warp::post())
        .and(json_body())
        .and(with_state(state.clone()))
        .map(|sensor_id: String, command: Command, state: Arc<ControlPlane>| {
            let queued = state.enqueue_command(&sensor_id, command);
            warp::reply::with_status(warp::reply::json(&queued), StatusCode::CREATED)
        });

    let sensor_list = warp::path!("api" / "v1" / "sensors")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<ControlPlane>| warp::reply::json(&state.sensors()));

    let sensor_get = warp::path!("api" / "v1" / "sensors" / String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(|sensor_id: String, state: Arc<ControlPlane>| async move {
            let record = state
                .sensor(&sensor_id)
                .ok_or_else(|| reject(ManagerError::UnknownSensor(sensor_id)))?;
            Ok::<_, Rejection>(warp::reply::json(&record))
        });

    let log = warp::log::custom(|info| {
        tracing::debug!(
            method = %info.method(),
            path = info.path(),
            status = info.status().as_u16(),
            elapsed_ms = info.elapsed().as_millis() as u64,
            "Request"
        );
    });

    health
        .or(register)
        .or(pending_create)
        .or(pending_list)
        .or(pending_delete)
        .or(settings_get)
        .or(settings_put)
        .or(heartbeat)
        .or(poll)
        .or(enqueue)
        .or(ack)
        .or(discoveries)
        .or(exports)
        .or(sensor_list)
        .or(sensor_get)
        .recover(handle_rejection)
        .with(log)
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (status, error, code) = if let Some(e) = err.find::<ManagerError>() {
        let status =
            StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %e, "Request failed");
        }
        (status, e.to_string(), e.code())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string(), "not_found")
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string(), "invalid_request")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large".to_string(),
            "payload_too_large",
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
            "method_not_allowed",
        )
    } else {
        tracing::error!(rejection = ?err, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error".to_string(),
            "internal",
        )
    };

    let body = ErrorBody {
        error,
        code: code.to_string(),
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Serve until `shutdown` resolves. With TLS enabled the server presents
/// either the configured certificate or one issued from the CA, and asks
/// sensors for client certificates chained to the CA.
pub async fn serve<F>(state: Arc<ControlPlane>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = state.config().clone();
    let api = routes(state.clone());

    if config.tls.enabled {
        let (cert_pem, key_pem) = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => (std::fs::read(cert)?, std::fs::read(key)?),
            _ => {
                let issued = state.ca().issue_server(&config.tls.server_names)?;
                (issued.cert_pem.into_bytes(), issued.key_pem.into_bytes())
            }
        };
        let (addr, server) = warp::serve(api)
            .tls()
            .cert(cert_pem)
            .key(key_pem)
            .client_auth_optional(state.ca().cert_pem().as_bytes())
            .bind_with_graceful_shutdown(config.listen, shutdown);
        tracing::info!(%addr, tls = true, "Manager listening");
        server.await;
    } else {
        let (addr, server) = warp::serve(api)
            .try_bind_with_graceful_shutdown(config.listen, shutdown)
            .map_err(|e| ManagerError::Server(e.to_string()))?;
        tracing::info!(%addr, tls = false, "Manager listening");
        server.await;
    }

    tracing::info!("Manager stopped");
    Ok(())
}
