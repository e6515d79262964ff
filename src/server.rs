//! REST façade
//!
//! Thin warp layer over a [`BleTransport`]: device listing, action triggers
//! and callback subscriptions. Subscribers receive readings as JSON POSTs.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Reply};

use crate::callback::{callback_fn, Callback, CallbackError};
use crate::device::{DeviceDescription, DeviceError};
use crate::model::{ActionData, PeripheralId, Reading};
use crate::signal::SignalListener;
use crate::transport::BleTransport;

#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub url: String,
}

/// Body POSTed to subscribers for every reading.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadingNotification {
    pub peripheral_id: PeripheralId,
    pub reading: Reading,
}

/// HTTP client used to deliver readings to subscribers.
pub fn callback_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(concat!("fog-node/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Delivery function that POSTs each reading to `url`. Network errors and
/// non-2xx answers count as failed deliveries.
pub fn http_callback(client: reqwest::Client, url: String) -> Callback {
    callback_fn(move |peripheral_id, reading| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let body = ReadingNotification { peripheral_id, reading };
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| CallbackError::Delivery(format!("{}: {}", url, e)))?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CallbackError::Delivery(format!("{} answered {}", url, response.status())))
            }
        }
    })
}

fn message(status: StatusCode, text: impl Into<String>) -> WithStatus<Json> {
    warp::reply::with_status(warp::reply::json(&Message { message: text.into() }), status)
}

fn with_transport(
    transport: Arc<BleTransport>,
) -> impl Filter<Extract = (Arc<BleTransport>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&transport))
}

fn with_client(client: reqwest::Client) -> impl Filter<Extract = (reqwest::Client,), Error = Infallible> + Clone {
    warp::any().map(move || client.clone())
}

pub fn routes(
    transport: Arc<BleTransport>,
    client: reqwest::Client,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let list_devices = warp::path!("devices")
        .and(warp::get())
        .and(with_transport(Arc::clone(&transport)))
        .and_then(handle_list_devices);

    let get_device = warp::path!("devices" / String)
        .and(warp::get())
        .and(with_transport(Arc::clone(&transport)))
        .and_then(handle_get_device);

    let trigger_action = warp::path!("devices" / String / "actions" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_transport(Arc::clone(&transport)))
        .and_then(handle_trigger_action);

    let add_callback = warp::path!("callbacks")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_transport(Arc::clone(&transport)))
        .and(with_client(client))
        .and_then(handle_add_callback);

    let remove_callback = warp::path!("callbacks" / String)
        .and(warp::delete())
        .and(with_transport(transport))
        .and_then(handle_remove_callback);

    list_devices
        .or(get_device)
        .or(trigger_action)
        .or(add_callback)
        .or(remove_callback)
}

/// Serve the façade on `port` until `shutdown` fires.
pub async fn serve(
    transport: Arc<BleTransport>,
    client: reqwest::Client,
    port: u16,
    mut shutdown: SignalListener,
) -> Result<(), warp::Error> {
    let (addr, server): (SocketAddr, _) = warp::serve(routes(transport, client))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move { shutdown.fired().await })?;

    log::info!("REST server listening on http://{}", addr);
    server.await;
    log::info!("REST server stopped");
    Ok(())
}

async fn handle_list_devices(transport: Arc<BleTransport>) -> Result<impl Reply, warp::Rejection> {
    let mut devices: Vec<DeviceDescription> = Vec::new();
    for device in transport.get_devices().await {
        devices.push(device.describe().await);
    }
    Ok(warp::reply::json(&devices))
}

async fn handle_get_device(id: String, transport: Arc<BleTransport>) -> Result<impl Reply, warp::Rejection> {
    match transport.get_device_by_id(&PeripheralId::new(id.as_str())).await {
        Some(device) => Ok(warp::reply::with_status(
            warp::reply::json(&device.describe().await),
            StatusCode::OK,
        )),
        None => Ok(message(StatusCode::NOT_FOUND, format!("device {} not found", id))),
    }
}

async fn handle_trigger_action(
    id: String,
    action: String,
    body: Bytes,
    transport: Arc<BleTransport>,
) -> Result<impl Reply, warp::Rejection> {
    let data = if body.iter().all(u8::is_ascii_whitespace) {
        ActionData::default()
    } else {
        match serde_json::from_slice::<ActionData>(&body) {
            Ok(data) => data,
            Err(e) => return Ok(message(StatusCode::BAD_REQUEST, format!("invalid action body: {}", e))),
        }
    };

    let Some(device) = transport.get_device_by_id(&PeripheralId::new(id.as_str())).await else {
        return Ok(message(StatusCode::NOT_FOUND, format!("device {} not found", id)));
    };

    match device.trigger_action(&action, data).await {
        Ok(()) => Ok(message(StatusCode::OK, format!("action {} triggered", action))),
        Err(e @ DeviceError::ActionNotRecognized(_)) => Ok(message(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            log::warn!("Action {} on {} failed: {}", action, id, e);
            Ok(message(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

async fn handle_add_callback(
    body: Bytes,
    transport: Arc<BleTransport>,
    client: reqwest::Client,
) -> Result<impl Reply, warp::Rejection> {
    let request = match serde_json::from_slice::<CallbackRequest>(&body) {
        Ok(request) if !request.url.trim().is_empty() => request,
        Ok(_) => return Ok(message(StatusCode::BAD_REQUEST, "url must not be empty")),
        Err(e) => return Ok(message(StatusCode::BAD_REQUEST, format!("invalid callback body: {}", e))),
    };

    if let Some(existing) = transport.get_callback_uuid(&request.url).await {
        return Ok(message(StatusCode::OK, existing.to_string()));
    }

    let deliver = http_callback(client, request.url.clone());
    match transport.add_callback(request.url, deliver).await {
        Ok(id) => Ok(message(StatusCode::OK, id.to_string())),
        // Lost a race with a concurrent registration of the same url.
        Err(CallbackError::AlreadyRegistered { id, .. }) => Ok(message(StatusCode::OK, id.to_string())),
        Err(e) => Ok(message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn handle_remove_callback(id: String, transport: Arc<BleTransport>) -> Result<impl Reply, warp::Rejection> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Ok(message(StatusCode::BAD_REQUEST, format!("{} is not a callback id", id)));
    };

    if transport.remove_callback(id).await {
        Ok(message(StatusCode::OK, format!("callback {} removed", id)))
    } else {
        Ok(message(StatusCode::OK, format!("callback {} was not registered", id)))
    }
}
