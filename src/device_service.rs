//! Device service client
//!
//! The device service is the remote registry that rooms, devices and their
//! readings are published to. Devices only see the [`DeviceService`] trait;
//! [`HttpDeviceService`] is the JSON-over-HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::model::{GioDevice, PeripheralId, Reading, Room};

#[derive(Error, Debug)]
pub enum DeviceServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Device service answered {status} for {url}")]
    Status { status: u16, url: String },
}

#[async_trait]
pub trait DeviceService: Send + Sync {
    /// Register a peripheral in a room, creating the room if needed.
    async fn register(&self, peripheral_id: &PeripheralId, room: &str) -> Result<GioDevice, DeviceServiceError>;

    /// Publish a reading of a registered device.
    async fn send_data(&self, device: &GioDevice, reading: &Reading) -> Result<(), DeviceServiceError>;
}

pub struct HttpDeviceService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeviceService {
    pub fn new(host: &str, port: u16) -> Result<Self, DeviceServiceError> {
        Self::with_base_url(format!("http://{}:{}", host, port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, DeviceServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("fog-node/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_room(&self, name: &str) -> Result<Room, DeviceServiceError> {
        let room = Room {
            id: String::new(),
            name: name.to_string(),
        };
        self.post_json("/rooms", &room).await
    }

    pub async fn create_device(&self, room_id: &str, device: &GioDevice) -> Result<GioDevice, DeviceServiceError> {
        self.post_json(&format!("/rooms/{}/devices", room_id), device).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, DeviceServiceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            return Err(DeviceServiceError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, DeviceServiceError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        Ok(self.post(path, body).await?.json().await?)
    }
}

#[async_trait]
impl DeviceService for HttpDeviceService {
    async fn register(&self, peripheral_id: &PeripheralId, room: &str) -> Result<GioDevice, DeviceServiceError> {
        let room = self.create_room(room).await?;

        let request = GioDevice {
            id: None,
            name: format!("device{}", peripheral_id),
            mac: peripheral_id.to_string(),
            room: room.id.clone(),
        };
        let mut device = self.create_device(&room.id, &request).await?;
        if device.room.is_empty() {
            device.room = room.id;
        }

        log::info!(
            "Registered {} on the device service as {}",
            peripheral_id,
            device.id.as_deref().unwrap_or("<unassigned>")
        );
        Ok(device)
    }

    async fn send_data(&self, device: &GioDevice, reading: &Reading) -> Result<(), DeviceServiceError> {
        let device_id = device.id.as_deref().unwrap_or(&device.mac);
        let path = format!("/rooms/{}/devices/{}/readings", device.room, device_id);
        self.post(&path, reading).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use warp::Filter;

    type Received = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    /// A device service stand-in that assigns ids and records every request.
    fn spawn_stub(received: Received) -> SocketAddr {
        let rooms = {
            let received = Arc::clone(&received);
            warp::path!("rooms")
                .and(warp::post())
                .and(warp::body::json())
                .and_then(move |body: serde_json::Value| {
                    let received = Arc::clone(&received);
                    async move {
                        received.lock().await.push(("rooms".to_string(), body.clone()));
                        let reply = serde_json::json!({"id": "room-1", "name": body["name"]});
                        Ok::<_, warp::Rejection>(warp::reply::json(&reply))
                    }
                })
        };

        let devices = {
            let received = Arc::clone(&received);
            warp::path!("rooms" / String / "devices")
                .and(warp::post())
                .and(warp::body::json())
                .and_then(move |room: String, body: serde_json::Value| {
                    let received = Arc::clone(&received);
                    async move {
                        received.lock().await.push((format!("rooms/{}/devices", room), body.clone()));
                        let mut reply = body;
                        reply["id"] = serde_json::json!("dev-1");
                        Ok::<_, warp::Rejection>(warp::reply::json(&reply))
                    }
                })
        };

        let readings = {
            let received = Arc::clone(&received);
            warp::path!("rooms" / String / "devices" / String / "readings")
                .and(warp::post())
                .and(warp::body::json())
                .and_then(move |room: String, device: String, body: serde_json::Value| {
                    let received = Arc::clone(&received);
                    async move {
                        received
                            .lock()
                            .await
                            .push((format!("rooms/{}/devices/{}/readings", room, device), body));
                        Ok::<_, warp::Rejection>(warp::reply())
                    }
                })
        };

        let (addr, server) = warp::serve(readings.or(devices).or(rooms)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_register_then_send_data() {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let addr = spawn_stub(Arc::clone(&received));
        let service = HttpDeviceService::new("127.0.0.1", addr.port()).unwrap();

        let device = service.register(&PeripheralId::new("AA:BB"), "kitchen").await.unwrap();
        assert_eq!(device.id.as_deref(), Some("dev-1"));
        assert_eq!(device.name, "deviceAA:BB");
        assert_eq!(device.mac, "AA:BB");
        assert_eq!(device.room, "room-1");

        let reading = Reading::new("temperature", "22 0", "C°");
        service.send_data(&device, &reading).await.unwrap();

        let received = received.lock().await;
        let paths: Vec<&str> = received.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec!["rooms", "rooms/room-1/devices", "rooms/room-1/devices/dev-1/readings"]
        );
        assert_eq!(received[0].1["name"], "kitchen");
        assert_eq!(received[2].1["unit"], "C°");
        assert!(received[2].1.get("creation_timestamp").is_some());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let not_found = warp::any().map(|| warp::reply::with_status("nope", warp::http::StatusCode::NOT_FOUND));
        let (addr, server) = warp::serve(not_found).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let service = HttpDeviceService::with_base_url(format!("http://{}/", addr)).unwrap();
        assert!(!service.base_url().ends_with('/'));

        let err = service.create_room("kitchen").await.unwrap_err();
        assert!(matches!(err, DeviceServiceError::Status { status: 404, .. }));
    }
}
