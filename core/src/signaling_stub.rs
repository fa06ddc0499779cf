//! Test-support only: a minimal in-process reference implementation of the
//! signaling wire protocol, used so the end-to-end forwarding scenarios and
//! the signaling-backoff tests are self-contained. Not part of the
//! product's deliverable surface -- any compliant external endpoint works
//! against the real binary.
//!
//! Grounded in this codebase's existing controller binary: axum `Router`
//! over `Arc<Mutex<...>>` state, same handler shape (`State` + `Query`/`Json`
//! extractors).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

const ROOM_PURGE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct Room {
    client_data: Option<String>,
    server_data: Option<String>,
    room_version: u64,
    mapping_version: u64,
    last_activity: Option<Instant>,
}

type Rooms = Arc<Mutex<HashMap<String, Room>>>;

#[derive(Deserialize)]
struct PublishBody {
    role: String,
    room: String,
    data: String,
}

#[derive(Serialize)]
struct PublishReply {
    status: String,
    room_version: u64,
    participant_version: u64,
    mapping_version: u64,
}

#[derive(Deserialize)]
struct GetQuery {
    role: String,
    room: String,
    #[serde(default)]
    check_updates: bool,
    #[serde(default)]
    last_mapping_version: u64,
}

#[derive(Serialize)]
struct CheckUpdatesReply {
    has_update: bool,
    version: u64,
    client_data: Option<String>,
}

#[derive(Deserialize)]
struct UpdateMappingsBody {
    room: String,
    #[allow(dead_code)]
    mappings: Vec<String>,
}

#[derive(Serialize)]
struct StatusReply {
    status: String,
    mapping_version: u64,
}

#[derive(Deserialize)]
struct DeleteQuery {
    room: String,
}

async fn publish(
    State(rooms): State<Rooms>,
    Json(body): Json<PublishBody>,
) -> Json<PublishReply> {
    let mut rooms = rooms.lock().unwrap();
    let room = rooms.entry(body.room).or_default();
    room.last_activity = Some(Instant::now());
    room.room_version += 1;

    match body.role.as_str() {
        "client" => room.client_data = Some(body.data),
        "server" => room.server_data = Some(body.data),
        _ => {}
    }

    Json(PublishReply {
        status: "ok".into(),
        room_version: room.room_version,
        participant_version: room.room_version,
        mapping_version: room.mapping_version,
    })
}

async fn get_handler(
    State(rooms): State<Rooms>,
    Query(q): Query<GetQuery>,
) -> Result<axum::response::Response, StatusCode> {
    use axum::response::IntoResponse;

    let mut rooms = rooms.lock().unwrap();
    let room = rooms.entry(q.room).or_default();
    room.last_activity = Some(Instant::now());

    if q.check_updates {
        let has_update = room.mapping_version > q.last_mapping_version;
        return Ok(Json(CheckUpdatesReply {
            has_update,
            version: room.mapping_version,
            client_data: if has_update {
                room.client_data.clone()
            } else {
                None
            },
        })
        .into_response());
    }

    let data = match q.role.as_str() {
        "client" => room.client_data.clone(),
        "server" => room.server_data.clone(),
        _ => None,
    };

    // Plain fetch returns the raw payload body, not a JSON-encoded string --
    // callers (`SignalingClient::fetch`) read it back with `resp.text()`.
    match data {
        Some(d) => Ok(d.into_response()),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn update_mappings(
    State(rooms): State<Rooms>,
    Json(body): Json<UpdateMappingsBody>,
) -> Json<StatusReply> {
    let mut rooms = rooms.lock().unwrap();
    let room = rooms.entry(body.room).or_default();
    room.last_activity = Some(Instant::now());
    room.mapping_version += 1;

    Json(StatusReply {
        status: "ok".into(),
        mapping_version: room.mapping_version,
    })
}

async fn delete_room(
    State(rooms): State<Rooms>,
    Query(q): Query<DeleteQuery>,
) -> Json<StatusReply> {
    let mut rooms = rooms.lock().unwrap();
    rooms.remove(&q.room);

    Json(StatusReply {
        status: "ok".into(),
        mapping_version: 0,
    })
}

fn purge_stale(rooms: &Rooms) {
    let mut rooms = rooms.lock().unwrap();
    rooms.retain(|_, room| {
        room.last_activity
            .map(|t| t.elapsed() < ROOM_PURGE_AFTER)
            .unwrap_or(true)
    });
}

/// A running signaling stub bound to an ephemeral localhost port.
pub struct SignalingStub {
    base_url: String,
    _rooms: Rooms,
    serve_handle: tokio::task::JoinHandle<()>,
    sweep_handle: tokio::task::JoinHandle<()>,
}

impl SignalingStub {
    pub async fn spawn() -> Self {
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));

        let app = Router::new()
            .route("/", post(publish).get(get_handler).put(update_mappings).delete(delete_room))
            .with_state(rooms.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serve_handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.ok();
        });

        let sweep_rooms = rooms.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut sweeper = tokio::time::interval(Duration::from_secs(60));
            loop {
                sweeper.tick().await;
                purge_stale(&sweep_rooms);
            }
        });

        Self {
            base_url: format!("http://{addr}/"),
            _rooms: rooms,
            serve_handle,
            sweep_handle,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }
}

impl Drop for SignalingStub {
    fn drop(&mut self) {
        self.serve_handle.abort();
        self.sweep_handle.abort();
    }
}
