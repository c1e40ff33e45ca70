use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use jobwatch::config::{EnvMsDuration, NonEmptyString, TelegramConfig};
use jobwatch::posting::Posting;

pub const CHANNEL_ID: &str = "@jobwatch_test";

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub fn posting(id: u32) -> Posting {
    Posting {
        title: format!("Rust Engineer {id}"),
        company: "Acme Corp".to_string(),
        work_status: "Remote".to_string(),
        location: "Worldwide".to_string(),
        skills: vec!["Rust".to_string(), "Tokio".to_string()],
        link: format!("https://jobs.example/postings/{id}"),
    }
}

/// Scripted stand-in for the Bot API, bound to an ephemeral port. Records
/// every request body it receives and answers `{"ok": true}` unless a
/// response was queued.
#[derive(Clone)]
pub struct TelegramServer {
    addr: SocketAddr,
    token: String,
    requests: Arc<Mutex<Vec<Value>>>,
    responses: Arc<Mutex<VecDeque<(StatusCode, Value)>>>,
}

impl TelegramServer {
    pub async fn start() -> TelegramServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = TelegramServer {
            addr: listener.local_addr().unwrap(),
            token: random_string("token", 16),
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
        };

        let router = Router::new()
            .route(
                &format!("/bot{}/sendMessage", server.token),
                post(send_message),
            )
            .with_state(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        server
    }

    /// Script the answer for an upcoming request, oldest first.
    pub fn queue_response(&self, status: StatusCode, body: Value) {
        self.responses.lock().unwrap().push_back((status, body));
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn config(&self) -> TelegramConfig {
        TelegramConfig {
            api_base: format!("http://{}", self.addr),
            bot_token: NonEmptyString(self.token.clone()),
            channel_id: NonEmptyString(CHANNEL_ID.to_string()),
            // tight pacing so tests do not sit in the rate limiter
            send_interval: EnvMsDuration(Duration::from_millis(10)),
            max_attempts: 3,
        }
    }
}

async fn send_message(
    State(server): State<TelegramServer>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    server.requests.lock().unwrap().push(body);

    let scripted = server.responses.lock().unwrap().pop_front();
    let (status, reply) = scripted.unwrap_or((
        StatusCode::OK,
        json!({"ok": true, "result": {"message_id": 1}}),
    ));

    (status, Json(reply))
}
