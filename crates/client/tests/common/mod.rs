//! In-process stand-in for the verdict service: a WebSocket endpoint plus
//! the HTTP upload endpoint it hands out for unknown samples.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use verdict_client::Sha256;

pub const VALID_TOKEN: &str = "valid-token";
/// Accepted, but only after [`SLOW_DELAY`].
pub const SLOW_TOKEN: &str = "slow-token";
pub const SESSION_ID: &str = "mock-session";
pub const UPLOAD_TOKEN: &str = "upload-token";

/// Answered immediately with `Pup`.
pub const PUP_SHA: &str = "d6f6c6b9fde37694e12b12009ad11ab9ec8dd0f193e7319c523933bdad8a50ad";
/// Answered with `Clean` after [`SLOW_DELAY`].
pub const SLOW_SHA: &str = "1111111111111111111111111111111111111111111111111111111111111111";
/// Never answered.
pub const HANG_SHA: &str = "2222222222222222222222222222222222222222222222222222222222222222";
/// Makes the service drop the connection.
pub const DROP_SHA: &str = "3333333333333333333333333333333333333333333333333333333333333333";

pub const SLOW_DELAY: Duration = Duration::from_millis(300);

/// Sample whose upload the service hands a token it will not accept.
pub const REJECTED_SAMPLE: &[u8] = b"upload gets rejected";
/// Sample whose upload the service stalls on for [`STALLED_UPLOAD`].
pub const STALLED_SAMPLE: &[u8] = b"upload hangs";
pub const STALLED_UPLOAD: Duration = Duration::from_secs(30);
/// Sample reported `Unknown` without anywhere to upload it.
pub const UNTARGETED_SAMPLE: &[u8] = b"nowhere to upload";

pub const DETECTION: &str = "Mock.Sample";

type Outbox = mpsc::UnboundedSender<Message>;

struct Shared {
    upload_base: String,
    /// Uploads the service is waiting for: guid -> (sha256, connection outbox).
    waiting: Mutex<HashMap<String, (String, Outbox)>>,
    requests: Mutex<Vec<Value>>,
    uploads: AtomicUsize,
    pings: AtomicUsize,
}

pub struct MockService {
    pub url: String,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockService {
    pub async fn start() -> Self {
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let shared = Arc::new(Shared {
            upload_base: format!("http://{}", http.local_addr().unwrap()),
            waiting: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            uploads: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        });
        let url = format!("ws://{}", ws.local_addr().unwrap());

        let app = Router::new()
            .route("/upload/:guid", put(accept_upload))
            .with_state(Arc::clone(&shared));
        let http_task = tokio::spawn(async move {
            let _ = axum::serve(http, app).await;
        });

        let accept_shared = Arc::clone(&shared);
        let ws_task = tokio::spawn(async move {
            while let Ok((stream, _)) = ws.accept().await {
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_shared)));
            }
        });

        Self {
            url,
            shared,
            tasks: vec![http_task, ws_task],
        }
    }

    pub fn uploads(&self) -> usize {
        self.shared.uploads.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Every verdict request received so far, as raw JSON.
    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().clone()
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn post(outbox: &Outbox, value: &Value) {
    let _ = outbox.send(Message::Text(value.to_string()));
}

fn verdict(guid: &str, sha256: &str, verdict: &str) -> Value {
    json!({"kind": "VerdictResponse", "guid": guid, "sha256": sha256, "verdict": verdict})
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (outbox, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let Some(Ok(Message::Text(first))) = source.next().await else {
        return;
    };
    let auth: Value = serde_json::from_str(&first).unwrap_or_default();
    if auth["token"] == SLOW_TOKEN {
        tokio::time::sleep(SLOW_DELAY).await;
    } else if auth["kind"] != "AuthRequest" || auth["token"] != VALID_TOKEN {
        post(&outbox, &json!({"kind": "AuthResponse", "success": false, "text": "Unauthorized"}));
        return;
    }
    post(&outbox, &json!({"kind": "AuthResponse", "success": true, "session_id": SESSION_ID}));

    while let Some(Ok(msg)) = source.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(request) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                shared.requests.lock().push(request.clone());
                if !respond(&shared, &outbox, &request) {
                    let _ = outbox.send(Message::Close(None));
                    return;
                }
            }
            Message::Ping(_) => {
                shared.pings.fetch_add(1, Ordering::SeqCst);
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

/// Answer one request. Returns false when the connection should be dropped.
fn respond(shared: &Shared, outbox: &Outbox, request: &Value) -> bool {
    let guid = request["guid"].as_str().unwrap_or_default().to_string();

    match request["kind"].as_str() {
        Some("VerdictRequest") => {
            let sha = request["sha256"].as_str().unwrap_or_default().to_string();
            match sha.as_str() {
                PUP_SHA => {
                    // Noise the client must skip over.
                    post(outbox, &verdict("stray-guid", PUP_SHA, "Clean"));
                    post(outbox, &json!({"kind": "Unsupported", "guid": guid}));
                    post(outbox, &verdict(&guid, &sha, "Pup"));
                }
                SLOW_SHA => {
                    let outbox = outbox.clone();
                    let clean = verdict(&guid, SLOW_SHA, "Clean");
                    tokio::spawn(async move {
                        tokio::time::sleep(SLOW_DELAY).await;
                        post(&outbox, &clean);
                    });
                }
                HANG_SHA => {}
                DROP_SHA => return false,
                other if other == Sha256::from_bytes(UNTARGETED_SAMPLE).as_str() => {
                    post(outbox, &verdict(&guid, &sha, "Unknown"));
                }
                _ => {
                    let token = if sha == Sha256::from_bytes(REJECTED_SAMPLE).as_str() {
                        "not-the-upload-token"
                    } else {
                        UPLOAD_TOKEN
                    };
                    request_upload(shared, outbox, &guid, &sha, token);
                }
            }
        }
        Some("VerdictRequestForStream") => {
            // The digest is only known once the body arrives.
            request_upload(shared, outbox, &guid, "", UPLOAD_TOKEN);
        }
        Some("VerdictRequestForUrl") => {
            let url = request["url"].as_str().unwrap_or_default();
            let sha = Sha256::from_bytes(url.as_bytes());
            let resp = if url.contains("eicar") {
                let mut v = verdict(&guid, sha.as_str(), "Malicious");
                v["detection"] = json!("EICAR-Test-File");
                v
            } else {
                verdict(&guid, sha.as_str(), "Clean")
            };
            post(outbox, &resp);
        }
        _ => {}
    }
    true
}

/// Answer `Unknown` and wait for the sample on `/upload/<guid>`.
/// An empty `sha` is filled in from the uploaded body.
fn request_upload(shared: &Shared, outbox: &Outbox, guid: &str, sha: &str, token: &str) {
    shared
        .waiting
        .lock()
        .insert(guid.to_string(), (sha.to_string(), outbox.clone()));
    let mut unknown = verdict(guid, sha, "Unknown");
    unknown["url"] = json!(format!("{}/upload/{guid}", shared.upload_base));
    unknown["upload_token"] = json!(token);
    post(outbox, &unknown);
}

async fn accept_upload(
    State(shared): State<Arc<Shared>>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let token = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if token != Some(UPLOAD_TOKEN) {
        return StatusCode::UNAUTHORIZED;
    }
    let Some((sha, outbox)) = shared.waiting.lock().remove(&guid) else {
        return StatusCode::NOT_FOUND;
    };
    let digest = Sha256::from_bytes(&body);
    if digest == Sha256::from_bytes(STALLED_SAMPLE) {
        tokio::time::sleep(STALLED_UPLOAD).await;
    }
    let sha = if sha.is_empty() { digest.to_string() } else { sha };
    if digest.as_str() != sha {
        return StatusCode::BAD_REQUEST;
    }
    shared.uploads.fetch_add(1, Ordering::SeqCst);

    // A repeated Unknown before the final verdict must not end the wait.
    post(&outbox, &verdict(&guid, &sha, "Unknown"));
    let mut done = verdict(&guid, &sha, "Malicious");
    done["detection"] = json!(DETECTION);
    post(&outbox, &done);
    StatusCode::OK
}
