// In-memory json-server style resource store for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct StoreState {
    collections: HashMap<String, Vec<Value>>,
    versions: HashMap<(String, String), u64>,
    /// Upcoming PATCH requests answered with 500.
    pub fail_patches: usize,
    /// Delay before a PATCH is applied.
    pub patch_delay: Option<Duration>,
    /// Upcoming If-Match PUT requests answered with 412, each simulating a
    /// concurrent edit.
    pub conflicts: usize,
    /// Whether GET by id sends an ETag.
    pub send_etags: bool,
    pub requests: Vec<String>,
}

pub type Shared = Arc<Mutex<StoreState>>;

pub struct FakeStore {
    pub state: Shared,
    pub base_url: String,
}

fn id_of(v: &Value) -> String {
    match &v["id"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_matches(v: &Value, key: &str, expected: &str) -> bool {
    match &v[key] {
        Value::String(s) => s == expected,
        Value::Null => false,
        other => other.to_string() == expected,
    }
}

impl FakeStore {
    pub async fn start(seed: Value) -> Self {
        let mut st = StoreState {
            send_etags: true,
            ..StoreState::default()
        };
        for kind in ["courses", "users"] {
            let records = seed[kind].as_array().cloned().unwrap_or_default();
            for r in &records {
                st.versions.insert((kind.to_owned(), id_of(r)), 1);
            }
            st.collections.insert(kind.to_owned(), records);
        }
        let state: Shared = Arc::new(Mutex::new(st));
        let app = Router::new()
            .route("/:kind", get(list).post(create))
            .route(
                "/:kind/:id",
                get(get_one).put(put_one).patch(patch_one).delete(delete_one),
            )
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake store");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake store");
        });
        Self {
            state,
            base_url: format!("http://{addr}"),
        }
    }

    pub fn record(&self, kind: &str, id: u64) -> Option<Value> {
        let st = self.state.lock().unwrap();
        st.collections[kind]
            .iter()
            .find(|r| id_of(r) == id.to_string())
            .cloned()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.state.lock().unwrap().collections[kind].len()
    }

    /// Requests other than GET seen so far.
    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| !r.starts_with("GET "))
            .cloned()
            .collect()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Edit a record behind the client's back, as a second admin would.
    pub fn tamper(&self, kind: &str, id: u64, f: impl FnOnce(&mut Value)) {
        let mut st = self.state.lock().unwrap();
        let key = (kind.to_owned(), id.to_string());
        if let Some(r) = st
            .collections
            .get_mut(kind)
            .and_then(|c| c.iter_mut().find(|r| id_of(r) == id.to_string()))
        {
            f(r);
        }
        *st.versions.entry(key).or_insert(0) += 1;
    }
}

fn etag(version: u64) -> String {
    format!("\"v{version}\"")
}

fn json_with_etag(body: Value, version: Option<u64>) -> Response {
    match version {
        Some(v) => ([(header::ETAG, etag(v))], Json(body)).into_response(),
        None => Json(body).into_response(),
    }
}

async fn list(
    State(state): State<Shared>,
    Path(kind): Path<String>,
    Query(filters): Query<HashMap<String, String>>,
) -> Response {
    let mut st = state.lock().unwrap();
    st.requests.push(format!("GET /{kind}"));
    let Some(records) = st.collections.get(&kind) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let hits: Vec<Value> = records
        .iter()
        .filter(|r| filters.iter().all(|(k, v)| field_matches(r, k, v)))
        .cloned()
        .collect();
    Json(Value::Array(hits)).into_response()
}

async fn create(
    State(state): State<Shared>,
    Path(kind): Path<String>,
    Json(mut body): Json<Value>,
) -> Response {
    let mut st = state.lock().unwrap();
    st.requests.push(format!("POST /{kind}"));
    let Some(records) = st.collections.get_mut(&kind) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let next = records.iter().filter_map(|r| r["id"].as_u64()).max().unwrap_or(0) + 1;
    body["id"] = json!(next);
    records.push(body.clone());
    st.versions.insert((kind, next.to_string()), 1);
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn get_one(State(state): State<Shared>, Path((kind, id)): Path<(String, String)>) -> Response {
    let mut st = state.lock().unwrap();
    st.requests.push(format!("GET /{kind}/{id}"));
    let found = st
        .collections
        .get(&kind)
        .and_then(|c| c.iter().find(|r| id_of(r) == id))
        .cloned();
    match found {
        Some(r) => {
            let version = st
                .send_etags
                .then(|| st.versions.get(&(kind, id)).copied().unwrap_or(1));
            json_with_etag(r, version)
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_one(
    State(state): State<Shared>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let mut st = state.lock().unwrap();
    st.requests.push(format!("PUT /{kind}/{id}"));
    let key = (kind.clone(), id.clone());
    let current = st.versions.get(&key).copied().unwrap_or(1);
    if let Some(tag) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        if st.conflicts > 0 {
            st.conflicts -= 1;
            st.versions.insert(key, current + 1);
            return StatusCode::PRECONDITION_FAILED.into_response();
        }
        if tag != etag(current) {
            return StatusCode::PRECONDITION_FAILED.into_response();
        }
    }
    let Some(slot) = st
        .collections
        .get_mut(&kind)
        .and_then(|c| c.iter_mut().find(|r| id_of(r) == id))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    body["id"] = slot["id"].clone();
    *slot = body.clone();
    st.versions.insert(key, current + 1);
    Json(body).into_response()
}

async fn patch_one(
    State(state): State<Shared>,
    Path((kind, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let delay = {
        let mut st = state.lock().unwrap();
        st.requests.push(format!("PATCH /{kind}/{id}"));
        st.patch_delay
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let mut st = state.lock().unwrap();
    if st.fail_patches > 0 {
        st.fail_patches -= 1;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Some(slot) = st
        .collections
        .get_mut(&kind)
        .and_then(|c| c.iter_mut().find(|r| id_of(r) == id))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let (Some(target), Some(fields)) = (slot.as_object_mut(), body.as_object()) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
    let updated = slot.clone();
    *st.versions.entry((kind, id)).or_insert(1) += 1;
    Json(updated).into_response()
}

async fn delete_one(State(state): State<Shared>, Path((kind, id)): Path<(String, String)>) -> Response {
    let mut st = state.lock().unwrap();
    st.requests.push(format!("DELETE /{kind}/{id}"));
    let Some(records) = st.collections.get_mut(&kind) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let before = records.len();
    records.retain(|r| id_of(r) != id);
    if records.len() == before {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({})).into_response()
}

/// Three courses and two accounts: `ada` (learner) and `root` (admin).
pub fn seed() -> Value {
    json!({
        "courses": [
            {
                "id": 1, "title": "React Basics", "description": "Components and hooks",
                "category": "Frontend", "difficulty": "Beginner", "duration": "4 weeks",
                "price": 49.99, "instructor": "Dan", "thumbnail": "/static/react.png",
                "rating": 4.7, "students": 120,
                "lessons": [
                    {"id": 1, "title": "JSX", "duration": "10:00", "videoUrl": "https://v/1", "description": "", "completed": false},
                    {"id": 2, "title": "State", "duration": "12:00", "videoUrl": "https://v/2", "description": "", "completed": false},
                    {"id": 3, "title": "Effects", "duration": "15:00", "videoUrl": "https://v/3", "description": "", "completed": false},
                    {"id": 4, "title": "Context", "duration": "11:00", "videoUrl": "https://v/4", "description": "", "completed": false}
                ]
            },
            {
                "id": 2, "title": "Node APIs", "description": "Build REST services",
                "category": "Backend", "difficulty": "Intermediate", "duration": "6 weeks",
                "price": "59", "instructor": "Ryan", "thumbnail": "/static/node.png",
                "students": 80,
                "lessons": [
                    {"id": 1, "title": "HTTP", "videoUrl": "https://v/n1"},
                    {"id": 2, "title": "Routing", "videoUrl": "https://v/n2"}
                ]
            },
            {
                "id": 3, "title": "Python for Data", "description": "Pandas and numpy",
                "category": "Data Science", "difficulty": "Advanced", "duration": "8 weeks",
                "price": 0, "instructor": "Wes", "thumbnail": "/static/py.png",
                "lessons": []
            }
        ],
        "users": [
            {"id": 1, "username": "ada", "password": "secret", "role": "student",
             "enrolledCourses": [], "completedLessons": []},
            {"id": 2, "username": "root", "password": "admin", "role": "admin",
             "enrolledCourses": [], "completedLessons": []}
        ]
    })
}
