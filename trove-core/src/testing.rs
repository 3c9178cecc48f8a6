//! In-memory store used by the unit tests.
//!
//! `FakeStore` implements [`Transport`] and serves the archive, multipart
//! upload and resource endpoints from memory. Tests can inject transport
//! failures, pin canned responses on a path and inspect every request
//! that was sent.

use crate::TroveError;
use crate::id::ArtifactId;
use crate::params::{
    ArchiveUploadResponse, FinishUploadResponse, Part, Parts, Resource, ResourceUploadResponse,
    UploadInfoResponse,
};
use crate::progress::Progress;
use crate::transport::{RequestBody, StoreRequest, StoreResponse, Transport};
use crate::verify::compute_hash;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub url: String,
    /// Path below the API version prefix, with its query string.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

#[derive(Clone)]
struct Canned {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    content_length: Option<u64>,
}

struct FailureRule {
    method: String,
    path: String,
    remaining: usize,
}

struct FakeSession {
    info: UploadInfoResponse,
    data: BTreeMap<usize, Bytes>,
    assembled: Option<Bytes>,
}

struct State {
    requests: Vec<RecordedRequest>,
    canned: HashMap<(String, String), Canned>,
    failures: Vec<FailureRule>,
    archives: HashMap<String, Vec<Bytes>>,
    resources: HashMap<(String, String), Vec<Bytes>>,
    sessions: HashMap<String, FakeSession>,
    next_upload: u32,
    min_part_size: u64,
    max_part_size: u64,
    max_parts: u32,
    multipart: bool,
    omit_content_length: bool,
    corrupt_archives: bool,
}

pub(crate) struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                requests: Vec::new(),
                canned: HashMap::new(),
                failures: Vec::new(),
                archives: HashMap::new(),
                resources: HashMap::new(),
                sessions: HashMap::new(),
                next_upload: 1,
                min_part_size: 10,
                max_part_size: 1024 * 1024,
                max_parts: 100,
                multipart: true,
                omit_content_length: false,
                corrupt_archives: false,
            }),
        }
    }

    pub fn with_session_limits(self, min_part_size: u64, max_part_size: u64, max_parts: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.min_part_size = min_part_size;
            state.max_part_size = max_part_size;
            state.max_parts = max_parts;
        }
        self
    }

    /// Answers `POST /upload` with "not found", like stores that predate
    /// multipart uploads.
    pub fn without_multipart(self) -> Self {
        self.state.lock().unwrap().multipart = false;
        self
    }

    pub fn omit_content_length(&self, omit: bool) {
        self.state.lock().unwrap().omit_content_length = omit;
    }

    /// Serves archive bodies with one byte flipped while keeping the
    /// advertised hash.
    pub fn corrupt_archives(&self, corrupt: bool) {
        self.state.lock().unwrap().corrupt_archives = corrupt;
    }

    /// Stores `data` as the next revision of `id` and returns the fully
    /// qualified id.
    pub fn put_archive(&self, id: &str, data: &[u8]) -> ArtifactId {
        let id = ArtifactId::parse(id).unwrap().with_revision(None);
        let mut state = self.state.lock().unwrap();
        let revisions = state.archives.entry(id.path()).or_default();
        revisions.push(Bytes::copy_from_slice(data));
        id.with_revision(Some(revisions.len() as u32 - 1))
    }

    pub fn archive_content(&self, id: &ArtifactId) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        let revisions = state.archives.get(&id.with_revision(None).path())?;
        match id.revision {
            Some(revision) => revisions.get(revision as usize).cloned(),
            None => revisions.last().cloned(),
        }
    }

    pub fn put_resource(&self, entity: &str, name: &str, data: &[u8]) -> u32 {
        let mut state = self.state.lock().unwrap();
        let revisions = state
            .resources
            .entry((entity.to_string(), name.to_string()))
            .or_default();
        revisions.push(Bytes::copy_from_slice(data));
        revisions.len() as u32 - 1
    }

    pub fn resource_content(&self, entity: &str, name: &str, revision: u32) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(&(entity.to_string(), name.to_string()))
            .and_then(|revisions| revisions.get(revision as usize).cloned())
    }

    /// Creates session `upload_id` holding `data` as complete part `index`
    /// starting at `offset`.
    pub fn seed_session(&self, upload_id: &str, index: usize, offset: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let mut session = new_session(&state, upload_id);
        session.info.parts.resize(index + 1, Part::default());
        session.info.parts[index] = Part {
            offset,
            size: data.len() as u64,
            complete: true,
            hash: compute_hash(data),
        };
        session.data.insert(index, Bytes::copy_from_slice(data));
        state.sessions.insert(upload_id.to_string(), session);
    }

    /// Always answers `method path` (query ignored) with a JSON body.
    pub fn respond_json(&self, method: &str, path: &str, body: &str) {
        self.respond_status(method, path, 200, "application/json", body.as_bytes().to_vec());
    }

    pub fn respond_status(
        &self,
        method: &str,
        path: &str,
        status: u16,
        content_type: &str,
        body: Vec<u8>,
    ) {
        let length = body.len() as u64;
        self.respond_with(
            method,
            path,
            status,
            &[("Content-Type", content_type)],
            body,
            Some(length),
        );
    }

    pub fn respond_with(
        &self,
        method: &str,
        path: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: Vec<u8>,
        content_length: Option<u64>,
    ) {
        let canned = Canned {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body,
            content_length,
        };
        self.state
            .lock()
            .unwrap()
            .canned
            .insert((method.to_string(), path.to_string()), canned);
    }

    /// Fails the next `times` requests to `method path` (query ignored)
    /// with a connection reset, after their bodies have been sent.
    pub fn fail_requests(&self, method: &str, path: &str, times: usize) {
        self.state.lock().unwrap().failures.push(FailureRule {
            method: method.to_string(),
            path: path.to_string(),
            remaining: times,
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.lock().unwrap().requests.last().cloned()
    }

    /// Requests whose path and query start with `prefix`.
    pub fn requests_matching(&self, method: &str, prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.path.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl Transport for FakeStore {
    async fn send(&self, request: StoreRequest) -> crate::Result<StoreResponse> {
        let StoreRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let body = match body {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Json(data) => data,
            RequestBody::Stream { mut stream, .. } => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Bytes::from(out)
            }
        };

        let path = url
            .path()
            .strip_prefix("/v5")
            .unwrap_or(url.path())
            .to_string();
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let method = method.as_str().to_string();

        let mut state = self.state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            url: url.to_string(),
            path: match url.query() {
                Some(q) => format!("{}?{}", path, q),
                None => path.clone(),
            },
            headers,
            body: body.clone(),
        });

        if let Some(rule) = state
            .failures
            .iter_mut()
            .find(|rule| rule.method == method && rule.path == path && rule.remaining > 0)
        {
            rule.remaining -= 1;
            return Err(TroveError::transport(
                format!("{} {}", method, path),
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer"),
            ));
        }

        if let Some(canned) = state.canned.get(&(method.clone(), path.clone())).cloned() {
            return Ok(canned_response(canned));
        }

        Ok(route(&mut state, &method, &path, &query, body))
    }
}

fn route(
    state: &mut State,
    method: &str,
    path: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> StoreResponse {
    if path == "/upload" && method == "POST" {
        if !state.multipart {
            return error_response(404, "not found", "not found");
        }
        let upload_id = format!("upload-{}", state.next_upload);
        state.next_upload += 1;
        let session = new_session(state, &upload_id);
        let info = session.info.clone();
        state.sessions.insert(upload_id, session);
        return json_response(&info);
    }
    if let Some(rest) = path.strip_prefix("/upload/") {
        return match (method, rest.split_once('/')) {
            ("PUT", Some((upload_id, index))) => put_part(state, upload_id, index, query, body),
            ("GET", None) => match state.sessions.get(rest) {
                Some(session) => json_response(&session.info),
                None => error_response(404, "not found", "upload not found"),
            },
            ("PUT", None) => finish_upload(state, rest, body),
            _ => error_response(405, "method not allowed", "method not allowed"),
        };
    }
    if let Some(entity) = path.strip_suffix("/archive") {
        let entity = entity.trim_start_matches('/');
        return match method {
            "GET" => get_archive(state, entity),
            "POST" | "PUT" => post_archive(state, entity, query, body),
            _ => error_response(405, "method not allowed", "method not allowed"),
        };
    }
    if let Some((entity, rest)) = path.split_once("/meta/resources") {
        let entity = entity.trim_start_matches('/');
        return resource_meta(state, entity, rest.trim_start_matches('/'));
    }
    if let Some((entity, rest)) = path.split_once("/resource/") {
        let entity = entity.trim_start_matches('/');
        return match method {
            "GET" => get_resource(state, entity, rest),
            "POST" => post_resource(state, entity, rest, query, body),
            _ => error_response(405, "method not allowed", "method not allowed"),
        };
    }
    error_response(404, "not found", &format!("no handler for {}", path))
}

fn new_session(state: &State, upload_id: &str) -> FakeSession {
    FakeSession {
        info: UploadInfoResponse {
            upload_id: upload_id.to_string(),
            expires: expiry(),
            min_part_size: state.min_part_size,
            max_part_size: state.max_part_size,
            max_parts: state.max_parts,
            parts: Vec::new(),
        },
        data: BTreeMap::new(),
        assembled: None,
    }
}

fn expiry() -> DateTime<Utc> {
    Utc::now() + Duration::hours(24)
}

fn put_part(
    state: &mut State,
    upload_id: &str,
    index: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> StoreResponse {
    let Some(session) = state.sessions.get_mut(upload_id) else {
        return error_response(404, "not found", "upload not found");
    };
    let Ok(index) = index.parse::<usize>() else {
        return error_response(400, "bad request", "invalid part number");
    };
    let hash = query.get("hash").cloned().unwrap_or_default();
    if hash != compute_hash(&body) {
        return error_response(400, "bad request", "part hash mismatch");
    }
    let offset = query
        .get("offset")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_default();

    if session.info.parts.len() <= index {
        session.info.parts.resize(index + 1, Part::default());
    }
    session.info.parts[index] = Part {
        offset,
        size: body.len() as u64,
        complete: true,
        hash,
    };
    session.data.insert(index, body);
    json_response(&serde_json::json!({}))
}

fn finish_upload(state: &mut State, upload_id: &str, body: Bytes) -> StoreResponse {
    let Some(session) = state.sessions.get_mut(upload_id) else {
        return error_response(404, "not found", "upload not found");
    };
    let Ok(submitted) = serde_json::from_slice::<Parts>(&body) else {
        return error_response(400, "bad request", "cannot parse parts");
    };

    let mut assembled = Vec::new();
    for (index, part) in submitted.parts.iter().enumerate() {
        let stored = session.info.parts.get(index);
        let data = session.data.get(&index);
        match (stored, data) {
            (Some(stored), Some(data))
                if stored.complete
                    && stored.hash == part.hash
                    && stored.offset == assembled.len() as u64 =>
            {
                assembled.extend_from_slice(data);
            }
            _ => return error_response(400, "bad request", &format!("part {} not uploaded", index)),
        }
    }

    let assembled = Bytes::from(assembled);
    let hash = compute_hash(&assembled);
    session.assembled = Some(assembled);
    json_response(&FinishUploadResponse { hash })
}

fn get_archive(state: &State, entity: &str) -> StoreResponse {
    let Ok(id) = ArtifactId::parse(entity) else {
        return error_response(400, "bad request", "invalid id");
    };
    let Some(revisions) = state.archives.get(&id.with_revision(None).path()) else {
        return error_response(404, "not found", &format!("no matching charm or bundle for {}", id));
    };
    let revision = id.revision.unwrap_or(revisions.len() as u32 - 1);
    let Some(data) = revisions.get(revision as usize) else {
        return error_response(404, "not found", &format!("no matching charm or bundle for {}", id));
    };

    let hash = compute_hash(data);
    let mut served = data.to_vec();
    if state.corrupt_archives {
        if let Some(first) = served.first_mut() {
            *first ^= 0xff;
        }
    }
    let entity_id = id.with_revision(Some(revision)).to_string();
    let length = if state.omit_content_length {
        None
    } else {
        Some(served.len() as u64)
    };
    canned_response(Canned {
        status: 200,
        headers: vec![
            ("Entity-Id".to_string(), entity_id),
            ("Content-Sha384".to_string(), hash),
            ("Content-Type".to_string(), "application/octet-stream".to_string()),
        ],
        body: served,
        content_length: length,
    })
}

fn post_archive(
    state: &mut State,
    entity: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> StoreResponse {
    let Ok(id) = ArtifactId::parse(entity) else {
        return error_response(400, "bad request", "invalid id");
    };
    if query.get("hash").map(String::as_str) != Some(compute_hash(&body).as_str()) {
        return error_response(400, "bad request", "archive hash mismatch");
    }
    let revisions = state.archives.entry(id.with_revision(None).path()).or_default();
    let revision = match id.revision {
        Some(revision) => {
            if revisions.len() <= revision as usize {
                revisions.resize(revision as usize + 1, Bytes::new());
            }
            revisions[revision as usize] = body;
            revision
        }
        None => {
            // Re-posting the latest content does not create a new revision.
            if revisions.last() != Some(&body) {
                revisions.push(body);
            }
            revisions.len() as u32 - 1
        }
    };
    json_response(&ArchiveUploadResponse {
        id: id.with_revision(Some(revision)).to_string(),
        promulgated_id: query.get("promulgated").map(|p| format!("cs:{}", p)),
    })
}

fn resource_revision(rest: &str) -> (&str, Option<u32>) {
    match rest.split_once('/') {
        Some((name, revision)) => (name, revision.parse().ok()),
        None => (rest, None),
    }
}

fn get_resource(state: &State, entity: &str, rest: &str) -> StoreResponse {
    let (name, revision) = resource_revision(rest);
    let Some(revisions) = state.resources.get(&(entity.to_string(), name.to_string())) else {
        return error_response(404, "not found", "resource not found");
    };
    let revision = revision.unwrap_or(revisions.len() as u32 - 1);
    let Some(data) = revisions.get(revision as usize) else {
        return error_response(404, "not found", "resource revision not found");
    };
    canned_response(Canned {
        status: 200,
        headers: vec![
            ("Content-Sha384".to_string(), compute_hash(data)),
            ("Content-Type".to_string(), "application/octet-stream".to_string()),
        ],
        body: data.to_vec(),
        content_length: Some(data.len() as u64),
    })
}

fn post_resource(
    state: &mut State,
    entity: &str,
    name: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> StoreResponse {
    let data = if let Some(upload_id) = query.get("upload-id") {
        let Some(session) = state.sessions.get(upload_id) else {
            return error_response(404, "not found", "upload not found");
        };
        let Some(assembled) = session.assembled.clone() else {
            return error_response(400, "bad request", "upload not finished");
        };
        state.sessions.remove(upload_id);
        assembled
    } else {
        if query.get("hash").map(String::as_str) != Some(compute_hash(&body).as_str()) {
            return error_response(400, "bad request", "resource hash mismatch");
        }
        let existing = state
            .resources
            .get(&(entity.to_string(), name.to_string()))
            .and_then(|revisions| revisions.iter().rposition(|data| *data == body));
        if let Some(revision) = existing {
            return json_response(&ResourceUploadResponse {
                revision: revision as u32,
            });
        }
        body
    };

    let revisions = state
        .resources
        .entry((entity.to_string(), name.to_string()))
        .or_default();
    revisions.push(data);
    json_response(&ResourceUploadResponse {
        revision: revisions.len() as u32 - 1,
    })
}

fn resource_meta(state: &State, entity: &str, rest: &str) -> StoreResponse {
    let describe = |name: &str, revision: usize, data: &Bytes| Resource {
        name: name.to_string(),
        resource_type: "file".to_string(),
        path: format!("{}.bin", name),
        description: String::new(),
        revision: revision as u32,
        fingerprint: compute_hash(data),
        size: data.len() as u64,
    };

    if rest.is_empty() {
        let mut listed: Vec<Resource> = state
            .resources
            .iter()
            .filter(|((owner, _), revisions)| owner == entity && !revisions.is_empty())
            .map(|((_, name), revisions)| {
                let revision = revisions.len() - 1;
                describe(name, revision, &revisions[revision])
            })
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        return json_response(&listed);
    }

    let (name, revision) = resource_revision(rest);
    let Some(revisions) = state.resources.get(&(entity.to_string(), name.to_string())) else {
        return error_response(404, "not found", "resource not found");
    };
    let revision = revision.map(|r| r as usize).unwrap_or(revisions.len() - 1);
    match revisions.get(revision) {
        Some(data) => json_response(&describe(name, revision, data)),
        None => error_response(404, "not found", "resource revision not found"),
    }
}

fn json_response<T: Serialize + ?Sized>(value: &T) -> StoreResponse {
    let body = serde_json::to_vec(value).unwrap();
    let length = body.len() as u64;
    canned_response(Canned {
        status: 200,
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body,
        content_length: Some(length),
    })
}

fn error_response(status: u16, code: &str, message: &str) -> StoreResponse {
    let body = serde_json::to_vec(&serde_json::json!({ "Message": message, "Code": code })).unwrap();
    let length = body.len() as u64;
    canned_response(Canned {
        status,
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body,
        content_length: Some(length),
    })
}

fn canned_response(canned: Canned) -> StoreResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in &canned.headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    if let Some(length) = canned.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    }
    StoreResponse {
        status: canned.status,
        headers,
        content_length: canned.content_length,
        body: stream::iter(std::iter::once(Ok(Bytes::from(canned.body)))).boxed(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProgressEvent {
    Start(String),
    Transferred(u64),
    Error(String),
    Finalizing,
}

/// Progress sink that records every event it receives.
#[derive(Default)]
pub(crate) struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn error_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Error(_)))
            .count()
    }
}

impl Progress for RecordingProgress {
    fn start(&self, upload_id: &str, _expires: Option<DateTime<Utc>>) {
        self.events
            .lock()
            .unwrap()
            .push(ProgressEvent::Start(upload_id.to_string()));
    }

    fn transferred(&self, total: u64) {
        self.events
            .lock()
            .unwrap()
            .push(ProgressEvent::Transferred(total));
    }

    fn error(&self, err: &TroveError) {
        self.events
            .lock()
            .unwrap()
            .push(ProgressEvent::Error(err.to_string()));
    }

    fn finalizing(&self) {
        self.events.lock().unwrap().push(ProgressEvent::Finalizing);
    }
}
