//! Admin HTTP endpoint.
//!
//! | Method   | Path                     | Body                                   | Action                 |
//! |----------|--------------------------|----------------------------------------|------------------------|
//! | `GET`    | `/projects`              |                                        | list projects          |
//! | `POST`   | `/projects`              | `{id, root, name?, start?}`            | register               |
//! | `GET`    | `/projects/<id>`         |                                        | one project            |
//! | `DELETE` | `/projects/<id>`         |                                        | unregister             |
//! | `POST`   | `/projects/<id>/start`   |                                        | start runtime + watch  |
//! | `POST`   | `/projects/<id>/stop`    |                                        | stop runtime           |
//! | `POST`   | `/projects/<id>/changes` | `{files: [{file_path, content?}]}`     | bulk enqueue           |
//! | `POST`   | `/projects/<id>/edits`   | edit action                            | editor write           |
//! | `GET`    | `/changes/<n>`           |                                        | change status          |
//! | `GET`    | `/conflicts`             |                                        | pending conflicts      |
//! | `POST`   | `/conflicts/resolve`     | `{project_id, file_path, strategy?}`   | resolve and write      |
//! | `GET`    | `/stats`                 |                                        | registry statistics    |
//!
//! Every response is JSON. Failures carry `{"error": "..."}`. A change
//! without `content` deletes the file.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tokio::runtime::Handle;

use crate::config::AdminConfig;
use crate::conflict::ResolutionStrategy;
use crate::core::{Priority, ProjectId};
use crate::queue::{ChangeId, ChangeStatus, EditAction, NewChange, QueueError};
use crate::registry::{ProjectRegistry, RegistryError};
use crate::runtime::RuntimeError;
use crate::{debug, log};

/// Request bodies past this are cut off, and fail to parse.
const MAX_BODY: u64 = 8 * 1024 * 1024;

/// Status code and JSON body of one admin response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn not_found() -> Self {
        Self::error(404, "no such route")
    }
}

impl From<RegistryError> for Reply {
    fn from(err: RegistryError) -> Self {
        Self::error(status_of(&err), err.to_string())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    ListProjects,
    Register,
    Project(&'a str),
    Stats,
    Start(&'a str),
    Stop(&'a str),
    Unregister(&'a str),
    Changes(&'a str),
    Edit(&'a str),
    Change(&'a str),
    Conflicts,
    Resolve,
}

impl<'a> Route<'a> {
    fn parse(method: &Method, url: &'a str) -> Option<Self> {
        let path = url.split_once('?').map_or(url, |(path, _)| path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (method, segments.as_slice()) {
            (Method::Get, ["projects"]) => Some(Self::ListProjects),
            (Method::Post, ["projects"]) => Some(Self::Register),
            (Method::Get, ["projects", id]) => Some(Self::Project(id)),
            (Method::Get, ["stats"]) => Some(Self::Stats),
            (Method::Post, ["projects", id, "start"]) => Some(Self::Start(id)),
            (Method::Post, ["projects", id, "stop"]) => Some(Self::Stop(id)),
            (Method::Delete, ["projects", id]) => Some(Self::Unregister(id)),
            (Method::Post, ["projects", id, "changes"]) => Some(Self::Changes(id)),
            (Method::Post, ["projects", id, "edits"]) => Some(Self::Edit(id)),
            (Method::Get, ["changes", n]) => Some(Self::Change(n)),
            (Method::Get, ["conflicts"]) => Some(Self::Conflicts),
            (Method::Post, ["conflicts", "resolve"]) => Some(Self::Resolve),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    id: ProjectId,
    root: PathBuf,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    start: bool,
}

#[derive(Debug, Deserialize)]
struct ChangesBody {
    files: Vec<FileBody>,
}

#[derive(Debug, Deserialize)]
struct FileBody {
    file_path: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    project_id: ProjectId,
    file_path: String,
    #[serde(default)]
    strategy: Option<ResolutionStrategy>,
}

/// Answer one request against the registry.
pub async fn route(registry: &ProjectRegistry, method: &Method, url: &str, body: &str) -> Reply {
    let Some(route) = Route::parse(method, url) else {
        return Reply::not_found();
    };

    let result = match route {
        Route::ListProjects => Ok(json!(registry.get_all_projects())),
        Route::Stats => Ok(json!(registry.get_stats())),
        Route::Project(id) => project_json(registry, &ProjectId::new(id)),
        Route::Register => register(registry, body).await,
        Route::Start(id) => {
            let id = ProjectId::new(id);
            match registry.start_project(&id).await {
                Ok(_) => project_json(registry, &id),
                Err(e) => Err(e.into()),
            }
        }
        Route::Stop(id) => {
            let id = ProjectId::new(id);
            match registry.stop_project(&id).await {
                Ok(()) => project_json(registry, &id),
                Err(e) => Err(e.into()),
            }
        }
        Route::Unregister(id) => {
            let id = ProjectId::new(id);
            registry
                .unregister_project(&id)
                .await
                .map(|()| json!({ "unregistered": id }))
                .map_err(Reply::from)
        }
        Route::Changes(id) => enqueue_files(registry, ProjectId::new(id), body),
        Route::Edit(id) => parse_body::<EditAction>(body).and_then(|edit| {
            let change = registry.apply_edit(&ProjectId::new(id), edit)?;
            Ok(json!({ "id": change.0 }))
        }),
        Route::Change(n) => change_json(registry, n),
        Route::Conflicts => Ok(json!(registry.pending_conflicts())),
        Route::Resolve => resolve(registry, body).await,
    };

    match result {
        Ok(body) => Reply::ok(body),
        Err(reply) => reply,
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, Reply> {
    serde_json::from_str(body).map_err(|e| Reply::error(400, format!("invalid request body: {}", e)))
}

fn project_json(registry: &ProjectRegistry, id: &ProjectId) -> Result<Value, Reply> {
    registry
        .get_project_info(id)
        .map(|info| json!(info))
        .ok_or_else(|| RegistryError::NotFound(id.clone()).into())
}

async fn register(registry: &ProjectRegistry, body: &str) -> Result<Value, Reply> {
    let RegisterBody {
        id,
        root,
        name,
        start,
    } = parse_body(body)?;

    registry.register_project(id.clone(), &root, name).await?;
    if start {
        registry.start_project(&id).await?;
    }
    project_json(registry, &id)
}

fn enqueue_files(registry: &ProjectRegistry, id: ProjectId, body: &str) -> Result<Value, Reply> {
    let ChangesBody { files } = parse_body(body)?;
    let changes = files
        .into_iter()
        .map(|file| match file.content {
            Some(content) => NewChange::bulk(id.clone(), file.file_path, content),
            None => NewChange::delete(id.clone(), file.file_path)
                .with_priority(Priority::BULK),
        })
        .collect();

    let ids: Vec<u64> = registry
        .enqueue_changes(changes)?
        .into_iter()
        .map(|change| change.0)
        .collect();
    Ok(json!({ "ids": ids }))
}

fn change_json(registry: &ProjectRegistry, n: &str) -> Result<Value, Reply> {
    let id = n
        .parse::<u64>()
        .map(ChangeId)
        .map_err(|_| Reply::error(400, format!("invalid change id `{}`", n)))?;

    let queue = registry.queue();
    let status = queue.get_status(id);
    if status == ChangeStatus::Unknown {
        return Err(Reply::error(404, format!("no change {}", id)));
    }
    Ok(json!({
        "id": id.0,
        "status": status.as_str(),
        "retries": queue.retry_count(id).unwrap_or(0),
        "error": queue.failure(id).map(|failed| failed.error.to_string()),
    }))
}

async fn resolve(registry: &ProjectRegistry, body: &str) -> Result<Value, Reply> {
    let ResolveBody {
        project_id,
        file_path,
        strategy,
    } = parse_body(body)?;

    let change = registry
        .resolve_conflict(&project_id, &file_path, strategy)
        .await?;
    Ok(json!({
        "resolved": change.is_some(),
        "change": change.map(|id| id.0),
    }))
}

fn status_of(err: &RegistryError) -> u16 {
    match err {
        RegistryError::NotFound(_) => 404,
        RegistryError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => 404,
        RegistryError::InvalidRoot(_) | RegistryError::Queue(QueueError::InvalidPath(_)) => 400,
        RegistryError::CapacityExceeded(_)
        | RegistryError::Conflict(_)
        | RegistryError::Queue(QueueError::Conflict(_)) => 409,
        RegistryError::Runtime(RuntimeError::PoolExhausted(_)) => 503,
        RegistryError::Runtime(RuntimeError::StartupTimeout { .. }) => 504,
        _ => 500,
    }
}

// ============================================================================
// server
// ============================================================================

pub struct AdminServer {
    server: Arc<Server>,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl AdminServer {
    /// Bind and serve on a background thread.
    ///
    /// `handle` drives the registry's async operations from request threads.
    pub fn start(config: &AdminConfig, registry: ProjectRegistry, handle: Handle) -> Result<Self> {
        let server = Server::http(SocketAddr::new(config.interface, config.port))
            .map_err(|e| anyhow!("failed to bind admin on {}:{}: {}", config.interface, config.port, e))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("admin server is not bound to an IP address"))?;
        let server = Arc::new(server);

        let incoming = Arc::clone(&server);
        let thread = std::thread::Builder::new()
            .name("admin".into())
            .spawn(move || serve(&incoming, &registry, &handle))?;

        log!("admin"; "http://{}", addr);
        Ok(Self {
            server,
            addr,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.server.unblock();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AdminServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(server: &Server, registry: &ProjectRegistry, handle: &Handle) {
    for request in server.incoming_requests() {
        let registry = registry.clone();
        let handle = handle.clone();
        // Starting a project can take the whole startup timeout.
        std::thread::spawn(move || {
            if let Err(e) = respond(request, &registry, &handle) {
                log!("admin"; "response error: {}", e);
            }
        });
    }
}

fn respond(mut request: Request, registry: &ProjectRegistry, handle: &Handle) -> Result<()> {
    let reply = if crate::core::is_shutdown() {
        Reply::error(503, "shutting down")
    } else {
        match read_body(&mut request) {
            Ok(body) => handle.block_on(route(registry, request.method(), request.url(), &body)),
            Err(e) => Reply::error(400, format!("unreadable request body: {}", e)),
        }
    };
    debug!("admin"; "{} {} -> {}", request.method(), request.url(), reply.status);

    let mut response = Response::from_string(reply.body.to_string())
        .with_status_code(StatusCode(reply.status));
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response.add_header(header);
    }
    request.respond(response)?;
    Ok(())
}

fn read_body(request: &mut Request) -> io::Result<String> {
    let mut body = String::new();
    Read::take(request.as_reader(), MAX_BODY).read_to_string(&mut body)?;
    Ok(body)
}
