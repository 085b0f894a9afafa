//! Development HTTP server.
//!
//! Serves the latest compilation from memory, falls back to the static content root, and
//! optionally answers unknown routes with the entry document so client-side routers work.
//! A file watcher marks the compilation dirty when a directory holding one of its files
//! changes; the next request rebuilds it.

use anyhow::{Context, Result, anyhow};
use indexmap::IndexSet;
use log::{debug, error, info, trace, warn};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tiny_http::{Header, Request, Response, Server};

use crate::compiler::{Compilation, Compiler};
use crate::config::DEFAULT_HTML_FILENAME;

/// A response produced by [`DevServer::respond`], independent of the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl DevResponse {
    fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::new(status, "text/plain; charset=utf-8", body)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct BuildState {
    result: Result<Compilation, String>,
    watcher: Option<RecommendedWatcher>,
    watched: IndexSet<PathBuf>,
}

impl fmt::Debug for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildState")
            .field("succeeded", &self.result.is_ok())
            .field("watched", &self.watched)
            .finish()
    }
}

impl BuildState {
    /// Watch the directories holding every file the build read, so edits and newly created
    /// siblings mark the build dirty
    fn watch(&mut self, directories: IndexSet<PathBuf>) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        for stale in self.watched.difference(&directories) {
            if let Err(err) = watcher.unwatch(stale) {
                debug!("Failed to unwatch {:?}: {}", stale, err);
            }
        }
        for fresh in directories.difference(&self.watched) {
            if let Err(err) = watcher.watch(fresh, RecursiveMode::NonRecursive) {
                warn!("Failed to watch {:?}: {}", fresh, err);
            }
        }
        self.watched = directories;
    }
}

pub struct DevServer {
    compiler: Compiler,
    state: Mutex<BuildState>,
    dirty: Arc<AtomicBool>,
}

impl fmt::Debug for DevServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevServer")
            .field("compiler", &self.compiler)
            .field("state", &self.state)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

impl DevServer {
    /// Run the first compilation. A failing build does not prevent the server from starting.
    pub fn new(compiler: Compiler) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let watcher = Self::watcher(Arc::clone(&dirty));
        let mut state = BuildState {
            result: Err("Not built yet".to_owned()),
            watcher,
            watched: IndexSet::new(),
        };
        Self::build(&compiler, &mut state);
        Self {
            compiler,
            state: Mutex::new(state),
            dirty,
        }
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    fn watcher(dirty: Arc<AtomicBool>) -> Option<RecommendedWatcher> {
        let handler = move |event: notify::Result<Event>| match event {
            Ok(event) if !matches!(event.kind, EventKind::Access(_)) => {
                trace!("{:?} {:?}", event.kind, event.paths);
                dirty.store(true, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(err) => warn!("File watcher error: {err}"),
        };
        match RecommendedWatcher::new(handler, Config::default()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!("File watching unavailable, changes will not trigger rebuilds: {err}");
                None
            }
        }
    }

    fn build(compiler: &Compiler, state: &mut BuildState) {
        let config = compiler.config();
        let mut directories: IndexSet<PathBuf> = IndexSet::new();
        directories.insert(config.context.clone());
        directories.extend(config.entry_point.parent().map(Path::to_path_buf));

        match compiler.compile() {
            Ok(compilation) => {
                directories.extend(
                    compilation
                        .watch_files()
                        .iter()
                        .filter_map(|path| path.parent().map(Path::to_path_buf)),
                );
                state.result = Ok(compilation);
            }
            Err(err) => {
                error!("Build failed: {err:#}");
                state.result = Err(format!("{err:#}"));
                // Keep watching what the last good build read
                directories.extend(state.watched.iter().cloned());
            }
        }

        directories.retain(|directory| directory.is_dir());
        state.watch(directories);
    }

    /// The latest build, rebuilt first if a watched directory changed since
    fn current(&self) -> MutexGuard<'_, BuildState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.dirty.swap(false, Ordering::SeqCst) {
            info!("Sources changed, rebuilding");
            Self::build(&self.compiler, &mut state);
        }
        state
    }

    /// Answer one request. `accept` is the raw `Accept` header, if any.
    pub fn respond(&self, method: &str, url: &str, accept: Option<&str>) -> DevResponse {
        if method != "GET" && method != "HEAD" {
            return DevResponse::text(405, "Method Not Allowed");
        }

        let path = url.split(['?', '#']).next().unwrap_or("/");
        let Some(segments) = path_segments(path) else {
            return DevResponse::text(400, "Bad Request");
        };
        let relative = segments.join("/");

        let state = self.current();
        let compilation = state.result.as_ref().ok();

        if let Some(compilation) = compilation {
            let name = if relative.is_empty() {
                DEFAULT_HTML_FILENAME
            } else {
                relative.as_str()
            };
            if let Some(content) = compilation.asset(name) {
                return DevResponse::new(200, content_type_for(name), content);
            }
        }

        let static_root = &self.compiler.config().dev_server.static_content_root;
        if let Some(response) = serve_static(static_root, &relative) {
            return response;
        }

        if let Err(message) = &state.result {
            return DevResponse::text(500, message.clone());
        }

        if self.compiler.config().dev_server.history_fallback_enabled
            && accepts_html(accept)
            && segments.last().is_none_or(|last| !last.contains('.'))
        {
            let html = self.compiler.config().html.as_ref();
            if let Some(page) = html.and_then(|html| compilation?.asset(&html.filename)) {
                return DevResponse::new(200, "text/html; charset=utf-8", page);
            }
            if let Ok(page) = fs::read(static_root.join(DEFAULT_HTML_FILENAME)) {
                return DevResponse::new(200, "text/html; charset=utf-8", page);
            }
        }

        DevResponse::text(404, "Not Found")
    }

    /// Bind to `host:port` from the configuration
    pub fn listen(self) -> Result<BoundServer> {
        let dev_server = &self.compiler.config().dev_server;
        let addr = format!("{}:{}", dev_server.host, dev_server.port);
        self.bind(&addr)
    }

    pub fn bind(self, addr: &str) -> Result<BoundServer> {
        let server = Server::http(addr)
            .map_err(|err| anyhow!("Failed to bind dev server to {addr}: {err}"))?;
        Ok(BoundServer { server, dev: self })
    }
}

/// A [`DevServer`] attached to a listening socket
pub struct BoundServer {
    server: Server,
    dev: DevServer,
}

impl fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundServer")
            .field("addr", &self.local_addr())
            .field("dev", &self.dev)
            .finish()
    }
}

impl BoundServer {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Block until one request arrives and answer it
    pub fn serve_one(&self) -> Result<()> {
        let request = self
            .server
            .recv()
            .context("Failed to receive request")?;
        self.handle(request)
    }

    pub fn serve_forever(&self) -> Result<()> {
        if let Some(addr) = self.local_addr() {
            info!("Dev server listening on http://{addr}/");
        }
        for request in self.server.incoming_requests() {
            if let Err(err) = self.handle(request) {
                warn!("{err:#}");
            }
        }
        Ok(())
    }

    fn handle(&self, request: Request) -> Result<()> {
        let accept = request
            .headers()
            .iter()
            .find(|header| header.field.equiv("Accept"))
            .map(|header| header.value.as_str().to_owned());
        let method = request.method().to_string();
        let url = request.url().to_owned();

        let response = self.dev.respond(&method, &url, accept.as_deref());
        debug!("{} {} -> {}", method, url, response.status);

        let content_type =
            Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes())
                .map_err(|()| anyhow!("Invalid content type {}", response.content_type))?;
        let reply = Response::from_data(response.body)
            .with_status_code(response.status)
            .with_header(content_type);
        request
            .respond(reply)
            .with_context(|| format!("Failed to answer {method} {url}"))
    }
}

/// Decoded, non-empty path segments. `None` when the path tries to leave the root or does
/// not decode to UTF-8.
fn path_segments(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for raw in path.split('/') {
        let segment = percent_decode_str(raw).decode_utf8().ok()?.into_owned();
        match segment.as_str() {
            "" | "." => {}
            ".." => return None,
            _ if segment.contains(['/', '\\']) => return None,
            _ => segments.push(segment),
        }
    }
    Some(segments)
}

fn serve_static(root: &Path, relative: &str) -> Option<DevResponse> {
    let mut path = root.join(relative);
    if path.is_dir() {
        path = path.join(DEFAULT_HTML_FILENAME);
    }
    if !path.is_file() {
        return None;
    }
    match fs::read(&path) {
        Ok(body) => Some(DevResponse::new(200, content_type_for(&path.to_string_lossy()), body)),
        Err(err) => {
            warn!("Failed to read {:?}: {}", path, err);
            Some(DevResponse::text(500, format!("Failed to read {relative}")))
        }
    }
}

fn accepts_html(accept: Option<&str>) -> bool {
    accept.is_some_and(|accept| accept.contains("text/html") || accept.contains("*/*"))
}

fn content_type_for(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map_or("", |(_, ext)| ext);
    match extension {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" | "cjs" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
