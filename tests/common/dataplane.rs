//! In-process stand-in for the HAProxy Data Plane API
//!
//! Keeps a live configuration plus one private copy per open transaction,
//! renders both as HAProxy configuration text and validates that text the way
//! HAProxy would for the constructs the driver uses (`use_backend` targets
//! must exist). Knobs inject the failures the control plane has to survive.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use routekeeper::config::DataPlaneConfig;
use routekeeper::dataplane::{BackendObject, ServerObject, SwitchingRule, TransactionInfo};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const HTTP_FRONTEND: &str = "https_front";
pub const TCP_FRONTEND: &str = "mongodb_front";

const CONFIG_PREFIX: &str = "/v2/services/haproxy/configuration/";
const TRANSACTIONS_PATH: &str = "/v2/services/haproxy/transactions";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HaConfig {
    pub backends: BTreeMap<String, BackendObject>,
    pub servers: BTreeMap<String, Vec<ServerObject>>,
    /// Switching rules per frontend, in evaluation order
    pub rules: BTreeMap<String, Vec<SwitchingRule>>,
}

impl HaConfig {
    fn seeded() -> Self {
        let mut config = Self::default();
        config.rules.insert(HTTP_FRONTEND.to_string(), Vec::new());
        config.rules.insert(TCP_FRONTEND.to_string(), Vec::new());
        config
    }

    pub fn rules_for(&self, frontend: &str) -> Vec<SwitchingRule> {
        self.rules.get(frontend).cloned().unwrap_or_default()
    }

    pub fn server(&self, backend: &str) -> Option<ServerObject> {
        self.servers.get(backend).and_then(|s| s.first().cloned())
    }

    /// Add a backend with one server and a rule, bypassing transactions
    pub fn insert_route(&mut self, frontend: &str, backend: &str, mode: &str, address: &str, port: u16, cond_test: &str) {
        self.backends.insert(
            backend.to_string(),
            BackendObject {
                name: backend.to_string(),
                mode: mode.to_string(),
                balance: None,
            },
        );
        self.servers.insert(
            backend.to_string(),
            vec![ServerObject {
                name: "server1".to_string(),
                address: address.to_string(),
                port: Some(port),
                ssl: Some("disabled".to_string()),
                verify: None,
            }],
        );
        let rules = self.rules.entry(frontend.to_string()).or_default();
        rules.push(SwitchingRule {
            index: rules.len() as u32,
            name: backend.to_string(),
            cond: Some("if".to_string()),
            cond_test: Some(cond_test.to_string()),
        });
    }

    pub fn remove_backend(&mut self, backend: &str) {
        self.backends.remove(backend);
        self.servers.remove(backend);
        for rules in self.rules.values_mut() {
            rules.retain(|r| r.name != backend);
            reindex(rules);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("global\n    daemon\n\ndefaults\n    timeout connect 5s\n");
        for (frontend, rules) in &self.rules {
            out.push_str(&format!("\nfrontend {}\n", frontend));
            for rule in rules {
                match &rule.cond_test {
                    Some(test) => out.push_str(&format!(
                        "    use_backend {} {} {}\n",
                        rule.name,
                        rule.cond.as_deref().unwrap_or("if"),
                        test
                    )),
                    None => out.push_str(&format!("    use_backend {}\n", rule.name)),
                }
            }
        }
        for (name, backend) in &self.backends {
            out.push_str(&format!("\nbackend {}\n    mode {}\n", name, backend.mode));
            for server in self.servers.get(name).into_iter().flatten() {
                let ssl = if server.ssl.as_deref() == Some("enabled") {
                    " ssl verify none"
                } else {
                    ""
                };
                out.push_str(&format!(
                    "    server {} {}:{}{}\n",
                    server.name,
                    server.address,
                    server.port.unwrap_or(0),
                    ssl
                ));
            }
        }
        out
    }
}

fn reindex(rules: &mut [SwitchingRule]) {
    for (i, rule) in rules.iter_mut().enumerate() {
        rule.index = i as u32;
    }
}

/// Reject text whose `use_backend` lines point at undefined backends
fn check_text(text: &str) -> Result<(), String> {
    let mut defined = Vec::new();
    let mut used = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("backend") => defined.extend(words.next().map(str::to_string)),
            Some("use_backend") => used.extend(words.next().map(str::to_string)),
            _ => {}
        }
    }
    match used.iter().find(|u| !defined.contains(*u)) {
        Some(missing) => Err(format!("unable to find required use_backend: '{}'", missing)),
        None => Ok(()),
    }
}

struct Tx {
    version: i64,
    status: String,
    config: HaConfig,
}

#[derive(Default)]
struct Knobs {
    reject_validation: Option<String>,
    reject_commit: Option<u16>,
    drop_after_commit: u32,
    drop_before_commit: u32,
    commit_delay: Option<Duration>,
    fail_requests: u32,
    runtime_down: bool,
}

struct State {
    version: i64,
    live: HaConfig,
    transactions: BTreeMap<String, Tx>,
    next_tx: u64,
    knobs: Knobs,
    commits: u32,
    validations: u32,
}

enum Reply {
    Body(StatusCode, String),
    Empty(StatusCode),
    /// Close the connection without answering
    Drop,
    Delayed(Duration, Box<Reply>),
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Reply {
    Reply::Body(status, serde_json::to_string(value).unwrap())
}

fn error(status: StatusCode, message: &str) -> Reply {
    json(status, &serde_json::json!({ "code": status.as_u16(), "message": message }))
}

fn listing<T: Serialize>(items: Vec<T>) -> Reply {
    json(StatusCode::OK, &serde_json::json!({ "data": items }))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Reply> {
    serde_json::from_slice(body).map_err(|e| error(StatusCode::BAD_REQUEST, &e.to_string()))
}

impl State {
    fn new() -> Self {
        Self {
            version: 1,
            live: HaConfig::seeded(),
            transactions: BTreeMap::new(),
            next_tx: 1,
            knobs: Knobs::default(),
            commits: 0,
            validations: 0,
        }
    }

    fn view(&self, tx: Option<&str>) -> Result<&HaConfig, Reply> {
        match tx {
            None => Ok(&self.live),
            Some(id) => self
                .transactions
                .get(id)
                .map(|t| &t.config)
                .ok_or_else(|| error(StatusCode::NOT_FOUND, "transaction not found")),
        }
    }

    fn edit(&mut self, tx: Option<&str>) -> Result<&mut HaConfig, Reply> {
        let id = tx.ok_or_else(|| error(StatusCode::BAD_REQUEST, "transaction_id required"))?;
        match self.transactions.get_mut(id) {
            Some(t) if t.status == "in_progress" => Ok(&mut t.config),
            Some(_) => Err(error(StatusCode::NOT_ACCEPTABLE, "transaction is not in progress")),
            None => Err(error(StatusCode::NOT_FOUND, "transaction not found")),
        }
    }

    fn info(&self, id: &str) -> Option<TransactionInfo> {
        self.transactions.get(id).map(|t| TransactionInfo {
            id: id.to_string(),
            version: t.version,
            status: t.status.clone(),
        })
    }

    fn create_transaction(&mut self, version: i64) -> String {
        let id = format!("tx-{:04}", self.next_tx);
        self.next_tx += 1;
        self.transactions.insert(
            id.clone(),
            Tx {
                version,
                status: "in_progress".to_string(),
                config: self.live.clone(),
            },
        );
        id
    }

    fn transactions(&mut self, method: &Method, id: Option<&str>, query: &HashMap<String, String>) -> Result<Reply, Reply> {
        match (method, id) {
            (&Method::GET, None) => {
                let infos: Vec<TransactionInfo> = self.transactions.keys().filter_map(|id| self.info(id)).collect();
                Ok(json(StatusCode::OK, &infos))
            }
            (&Method::POST, None) => {
                let version: i64 = query
                    .get("version")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| error(StatusCode::BAD_REQUEST, "version required"))?;
                if version != self.version {
                    return Err(error(StatusCode::CONFLICT, "version mismatch"));
                }
                let id = self.create_transaction(version);
                Ok(json(StatusCode::CREATED, &self.info(&id)))
            }
            (&Method::GET, Some(id)) => match self.info(id) {
                Some(info) => Ok(json(StatusCode::OK, &info)),
                None => Err(error(StatusCode::NOT_FOUND, "transaction not found")),
            },
            (&Method::DELETE, Some(id)) => match self.transactions.remove(id) {
                Some(_) => Ok(Reply::Empty(StatusCode::NO_CONTENT)),
                None => Err(error(StatusCode::NOT_FOUND, "transaction not found")),
            },
            (&Method::PUT, Some(id)) => self.commit(id),
            _ => Err(error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
        }
    }

    fn commit(&mut self, id: &str) -> Result<Reply, Reply> {
        let (tx_version, status) = match self.transactions.get(id) {
            Some(t) => (t.version, t.status.clone()),
            None => return Err(error(StatusCode::NOT_FOUND, "transaction not found")),
        };
        if status != "in_progress" {
            return Err(error(StatusCode::NOT_ACCEPTABLE, "transaction is not in progress"));
        }

        if self.knobs.drop_before_commit > 0 {
            self.knobs.drop_before_commit -= 1;
            return Ok(Reply::Drop);
        }
        if let Some(code) = self.knobs.reject_commit {
            if let Some(t) = self.transactions.get_mut(id) {
                t.status = "failed".to_string();
            }
            let status = StatusCode::from_u16(code).unwrap();
            return Err(error(status, "commit rejected"));
        }
        if tx_version != self.version {
            if let Some(t) = self.transactions.get_mut(id) {
                t.status = "failed".to_string();
            }
            return Err(error(StatusCode::CONFLICT, "version mismatch"));
        }

        let Some(tx) = self.transactions.remove(id) else {
            return Err(error(StatusCode::NOT_FOUND, "transaction not found"));
        };
        self.live = tx.config;
        self.version += 1;
        self.commits += 1;

        if self.knobs.drop_after_commit > 0 {
            self.knobs.drop_after_commit -= 1;
            return Ok(Reply::Drop);
        }
        let reply = json(
            StatusCode::ACCEPTED,
            &TransactionInfo {
                id: id.to_string(),
                version: tx.version,
                status: "success".to_string(),
            },
        );
        Ok(match self.knobs.commit_delay {
            Some(delay) => Reply::Delayed(delay, Box::new(reply)),
            None => reply,
        })
    }

    fn configuration(
        &mut self,
        method: &Method,
        segments: &[&str],
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<Reply, Reply> {
        let tx = query.get("transaction_id").map(String::as_str);
        let param = |name: &str| {
            query
                .get(name)
                .cloned()
                .ok_or_else(|| error(StatusCode::BAD_REQUEST, &format!("{} required", name)))
        };

        match (method, segments) {
            (&Method::GET, ["version"]) => Ok(json(StatusCode::OK, &self.version)),

            (&Method::GET, ["raw"]) => {
                let text = self.view(tx)?.render();
                Ok(json(StatusCode::OK, &serde_json::json!({ "_version": self.version, "data": text })))
            }
            (&Method::POST, ["raw"]) => {
                self.validations += 1;
                if let Some(message) = &self.knobs.reject_validation {
                    return Err(error(StatusCode::BAD_REQUEST, message));
                }
                let text = String::from_utf8_lossy(body);
                check_text(&text).map_err(|m| error(StatusCode::BAD_REQUEST, &m))?;
                Ok(Reply::Body(StatusCode::ACCEPTED, "configuration file is valid".to_string()))
            }

            (&Method::GET, ["backends"]) => Ok(listing(self.view(tx)?.backends.values().cloned().collect())),
            (&Method::POST, ["backends"]) => {
                let backend: BackendObject = decode(body)?;
                let config = self.edit(tx)?;
                if config.backends.contains_key(&backend.name) {
                    return Err(error(StatusCode::CONFLICT, "backend already exists"));
                }
                config.backends.insert(backend.name.clone(), backend.clone());
                Ok(json(StatusCode::CREATED, &backend))
            }
            (&Method::PUT, ["backends", name]) => {
                let backend: BackendObject = decode(body)?;
                let config = self.edit(tx)?;
                if !config.backends.contains_key(*name) {
                    return Err(error(StatusCode::NOT_FOUND, "backend not found"));
                }
                config.backends.insert(name.to_string(), backend.clone());
                Ok(json(StatusCode::OK, &backend))
            }
            (&Method::DELETE, ["backends", name]) => {
                let config = self.edit(tx)?;
                if config.backends.remove(*name).is_none() {
                    return Err(error(StatusCode::NOT_FOUND, "backend not found"));
                }
                config.servers.remove(*name);
                Ok(Reply::Empty(StatusCode::NO_CONTENT))
            }

            (&Method::GET, ["servers"]) => {
                let backend = param("backend")?;
                Ok(listing(self.view(tx)?.servers.get(&backend).cloned().unwrap_or_default()))
            }
            (&Method::POST, ["servers"]) => {
                let backend = param("backend")?;
                let server: ServerObject = decode(body)?;
                let config = self.edit(tx)?;
                if !config.backends.contains_key(&backend) {
                    return Err(error(StatusCode::NOT_FOUND, "parent backend not found"));
                }
                let servers = config.servers.entry(backend).or_default();
                if servers.iter().any(|s| s.name == server.name) {
                    return Err(error(StatusCode::CONFLICT, "server already exists"));
                }
                servers.push(server.clone());
                Ok(json(StatusCode::CREATED, &server))
            }
            (&Method::PUT, ["servers", name]) => {
                let backend = param("backend")?;
                let server: ServerObject = decode(body)?;
                let config = self.edit(tx)?;
                let slot = config
                    .servers
                    .get_mut(&backend)
                    .and_then(|servers| servers.iter_mut().find(|s| s.name == *name))
                    .ok_or_else(|| error(StatusCode::NOT_FOUND, "server not found"))?;
                *slot = server.clone();
                Ok(json(StatusCode::OK, &server))
            }

            (&Method::GET, ["backend_switching_rules"]) => {
                let frontend = param("frontend")?;
                let rules = self
                    .view(tx)?
                    .rules
                    .get(&frontend)
                    .cloned()
                    .ok_or_else(|| error(StatusCode::NOT_FOUND, "frontend not found"))?;
                Ok(listing(rules))
            }
            (&Method::POST, ["backend_switching_rules"]) => {
                let frontend = param("frontend")?;
                let rule: SwitchingRule = decode(body)?;
                let rules = self
                    .edit(tx)?
                    .rules
                    .get_mut(&frontend)
                    .ok_or_else(|| error(StatusCode::NOT_FOUND, "frontend not found"))?;
                let at = (rule.index as usize).min(rules.len());
                rules.insert(at, rule.clone());
                reindex(rules);
                Ok(json(StatusCode::CREATED, &rule))
            }
            (&Method::PUT, ["backend_switching_rules", index]) => {
                let frontend = param("frontend")?;
                let rule: SwitchingRule = decode(body)?;
                let index: usize = index.parse().map_err(|_| error(StatusCode::BAD_REQUEST, "bad index"))?;
                let rules = self
                    .edit(tx)?
                    .rules
                    .get_mut(&frontend)
                    .ok_or_else(|| error(StatusCode::NOT_FOUND, "frontend not found"))?;
                let slot = rules
                    .get_mut(index)
                    .ok_or_else(|| error(StatusCode::NOT_FOUND, "rule not found"))?;
                *slot = SwitchingRule {
                    index: index as u32,
                    ..rule.clone()
                };
                Ok(json(StatusCode::OK, &rule))
            }
            (&Method::DELETE, ["backend_switching_rules", index]) => {
                let frontend = param("frontend")?;
                let index: usize = index.parse().map_err(|_| error(StatusCode::BAD_REQUEST, "bad index"))?;
                let rules = self
                    .edit(tx)?
                    .rules
                    .get_mut(&frontend)
                    .ok_or_else(|| error(StatusCode::NOT_FOUND, "frontend not found"))?;
                if index >= rules.len() {
                    return Err(error(StatusCode::NOT_FOUND, "rule not found"));
                }
                rules.remove(index);
                reindex(rules);
                Ok(Reply::Empty(StatusCode::NO_CONTENT))
            }

            _ => Err(error(StatusCode::NOT_FOUND, "not found")),
        }
    }

    fn handle(&mut self, method: &Method, path: &str, query: &HashMap<String, String>, body: &[u8]) -> Reply {
        if self.knobs.fail_requests > 0 {
            self.knobs.fail_requests -= 1;
            return error(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
        }

        let outcome = if let Some(resource) = path.strip_prefix(CONFIG_PREFIX) {
            let segments: Vec<&str> = resource.split('/').filter(|s| !s.is_empty()).collect();
            self.configuration(method, &segments, query, body)
        } else if let Some(rest) = path.strip_prefix(TRANSACTIONS_PATH) {
            let id = rest.trim_start_matches('/');
            self.transactions(method, (!id.is_empty()).then_some(id), query)
        } else {
            match (method, path) {
                (&Method::GET, "/v2/services/haproxy/runtime/info") => {
                    if self.knobs.runtime_down {
                        Err(error(StatusCode::SERVICE_UNAVAILABLE, "HAProxy is not running"))
                    } else {
                        Ok(json(StatusCode::OK, &serde_json::json!([{ "info": { "version": "2.8.3" } }])))
                    }
                }
                _ => Err(error(StatusCode::NOT_FOUND, "not found")),
            }
        };
        outcome.unwrap_or_else(|reply| reply)
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string());
            (decode(k), decode(v))
        })
        .collect()
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<Mutex<State>>,
) -> Result<Response<Full<Bytes>>, std::io::Error> {
    if !req.headers().contains_key(AUTHORIZATION) {
        return Ok(Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Full::new(Bytes::from_static(b"unauthorized")))
            .unwrap());
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let mut reply = state.lock().handle(&method, &path, &query, &body);

    loop {
        reply = match reply {
            Reply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                *inner
            }
            Reply::Drop => {
                return Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "dropped by mock"));
            }
            Reply::Empty(status) => {
                return Ok(Response::builder().status(status).body(Full::new(Bytes::new())).unwrap());
            }
            Reply::Body(status, body) => {
                return Ok(Response::builder()
                    .status(status)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap());
            }
        };
    }
}

pub struct MockDataPlane {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl MockDataPlane {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::new()));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn config(&self) -> DataPlaneConfig {
        DataPlaneConfig {
            url: self.url(),
            username: "admin".to_string(),
            password: Some("adminpwd".to_string()),
            http_frontend: HTTP_FRONTEND.to_string(),
            tcp_frontend: TCP_FRONTEND.to_string(),
        }
    }

    pub fn live(&self) -> HaConfig {
        self.state.lock().live.clone()
    }

    /// Change the live configuration out of band (another operator, a crash)
    pub fn edit_live(&self, edit: impl FnOnce(&mut HaConfig)) {
        let mut state = self.state.lock();
        edit(&mut state.live);
        state.version += 1;
    }

    pub fn version(&self) -> i64 {
        self.state.lock().version
    }

    pub fn commits(&self) -> u32 {
        self.state.lock().commits
    }

    pub fn validations(&self) -> u32 {
        self.state.lock().validations
    }

    /// Ids of transactions still held by the server
    pub fn open_transactions(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .transactions
            .iter()
            .filter(|(_, t)| t.status == "in_progress")
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Start a transaction nobody in the control plane knows about
    pub fn start_foreign_transaction(&self) -> String {
        let mut state = self.state.lock();
        let version = state.version;
        state.create_transaction(version)
    }

    pub fn reject_validation(&self, message: Option<&str>) {
        self.state.lock().knobs.reject_validation = message.map(str::to_string);
    }

    pub fn reject_commit(&self, status: Option<u16>) {
        self.state.lock().knobs.reject_commit = status;
    }

    /// Apply the next `n` commits but close the connection instead of answering
    pub fn drop_after_commit(&self, n: u32) {
        self.state.lock().knobs.drop_after_commit = n;
    }

    /// Close the connection on the next `n` commits without applying them
    pub fn drop_before_commit(&self, n: u32) {
        self.state.lock().knobs.drop_before_commit = n;
    }

    /// Apply commits immediately but answer after `delay`
    pub fn delay_commit(&self, delay: Option<Duration>) {
        self.state.lock().knobs.commit_delay = delay;
    }

    /// Answer the next `n` requests with 503
    pub fn fail_requests(&self, n: u32) {
        self.state.lock().knobs.fail_requests = n;
    }

    pub fn runtime_down(&self, down: bool) {
        self.state.lock().knobs.runtime_down = down;
    }
}

impl Drop for MockDataPlane {
    fn drop(&mut self) {
        self.task.abort();
    }
}
