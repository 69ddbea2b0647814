use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regman::auth::keychain::CredentialStore;
use regman::auth::{CredentialSet, Credentials};
use regman::config::Settings;
use regman::error::RegmanError;
use regman::reference::{ImageReference, RegistryEndpoint, RepositoryRef};
use regman::registry::{CallConfig, Dispatcher, HttpRegistry, RegistryApi};
use regman::transport::TransportPolicy;
use sha2::{Digest, Sha256};

const DIGEST_111: &str =
    "sha256:1111111111111111111111111111111111111111111111111111111111111111";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
}

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Reply {
    fn status(status: u16) -> Self {
        Reply {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn json(body: &str) -> Self {
        Reply {
            body: body.to_string(),
            ..Reply::status(200)
        }
        .header("Content-Type", "application/json")
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Plain-HTTP registry stand-in. Every request is answered by `handler`
/// and logged; TLS handshakes are dropped so clients fall back to `http`.
struct FakeServer {
    port: u16,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeServer {
    fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request, u16) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        thread::spawn(move || {
            for mut stream in listener.incoming().flatten() {
                let Some(request) = read_request(&mut stream) else {
                    continue;
                };
                let reply = handler(&request, port);
                log.lock().unwrap().push(request.clone());
                write_reply(&mut stream, &request, &reply);
            }
        });

        FakeServer { port, requests }
    }

    fn endpoint(&self) -> RegistryEndpoint {
        RegistryEndpoint::parse(&format!("127.0.0.1:{}", self.port)).unwrap()
    }

    fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn pings(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == "GET" && r.path == "/v2/")
            .count()
    }
}

fn read_request(stream: &mut TcpStream) -> Option<Request> {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        // 0x16 opens a TLS handshake record.
        if buf.is_empty() && chunk[0] == 0x16 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let authorization = lines.take_while(|l| !l.is_empty()).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("authorization")
            .then(|| value.trim().to_string())
    });

    Some(Request {
        method,
        path,
        authorization,
    })
}

fn write_reply(stream: &mut TcpStream, request: &Request, reply: &Reply) {
    let mut out = format!(
        "HTTP/1.1 {} FAKE\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.body.len()
    );
    for (name, value) in &reply.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    if request.method != "HEAD" {
        out.push_str(&reply.body);
    }
    let _ = stream.write_all(out.as_bytes());
}

struct Stored(Option<Credentials>);

impl CredentialStore for Stored {
    fn lookup(&self, _: &str) -> Result<Option<Credentials>, RegmanError> {
        Ok(self.0.clone())
    }
}

fn creds(username: &str, password: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

fn registry_with(store: Option<Credentials>) -> HttpRegistry {
    HttpRegistry::new(Box::new(Stored(store)))
}

fn insecure(credentials: CredentialSet) -> CallConfig {
    CallConfig {
        credentials,
        transport: TransportPolicy::from_insecure(true),
    }
}

fn is_basic(request: &Request) -> bool {
    request
        .authorization
        .as_deref()
        .is_some_and(|a| a.starts_with("Basic "))
}

#[tokio::test]
async fn explicit_credentials_sent_when_ping_is_anonymous() {
    let server = FakeServer::start(|request, _| {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/v2/") => Reply::json("{}"),
            ("HEAD", "/v2/foo/manifests/latest") => {
                Reply::status(200).header("Docker-Content-Digest", DIGEST_111)
            }
            ("DELETE", _) if is_basic(request) => Reply::status(202),
            ("DELETE", _) => Reply::status(401),
            _ => Reply::status(404),
        }
    });
    let settings = Settings {
        registry: Some(server.host()),
        user: "alice".to_string(),
        pass: "pw".to_string(),
        insecure: true,
    };
    let dispatcher = Dispatcher::new(registry_with(None), &settings).unwrap();

    let deletion = dispatcher.delete("foo").await.unwrap();
    assert_eq!(deletion.digest(), DIGEST_111);

    let requests = server.requests();
    let head = requests.iter().find(|r| r.method == "HEAD").unwrap();
    assert_eq!(head.authorization, Some(basic("alice", "pw")));
    let delete = requests.iter().find(|r| r.method == "DELETE").unwrap();
    assert_eq!(delete.path, format!("/v2/foo/manifests/{DIGEST_111}"));
    assert_eq!(delete.authorization, Some(basic("alice", "pw")));

    // Both phases share one ping.
    assert_eq!(server.pings(), 1);
}

#[tokio::test]
async fn anonymous_without_credentials_sends_no_header() {
    let server = FakeServer::start(|request, _| match request.path.as_str() {
        "/v2/" => Reply::json("{}"),
        "/v2/_catalog" => Reply::json(r#"{"repositories":["zeta","alpha"]}"#),
        _ => Reply::status(404),
    });
    let call = insecure(CredentialSet::Keychain { host: server.host() });

    let repositories = registry_with(None)
        .list_repositories(&server.endpoint(), &call)
        .await
        .unwrap();

    assert_eq!(repositories, vec!["zeta", "alpha"]);
    assert!(server.requests().iter().all(|r| r.authorization.is_none()));
}

#[tokio::test]
async fn basic_challenge_uses_stored_credentials() {
    let server = FakeServer::start(|request, _| {
        if !is_basic(request) {
            return Reply::status(401).header("WWW-Authenticate", r#"Basic realm="fake""#);
        }
        match request.path.as_str() {
            "/v2/" => Reply::json("{}"),
            "/v2/team/app/tags/list" => Reply::json(r#"{"name":"team/app","tags":["v2","v1"]}"#),
            _ => Reply::status(404),
        }
    });
    let call = insecure(CredentialSet::Keychain { host: server.host() });
    let repository = RepositoryRef::parse(&server.endpoint(), "team/app").unwrap();

    let tags = registry_with(Some(creds("bob", "stored")))
        .list_tags(&repository, &call)
        .await
        .unwrap();

    assert_eq!(tags, vec!["v2", "v1"]);
    let list = server
        .requests()
        .into_iter()
        .find(|r| r.path == "/v2/team/app/tags/list")
        .unwrap();
    assert_eq!(list.authorization, Some(basic("bob", "stored")));
}

#[tokio::test]
async fn bearer_challenge_exchanges_credentials_for_token() {
    let server = FakeServer::start(|request, port| {
        if request.path.starts_with("/token") {
            return Reply::json(r#"{"token":"abc"}"#);
        }
        if request.authorization.as_deref() != Some("Bearer abc") {
            let challenge = format!(r#"Bearer realm="http://127.0.0.1:{port}/token",service="fake""#);
            return Reply::status(401).header("WWW-Authenticate", challenge);
        }
        match request.path.as_str() {
            "/v2/foo/tags/list" => Reply::json(r#"{"name":"foo","tags":["latest"]}"#),
            _ => Reply::status(404),
        }
    });
    let call = insecure(CredentialSet::Explicit(creds("alice", "pw")));
    let repository = RepositoryRef::parse(&server.endpoint(), "foo").unwrap();

    let tags = registry_with(None)
        .list_tags(&repository, &call)
        .await
        .unwrap();

    assert_eq!(tags, vec!["latest"]);
    let requests = server.requests();
    let token = requests
        .iter()
        .find(|r| r.path.starts_with("/token"))
        .unwrap();
    assert!(token.path.contains("service=fake"));
    assert!(token.path.contains("scope=repository"));
    assert_eq!(token.authorization, Some(basic("alice", "pw")));
    let list = requests
        .iter()
        .find(|r| r.path == "/v2/foo/tags/list")
        .unwrap();
    assert_eq!(list.authorization.as_deref(), Some("Bearer abc"));
}

#[tokio::test]
async fn lookup_without_digest_header_hashes_manifest() {
    const MANIFEST: &str = r#"{"schemaVersion":2}"#;
    let server = FakeServer::start(|request, _| {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/v2/") => Reply::json("{}"),
            ("HEAD", "/v2/foo/manifests/v1") => Reply::status(200),
            ("GET", "/v2/foo/manifests/v1") => Reply::json(MANIFEST),
            _ => Reply::status(404),
        }
    });
    let call = insecure(CredentialSet::Anonymous);
    let reference = ImageReference::parse(&server.endpoint(), "foo:v1").unwrap();

    let digest = registry_with(None)
        .head_reference(&reference, &call)
        .await
        .unwrap();

    assert_eq!(
        digest,
        format!("sha256:{:x}", Sha256::digest(MANIFEST.as_bytes()))
    );
    let methods: Vec<String> = server
        .requests()
        .into_iter()
        .filter(|r| r.path == "/v2/foo/manifests/v1")
        .map(|r| r.method)
        .collect();
    assert_eq!(methods, vec!["HEAD", "GET"]);
}

#[tokio::test]
async fn unknown_tag_is_not_found_and_never_deleted() {
    let server = FakeServer::start(|request, _| match request.path.as_str() {
        "/v2/" => Reply::json("{}"),
        _ => Reply::status(404),
    });
    let settings = Settings {
        registry: Some(server.host()),
        insecure: true,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(registry_with(None), &settings).unwrap();

    let err = dispatcher.delete("foo:gone").await.unwrap_err();

    assert!(matches!(err, RegmanError::ReferenceNotFound { .. }));
    assert!(server.requests().iter().all(|r| r.method != "DELETE"));
}

#[tokio::test]
async fn failing_ping_reports_registry_status() {
    let server = FakeServer::start(|_, _| {
        Reply::json(r#"{"errors":[{"code":"UNAVAILABLE","message":"maintenance"}]}"#)
            .with_status(503)
    });
    let call = insecure(CredentialSet::Anonymous);

    let err = registry_with(None)
        .list_repositories(&server.endpoint(), &call)
        .await
        .unwrap_err();

    assert!(matches!(err, RegmanError::Registry { status: 503, .. }));
}
