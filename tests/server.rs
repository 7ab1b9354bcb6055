//! Server-side end-to-end tests driving connections over an in-memory
//! duplex transport.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use weir::{
    auth::{AuthConfig, MemoryStore},
    ConnCore, Connection, Host, Http, MethodSet, Qid, Route, Stage, StageKind,
};

/// Handler returning a fixed five byte body.
struct Hello;

impl Stage for Hello {
    fn name(&self) -> &'static str {
        "hello"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn methods(&self) -> MethodSet {
        MethodSet::GET.with(MethodSet::HEAD).with(MethodSet::POST)
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        core.write_str("hello").unwrap();
        core.finalize();
    }
}

/// Handler emitting three writes with explicit flushes, so the output is
/// chunked.
struct Chunky;

impl Stage for Chunky {
    fn name(&self) -> &'static str {
        "chunky"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        core.write_str("AAAA").unwrap();
        core.flush();
        core.write_str("BBBB").unwrap();
        core.flush();
        core.write_str("CCC").unwrap();
        core.finalize();
    }
}

/// Handler serving a ten byte entity for range tests.
struct TenBytes;

impl Stage for TenBytes {
    fn name(&self) -> &'static str {
        "ten"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        core.write_str("0123456789").unwrap();
        core.finalize();
    }
}

/// Handler echoing form variables and upload metadata after the body
/// has been received.
struct FormEcho {
    seen_paths: Arc<Mutex<Vec<std::path::PathBuf>>>,
}

impl Stage for FormEcho {
    fn name(&self) -> &'static str {
        "form-echo"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start_after_content(&self) -> bool {
        true
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        let mut out = String::new();
        {
            let rx = core.rx().expect("rx");
            if let Some(name) = rx.form_vars.get("name") {
                out.push_str(&format!("name={};", name));
            }
            for file in &rx.files {
                let exists = file.temp_filename.exists();
                out.push_str(&format!(
                    "{}={}:{}:{};",
                    file.name, file.client_filename, file.size, exists
                ));
            }
        }
        let paths: Vec<_> = core
            .rx()
            .expect("rx")
            .files
            .iter()
            .map(|f| f.temp_filename.clone())
            .collect();
        self.seen_paths.lock().unwrap().extend(paths);
        core.write_str(&out).unwrap();
        core.finalize();
    }
}

fn host_with(handler: Arc<dyn Stage>, http: &Http) -> Host {
    let mut host = Host::new("*");
    host.add_route(
        Route::new("default")
            .handler(handler)
            .build_with(http)
            .unwrap(),
    );
    host
}

/// Send raw bytes, close the write half and collect the full response
/// stream.
async fn roundtrip(http: &Http, hosts: Vec<Host>, request: &[u8]) -> String {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let conn = Connection::server(http, server, hosts);
    let driver = tokio::spawn(conn.drive());
    let (mut rd, mut wr) = tokio::io::split(client);
    wr.write_all(request).await.unwrap();
    wr.shutdown().await.unwrap();
    let mut out = Vec::new();
    rd.read_to_end(&mut out).await.unwrap();
    driver.await.unwrap().unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn body_of(response: &str) -> &str {
    let pos = response.find("\r\n\r\n").expect("header end");
    &response[pos + 4..]
}

/// Read from `rd` until the accumulated response ends with `marker`.
async fn read_until<R: tokio::io::AsyncRead + Unpin>(rd: &mut R, marker: &str) -> String {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = rd.read(&mut buf).await.unwrap();
        assert!(n > 0, "eof before {:?} in {:?}", marker, String::from_utf8_lossy(&out));
        out.extend_from_slice(&buf[..n]);
        if out.ends_with(marker.as_bytes()) {
            return String::from_utf8_lossy(&out).into_owned();
        }
    }
}

#[tokio::test]
async fn simple_get_keep_alive() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let response = roundtrip(&http, hosts, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.contains("Connection: keep-alive\r\n"));
    assert_eq!(body_of(&response), "hello");
}

#[tokio::test]
async fn keep_alive_reuses_connection() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::server(&http, server, hosts);
    let driver = tokio::spawn(conn.drive());
    let (mut rd, mut wr) = tokio::io::split(client);

    for _ in 0..2 {
        wr.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let response = read_until(&mut rd, "hello").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }
    wr.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn chunked_response_framing() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Chunky), &http)];
    let response = roundtrip(&http, hosts, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;

    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!response.contains("Content-Length"));
    assert_eq!(body_of(&response), "4\r\nAAAA\r\n4\r\nBBBB\r\n3\r\nCCC\r\n0\r\n\r\n");
}

#[tokio::test]
async fn multi_range_request() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(TenBytes), &http)];
    let response = roundtrip(
        &http,
        hosts,
        b"GET /file HTTP/1.1\r\nHost: x\r\nRange: bytes=0-3,6-9\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{}", response);
    let marker = "multipart/byteranges; boundary=";
    let at = response.find(marker).expect("multipart content type");
    let boundary: String = response[at + marker.len()..]
        .chars()
        .take_while(|c| *c != '\r')
        .collect();
    let body = body_of(&response);
    let part1 = format!(
        "\r\n--{}\r\nContent-Range: bytes 0-3/10\r\n\r\n0123",
        boundary
    );
    let part2 = format!(
        "\r\n--{}\r\nContent-Range: bytes 6-9/10\r\n\r\n6789",
        boundary
    );
    let closing = format!("\r\n--{}--\r\n", boundary);
    assert!(body.contains(&part1), "{}", body);
    assert!(body.contains(&part2), "{}", body);
    assert!(body.ends_with(&closing), "{}", body);
}

#[tokio::test]
async fn single_range_request() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(TenBytes), &http)];
    let response = roundtrip(
        &http,
        hosts,
        b"GET /file HTTP/1.1\r\nHost: x\r\nRange: bytes=2-5\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    assert!(response.contains("Content-Range: bytes 2-5/10\r\n"));
    assert!(response.contains("Content-Length: 4\r\n"));
    assert_eq!(body_of(&response), "2345");
}

#[tokio::test]
async fn suffix_range_request() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(TenBytes), &http)];
    let response = roundtrip(
        &http,
        hosts,
        b"GET /file HTTP/1.1\r\nHost: x\r\nRange: bytes=-3\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    assert!(response.contains("Content-Range: bytes 7-9/10\r\n"));
    assert_eq!(body_of(&response), "789");
}

#[tokio::test]
async fn invalid_range_set_is_416() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(TenBytes), &http)];
    let response = roundtrip(
        &http,
        hosts,
        b"GET /file HTTP/1.1\r\nHost: x\r\nRange: bytes=5-2\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 416 "), "{}", response);
}

#[tokio::test]
async fn digest_auth_round_trip() {
    let store = Arc::new(MemoryStore::new());
    store.add_digest_user("R", "joe", "secret");

    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("protected")
            .auth(AuthConfig::digest("R", store))
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );

    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::server(&http, server, vec![host]);
    let driver = tokio::spawn(conn.drive());
    let (mut rd, mut wr) = tokio::io::split(client);

    // First request: expect a challenge.
    wr.write_all(b"GET /p HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let challenge = read_until(&mut rd, "</html>\r\n").await;
    assert!(challenge.starts_with("HTTP/1.1 401 "), "{}", challenge);
    let wa = challenge
        .lines()
        .find(|l| l.starts_with("WWW-Authenticate:"))
        .expect("challenge header");
    assert!(wa.contains("Digest realm=\"R\""));
    assert!(wa.contains("qop=\"auth\""));
    let nonce = extract_quoted(wa, "nonce=\"").expect("nonce");

    // Compute the response per RFC 2617 with qop=auth.
    let ha1 = md5_hex("joe:R:secret");
    let ha2 = md5_hex("GET:/p");
    let response_digest = md5_hex(&format!(
        "{}:{}:00000001:abcdef:auth:{}",
        ha1, nonce, ha2
    ));
    let authorized = format!(
        "GET /p HTTP/1.1\r\nHost: x\r\nAuthorization: Digest username=\"joe\", realm=\"R\", \
         nonce=\"{}\", uri=\"/p\", qop=auth, nc=00000001, cnonce=\"abcdef\", \
         response=\"{}\"\r\n\r\n",
        nonce, response_digest
    );
    wr.write_all(authorized.as_bytes()).await.unwrap();
    let granted = read_until(&mut rd, "hello").await;
    assert!(granted.starts_with("HTTP/1.1 200 OK\r\n"), "{}", granted);

    wr.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn digest_rejects_foreign_nonce() {
    let store = Arc::new(MemoryStore::new());
    store.add_digest_user("R", "joe", "secret");

    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("protected")
            .auth(AuthConfig::digest("R", store))
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );
    // A nonce this server never minted.
    let forged = base64::encode("wrong-secret:R:3f:0");
    let ha1 = md5_hex("joe:R:secret");
    let response_digest = md5_hex(&format!(
        "{}:{}:00000001:abcdef:auth:{}",
        ha1,
        forged,
        md5_hex("GET:/p")
    ));
    let request = format!(
        "GET /p HTTP/1.1\r\nHost: x\r\nAuthorization: Digest username=\"joe\", realm=\"R\", \
         nonce=\"{}\", uri=\"/p\", qop=auth, nc=00000001, cnonce=\"abcdef\", \
         response=\"{}\"\r\n\r\n",
        forged, response_digest
    );
    let response = roundtrip(&http, vec![host], request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 401 "), "{}", response);
}

#[tokio::test]
async fn basic_auth_round_trip() {
    let store = Arc::new(MemoryStore::new());
    store.add_user("R", "joe", "secret");

    let http = Http::new();
    let make_host = |http: &Http| {
        let mut host = Host::new("*");
        host.add_route(
            Route::new("protected")
                .auth(AuthConfig::basic("R", store.clone()))
                .handler(Arc::new(Hello))
                .build_with(http)
                .unwrap(),
        );
        host
    };

    let response = roundtrip(&http, vec![make_host(&http)], b"GET /p HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 401 "));
    assert!(response.contains("WWW-Authenticate: Basic realm=\"R\"\r\n"));

    let creds = base64::encode("joe:secret");
    let request = format!(
        "GET /p HTTP/1.1\r\nHost: x\r\nAuthorization: Basic {}\r\n\r\n",
        creds
    );
    let response = roundtrip(&http, vec![make_host(&http)], request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
}

#[tokio::test]
async fn pipelined_requests_share_one_segment() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let both = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
    let response = roundtrip(&http, hosts, both).await;

    assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{}", response);
    assert_eq!(response.matches("hello").count(), 2);
}

#[tokio::test]
async fn upload_two_files_with_auto_delete() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("upload")
            .handler(Arc::new(FormEcho { seen_paths: seen.clone() }))
            .auto_delete_uploads(true)
            .build_with(&http)
            .unwrap(),
    );

    let f1 = "a".repeat(100);
    let f2 = "b".repeat(200);
    let body = format!(
        "--XYZ\r\n\
         Content-Disposition: form-data; name=\"name\"\r\n\r\n\
         alice\r\n\
         --XYZ\r\n\
         Content-Disposition: form-data; name=\"f1\"; filename=\"one.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {}\r\n\
         --XYZ\r\n\
         Content-Disposition: form-data; name=\"f2\"; filename=\"two.bin\"\r\n\r\n\
         {}\r\n\
         --XYZ--\r\n",
        f1, f2
    );
    let request = format!(
        "POST /up HTTP/1.1\r\nHost: x\r\n\
         Content-Type: multipart/form-data; boundary=XYZ\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = roundtrip(&http, vec![host], request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    let body = body_of(&response);
    assert!(body.contains("name=alice;"), "{}", body);
    assert!(body.contains("f1=one.txt:100:true;"), "{}", body);
    assert!(body.contains("f2=two.bin:200:true;"), "{}", body);

    // Auto-delete unlinks the spool files at request completion.
    let paths = seen.lock().unwrap().clone();
    assert_eq!(paths.len(), 2);
    for path in paths {
        assert!(!path.exists(), "{} still exists", path.display());
    }
}

/// Handler delivering a file through the connector's send-file path.
struct SendFile {
    path: std::path::PathBuf,
    len: u64,
}

impl Stage for SendFile {
    fn name(&self) -> &'static str {
        "send-file"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        core.tx_mut_opt()
            .expect("tx")
            .set_send_file(self.path.clone());
        core.write_entity(self.len).unwrap();
        core.finalize();
    }
}

#[tokio::test]
async fn send_file_delivery() {
    use std::io::Write as _;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"file payload: 0123456789").unwrap();
    file.flush().unwrap();

    let http = Http::new();
    let handler = Arc::new(SendFile {
        path: file.path().to_path_buf(),
        len: 24,
    });
    let hosts = vec![host_with(handler, &http)];
    let response = roundtrip(&http, hosts, b"GET /f HTTP/1.1\r\nHost: x\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Content-Length: 24\r\n"), "{}", response);
    assert_eq!(body_of(&response), "file payload: 0123456789");
}

#[tokio::test]
async fn urlencoded_form_body_fills_vars() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("form")
            .handler(Arc::new(FormEcho { seen_paths: seen }))
            .build_with(&http)
            .unwrap(),
    );
    let body = "name=alice%20smith";
    let request = format!(
        "POST /form HTTP/1.1\r\nHost: x\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = roundtrip(&http, vec![host], request.as_bytes()).await;
    assert!(body_of(&response).contains("name=alice smith;"), "{}", response);
}

/// Handler counting visits in the cookie-bound session.
struct Visits;

impl Stage for Visits {
    fn name(&self) -> &'static str {
        "visits"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        let session = core.session(true).expect("session");
        let visits: u32 = session.get("visits").and_then(|v| v.parse().ok()).unwrap_or(0) + 1;
        session.set("visits", &visits.to_string());
        core.write_str(&format!("visits={}", visits)).unwrap();
        core.finalize();
    }
}

#[tokio::test]
async fn session_persists_across_requests() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Visits), &http)];
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::server(&http, server, hosts);
    let driver = tokio::spawn(conn.drive());
    let (mut rd, mut wr) = tokio::io::split(client);

    wr.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let first = read_until(&mut rd, "visits=1").await;
    let cookie_line = first
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("set-cookie:"))
        .expect("session cookie");
    assert!(cookie_line.contains("-http-session-="), "{}", cookie_line);
    assert!(cookie_line.contains("httponly"));
    let cookie = cookie_line["Set-Cookie: ".len()..]
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let second = format!("GET / HTTP/1.1\r\nHost: x\r\nCookie: {}\r\n\r\n", cookie);
    wr.write_all(second.as_bytes()).await.unwrap();
    let response = read_until(&mut rd, "visits=2").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    wr.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_host_is_404() {
    let http = Http::new();
    let mut host = Host::new("www.example.com");
    host.add_route(
        Route::new("default")
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );
    let response = roundtrip(
        &http,
        vec![host],
        b"GET / HTTP/1.1\r\nHost: other.example.org\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404 "), "{}", response);
}

#[tokio::test]
async fn uri_too_long_is_414() {
    let mut limits = weir::Limits::server();
    limits.uri_size = 64;
    let http = Http::with_limits(limits);
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let long = "x".repeat(200);
    let request = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", long);
    let response = roundtrip(&http, hosts, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 414 "), "{}", response);
}

#[tokio::test]
async fn duplicate_content_length_is_400() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let response = roundtrip(
        &http,
        hosts,
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\nhi",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 "), "{}", response);
}

#[tokio::test]
async fn options_reports_allowed_methods() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let response = roundtrip(&http, hosts, b"OPTIONS / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Allow: OPTIONS,GET,HEAD,POST\r\n"), "{}", response);
    assert!(response.contains("Content-Length: 0\r\n"));
}

#[tokio::test]
async fn trace_is_denied_by_default() {
    let http = Http::new();
    let hosts = vec![host_with(Arc::new(Hello), &http)];
    let response = roundtrip(&http, hosts, b"TRACE / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 406 "), "{}", response);
    assert!(body_of(&response).contains("TRACE method is disabled"));
}

#[tokio::test]
async fn redirect_route() {
    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("moved")
            .prefix("/old")
            .redirect(302, "/new")
            .build_with(&http)
            .unwrap(),
    );
    host.add_route(
        Route::new("default")
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );
    let response = roundtrip(&http, vec![host], b"GET /old HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 302 "), "{}", response);
    assert!(response.contains("Location: http://x/new\r\n"), "{}", response);
}

#[tokio::test]
async fn rewrite_route_restarts_routing() {
    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("alias")
            .pattern("/alias/{rest}")
            .rewrite("/real/{rest}")
            .build_with(&http)
            .unwrap(),
    );
    host.add_route(
        Route::new("real")
            .prefix("/real")
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );
    let response = roundtrip(&http, vec![host], b"GET /alias/x HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert_eq!(body_of(&response), "hello");
}

#[tokio::test]
async fn chunked_request_body_is_decoded() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("form")
            .handler(Arc::new(FormEcho { seen_paths: seen }))
            .build_with(&http)
            .unwrap(),
    );
    // The urlencoded body "name=bob" sent chunked.
    let request = b"POST /form HTTP/1.1\r\nHost: x\r\n\
        Content-Type: application/x-www-form-urlencoded\r\n\
        Transfer-Encoding: chunked\r\n\r\n\
        5\r\nname=\r\n3\r\nbob\r\n0\r\n\r\n";
    let response = roundtrip(&http, vec![host], request).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(body_of(&response).contains("name=bob;"), "{}", response);
}

fn extract_quoted(line: &str, prefix: &str) -> Option<String> {
    let at = line.find(prefix)? + prefix.len();
    let rest = &line[at..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
