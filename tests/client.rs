//! Client-side end-to-end tests against in-process endpoints.

use std::sync::Arc;

use bytes::Bytes;

use weir::{
    auth::{AuthConfig, MemoryStore},
    Client, ConnCore, Endpoint, EndpointHandle, Host, Http, Qid, Route, Stage, StageKind,
};

struct Hello;

impl Stage for Hello {
    fn name(&self) -> &'static str {
        "hello"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        core.write_str("hello").unwrap();
        core.finalize();
    }
}

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

/// Echoes the request body back.
struct EchoBody;

impl Stage for EchoBody {
    fn name(&self) -> &'static str {
        "echo"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn start_after_content(&self) -> bool {
        true
    }
    fn start(&self, core: &mut ConnCore, _q: Qid) {
        let mut body = Vec::new();
        while let Some(chunk) = core.read_body() {
            body.extend_from_slice(&chunk);
        }
        core.write(&body).unwrap();
        core.finalize();
    }
}

async fn serve(http: &Http, host: Host) -> EndpointHandle {
    let mut endpoint = Endpoint::new(http, "127.0.0.1:0".parse().unwrap());
    endpoint.add_host(host);
    endpoint.start().await.unwrap()
}

fn simple_host(http: &Http, handler: Arc<dyn Stage>) -> Host {
    let mut host = Host::new("*");
    host.add_route(
        Route::new("default")
            .handler(handler)
            .build_with(http)
            .unwrap(),
    );
    host
}

#[tokio::test]
async fn get_twice_reuses_connection() {
    let http = Http::new();
    let handle = serve(&http, simple_host(&http, Arc::new(Hello))).await;
    let url = format!("http://127.0.0.1:{}/", handle.local_addr().port());

    let mut client = Client::new(&http);
    let first = client.get(&url).await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.text(), "hello");
    assert_eq!(first.headers.get("connection"), Some("keep-alive"));

    let second = client.get(&url).await.unwrap();
    assert_eq!(second.status, 200);
    assert_eq!(second.text(), "hello");

    handle.stop();
}

#[tokio::test]
async fn chunked_response_is_decoded() {
    let http = Http::new();
    let handle = serve(&http, simple_host(&http, Arc::new(Chunky))).await;
    let url = format!("http://127.0.0.1:{}/", handle.local_addr().port());

    let mut client = Client::new(&http);
    let response = client.get(&url).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(
        response.headers.get("transfer-encoding"),
        Some("chunked")
    );
    assert_eq!(response.text(), "AAAABBBBCCC");

    handle.stop();
}

#[tokio::test]
async fn post_body_round_trip() {
    let http = Http::new();
    let handle = serve(&http, simple_host(&http, Arc::new(EchoBody))).await;
    let url = format!("http://127.0.0.1:{}/echo", handle.local_addr().port());

    let mut client = Client::new(&http);
    let response = client
        .post(&url, Bytes::from_static(b"some request payload"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "some request payload");

    handle.stop();
}

#[tokio::test]
async fn follows_redirects() {
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
        Route::new("target")
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );
    let handle = serve(&http, host).await;
    let url = format!("http://127.0.0.1:{}/old", handle.local_addr().port());

    let mut client = Client::new(&http);
    let response = client.get(&url).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");

    // With redirects disabled the 302 comes straight back.
    let mut direct = Client::new(&http);
    direct.follow_redirects(false);
    let response = direct.get(&url).await.unwrap();
    assert_eq!(response.status, 302);

    handle.stop();
}

#[tokio::test]
async fn digest_auth_retry_succeeds() {
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
    let handle = serve(&http, host).await;
    let url = format!("http://127.0.0.1:{}/p", handle.local_addr().port());

    let mut client = Client::new(&http);
    client.set_credentials("joe", "secret");
    let response = client.get(&url).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");

    handle.stop();
}

#[tokio::test]
async fn digest_auth_wrong_password_fails() {
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
    let handle = serve(&http, host).await;
    let url = format!("http://127.0.0.1:{}/p", handle.local_addr().port());

    let mut client = Client::new(&http);
    client.set_credentials("joe", "wrong");
    let err = client.get(&url).await.unwrap_err();
    assert_eq!(err.status(), Some(401));

    handle.stop();
}

#[tokio::test]
async fn missing_credentials_reports_auth_required() {
    let store = Arc::new(MemoryStore::new());
    let http = Http::new();
    let mut host = Host::new("*");
    host.add_route(
        Route::new("protected")
            .auth(AuthConfig::basic("R", store))
            .handler(Arc::new(Hello))
            .build_with(&http)
            .unwrap(),
    );
    let handle = serve(&http, host).await;
    let url = format!("http://127.0.0.1:{}/p", handle.local_addr().port());

    let mut client = Client::new(&http);
    let err = client.get(&url).await.unwrap_err();
    assert_eq!(err.status(), Some(401));

    handle.stop();
}
