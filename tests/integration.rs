//! Integration tests for microproxy

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use microproxy::config::ServiceConfig;
use microproxy::framework::FrameworkConfig;
use microproxy::proxy::{DispatchSettings, ProxyServer};
use microproxy::router::Router;
use microproxy::service::{LaunchSettings, Service};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEV: DispatchSettings = DispatchSettings {
    dev_mode: true,
    autostart: false,
};

const DEV_AUTOSTART: DispatchSettings = DispatchSettings {
    dev_mode: true,
    autostart: true,
};

struct TestProxy {
    addr: SocketAddr,
    router: Arc<Router>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    async fn start(services: Vec<Arc<Service>>, settings: DispatchSettings) -> Self {
        let router = Router::new(services, 3000);
        router.load().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&router),
            settings,
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        let handle = tokio::spawn(server.run());

        Self {
            addr,
            router,
            shutdown_tx,
            handle,
        }
    }

    async fn get(&self, path: &str) -> HttpResponse {
        send(self.addr, "GET", path, &[], "").await
    }

    async fn stop(self) {
        self.router.close_services().await;
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("proxy did not shut down")
            .unwrap()
            .unwrap();
    }
}

struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Send a raw HTTP/1.1 request and parse the response
async fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        addr.port(),
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

/// Serve `{name} {method} {path} {body}` for every request on `listener`
fn start_backend(listener: TcpListener, name: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let body = req.into_body().collect().await?.to_bytes();
                    let text = format!(
                        "{} {} {} {}",
                        name,
                        method,
                        path,
                        String::from_utf8_lossy(&body)
                    );
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(text))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    })
}

async fn backend(name: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (port, start_backend(listener, name))
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn settings() -> Arc<LaunchSettings> {
    Arc::new(LaunchSettings {
        shutdown_grace_period: Duration::from_secs(1),
        ..LaunchSettings::default()
    })
}

fn explicit_service(id: usize, name: &str, port: u16, routes: &[&str]) -> Arc<Service> {
    Service::new(
        id,
        ServiceConfig::new("/tmp")
            .with_name(name)
            .with_port(port)
            .with_routes(routes),
        None,
        None,
        settings(),
    )
}

fn script_service(id: usize, dir: &Path, port: u16, script: &str, wait_ms: u64) -> Arc<Service> {
    std::fs::write(dir.join("start.sh"), script).unwrap();
    Service::new(
        id,
        ServiceConfig::new(dir)
            .with_name("launched")
            .with_port(port)
            .with_routes(&["/api/.*"])
            .with_script("start.sh")
            .with_interpreter("bash")
            .with_script_wait_timeout_ms(wait_ms),
        None,
        None,
        settings(),
    )
}

async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_routes_by_path() {
    let (one_port, _one) = backend("one").await;
    let (two_port, _two) = backend("two").await;

    let proxy = TestProxy::start(
        vec![
            explicit_service(1, "one", one_port, &["/route/one/.*"]),
            explicit_service(2, "two", two_port, &["/route/two/.*"]),
        ],
        DEV,
    )
    .await;

    let response = proxy.get("/route/one/x").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "one GET /route/one/x ");
    assert_eq!(response.header("x-service-name"), Some("one"));
    assert_eq!(
        response.header("x-service-port"),
        Some(one_port.to_string().as_str())
    );

    let response = proxy.get("/route/two/y?page=2").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "two GET /route/two/y ");
    assert_eq!(response.header("x-service-name"), Some("two"));

    let response = proxy.get("/c").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.body, "Not Found");

    assert!(proxy.router.services()[0].is_running());
    proxy.stop().await;
}

#[tokio::test]
async fn test_routes_by_referer() {
    let (one_port, _one) = backend("one").await;
    let (two_port, _two) = backend("two").await;

    let proxy = TestProxy::start(
        vec![
            explicit_service(1, "one", one_port, &["/route/one/.*"]),
            explicit_service(2, "two", two_port, &["/route/two/.*"]),
        ],
        DEV,
    )
    .await;

    let response = send(
        proxy.addr,
        "GET",
        "/_next/static/chunk.js",
        &[("Referer", "http://localhost:3000/route/two/page")],
        "",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "two GET /_next/static/chunk.js ");

    proxy.stop().await;
}

#[tokio::test]
async fn test_routes_framework_pages() {
    let dir = TempDir::new().unwrap();
    let pages = dir.path().join("pages");
    std::fs::create_dir_all(pages.join("stuff")).unwrap();
    std::fs::write(pages.join("index.js"), "").unwrap();
    std::fs::write(pages.join("stuff/[id].js"), "").unwrap();

    let (web_port, _web) = backend("web").await;
    let (api_port, _api) = backend("api").await;

    let web = Service::new(
        1,
        ServiceConfig::new(dir.path()).with_name("web").with_port(web_port),
        Some(FrameworkConfig::new(dir.path().join("next.config.js"))),
        None,
        settings(),
    );
    let api = explicit_service(2, "api", api_port, &["/stuff/special"]);

    let proxy = TestProxy::start(vec![web, api], DEV).await;

    // Pages come before explicit routes
    let response = proxy.get("/stuff/special").await;
    assert_eq!(response.header("x-service-name"), Some("web"));

    let response = proxy.get("/").await;
    assert_eq!(response.header("x-service-name"), Some("web"));

    // Explicit routes are not anchored
    let response = proxy.get("/stuff/special/more").await;
    assert_eq!(response.header("x-service-name"), Some("api"));

    let response = proxy.get("/other/deep/path").await;
    assert_eq!(response.status, 404);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_service_without_autostart() {
    let proxy = TestProxy::start(
        vec![explicit_service(1, "one", free_port(), &["/route/one/.*"])],
        DEV,
    )
    .await;

    let response = proxy.get("/route/one/x").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.body, "Should be served by one");

    proxy.stop().await;
}

#[tokio::test]
async fn test_autostart_without_script() {
    let proxy = TestProxy::start(
        vec![explicit_service(1, "one", free_port(), &["/route/one/.*"])],
        DEV_AUTOSTART,
    )
    .await;

    let response = proxy.get("/route/one/x").await;
    assert_eq!(response.status, 404);

    proxy.stop().await;
}

#[tokio::test]
async fn test_autostart_launch_timeout() {
    let dir = TempDir::new().unwrap();
    let service = script_service(1, dir.path(), free_port(), "exec sleep 30\n", 300);

    let proxy = TestProxy::start(vec![service], DEV_AUTOSTART).await;

    let response = proxy.get("/api/hello").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.body, "Should be served by launched");

    proxy.stop().await;
}

#[tokio::test]
async fn test_autostart_launches_and_replays_request() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let script = r#"
echo "$PORT" >> spawns.log
while [ ! -f serving ]; do sleep 0.05; done
exec 3<>"/dev/tcp/127.0.0.1/$MICROPROXY_READY_PORT"
echo ready >&3
exec 3>&-
exec sleep 30
"#;
    let service = script_service(1, dir.path(), port, script, 10_000);
    let proxy = TestProxy::start(vec![service], DEV_AUTOSTART).await;

    let addr = proxy.addr;
    let request = tokio::spawn(async move {
        send(addr, "POST", "/api/items", &[("Content-Type", "text/plain")], "payload").await
    });

    // The service is started with its port, then begins serving
    let spawn_log = dir.path().join("spawns.log");
    assert!(wait_for_file(&spawn_log, Duration::from_secs(5)).await);
    assert_eq!(
        std::fs::read_to_string(&spawn_log).unwrap().trim(),
        port.to_string()
    );

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let _backend = start_backend(listener, "launched");
    std::fs::write(dir.path().join("serving"), "").unwrap();

    let response = tokio::time::timeout(Duration::from_secs(10), request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "launched POST /api/items payload");
    assert_eq!(response.header("x-service-name"), Some("launched"));

    let service = Arc::clone(&proxy.router.services()[0]);
    assert!(service.is_running());
    assert!(service.has_process());

    // Subsequent requests go straight through
    let response = proxy.get("/api/again").await;
    assert_eq!(response.status, 200);
    assert_eq!(
        std::fs::read_to_string(&spawn_log).unwrap().lines().count(),
        1
    );

    proxy.stop().await;
    assert!(!service.has_process());
}

#[tokio::test]
async fn test_autostart_with_ttl_shorter_than_startup() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let script = r#"
echo "$PORT" >> spawns.log
sleep 1
exec 3<>"/dev/tcp/127.0.0.1/$MICROPROXY_READY_PORT"
echo ready >&3
exec 3>&-
exec sleep 30
"#;
    std::fs::write(dir.path().join("start.sh"), script).unwrap();
    let service = Service::new(
        1,
        ServiceConfig::new(dir.path())
            .with_name("slow")
            .with_port(port)
            .with_routes(&["/api/.*"])
            .with_script("start.sh")
            .with_interpreter("bash")
            .with_script_wait_timeout_ms(3000)
            .with_ttl_ms(300),
        None,
        None,
        settings(),
    );
    let proxy = TestProxy::start(vec![service], DEV_AUTOSTART).await;

    let addr = proxy.addr;
    let started = std::time::Instant::now();
    let request = tokio::spawn(async move { send(addr, "GET", "/api/slow", &[], "").await });

    // The backend listens before the script reports ready
    let spawn_log = dir.path().join("spawns.log");
    assert!(wait_for_file(&spawn_log, Duration::from_secs(5)).await);
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let _backend = start_backend(listener, "slow");

    let response = tokio::time::timeout(Duration::from_secs(10), request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "slow GET /api/slow ");
    assert!(started.elapsed() < Duration::from_secs(3));

    let service = Arc::clone(&proxy.router.services()[0]);
    assert!(service.has_process());
    assert_eq!(
        std::fs::read_to_string(&spawn_log).unwrap().lines().count(),
        1
    );

    // Idle after the request, so the TTL closes it
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!service.has_process());
    assert!(!service.is_running());

    proxy.stop().await;
}

#[tokio::test]
async fn test_redirect_location_is_rewritten() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _backend = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    let response = Response::builder()
                        .status(302)
                        .header("Location", format!("http://127.0.0.1:{}/login", port))
                        .body(Full::new(Bytes::new()))
                        .unwrap();
                    Ok::<_, Infallible>(response)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let proxy = TestProxy::start(vec![explicit_service(1, "auth", port, &["/account"])], DEV).await;

    let response = proxy.get("/account").await;
    assert_eq!(response.status, 302);
    assert_eq!(
        response.header("location"),
        Some(format!("http://localhost:{}/login", proxy.addr.port()).as_str())
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let proxy = TestProxy::start(Vec::new(), DEV).await;
    let addr = proxy.addr;

    assert_eq!(proxy.get("/anything").await.status, 404);
    proxy.stop().await;

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_when_sender_is_dropped() {
    let router = Router::new(Vec::new(), 3000);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), router, DEV, shutdown_rx)
        .await
        .unwrap();
    let handle = tokio::spawn(server.run());

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("proxy kept running after its shutdown channel closed")
        .unwrap()
        .unwrap();
}
