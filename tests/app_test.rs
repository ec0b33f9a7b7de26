//! End-to-end run cycle: assembly, lifecycle phases, live HTTP traffic,
//! schedulers and shutdown against a real listener on an ephemeral port.

use async_trait::async_trait;
use ensemble::prelude::*;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static WARMUPS: AtomicUsize = AtomicUsize::new(0);
static TICKS: AtomicUsize = AtomicUsize::new(0);
static ABORTED_TICKS: AtomicUsize = AtomicUsize::new(0);

struct NameService;

impl NameService {
    fn decorate(&self, text: &str) -> String {
        format!("[{text}]")
    }
}

impl Service for NameService {
    fn hook_methods(self: Arc<Self>) -> Vec<HookMethod> {
        vec![hook_method("warmup", &self, |_s| async {
            WARMUPS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })]
    }
}

impl ServiceInit for NameService {
    fn init(_app: AppHandle) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn describe() {
        attach_lifecycle::<Self>("warmup", Phase::Setup);
    }
}

struct EchoController {
    names: Arc<NameService>,
}

impl Service for EchoController {}

impl ServiceInit for EchoController {
    fn init(app: AppHandle) -> anyhow::Result<Self> {
        let names = app
            .service_as::<NameService>("names")
            .ok_or_else(|| anyhow::anyhow!("names service missing"))?;
        Ok(Self { names })
    }

    fn describe() {
        attach_route::<Self>(
            "echo",
            RouteMeta::new("/echo")
                .methods([HttpMethod::Get, HttpMethod::Post])
                .input(InputSpec::schema(json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }))),
        );
        attach_route::<Self>(
            "page",
            RouteMeta::new("/page").method(HttpMethod::Get).input(
                InputSpec::schema(json!({
                    "type": "object",
                    "properties": {
                        "pageNum": {"type": "number"},
                        "title": {"type": "string"}
                    },
                    "required": ["pageNum"]
                }))
                .with_tap(Tap::ParseNumbers),
            ),
        );
        attach_route::<Self>(
            "headers",
            RouteMeta::new("/headers")
                .method(HttpMethod::Get)
                .middleware(middleware(|ctx, next| async move {
                    ctx.set_header("x-first", "1");
                    next().await
                }))
                .middleware(middleware(|ctx, next| async move {
                    ctx.set_header("x-second", "2");
                    next().await
                })),
        );
    }
}

impl Controller for EchoController {
    fn routes(self: Arc<Self>) -> Vec<RouteHandler> {
        vec![
            handler("echo", &self, |c, _ctx, input| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let input = input.unwrap_or(Value::Null);
                let text = input["text"].as_str().unwrap_or_default();
                Ok(Some(json!({"echo": c.names.decorate(text)})))
            }),
            handler("page", &self, |_c, _ctx, input| async move { Ok(input) }),
            handler("headers", &self, |_c, _ctx, _input| async move {
                Ok(Some(json!({"ok": true})))
            }),
        ]
    }
}

struct UploadController;

impl Service for UploadController {}

impl ServiceInit for UploadController {
    fn init(_app: AppHandle) -> anyhow::Result<Self> {
        Ok(Self)
    }

    fn describe() {
        attach_route::<Self>("upload", RouteMeta::new("/upload").method(HttpMethod::Post));
    }
}

impl Controller for UploadController {
    fn routes(self: Arc<Self>) -> Vec<RouteHandler> {
        vec![handler("upload", &self, |_c, ctx, _input| async move {
            let file = ctx.files.get("file").cloned().unwrap_or(Value::Null);
            Ok(Some(json!({"name": file["name"], "size": file["size"]})))
        })]
    }
}

struct StampService;

impl StampService {
    fn stamp(&self) -> &'static str {
        "stamped"
    }
}

impl Service for StampService {}

impl ServiceInit for StampService {
    fn init(_app: AppHandle) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

struct Pool {
    size: usize,
}

struct TickScheduler;

impl Service for TickScheduler {}

impl ServiceInit for TickScheduler {
    fn init(_app: AppHandle) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[async_trait]
impl Scheduler for TickScheduler {
    fn timer(&self) -> Timer {
        Timer::Interval(Duration::from_millis(50))
    }

    fn immediately(&self) -> bool {
        true
    }

    async fn invoke(&self) -> anyhow::Result<()> {
        TICKS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AbortedTickScheduler;

impl Service for AbortedTickScheduler {}

impl ServiceInit for AbortedTickScheduler {
    fn init(_app: AppHandle) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[async_trait]
impl Scheduler for AbortedTickScheduler {
    fn timer(&self) -> Timer {
        Timer::Interval(Duration::from_millis(20))
    }

    fn immediately(&self) -> bool {
        true
    }

    async fn invoke(&self) -> anyhow::Result<()> {
        ABORTED_TICKS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ephemeral_config() -> AppConfig {
    AppConfig {
        local_port: 0,
        hostname: "127.0.0.1".to_string(),
        ..AppConfig::default()
    }
}

fn phase_probe(seq: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> HookEntry {
    let seq = Arc::clone(seq);
    hook(label, move |_app| {
        let seq = Arc::clone(&seq);
        async move {
            seq.lock().unwrap().push(label);
            Ok(())
        }
    })
}

#[tokio::test]
async fn full_run_cycle_serves_requests_and_closes() {
    init_tracing();
    let seq: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let ext_seq = Arc::clone(&seq);

    let app = AppDescriptor::new()
        .config(ephemeral_config())
        .service(ServiceDef::new::<NameService>("names"))
        .controller(ControllerDef::new::<EchoController>())
        .scheduler(SchedulerDef::new::<TickScheduler>())
        .middleware(middleware(|ctx, next| async move {
            ctx.set_header("x-app", "1");
            next().await
        }))
        .extension(
            Extension::new("toolkit")
                .app_member(AppMember::new("pool", |_app| Pool { size: 8 }))
                .service(ServiceDef::new::<StampService>("stamp"))
                .middleware(middleware(|ctx, next| async move {
                    ctx.set_header("x-ext", "1");
                    next().await
                }))
                .lifecycle(
                    Phase::Run,
                    hook("ext-run", move |_app| {
                        let seq = Arc::clone(&ext_seq);
                        async move {
                            seq.lock().unwrap().push("ext-run");
                            Ok(())
                        }
                    }),
                ),
        )
        .lifecycle(Phase::Setup, phase_probe(&seq, "setup"))
        .lifecycle(Phase::Listen, phase_probe(&seq, "listen"))
        .lifecycle(Phase::Run, phase_probe(&seq, "run"))
        .lifecycle(Phase::Close, phase_probe(&seq, "close"))
        .build()
        .unwrap();

    let ready: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let ready_slot = Arc::clone(&ready);
    app.on_ready(move |info| {
        *ready_slot.lock().unwrap() = Some(info.addr);
    });
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_count = Arc::clone(&closed);
    app.on_closed(move || {
        closed_count.fetch_add(1, Ordering::SeqCst);
    });

    let shutdown = Arc::clone(&app).run().await.unwrap();

    let addr = ready.lock().unwrap().expect("ready signal fired");
    assert_eq!(*seq.lock().unwrap(), vec!["setup", "listen", "run", "ext-run"]);
    assert_eq!(WARMUPS.load(Ordering::SeqCst), 1);

    // Extension contributions are reachable through the aggregate.
    assert_eq!(app.member::<Pool>().unwrap().size, 8);
    assert_eq!(
        app.service_as::<StampService>("stamp").unwrap().stamp(),
        "stamped"
    );

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // Query input, sibling service, app + extension middlewares.
    let resp = client
        .get(format!("{base}/echo?text=hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-app").unwrap(), "1");
    assert_eq!(resp.headers().get("x-ext").unwrap(), "1");
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"echo": "[hi]"}));

    // The same pipeline answers the other declared method with a JSON body.
    let resp = client
        .post(format!("{base}/echo"))
        .json(&json!({"text": "yo"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"echo": "[yo]"}));

    // Validation failure surfaces as a structured 400, not a transport error.
    let resp = client.get(format!("{base}/echo")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body = resp.json::<Value>().await.unwrap();
    assert_eq!(body["type"], "InvalidInputError");
    assert_eq!(body["code"], "INVALID_INPUT");
    assert!(body["message"].as_str().unwrap().contains("text"));

    // The number tap coerces query strings before validation.
    let resp = client
        .get(format!("{base}/page?pageNum=1&title=aaa"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.json::<Value>().await.unwrap(),
        json!({"pageNum": 1, "title": "aaa"})
    );

    // Route middlewares run for their route only, in declared order.
    let resp = client.get(format!("{base}/headers")).send().await.unwrap();
    assert_eq!(resp.headers().get("x-first").unwrap(), "1");
    assert_eq!(resp.headers().get("x-second").unwrap(), "2");

    // Undeclared paths and methods fall through to the router defaults.
    assert_eq!(
        client
            .get(format!("{base}/nope"))
            .send()
            .await
            .unwrap()
            .status(),
        404
    );
    assert_eq!(
        client
            .post(format!("{base}/page"))
            .send()
            .await
            .unwrap()
            .status(),
        405
    );

    // The immediate scheduler fired at least once after startup.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(TICKS.load(Ordering::SeqCst) >= 1);

    shutdown.shutdown().await.unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seq.lock().unwrap(),
        vec!["setup", "listen", "run", "ext-run", "close"]
    );

    // Scheduler tasks are stopped with the application.
    let ticks_at_close = TICKS.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(TICKS.load(Ordering::SeqCst), ticks_at_close);

    // The listener no longer accepts connections.
    assert!(client.get(format!("{base}/echo?text=x")).send().await.is_err());
}

#[tokio::test]
async fn failing_run_hook_tears_down_listener_and_schedulers() {
    init_tracing();

    // Reserve a concrete port so the listener can be probed after the abort.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let app = AppDescriptor::new()
        .config(AppConfig {
            local_port: port,
            hostname: "127.0.0.1".to_string(),
            ..AppConfig::default()
        })
        .scheduler(SchedulerDef::new::<AbortedTickScheduler>())
        .lifecycle(
            Phase::Run,
            hook("not-ready", |_app| async {
                Err(anyhow::anyhow!("dependency missing").into())
            }),
        )
        .build()
        .unwrap();

    let err = Arc::clone(&app).run().await.unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::Hook {
            phase: Phase::Run,
            ..
        }
    ));

    // Scheduler tasks started before the failing phase are aborted.
    let ticks = ABORTED_TICKS.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ABORTED_TICKS.load(Ordering::SeqCst), ticks);

    // The listener is back down.
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err());
}

#[tokio::test]
async fn multipart_upload_lands_in_the_files_map() {
    init_tracing();
    let app = AppDescriptor::new()
        .config(ephemeral_config())
        .controller(ControllerDef::new::<UploadController>())
        .build()
        .unwrap();

    let ready: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let ready_slot = Arc::clone(&ready);
    app.on_ready(move |info| {
        *ready_slot.lock().unwrap() = Some(info.addr);
    });

    let shutdown = Arc::clone(&app).run().await.unwrap();
    let addr = ready.lock().unwrap().expect("ready signal fired");

    let part = reqwest::multipart::Part::bytes(b"hello upload".to_vec())
        .file_name("hello.txt")
        .mime_str("text/plain")
        .unwrap();
    let form = reqwest::multipart::Form::new().part("file", part);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/upload"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.json::<Value>().await.unwrap();
    assert_eq!(body["name"], "hello.txt");
    assert_eq!(body["size"], 12);

    shutdown.shutdown().await.unwrap();
}
