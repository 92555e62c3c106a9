use super::*;
use crate::config::BaseConfig;
use async_trait::async_trait;
use roam_proto::EnvelopeCodec;
use roam_wasm::test_utils::test_modules::{destroy_directive_wasm, idle_agent_wasm};
use roam_wasm::SandboxMode;
use std::sync::Mutex as SyncMutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn module_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("demo.idle.wasm"), idle_agent_wasm()).unwrap();
    std::fs::write(
        dir.path().join("demo.destroyer.wasm"),
        destroy_directive_wasm(),
    )
    .unwrap();
    dir
}

fn test_config(dir: &TempDir) -> BaseConfig {
    BaseConfig {
        host: Some(localhost()),
        port: 0,
        code_paths: vec![dir.path().to_path_buf()],
        cache_grace: Duration::from_secs(10),
        class_timeout: Duration::from_secs(2),
        discovery_poll: Duration::from_millis(50),
        discovery_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn online_base(dir: &TempDir) -> (Arc<Base>, Address) {
    let base = Base::new(test_config(dir), Sandbox::new(SandboxMode::Restrictive)).unwrap();
    let address = base.online().await.unwrap();
    (base, address)
}

/// Write one envelope straight onto a base's listener socket
async fn send_raw(port: u16, envelope: &Envelope) {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    EnvelopeCodec::new()
        .write_envelope(&mut stream, envelope)
        .await
        .unwrap();
}

/// A bare envelope endpoint standing in for a peer base
struct Probe {
    tx: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl DeliveryHandler for Probe {
    async fn on_envelope(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
    }

    async fn on_delivery_error(&self, _id: u64, _code: DeliveryErrorCode) {}
}

async fn probe() -> (Arc<Delivery>, Address, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let delivery = Arc::new(Delivery::new(Arc::new(Probe { tx }) as Arc<dyn DeliveryHandler>));
    let port = delivery.online(0).await.unwrap();
    (delivery, Address::base(localhost(), port), rx)
}

async fn expect_notice(
    rx: &mut broadcast::Receiver<BaseNotice>,
    wanted: &BaseNotice,
    deadline: Duration,
) {
    let result = timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(notice) if notice == *wanted => break,
                Ok(_) => continue,
                Err(e) => panic!("notice channel failed: {}", e),
            }
        }
    })
    .await;
    assert!(result.is_ok(), "notice {:?} never arrived", wanted);
}

#[derive(Default)]
struct TestAgentLog {
    events: Vec<String>,
    ctx: Option<AgentContext>,
    errors: Vec<(u64, DeliveryErrorCode)>,
}

/// A native agent for exercising the trait seam directly
struct TestAgent {
    name: String,
    destination: Option<Address>,
    log: Arc<SyncMutex<TestAgentLog>>,
}

impl TestAgent {
    fn new(name: &str) -> (Self, Arc<SyncMutex<TestAgentLog>>) {
        let log = Arc::new(SyncMutex::new(TestAgentLog::default()));
        (
            Self {
                name: name.to_string(),
                destination: None,
                log: Arc::clone(&log),
            },
            log,
        )
    }

    fn record(&self, event: impl Into<String>) {
        self.log.lock().unwrap().events.push(event.into());
    }
}

#[async_trait]
impl Agent for TestAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> &str {
        "test.native"
    }

    fn destination(&self) -> Option<Address> {
        self.destination.clone()
    }

    fn set_destination(&mut self, destination: Option<Address>) {
        self.destination = destination;
    }

    fn image(&self) -> AgentImage {
        let mut image = AgentImage::new(&self.name, "test.native");
        image.destination = self.destination.clone();
        image
    }

    async fn on_create(&mut self, ctx: &AgentContext) {
        self.log.lock().unwrap().ctx = Some(ctx.clone());
        self.record("create");
    }

    async fn on_arrival(&mut self, _ctx: &AgentContext) {
        self.record("arrival");
    }

    async fn on_dispatch(&mut self, _ctx: &AgentContext) {
        self.record("dispatch");
    }

    async fn on_destroy(&mut self, _ctx: &AgentContext) {
        self.record("destroy");
    }

    async fn run(&mut self, _ctx: &AgentContext) {
        self.record("run");
    }

    async fn handle_message(&mut self, _ctx: &AgentContext, envelope: Envelope) {
        self.record(format!("msg:{}", envelope.content));
    }

    fn delivery_error(&mut self, id: u64, code: DeliveryErrorCode) {
        self.log.lock().unwrap().errors.push((id, code));
    }
}

#[tokio::test]
async fn test_agent_migrates_between_bases() {
    let dir_a = module_dir();
    let dir_b = module_dir();
    let (base_a, _addr_a) = online_base(&dir_a).await;
    let (base_b, addr_b) = online_base(&dir_b).await;

    let mut notices_b = base_b.subscribe();

    let name = base_a.load("demo.idle").await.unwrap();
    assert_eq!(base_a.agent_count().await, 1);
    assert_eq!(base_a.cache().refs("demo.idle"), Some(1));

    base_a.dispatch(&name, addr_b.clone()).await.unwrap();

    // the source forgets the agent immediately
    assert_eq!(base_a.agent_count().await, 0);
    assert_eq!(base_a.cache().refs("demo.idle"), Some(0));

    expect_notice(
        &mut notices_b,
        &BaseNotice::Arrived(name.clone()),
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(base_b.agent_count().await, 1);
    assert!(base_b.agent_names().await.contains(&name));

    // exactly one arrival: no duplicate agent envelope, no duplicate hook
    sleep(Duration::from_millis(300)).await;
    assert_eq!(base_b.agent_count().await, 1);
    match notices_b.try_recv() {
        Err(broadcast::error::TryRecvError::Empty) => {}
        other => panic!("unexpected extra notice: {:?}", other),
    }

    // the arrival's provenance points back at the source
    let (_, origin) = base_b.agent_provenance(&name).await.unwrap();
    assert_eq!(origin, Some(localhost()));

    base_a.offline().await;
    base_b.offline().await;
}

#[tokio::test]
async fn test_route_relays_foreign_envelope_unchanged() {
    let dir = module_dir();
    let (base_a, addr_a) = online_base(&dir).await;
    let (_probe_delivery, probe_addr, mut probe_rx) = probe().await;

    let envelope = Envelope::new(
        probe_addr.clone(),
        probe_addr.clone(),
        kind::MESSAGE,
        "pass it on",
        Bytes::from_static(b"opaque"),
    )
    .with_id(17);

    // hand the envelope to A even though it is addressed to the probe
    send_raw(addr_a.port, &envelope).await;

    let relayed = timeout(Duration::from_secs(5), probe_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relayed, envelope);

    base_a.offline().await;
}

#[tokio::test]
async fn test_get_absent_agent_yields_error() {
    let dir = module_dir();
    let (base_a, addr_a) = online_base(&dir).await;
    let (_probe_delivery, probe_addr, mut probe_rx) = probe().await;

    let request = Envelope::new(
        probe_addr.clone(),
        addr_a.clone(),
        kind::GET,
        "no-such-agent",
        Bytes::new(),
    );
    send_raw(addr_a.port, &request).await;

    let reply = timeout(Duration::from_secs(5), probe_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_kind(kind::ERROR));
    assert_eq!(reply.content, "agent not found");

    base_a.offline().await;
}

#[tokio::test]
async fn test_get_returns_resident_agent() {
    let dir = module_dir();
    let (base_a, addr_a) = online_base(&dir).await;
    let (_probe_delivery, probe_addr, mut probe_rx) = probe().await;

    let name = base_a.load("demo.idle").await.unwrap();
    let mut notices = base_a.subscribe();

    let request = Envelope::new(
        probe_addr.clone(),
        addr_a.clone(),
        kind::GET,
        name.clone(),
        Bytes::new(),
    );
    send_raw(addr_a.port, &request).await;

    let reply = timeout(Duration::from_secs(5), probe_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_kind(kind::AGENT));
    assert_eq!(reply.content, name);

    let image = AgentImage::from_msgpack(&reply.payload).unwrap();
    assert_eq!(image.name, name);
    assert_eq!(image.class, "demo.idle");

    expect_notice(
        &mut notices,
        &BaseNotice::Left(name.clone()),
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(base_a.agent_count().await, 0);

    base_a.offline().await;
}

#[tokio::test]
async fn test_unresolvable_class_drops_arriving_agent() {
    let empty_dir = TempDir::new().unwrap();
    let mut config = test_config(&empty_dir);
    config.class_timeout = Duration::from_millis(300);
    let base_b = Base::new(config, Sandbox::new(SandboxMode::Restrictive)).unwrap();
    let addr_b = base_b.online().await.unwrap();

    let mut notices = base_b.subscribe();

    let image = AgentImage::new("X", "demo.ghost");
    let envelope = Envelope::agent(
        // the source base is unreachable, so the class fetch must fail
        Address::base(localhost(), 1).named("X"),
        addr_b.clone(),
        "X",
        Bytes::from(image.to_msgpack().unwrap()),
    );
    send_raw(addr_b.port, &envelope).await;

    sleep(Duration::from_secs(1)).await;
    assert_eq!(base_b.agent_count().await, 0);
    assert!(matches!(
        notices.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    base_b.offline().await;
}

#[tokio::test]
async fn test_run_directive_destroys_agent() {
    let dir = module_dir();
    let (base, _addr) = online_base(&dir).await;
    let mut notices = base.subscribe();

    let name = base.load("demo.destroyer").await.unwrap();

    expect_notice(
        &mut notices,
        &BaseNotice::Created(name.clone()),
        Duration::from_secs(5),
    )
    .await;
    // the run body asks for destruction through its context
    expect_notice(
        &mut notices,
        &BaseNotice::Destroyed(name.clone()),
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(base.agent_count().await, 0);
    assert_eq!(base.cache().refs("demo.destroyer"), Some(0));

    base.offline().await;
}

#[tokio::test]
async fn test_discovery_against_peer() {
    let dir_a = module_dir();
    let (base_a, addr_a) = online_base(&dir_a).await;

    let dir_b = TempDir::new().unwrap();
    let mut config = test_config(&dir_b);
    config.host = None;
    config.discovery_peer = Some(addr_a.clone());
    let base_b = Base::new(config, Sandbox::new(SandboxMode::Restrictive)).unwrap();

    let addr_b = base_b.online().await.unwrap();
    assert_eq!(addr_b.host, Some(localhost()));
    assert!(addr_b.port > 0);
    assert!(base_b.is_online().await);

    // a dynamically discovered identity is forgotten offline
    base_b.offline().await;
    assert!(base_b.address().await.is_none());

    base_a.offline().await;
}

#[tokio::test]
async fn test_discovery_timeout_fails_the_transition() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.host = None;
    // nothing listens on port 1
    config.discovery_peer = Some(Address::base(localhost(), 1));
    config.discovery_timeout = Duration::from_millis(200);
    let base = Base::new(config, Sandbox::new(SandboxMode::Restrictive)).unwrap();

    let result = base.online().await;
    assert!(matches!(result, Err(BaseError::DiscoveryTimeout { .. })));
    assert!(!base.is_online().await);
}

#[tokio::test]
async fn test_message_envelope_reaches_agent() {
    let dir = module_dir();
    let (base, addr) = online_base(&dir).await;

    let (agent, log) = TestAgent::new("listener-1");
    base.register_on_creation(Box::new(agent)).await;

    let envelope = Envelope::new(
        Address::base(localhost(), 1).named("someone"),
        addr.named("listener-1"),
        kind::MESSAGE,
        "ping",
        Bytes::new(),
    );
    send_raw(addr.port, &envelope).await;

    timeout(Duration::from_secs(5), async {
        loop {
            if log.lock().unwrap().events.iter().any(|e| e == "msg:ping") {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("message never reached the agent");

    base.offline().await;
}

#[tokio::test]
async fn test_native_agent_lifecycle_order() {
    let dir = module_dir();
    let (base, _addr) = online_base(&dir).await;
    let (_probe_delivery, probe_addr, _probe_rx) = probe().await;

    let (agent, log) = TestAgent::new("traveler-1");
    base.register_on_creation(Box::new(agent)).await;

    // give the run task a moment
    sleep(Duration::from_millis(100)).await;
    base.dispatch("traveler-1", probe_addr).await.unwrap();

    let events = log.lock().unwrap().events.clone();
    assert_eq!(events, vec!["create", "run", "dispatch", "destroy"]);
    assert_eq!(base.agent_count().await, 0);

    base.offline().await;
}

#[tokio::test]
async fn test_send_to_missing_local_agent_reports_delivery_error() {
    let dir = module_dir();
    let (base, addr) = online_base(&dir).await;

    let (agent, log) = TestAgent::new("sender-1");
    base.register_on_creation(Box::new(agent)).await;
    sleep(Duration::from_millis(100)).await;

    let ctx = log.lock().unwrap().ctx.clone().expect("ctx captured");
    ctx.send(Envelope::new(
        addr.named("sender-1"),
        addr.named("nobody-home"),
        kind::MESSAGE,
        "hello?",
        Bytes::new(),
    ));

    timeout(Duration::from_secs(5), async {
        loop {
            let errors = log.lock().unwrap().errors.clone();
            if errors
                .iter()
                .any(|(_, code)| *code == DeliveryErrorCode::AgentUnreachable)
            {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("delivery error never surfaced");

    base.offline().await;
}

#[tokio::test]
async fn test_kind_handler_fan_out() {
    let dir = module_dir();
    let (base, addr) = online_base(&dir).await;

    struct Collector {
        seen: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl EnvelopeHandler for Collector {
        async fn on_envelope(&self, envelope: &Envelope) {
            self.seen.lock().unwrap().push(envelope.content.clone());
        }
    }

    let collector = Arc::new(Collector {
        seen: SyncMutex::new(Vec::new()),
    });
    let handler = Arc::clone(&collector) as Arc<dyn EnvelopeHandler>;
    base.add_kind_handler("TELEMETRY", Arc::clone(&handler)).await;

    let envelope = Envelope::new(
        Address::base(localhost(), 1),
        addr.clone(),
        "TELEMETRY",
        "tick",
        Bytes::new(),
    );
    send_raw(addr.port, &envelope).await;

    timeout(Duration::from_secs(5), async {
        loop {
            if !collector.seen.lock().unwrap().is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("handler never saw the envelope");

    assert!(base.remove_kind_handler("TELEMETRY", &handler).await);
    assert!(!base.remove_kind_handler("TELEMETRY", &handler).await);

    base.offline().await;
}

#[tokio::test]
async fn test_services_registry() {
    let dir = module_dir();
    let base = Base::new(test_config(&dir), Sandbox::new(SandboxMode::Restrictive)).unwrap();

    let service: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
    assert!(base.add_service("answers", service).await);
    assert!(!base.add_service("answers", Arc::new(0u32)).await);

    let looked_up = base.service("answers").await.unwrap();
    assert_eq!(*looked_up.downcast_ref::<u32>().unwrap(), 42);
    assert_eq!(base.service_names().await, vec!["answers".to_string()]);

    assert!(base.remove_service("answers").await);
    assert!(base.service("answers").await.is_none());
}

#[tokio::test]
async fn test_load_requires_online() {
    let dir = module_dir();
    let base = Base::new(test_config(&dir), Sandbox::new(SandboxMode::Restrictive)).unwrap();
    let result = base.load("demo.idle").await;
    assert!(matches!(result, Err(BaseError::Offline)));
}

#[tokio::test]
async fn test_generated_names_are_unique() {
    let dir = module_dir();
    let base = Base::new(test_config(&dir), Sandbox::new(SandboxMode::Restrictive)).unwrap();
    let a = base.generate_name();
    let b = base.generate_name();
    assert_ne!(a, b);
}
