//! The base: registry, router, and lifecycle state machine.
//!
//! A base exclusively owns its resident-agent table and code cache. Every
//! inbound envelope goes through [`Base::route`], which runs on the
//! dedicated worker of the connection that carried it, so a blocking
//! remote class fetch stalls only that worker, never the listener or the
//! envelopes of other agents.

use crate::agent::{Agent, AgentContext, AgentState, WasmAgent};
use crate::config::BaseConfig;
use crate::error::BaseError;
use async_trait::async_trait;
use bytes::Bytes;
use roam_net::{Delivery, DeliveryErrorCode, DeliveryHandler};
use roam_proto::{kind, Address, AgentImage, Envelope};
use roam_wasm::{AgentRuntime, CodeCache, RemoteLoader, ReplyRegistry, Sandbox};
use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long the id of an agent-originated envelope is remembered for the
/// best-effort delivery-error callback.
const PENDING_SEND_HORIZON: Duration = Duration::from_secs(60);

/// Registry notifications observers (such as a console) can subscribe to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseNotice {
    /// An agent was created on this base
    Created(String),
    /// An agent arrived from another base
    Arrived(String),
    /// An agent was dispatched away
    Left(String),
    /// An agent was destroyed
    Destroyed(String),
}

/// Handler registered for an envelope kind.
///
/// Kinds are an open extension point: plug-ins register handlers for new
/// kinds at runtime, and every inbound envelope fans out to the handlers
/// of its kind independently of the built-in routing.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// An envelope of a registered kind has arrived
    async fn on_envelope(&self, envelope: &Envelope);
}

/// One resident agent and its bookkeeping
struct AgentRecord {
    agent: Arc<Mutex<Box<dyn Agent>>>,
    ctx: AgentContext,
    /// The run task; `None` once the agent is detached for migration
    task: Option<JoinHandle<()>>,
    arrived_at: SystemTime,
    /// Host the agent came from; `None` if created locally
    origin: Option<IpAddr>,
    state: AgentState,
}

#[derive(Default)]
struct BaseInner {
    boxes: HashMap<String, AgentRecord>,
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
    kind_handlers: HashMap<String, Vec<Arc<dyn EnvelopeHandler>>>,
    address: Option<Address>,
    online: bool,
}

/// Routes transport callbacks into the base without a strong cycle
#[derive(Default)]
struct BaseRouter {
    base: StdMutex<Weak<Base>>,
}

impl BaseRouter {
    fn attach(&self, base: &Arc<Base>) {
        *self.base.lock().expect("router lock poisoned") = Arc::downgrade(base);
    }

    fn upgrade(&self) -> Option<Arc<Base>> {
        self.base.lock().expect("router lock poisoned").upgrade()
    }
}

#[async_trait]
impl DeliveryHandler for BaseRouter {
    async fn on_envelope(&self, envelope: Envelope) {
        if let Some(base) = self.upgrade() {
            base.route(envelope).await;
        }
    }

    async fn on_delivery_error(&self, id: u64, code: DeliveryErrorCode) {
        if let Some(base) = self.upgrade() {
            base.handle_delivery_error(id, code).await;
        }
    }
}

/// A host for mobile agents: receives, executes, and dispatches them, and
/// routes every envelope exchanged with peer bases.
pub struct Base {
    config: BaseConfig,
    delivery: Arc<Delivery>,
    runtime: Arc<AgentRuntime>,
    loader: RemoteLoader,
    replies: ReplyRegistry,
    ids: Arc<AtomicU64>,
    notices: broadcast::Sender<BaseNotice>,
    inner: Mutex<BaseInner>,
    pending_sends: StdMutex<HashMap<u64, (String, Instant)>>,
}

impl Base {
    /// Create a base with the given configuration and sandbox policy.
    ///
    /// The base starts offline; call [`Base::online`] to open the listener.
    pub fn new(config: BaseConfig, sandbox: Sandbox) -> crate::Result<Arc<Self>> {
        let router = Arc::new(BaseRouter::default());
        let delivery = Arc::new(Delivery::new(
            Arc::clone(&router) as Arc<dyn DeliveryHandler>
        ));
        let runtime = Arc::new(AgentRuntime::new(sandbox)?);
        let cache = CodeCache::new(config.code_paths.clone(), config.cache_grace);
        let replies = ReplyRegistry::new();
        let ids = Arc::new(AtomicU64::new(1));
        let loader = RemoteLoader::new(
            cache,
            Arc::clone(&delivery),
            replies.clone(),
            config.class_timeout,
            Arc::clone(&ids),
        );
        let (notices, _) = broadcast::channel(64);

        let base = Arc::new(Self {
            config,
            delivery,
            runtime,
            loader,
            replies,
            ids,
            notices,
            inner: Mutex::new(BaseInner::default()),
            pending_sends: StdMutex::new(HashMap::new()),
        });
        router.attach(&base);
        Ok(base)
    }

    /// The base configuration
    pub fn config(&self) -> &BaseConfig {
        &self.config
    }

    /// The code cache this base owns
    pub fn cache(&self) -> &CodeCache {
        self.loader.cache()
    }

    /// The runtime executing this base's agents
    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Subscribe to registry notifications
    pub fn subscribe(&self) -> broadcast::Receiver<BaseNotice> {
        self.notices.subscribe()
    }

    /// This base's address, once known
    pub async fn address(&self) -> Option<Address> {
        self.inner.lock().await.address.clone()
    }

    /// Whether the base is accepting traffic
    pub async fn is_online(&self) -> bool {
        self.inner.lock().await.online
    }

    /// Names of all resident agents
    pub async fn agent_names(&self) -> Vec<String> {
        self.inner.lock().await.boxes.keys().cloned().collect()
    }

    /// Number of resident agents
    pub async fn agent_count(&self) -> usize {
        self.inner.lock().await.boxes.len()
    }

    /// Generate a world-unique agent name
    pub fn generate_name(&self) -> String {
        format!("agent-{}", Uuid::new_v4())
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Post an envelope on behalf of the base itself (console commands,
    /// plug-in traffic). Fire-and-forget, like all sends.
    pub fn post(&self, envelope: Envelope) {
        self.delivery.post(envelope);
    }

    // ---- going online and offline -------------------------------------

    /// Open the listener and, if this base has no static host, run the
    /// bounded dynamic-address discovery exchange first.
    ///
    /// Fails the whole transition if discovery does not complete within
    /// its deadline. Notifies the configured directory server once online.
    pub async fn online(self: &Arc<Self>) -> crate::Result<Address> {
        {
            let inner = self.inner.lock().await;
            if inner.online {
                return inner.address.clone().ok_or(BaseError::AlreadyOnline);
            }
        }

        let port = self.delivery.online(self.config.port).await?;

        let address = if let Some(host) = self.config.host {
            Address::base(host, port)
        } else if let Some(peer) = self.config.discovery_peer.clone() {
            self.discover_address(port, peer).await?
        } else {
            Address::base(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        };

        {
            let mut inner = self.inner.lock().await;
            inner.address = Some(address.clone());
            inner.online = true;
        }
        info!(address = %address, "base is online");

        if let Some(directory) = self.config.directory.clone() {
            self.delivery.post(
                Envelope::new(address.clone(), directory, kind::BASE_ONLINE, "", Bytes::new())
                    .with_id(self.next_id()),
            );
        }

        Ok(address)
    }

    /// Ask `peer` what address this base appears under and poll until the
    /// reply has landed or the deadline passes.
    async fn discover_address(self: &Arc<Self>, port: u16, peer: Address) -> crate::Result<Address> {
        let request = Envelope::new(
            Address::unresolved(port),
            peer,
            kind::GET_ADDRESS,
            "",
            Bytes::new(),
        )
        .with_id(self.next_id());
        self.delivery.post(request);

        let mut waited = Duration::ZERO;
        loop {
            tokio::time::sleep(self.config.discovery_poll).await;

            if let Some(address) = self.inner.lock().await.address.clone() {
                return Ok(address);
            }

            waited += self.config.discovery_poll;
            if waited >= self.config.discovery_timeout {
                self.delivery.offline().await;
                return Err(BaseError::DiscoveryTimeout {
                    timeout: self.config.discovery_timeout,
                });
            }
        }
    }

    /// Close the listener and notify the directory server, if configured.
    ///
    /// In-flight transfers finish or fail on their own; resident agents
    /// stay registered.
    pub async fn offline(self: &Arc<Self>) {
        let address = {
            let inner = self.inner.lock().await;
            if !inner.online {
                return;
            }
            inner.address.clone()
        };

        if let (Some(address), Some(directory)) = (address, self.config.directory.clone()) {
            self.delivery.post(
                Envelope::new(address, directory, kind::BASE_OFFLINE, "", Bytes::new())
                    .with_id(self.next_id()),
            );
        }

        self.delivery.offline().await;

        let mut inner = self.inner.lock().await;
        inner.online = false;
        if self.config.host.is_none() && self.config.discovery_peer.is_some() {
            // a dynamically discovered identity is not ours to keep
            inner.address = None;
        }
        info!("base is offline");
    }

    // ---- registration and lifecycle -----------------------------------

    /// Register a newly created agent: insert its record, run `on_create`,
    /// start its task, and notify observers.
    pub async fn register_on_creation(self: &Arc<Self>, agent: Box<dyn Agent>) -> String {
        self.register(agent, None, true).await
    }

    /// Register an agent that arrived from `origin`: insert its record,
    /// run `on_arrival`, start its task, and notify observers.
    pub async fn register_on_arrival(
        self: &Arc<Self>,
        agent: Box<dyn Agent>,
        origin: Option<IpAddr>,
    ) -> String {
        self.register(agent, origin, false).await
    }

    async fn register(
        self: &Arc<Self>,
        agent: Box<dyn Agent>,
        origin: Option<IpAddr>,
        created: bool,
    ) -> String {
        let name = agent.name().to_string();
        let ctx = AgentContext::new(name.clone(), Arc::downgrade(self));
        let agent = Arc::new(Mutex::new(agent));

        {
            let mut inner = self.inner.lock().await;
            if inner.boxes.contains_key(&name) {
                warn!(agent = %name, "agent name collision; replacing resident agent");
            }
            inner.boxes.insert(
                name.clone(),
                AgentRecord {
                    agent: Arc::clone(&agent),
                    ctx: ctx.clone(),
                    task: None,
                    arrived_at: SystemTime::now(),
                    origin,
                    state: AgentState::Created,
                },
            );
        }

        // lifecycle hook, outside the registry lock
        {
            let mut guard = agent.lock().await;
            if created {
                guard.on_create(&ctx).await;
            } else {
                guard.on_arrival(&ctx).await;
            }
        }

        // the agent's own task; never forcibly cancelled, so a run body
        // that never returns leaks its task
        let run_agent = Arc::clone(&agent);
        let run_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let mut guard = run_agent.lock().await;
            guard.run(&run_ctx).await;
        });

        {
            let mut inner = self.inner.lock().await;
            if let Some(record) = inner.boxes.get_mut(&name) {
                record.task = Some(task);
                record.state = AgentState::Running;
            }
        }

        let notice = if created {
            BaseNotice::Created(name.clone())
        } else {
            BaseNotice::Arrived(name.clone())
        };
        let _ = self.notices.send(notice);
        name
    }

    /// Claim an agent for a terminal transition, detaching its task handle
    async fn claim(
        &self,
        name: &str,
        next: AgentState,
    ) -> crate::Result<(Arc<Mutex<Box<dyn Agent>>>, AgentContext)> {
        let mut inner = self.inner.lock().await;
        match inner.boxes.get_mut(name) {
            None => Err(BaseError::AgentNotFound(name.to_string())),
            Some(record) => match record.state {
                AgentState::Dispatching | AgentState::Destroying => {
                    Err(BaseError::AgentDetaching(name.to_string()))
                }
                _ => {
                    record.state = next;
                    record.task = None;
                    Ok((Arc::clone(&record.agent), record.ctx.clone()))
                }
            },
        }
    }

    async fn unclaim(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.boxes.get_mut(name) {
            record.state = AgentState::Running;
        }
    }

    async fn remove(&self, name: &str) {
        self.inner.lock().await.boxes.remove(name);
    }

    /// Dispatch a resident agent to another base.
    ///
    /// The record is removed and the cache reference released whether or
    /// not the envelope ever arrives: migration is fire-and-forget, and a
    /// destination that becomes unreachable after detach is a known loss
    /// window of the platform.
    pub async fn dispatch(self: &Arc<Self>, name: &str, destination: Address) -> crate::Result<()> {
        let local = self.address().await.ok_or(BaseError::Offline)?;
        let (agent, ctx) = self.claim(name, AgentState::Dispatching).await?;

        let image = {
            let mut guard = agent.lock().await;
            guard.on_dispatch(&ctx).await;
            guard.image()
        };
        let payload = match image.to_msgpack() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(agent = name, "agent image not serializable: {}", e);
                self.unclaim(name).await;
                return Err(e.into());
            }
        };

        self.delivery.post(
            Envelope::agent(local.named(name), destination.base_only(), name, payload)
                .with_id(self.next_id()),
        );

        {
            let mut guard = agent.lock().await;
            guard.on_destroy(&ctx).await;
        }
        ctx.detach();
        let _ = self.notices.send(BaseNotice::Left(name.to_string()));
        self.remove(name).await;
        self.cache().release(&image.class);
        info!(agent = name, destination = %destination, "agent dispatched");
        Ok(())
    }

    /// Destroy a resident agent with all necessary cleanup
    pub async fn destroy(self: &Arc<Self>, name: &str) -> crate::Result<()> {
        let (agent, ctx) = self.claim(name, AgentState::Destroying).await?;

        let class = {
            let mut guard = agent.lock().await;
            guard.on_destroy(&ctx).await;
            guard.class().to_string()
        };
        ctx.detach();
        let _ = self.notices.send(BaseNotice::Destroyed(name.to_string()));
        self.remove(name).await;
        self.cache().release(&class);
        info!(agent = name, "agent destroyed");
        Ok(())
    }

    /// Resolve a behavior module locally, instantiate it under a freshly
    /// generated name, and register the new agent. Returns the name.
    pub async fn load(self: &Arc<Self>, class: &str) -> crate::Result<String> {
        let local = self.address().await.ok_or(BaseError::Offline)?;
        let module = self
            .loader
            .resolve(class, &local, None, self.runtime.engine())
            .await?;
        let name = self.generate_name();
        let image = AgentImage::new(&name, class);
        let agent = WasmAgent::new(image, module, Arc::clone(&self.runtime));
        self.register_on_creation(Box::new(agent)).await;
        Ok(name)
    }

    // ---- agent transition requests ------------------------------------

    pub(crate) async fn on_dispatch_request(self: &Arc<Self>, name: &str) {
        let agent = {
            let inner = self.inner.lock().await;
            match inner.boxes.get(name) {
                Some(record) => Arc::clone(&record.agent),
                None => return,
            }
        };
        let destination = agent.lock().await.destination();
        match destination {
            Some(destination) => {
                if let Err(e) = self.dispatch(name, destination).await {
                    warn!(agent = name, "dispatch request failed: {}", e);
                }
            }
            None => warn!(agent = name, "dispatch requested without a destination"),
        }
    }

    pub(crate) async fn on_destroy_request(self: &Arc<Self>, name: &str) {
        if let Err(e) = self.destroy(name).await {
            debug!(agent = name, "destroy request ignored: {}", e);
        }
    }

    pub(crate) async fn on_sleep_request(self: &Arc<Self>, name: &str) {
        // sleep is a defined transition without an implementation: the
        // hook fires and nothing else happens
        let target = {
            let inner = self.inner.lock().await;
            inner
                .boxes
                .get(name)
                .map(|record| (Arc::clone(&record.agent), record.ctx.clone()))
        };
        if let Some((agent, ctx)) = target {
            agent.lock().await.on_sleep(&ctx).await;
        }
    }

    // ---- routing ------------------------------------------------------

    /// Central handler for every inbound envelope.
    ///
    /// Runs on the dedicated worker of the connection that carried the
    /// envelope. Envelopes for other bases are relayed unchanged; local
    /// ones dispatch on their kind, and every envelope additionally fans
    /// out to the handlers registered for its kind.
    pub async fn route(self: &Arc<Self>, envelope: Envelope) {
        let (local, online) = {
            let inner = self.inner.lock().await;
            (inner.address.clone(), inner.online)
        };

        // store-and-forward: not addressed to this base, pass it on as-is
        if let (Some(local), Some(_)) = (&local, envelope.recipient.host) {
            if !envelope.recipient.same_base(local) {
                debug!(envelope = %envelope, "relaying envelope");
                self.delivery.post(envelope);
                return;
            }
        }

        match envelope.kind.as_str() {
            kind::AGENT => self.handle_agent_arrival(&envelope, local.as_ref()).await,
            kind::GET_CLASS => self.handle_get_class(&envelope, local.as_ref()).await,
            kind::GET => self.handle_get(&envelope, local.as_ref()).await,
            kind::GET_ADDRESS => {
                // the listener already substituted the observed peer host
                if let Some(local) = &local {
                    self.delivery.post(Envelope::new(
                        local.clone(),
                        envelope.sender.clone(),
                        kind::YOUR_ADDRESS,
                        "",
                        Bytes::new(),
                    ));
                }
            }
            kind::YOUR_ADDRESS => {
                if !online {
                    let mut inner = self.inner.lock().await;
                    inner.address = Some(envelope.recipient.base_only());
                    info!(address = %envelope.recipient, "own address discovered");
                }
            }
            _ => {
                if let Some(name) = envelope.recipient.name.clone() {
                    self.deliver_to_agent(&name, &envelope).await;
                    self.replies.complete(&name, envelope.clone());
                }
            }
        }

        // independent fan-out to the extension point for this kind
        let handlers = {
            let inner = self.inner.lock().await;
            inner
                .kind_handlers
                .get(&envelope.kind)
                .cloned()
                .unwrap_or_default()
        };
        for handler in handlers {
            handler.on_envelope(&envelope).await;
        }
    }

    /// An agent has arrived: deserialize it, resolving its behavior module
    /// through the code layer, and register it.
    ///
    /// The resolve may block this worker on a bounded remote fetch back to
    /// the sending base. A resolution failure drops the agent with no
    /// retry; the sender has already forgotten it.
    async fn handle_agent_arrival(self: &Arc<Self>, envelope: &Envelope, local: Option<&Address>) {
        let Some(local) = local else {
            warn!("agent envelope arrived while this base has no address");
            return;
        };
        let image = match AgentImage::from_msgpack(&envelope.payload) {
            Ok(image) => image,
            Err(e) => {
                warn!("dropping malformed agent envelope: {}", e);
                return;
            }
        };

        let source = envelope.sender.base_only();
        let module = match self
            .loader
            .resolve(&image.class, local, Some(&source), self.runtime.engine())
            .await
        {
            Ok(module) => module,
            Err(e) => {
                warn!(
                    agent = %image.name,
                    class = %image.class,
                    "arriving agent dropped, module unresolvable: {}", e
                );
                return;
            }
        };

        let agent = WasmAgent::new(image, module, Arc::clone(&self.runtime));
        self.register_on_arrival(Box::new(agent), envelope.sender.host)
            .await;
    }

    /// A peer asks for module code: cache, then disk, or silence
    async fn handle_get_class(&self, envelope: &Envelope, local: Option<&Address>) {
        let Some(local) = local else { return };
        match self.cache().bytes(&envelope.content) {
            Some(bytes) => {
                self.delivery.post(Envelope::class(
                    local.clone(),
                    envelope.sender.clone(),
                    envelope.content.clone(),
                    Bytes::from(bytes),
                ));
            }
            None => {
                info!(module = %envelope.content, "module requested but unknown here");
            }
        }
    }

    /// A peer asks for a resident agent back: detach, serialize, reply
    async fn handle_get(self: &Arc<Self>, envelope: &Envelope, local: Option<&Address>) {
        let Some(local) = local else { return };
        let name = envelope.content.clone();

        let (agent, ctx) = match self.claim(&name, AgentState::Dispatching).await {
            Ok(claimed) => claimed,
            Err(_) => {
                self.delivery.post(Envelope::error(
                    local.clone(),
                    envelope.sender.clone(),
                    "agent not found",
                ));
                return;
            }
        };

        let image = {
            let mut guard = agent.lock().await;
            guard.on_dispatch(&ctx).await;
            guard.image()
        };
        let payload = match image.to_msgpack() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(agent = %name, "agent image not serializable: {}", e);
                self.unclaim(&name).await;
                return;
            }
        };

        self.delivery.post(
            Envelope::agent(local.named(&name), envelope.sender.clone(), &name, payload)
                .with_id(self.next_id()),
        );
        ctx.detach();
        let _ = self.notices.send(BaseNotice::Left(name.clone()));
        self.remove(&name).await;
        self.cache().release(&image.class);
        info!(agent = %name, to = %envelope.sender, "agent handed over");
    }

    /// Deliver an envelope to a resident agent's message handler
    async fn deliver_to_agent(&self, name: &str, envelope: &Envelope) {
        let target = {
            let inner = self.inner.lock().await;
            inner.boxes.get(name).and_then(|record| match record.state {
                AgentState::Created | AgentState::Running => {
                    Some((Arc::clone(&record.agent), record.ctx.clone()))
                }
                _ => None,
            })
        };
        match target {
            Some((agent, ctx)) => {
                agent.lock().await.handle_message(&ctx, envelope.clone()).await;
            }
            None => debug!(agent = name, "no resident agent for envelope"),
        }
    }

    /// Send an agent-originated envelope, short-circuiting recipients
    /// resident on this base.
    pub(crate) async fn agent_post(self: &Arc<Self>, mut envelope: Envelope) {
        if envelope.id == 0 {
            envelope.id = self.next_id();
        }

        let (local, online) = {
            let inner = self.inner.lock().await;
            (inner.address.clone(), inner.online)
        };

        let is_local = envelope.recipient.host.is_none()
            || local
                .as_ref()
                .map(|l| envelope.recipient.same_base(l))
                .unwrap_or(false);

        if is_local {
            if let Some(name) = envelope.recipient.name.clone() {
                let resident = self.inner.lock().await.boxes.contains_key(&name);
                if !resident && !self.replies.is_registered(&name) {
                    let id = envelope.id;
                    if let Some(sender) = envelope.sender.name.clone() {
                        self.pending_sends
                            .lock()
                            .expect("pending sends lock poisoned")
                            .insert(id, (sender, Instant::now()));
                    }
                    self.handle_delivery_error(id, DeliveryErrorCode::AgentUnreachable)
                        .await;
                    return;
                }
            }
            // direct delivery, bypassing the network
            self.route(envelope).await;
            return;
        }

        if !online {
            let id = envelope.id;
            self.handle_delivery_error(id, DeliveryErrorCode::BaseOffline)
                .await;
            return;
        }

        if let Some(sender) = envelope.sender.name.clone() {
            let mut pending = self
                .pending_sends
                .lock()
                .expect("pending sends lock poisoned");
            pending.retain(|_, (_, at)| at.elapsed() < PENDING_SEND_HORIZON);
            pending.insert(envelope.id, (sender, Instant::now()));
        }
        self.delivery.post(envelope);
    }

    /// Best-effort fan-in of delivery failures: pending fetches first,
    /// then the originating resident agent, if still known.
    pub(crate) async fn handle_delivery_error(&self, id: u64, code: DeliveryErrorCode) {
        if self.replies.fail(id, code) {
            return;
        }

        let sender = {
            let mut pending = self
                .pending_sends
                .lock()
                .expect("pending sends lock poisoned");
            pending.remove(&id).map(|(name, _)| name)
        };
        if let Some(name) = sender {
            let agent = {
                let inner = self.inner.lock().await;
                inner.boxes.get(&name).map(|record| Arc::clone(&record.agent))
            };
            if let Some(agent) = agent {
                agent.lock().await.delivery_error(id, code);
            }
        }
    }

    // ---- services and handler registries ------------------------------

    /// Add a named capability object agents can look up. Returns `false`
    /// if the name is taken.
    pub async fn add_service(&self, name: &str, service: Arc<dyn Any + Send + Sync>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.services.contains_key(name) {
            return false;
        }
        inner.services.insert(name.to_string(), service);
        true
    }

    /// Remove a named capability object
    pub async fn remove_service(&self, name: &str) -> bool {
        self.inner.lock().await.services.remove(name).is_some()
    }

    /// Look up a capability object by name
    pub async fn service(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.lock().await.services.get(name).cloned()
    }

    /// Names of all currently available services
    pub async fn service_names(&self) -> Vec<String> {
        self.inner.lock().await.services.keys().cloned().collect()
    }

    /// Register a handler for an envelope kind; several handlers may share
    /// one kind.
    pub async fn add_kind_handler(&self, kind: &str, handler: Arc<dyn EnvelopeHandler>) {
        self.inner
            .lock()
            .await
            .kind_handlers
            .entry(kind.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove a previously registered handler for a kind
    pub async fn remove_kind_handler(&self, kind: &str, handler: &Arc<dyn EnvelopeHandler>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.kind_handlers.get_mut(kind) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|h| !Arc::ptr_eq(h, handler));
                handlers.len() < before
            }
            None => false,
        }
    }

    /// When the named agent arrived, and from where (`None` when created
    /// locally)
    pub async fn agent_provenance(&self, name: &str) -> Option<(SystemTime, Option<IpAddr>)> {
        let inner = self.inner.lock().await;
        inner
            .boxes
            .get(name)
            .map(|record| (record.arrived_at, record.origin))
    }
}

#[cfg(test)]
mod tests;
