//! The agent trait, its context capability, and the wasm-backed agent

use crate::base::Base;
use async_trait::async_trait;
use bytes::Bytes;
use roam_net::DeliveryErrorCode;
use roam_proto::{Address, AgentImage, Envelope};
use roam_wasm::{AgentEvent, AgentRuntime, BehaviorModule, Directive, EventKind, Mail};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Lifecycle state of a resident agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Registered, hooks running, task not yet started
    Created,
    /// The run task has been started
    Running,
    /// Claimed for migration; about to be removed
    Dispatching,
    /// Claimed for destruction; about to be removed
    Destroying,
}

/// A mobile unit of behavior resident on a base.
///
/// The base drives the lifecycle: hooks fire at defined points, `run` gets
/// its own task after on-create/on-arrival, and `handle_message` receives
/// envelopes addressed to the agent by name. `image` must capture all
/// durable state; whatever it leaves out does not survive migration.
#[async_trait]
pub trait Agent: Send + 'static {
    /// World-unique name, the routing key
    fn name(&self) -> &str;

    /// Name of the behavior module this agent runs
    fn class(&self) -> &str;

    /// Destination for the next migration, if set
    fn destination(&self) -> Option<Address>;

    /// Set the destination for the next migration
    fn set_destination(&mut self, destination: Option<Address>);

    /// Detachable snapshot of the agent's durable state
    fn image(&self) -> AgentImage;

    /// Called once, on the base that created the agent
    async fn on_create(&mut self, _ctx: &AgentContext) {}

    /// Called on every base the agent arrives at after migration
    async fn on_arrival(&mut self, _ctx: &AgentContext) {}

    /// Called before the agent is serialized for migration
    async fn on_dispatch(&mut self, _ctx: &AgentContext) {}

    /// Called before the agent is removed
    async fn on_destroy(&mut self, _ctx: &AgentContext) {}

    /// Called before the agent is put to sleep (stub transition)
    async fn on_sleep(&mut self, _ctx: &AgentContext) {}

    /// Called when the agent is woken up (stub transition)
    async fn on_awake(&mut self, _ctx: &AgentContext) {}

    /// The agent's main body, driven on its own task
    async fn run(&mut self, _ctx: &AgentContext) {}

    /// An envelope addressed to this agent has arrived
    async fn handle_message(&mut self, _ctx: &AgentContext, _envelope: Envelope) {}

    /// An outbound envelope could not be delivered. Best-effort: not
    /// guaranteed to fire on every failure.
    fn delivery_error(&mut self, _id: u64, _code: DeliveryErrorCode) {}
}

struct ContextInner {
    name: String,
    base: Mutex<Weak<Base>>,
}

/// The weak "current host" capability handed to an agent on attach.
///
/// The three protected operations are delivered to the base
/// asynchronously, each on a freshly spawned notifier task: the base's
/// reaction may destroy the very agent issuing the request, so the
/// request must not run on the agent's own control flow. On detach the
/// capability is cleared and further requests become no-ops.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
}

impl AgentContext {
    pub(crate) fn new(name: String, base: Weak<Base>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name,
                base: Mutex::new(base),
            }),
        }
    }

    /// Name of the agent this context belongs to
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn base(&self) -> Option<Arc<Base>> {
        self.inner
            .base
            .lock()
            .expect("agent context lock poisoned")
            .upgrade()
    }

    pub(crate) fn detach(&self) {
        *self
            .inner
            .base
            .lock()
            .expect("agent context lock poisoned") = Weak::new();
    }

    /// Ask the base to migrate this agent to its pre-set destination
    pub fn request_dispatch(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let ctx = AgentContext { inner };
            if let Some(base) = ctx.base() {
                base.on_dispatch_request(ctx.name()).await;
            }
        });
    }

    /// Ask the base to destroy this agent
    pub fn request_destroy(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let ctx = AgentContext { inner };
            if let Some(base) = ctx.base() {
                base.on_destroy_request(ctx.name()).await;
            }
        });
    }

    /// Ask the base to put this agent to sleep (stub transition)
    pub fn request_sleep(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let ctx = AgentContext { inner };
            if let Some(base) = ctx.base() {
                base.on_sleep_request(ctx.name()).await;
            }
        });
    }

    /// Send an agent-originated envelope.
    ///
    /// Recipients resident on the same base are delivered directly,
    /// bypassing the network.
    pub fn send(&self, envelope: Envelope) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let ctx = AgentContext { inner };
            if let Some(base) = ctx.base() {
                base.agent_post(envelope).await;
            }
        });
    }

    /// Address of the hosting base, if attached and online
    pub async fn base_address(&self) -> Option<Address> {
        match self.base() {
            Some(base) => base.address().await,
            None => None,
        }
    }

    /// Whether the hosting base is online
    pub async fn is_online(&self) -> bool {
        match self.base() {
            Some(base) => base.is_online().await,
            None => false,
        }
    }
}

/// The concrete mobile agent: an [`AgentImage`] bound to a behavior module
/// and the runtime that executes it.
///
/// Lifecycle hooks deliver their event to the module and keep its successor
/// state; transition directives are honored from `run` and `message`
/// events only.
pub struct WasmAgent {
    image: AgentImage,
    module: BehaviorModule,
    runtime: Arc<AgentRuntime>,
}

impl WasmAgent {
    /// Bind an image to its behavior module
    pub fn new(image: AgentImage, module: BehaviorModule, runtime: Arc<AgentRuntime>) -> Self {
        Self {
            image,
            module,
            runtime,
        }
    }

    fn state_value(&self) -> serde_json::Value {
        if self.image.state.is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_slice(&self.image.state).unwrap_or(serde_json::Value::Null)
    }

    /// Deliver one event to the module, keep its successor state, and
    /// return the directive it asked for, if any.
    async fn deliver(&mut self, kind: EventKind, mail: Option<Mail>) -> Option<Directive> {
        let mut event = AgentEvent::new(kind, self.image.name.clone(), self.state_value());
        event.mail = mail;

        match self.runtime.deliver(&mut self.module, &event).await {
            Ok(reply) => {
                if let Some(state) = reply.state {
                    match serde_json::to_vec(&state) {
                        Ok(bytes) => self.image.state = Bytes::from(bytes),
                        Err(e) => warn!(agent = %self.image.name, "state not serializable: {}", e),
                    }
                }
                reply.directive
            }
            Err(e) => {
                // failures stay local to this agent
                warn!(agent = %self.image.name, event = ?kind, "behavior module failed: {}", e);
                None
            }
        }
    }

    fn apply(&mut self, directive: Option<Directive>, ctx: &AgentContext) {
        match directive {
            Some(Directive::Dispatch { host, port }) => {
                self.image.destination = Some(Address::base(host, port));
                ctx.request_dispatch();
            }
            Some(Directive::Destroy) => ctx.request_destroy(),
            Some(Directive::Sleep) => ctx.request_sleep(),
            None => {}
        }
    }
}

#[async_trait]
impl Agent for WasmAgent {
    fn name(&self) -> &str {
        &self.image.name
    }

    fn class(&self) -> &str {
        &self.image.class
    }

    fn destination(&self) -> Option<Address> {
        self.image.destination.clone()
    }

    fn set_destination(&mut self, destination: Option<Address>) {
        self.image.destination = destination;
    }

    fn image(&self) -> AgentImage {
        self.image.clone()
    }

    async fn on_create(&mut self, _ctx: &AgentContext) {
        self.deliver(EventKind::Create, None).await;
    }

    async fn on_arrival(&mut self, _ctx: &AgentContext) {
        self.deliver(EventKind::Arrival, None).await;
    }

    async fn on_dispatch(&mut self, _ctx: &AgentContext) {
        self.deliver(EventKind::Dispatch, None).await;
    }

    async fn on_destroy(&mut self, _ctx: &AgentContext) {
        self.deliver(EventKind::Destroy, None).await;
    }

    async fn on_sleep(&mut self, _ctx: &AgentContext) {
        self.deliver(EventKind::Sleep, None).await;
    }

    async fn on_awake(&mut self, _ctx: &AgentContext) {
        self.deliver(EventKind::Awake, None).await;
    }

    async fn run(&mut self, ctx: &AgentContext) {
        let directive = self.deliver(EventKind::Run, None).await;
        self.apply(directive, ctx);
    }

    async fn handle_message(&mut self, ctx: &AgentContext, envelope: Envelope) {
        let mail = Mail {
            kind: envelope.kind.clone(),
            content: envelope.content.clone(),
            payload: envelope.payload.to_vec(),
        };
        let directive = self.deliver(EventKind::Message, Some(mail)).await;
        self.apply(directive, ctx);
    }

    fn delivery_error(&mut self, id: u64, code: DeliveryErrorCode) {
        debug!(agent = %self.image.name, id, ?code, "outbound envelope was not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_wasm::test_utils::test_modules::{destroy_directive_wasm, idle_agent_wasm};
    use roam_wasm::{Sandbox, SandboxMode};
    use serde_json::json;

    fn runtime() -> Arc<AgentRuntime> {
        Arc::new(AgentRuntime::new(Sandbox::new(SandboxMode::Restrictive)).unwrap())
    }

    fn detached_ctx() -> AgentContext {
        AgentContext::new("scout-1".to_string(), Weak::new())
    }

    #[tokio::test]
    async fn test_image_roundtrip_preserves_identity() {
        let mut image = AgentImage::new("scout-1", "demo.idle");
        image.state = Bytes::from(serde_json::to_vec(&json!({"count": 3})).unwrap());
        let module = BehaviorModule::from_bytes(idle_agent_wasm().to_vec()).unwrap();
        let agent = WasmAgent::new(image.clone(), module, runtime());

        let snapshot = agent.image();
        let bytes = snapshot.to_msgpack().unwrap();
        let restored = AgentImage::from_msgpack(&bytes).unwrap();

        assert_eq!(restored, image);
    }

    #[tokio::test]
    async fn test_run_keeps_successor_state() {
        let image = AgentImage::new("scout-1", "demo.destroyer");
        let module = BehaviorModule::from_bytes(destroy_directive_wasm().to_vec()).unwrap();
        let mut agent = WasmAgent::new(image, module, runtime());

        let ctx = detached_ctx();
        agent.run(&ctx).await;

        // the module replied with {"done": true}
        let state: serde_json::Value = serde_json::from_slice(&agent.image().state).unwrap();
        assert_eq!(state, json!({"done": true}));
    }

    #[tokio::test]
    async fn test_detached_context_requests_are_noops() {
        let ctx = detached_ctx();
        ctx.request_dispatch();
        ctx.request_destroy();
        ctx.request_sleep();
        assert!(ctx.base_address().await.is_none());
        assert!(!ctx.is_online().await);
    }

    #[tokio::test]
    async fn test_set_destination() {
        let image = AgentImage::new("scout-1", "demo.idle");
        let module = BehaviorModule::from_bytes(idle_agent_wasm().to_vec()).unwrap();
        let mut agent = WasmAgent::new(image, module, runtime());

        assert!(agent.destination().is_none());
        let dest = Address::base("127.0.0.1".parse().unwrap(), 9001);
        agent.set_destination(Some(dest.clone()));
        assert_eq!(agent.destination(), Some(dest.clone()));
        assert_eq!(agent.image().destination, Some(dest));
    }
}
