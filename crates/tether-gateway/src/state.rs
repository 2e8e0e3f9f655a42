//! Shared gateway state.
//!
//! One [`AppState`] instance wires every surface to the same store,
//! validators, and peripheral services. It is cheap to clone (all arcs)
//! and is the axum state for every router.

use std::sync::Arc;

use secrecy::SecretString;

use tether_core::admission::{PolicyValidator, SessionValidator};
use tether_core::audit::AuditLog;
use tether_core::auth::{Authorizer, CachedAuthorizer, StaticAuthorizer, StaticTokenVerifier, TokenVerifier};
use tether_core::framework::FrameworkRegistry;
use tether_core::notify::Outbox;
use tether_core::resource::policy::NamespacePolicy;
use tether_core::resource::session::Session;
use tether_core::secrets::{MemorySecretStore, SecretStore};
use tether_core::store::TypedStore;
use tether_core::workload::fake::FakeOrchestrator;
use tether_core::workload::WorkloadApi;

use crate::callback::{CallbackTokenRegistry, SessionLogStore};
use crate::metrics::{MetricsRegistry, SharedMetrics};
use crate::webhook::auth::WebhookAuthenticator;
use crate::webhook::factory::{FactoryConfig, SessionFactory};
use crate::webhook::rate_limit::WebhookRateLimiter;

/// Everything the HTTP surfaces need.
#[derive(Clone)]
pub struct AppState {
    /// Session store with admission installed.
    pub sessions: Arc<TypedStore<Session>>,
    /// Policy store with admission installed.
    pub policies: Arc<TypedStore<NamespacePolicy>>,
    /// Framework registry.
    pub registry: Arc<FrameworkRegistry>,
    /// Workload orchestrator.
    pub orchestrator: Arc<dyn WorkloadApi>,
    /// Secret store.
    pub secrets: Arc<dyn SecretStore>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Webhook authenticator + tenant resolver.
    pub authenticator: Arc<WebhookAuthenticator>,
    /// Webhook rate limiter.
    pub limiter: Arc<WebhookRateLimiter>,
    /// Session factory.
    pub factory: Arc<SessionFactory>,
    /// Bearer-token verifier for the read API.
    pub token_verifier: Arc<dyn TokenVerifier>,
    /// Authorization decisions (cached).
    pub authorizer: Arc<dyn Authorizer>,
    /// Runner callback tokens.
    pub callback_tokens: Arc<CallbackTokenRegistry>,
    /// Runner-pushed session logs.
    pub logs: Arc<SessionLogStore>,
    /// Notification outbox.
    pub outbox: Outbox,
    /// Prometheus metrics.
    pub metrics: SharedMetrics,
}

/// Hand-wired in-process state used by the binary's dev mode and the
/// integration tests: in-memory store, fake orchestrator, static identity.
pub struct InProcess {
    /// The shared state.
    pub state: AppState,
    /// The fake orchestrator behind `state.orchestrator`.
    pub orchestrator: Arc<FakeOrchestrator>,
    /// The static token verifier behind `state.token_verifier`.
    pub token_verifier: Arc<StaticTokenVerifier>,
    /// The static authorizer wrapped by `state.authorizer`.
    pub static_authorizer: Arc<StaticAuthorizer>,
    /// The in-memory secret store behind `state.secrets`.
    pub secrets: Arc<MemorySecretStore>,
    /// Receiver end of the outbox, for wiring a dispatcher.
    pub outbox_rx: tokio::sync::mpsc::UnboundedReceiver<tether_core::notify::Notification>,
}

impl InProcess {
    /// Builds fully in-process state with validators installed.
    ///
    /// # Panics
    ///
    /// Panics if metrics registration fails, which only happens with
    /// duplicate registration in one registry.
    #[must_use]
    pub fn build(factory_config: FactoryConfig) -> Self {
        let sessions = Arc::new(TypedStore::<Session>::new());
        let policies = Arc::new(TypedStore::<NamespacePolicy>::new());
        let registry = Arc::new(FrameworkRegistry::builtin());

        policies.register_hook(Box::new(PolicyValidator));
        SessionValidator::install(&sessions, Arc::clone(&policies), Arc::clone(&registry));

        let orchestrator = Arc::new(FakeOrchestrator::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let token_verifier = Arc::new(StaticTokenVerifier::new());
        let static_authorizer = Arc::new(StaticAuthorizer::new());
        let authorizer: Arc<dyn Authorizer> = Arc::new(CachedAuthorizer::new(SharedAuthorizer(
            Arc::clone(&static_authorizer),
        )));
        let (outbox, outbox_rx) = Outbox::channel();

        let state = AppState {
            sessions: Arc::clone(&sessions),
            policies: Arc::clone(&policies),
            registry,
            orchestrator: Arc::clone(&orchestrator) as Arc<dyn WorkloadApi>,
            secrets: Arc::clone(&secrets) as Arc<dyn SecretStore>,
            audit: Arc::new(AuditLog::new()),
            authenticator: Arc::new(WebhookAuthenticator::new(
                Arc::clone(&policies),
                Arc::clone(&secrets) as Arc<dyn SecretStore>,
            )),
            limiter: Arc::new(WebhookRateLimiter::new()),
            factory: Arc::new(SessionFactory::new(factory_config)),
            token_verifier: Arc::clone(&token_verifier) as Arc<dyn TokenVerifier>,
            authorizer,
            callback_tokens: Arc::new(CallbackTokenRegistry::new()),
            logs: Arc::new(SessionLogStore::new()),
            outbox,
            metrics: Arc::new(MetricsRegistry::new().expect("fresh registry")),
        };

        Self {
            state,
            orchestrator,
            token_verifier,
            static_authorizer,
            secrets,
            outbox_rx,
        }
    }

    /// Registers a static API token for a subject, test convenience.
    pub fn register_token(&self, token: &str, subject: tether_core::auth::Subject) {
        self.token_verifier.insert(token, subject);
    }

    /// Seeds a webhook signature secret for a tenant and returns the
    /// secret-store reference.
    pub fn seed_signature_secret(&self, tenant: &str, source: &str, secret: &str) -> String {
        let reference = format!("tenants/{tenant}/webhooks/{source}");
        self.secrets.insert(&reference, SecretString::from(secret.to_string()));
        reference
    }
}

/// Adapter so a shared [`StaticAuthorizer`] can sit behind the cache.
struct SharedAuthorizer(Arc<StaticAuthorizer>);

#[async_trait::async_trait]
impl Authorizer for SharedAuthorizer {
    async fn allowed(
        &self,
        subject: &tether_core::auth::Subject,
        verb: &str,
        resource: &str,
        tenant: &str,
    ) -> tether_core::Result<bool> {
        self.0.allowed(subject, verb, resource, tenant).await
    }

    async fn permission(
        &self,
        subject: &tether_core::auth::Subject,
        tenant: &str,
    ) -> tether_core::Result<Option<tether_core::auth::Permission>> {
        self.0.permission(subject, tenant).await
    }

    async fn visible_tenants(
        &self,
        subject: &tether_core::auth::Subject,
    ) -> tether_core::Result<Vec<(String, tether_core::auth::Permission)>> {
        self.0.visible_tenants(subject).await
    }
}
