//! Ordered request interceptors.
//!
//! Hooks are registered on a [`HookRegistry`] owned by the client and run
//! around every request attempt. Within a phase they run one at a time, by
//! `order` ascending and registration order for ties.
//!
//! Failures accumulate in [`HookPayload::err`] instead of unwinding: once the
//! list is non-empty the remaining hooks are skipped, except those flagged
//! `handle_errors`, which still run (once each) so they can clean up, log, or
//! ask for a retry.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::executor::{OutboundRequest, Response};
use crate::transaction::{Token, Transaction};

/// Lifecycle point a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeRequest,
    AfterRequest,
}

/// What a hook can put in the error list.
#[derive(Debug, Clone)]
pub enum HookError {
    /// A transaction token requesting retry or abort.
    Control(Token),
    Failure(Error),
}

impl HookError {
    pub fn failure(message: impl Into<String>) -> Self {
        HookError::Failure(Error::hook(message))
    }
}

impl From<Error> for HookError {
    fn from(err: Error) -> Self {
        HookError::Failure(err)
    }
}

/// State handed to every hook of a phase.
#[derive(Debug)]
pub struct HookPayload {
    controller: String,
    transaction: Transaction,
    /// Request about to be sent; before-hooks may rewrite it.
    pub request: OutboundRequest,
    /// Response of the attempt, set for after-hooks when one arrived.
    pub response: Option<Response>,
    /// Errors accumulated during the current phase, oldest first.
    pub err: Vec<HookError>,
}

impl HookPayload {
    pub(crate) fn new(controller: impl Into<String>, request: OutboundRequest, transaction: Transaction) -> Self {
        Self {
            controller: controller.into(),
            transaction,
            request,
            response: None,
            err: Vec::new(),
        }
    }

    /// Name of the controller being executed.
    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Zero-based attempt number.
    pub fn attempt(&self) -> i64 {
        self.transaction.retries()
    }

    /// Ask the executor to run the operation again.
    pub fn retry(&mut self) {
        self.err.push(HookError::Control(self.transaction.retry_token()));
    }

    /// Ask the executor to give up on the operation.
    pub fn abort(&mut self) {
        self.err.push(HookError::Control(self.transaction.abort_token()));
    }

    pub fn has_errors(&self) -> bool {
        !self.err.is_empty()
    }

    /// The most recent failure that is not a control token.
    pub fn last_failure(&self) -> Option<&Error> {
        self.err.iter().rev().find_map(|err| match err {
            HookError::Failure(e) => Some(e),
            HookError::Control(_) => None,
        })
    }
}

/// Hook logic. Any `Fn(&mut HookPayload) -> Result<(), HookError>` closure
/// is a handler; implement the trait directly for async work.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn call(&self, payload: &mut HookPayload) -> Result<(), HookError>;
}

#[async_trait]
impl<F> HookHandler for F
where
    F: Fn(&mut HookPayload) -> Result<(), HookError> + Send + Sync + 'static,
{
    async fn call(&self, payload: &mut HookPayload) -> Result<(), HookError> {
        self(payload)
    }
}

/// A registered interceptor. Identity is the `Arc` it is registered as.
pub struct Hook {
    phase: Phase,
    order: i32,
    handle_errors: bool,
    controller: Option<String>,
    handler: Box<dyn HookHandler>,
}

impl Hook {
    pub fn new(phase: Phase, handler: impl HookHandler + 'static) -> Self {
        Self {
            phase,
            order: 0,
            handle_errors: true,
            controller: None,
            handler: Box::new(handler),
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn handle_errors(mut self, handle_errors: bool) -> Self {
        self.handle_errors = handle_errors;
        self
    }

    /// Restrict the hook to one controller.
    pub fn controller(mut self, name: impl Into<String>) -> Self {
        self.controller = Some(name.into());
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn priority(&self) -> i32 {
        self.order
    }

    pub fn handles_errors(&self) -> bool {
        self.handle_errors
    }

    fn applies_to(&self, phase: Phase, controller: &str) -> bool {
        self.phase == phase && self.controller.as_deref().map_or(true, |name| name == controller)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("phase", &self.phase)
            .field("order", &self.order)
            .field("handle_errors", &self.handle_errors)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

/// Process-lifetime store of hooks, shared by every executor of a client.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook. Registering the same `Arc` twice is an error.
    pub fn register(&self, hook: Arc<Hook>) -> Result<()> {
        let mut hooks = self.hooks.write();
        if hooks.iter().any(|existing| Arc::ptr_eq(existing, &hook)) {
            return Err(Error::DuplicateHook);
        }
        hooks.push(hook);
        Ok(())
    }

    /// Remove a hook; returns whether it was registered.
    pub fn unregister(&self, hook: &Arc<Hook>) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|existing| !Arc::ptr_eq(existing, hook));
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Hooks of a phase applicable to a controller, in execution order.
    pub fn for_phase(&self, phase: Phase, controller: &str) -> Vec<Arc<Hook>> {
        let mut hooks: Vec<Arc<Hook>> = self
            .hooks
            .read()
            .iter()
            .filter(|hook| hook.applies_to(phase, controller))
            .cloned()
            .collect();
        // stable: ties keep registration order
        hooks.sort_by_key(|hook| hook.order);
        hooks
    }

    /// Run the hook chain of a phase against a payload.
    ///
    /// Returns `Err(ExecutionAborted)` only when a hook fails with the
    /// transaction's abort token; every other failure is left in
    /// `payload.err` for the executor to judge.
    pub async fn run_phase(&self, phase: Phase, payload: &mut HookPayload) -> Result<()> {
        let hooks = self.for_phase(phase, payload.controller());
        let mut executed = vec![false; hooks.len()];

        for (index, hook) in hooks.iter().enumerate() {
            if payload.has_errors() {
                break;
            }

            executed[index] = true;
            if let Err(err) = hook.handler.call(payload).await {
                if payload.transaction().is_abort(&err) {
                    tracing::debug!(controller = payload.controller(), ?phase, "hook aborted execution");
                    return Err(Error::ExecutionAborted);
                }
                payload.err.push(err);
                break;
            }
        }

        if !payload.has_errors() {
            return Ok(());
        }

        for (index, hook) in hooks.iter().enumerate() {
            if executed[index] || !hook.handle_errors {
                continue;
            }

            executed[index] = true;
            if let Err(err) = hook.handler.call(payload).await {
                payload.err.push(err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::OutboundRequest;
    use modelsync_shared::HttpMethod;
    use parking_lot::Mutex;

    fn payload(controller: &str) -> HookPayload {
        let request = OutboundRequest::new(HttpMethod::Get, "https://api.example.com/".parse().unwrap());
        HookPayload::new(controller, request, Transaction::new())
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl HookHandler + 'static {
        let log = log.clone();
        move |_: &mut HookPayload| -> Result<(), HookError> {
            log.lock().push(name);
            Ok(())
        }
    }

    fn failing(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl HookHandler + 'static {
        let log = log.clone();
        move |_: &mut HookPayload| -> Result<(), HookError> {
            log.lock().push(name);
            Err(HookError::failure(name))
        }
    }

    #[tokio::test]
    async fn hooks_run_by_order_then_registration() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "five")).order(5))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "one")).order(1))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "three")).order(3))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "three-b")).order(3))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::AfterRequest, recorder(&log, "after")))).unwrap();

        let mut payload = payload("posts.list");
        registry.run_phase(Phase::BeforeRequest, &mut payload).await.unwrap();

        assert_eq!(*log.lock(), vec!["one", "three", "three-b", "five"]);
        assert!(!payload.has_errors());
    }

    #[tokio::test]
    async fn error_handling_hooks_run_once_after_failure() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "first")).order(0))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, failing(&log, "boom")).order(1))).unwrap();
        registry
            .register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "skipped")).order(2).handle_errors(false)))
            .unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, failing(&log, "cleanup-fails")).order(3))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "cleanup")).order(4))).unwrap();

        let mut payload = payload("posts.list");
        registry.run_phase(Phase::BeforeRequest, &mut payload).await.unwrap();

        assert_eq!(*log.lock(), vec!["first", "boom", "cleanup-fails", "cleanup"]);
        assert_eq!(payload.err.len(), 2);
        assert!(matches!(payload.last_failure(), Some(Error::Hook(msg)) if msg == "cleanup-fails"));
    }

    #[tokio::test]
    async fn pushed_errors_skip_plain_hooks() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let pusher = {
            let log = log.clone();
            move |payload: &mut HookPayload| -> Result<(), HookError> {
                log.lock().push("pusher");
                payload.retry();
                Ok(())
            }
        };
        registry.register(Arc::new(Hook::new(Phase::AfterRequest, pusher))).unwrap();
        registry
            .register(Arc::new(Hook::new(Phase::AfterRequest, recorder(&log, "plain")).order(1).handle_errors(false)))
            .unwrap();

        let mut payload = payload("posts.list");
        registry.run_phase(Phase::AfterRequest, &mut payload).await.unwrap();

        assert_eq!(*log.lock(), vec!["pusher"]);
        assert!(payload.transaction().is_retry(&payload.err[0]));
    }

    #[tokio::test]
    async fn thrown_abort_stops_the_chain() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let aborter = |payload: &mut HookPayload| -> Result<(), HookError> {
            Err(HookError::Control(payload.transaction().abort_token()))
        };
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, aborter))).unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "cleanup")).order(1))).unwrap();

        let mut payload = payload("posts.list");
        let result = registry.run_phase(Phase::BeforeRequest, &mut payload).await;

        assert!(matches!(result, Err(Error::ExecutionAborted)));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn controller_scoped_hooks() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry
            .register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "scoped")).controller("posts.create")))
            .unwrap();
        registry.register(Arc::new(Hook::new(Phase::BeforeRequest, recorder(&log, "global")))).unwrap();

        registry.run_phase(Phase::BeforeRequest, &mut payload("posts.list")).await.unwrap();
        registry.run_phase(Phase::BeforeRequest, &mut payload("posts.create")).await.unwrap();

        assert_eq!(*log.lock(), vec!["global", "scoped", "global"]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = HookRegistry::new();
        let hook = Arc::new(Hook::new(Phase::BeforeRequest, |_: &mut HookPayload| -> Result<(), HookError> { Ok(()) }));

        registry.register(hook.clone()).unwrap();
        assert!(matches!(registry.register(hook.clone()), Err(Error::DuplicateHook)));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&hook));
        assert!(!registry.unregister(&hook));
        assert!(registry.is_empty());
    }
}
