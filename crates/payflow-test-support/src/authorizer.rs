//! Authorizer doubles: a scripted acquirer and a fixed-outcome gateway.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use payflow_core::authorizer::{
    AuthorizationGateway, AuthorizationOutcome, AuthorizationRequest, Authorizer,
    AuthorizerDecision, AuthorizerError,
};

/// One scripted acquirer reaction.
#[derive(Debug, Clone)]
pub enum Step {
    /// Approve with an NSU derived from the call number.
    Approve,
    /// Decline with the given reason.
    Deny(String),
    /// Fail with the given error.
    Fail(AuthorizerError),
    /// Sleep for the given duration, then approve. Used to simulate a hung
    /// acquirer against the wrapper's timeout.
    Stall(Duration),
}

/// An acquirer that plays back a queue of steps, then repeats a fallback
/// step forever. Records every request and the peak number of concurrent
/// calls.
#[derive(Debug)]
pub struct ScriptedAuthorizer {
    steps: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    requests: Mutex<Vec<AuthorizationRequest>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedAuthorizer {
    /// Plays `steps` in order, then approves every further call.
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Mutex::new(Step::Approve),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Repeats `step` for every call.
    #[must_use]
    pub fn always(step: Step) -> Self {
        let authorizer = Self::new(Vec::new());
        authorizer.set_fallback(step);
        authorizer
    }

    /// Replaces the step used once the script is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_fallback(&self, step: Step) {
        *self.fallback.lock().unwrap() = step;
    }

    /// Number of calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn requests(&self) -> Vec<AuthorizationRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let scripted = self.steps.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizerDecision, AuthorizerError> {
        let call_number = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let approve = || AuthorizerDecision::Approved {
            nsu: format!("{call_number:06}"),
            authorization_code: format!("AUTH{call_number}"),
        };

        match self.next_step() {
            Step::Approve => Ok(approve()),
            Step::Deny(reason) => Ok(AuthorizerDecision::Denied { reason }),
            Step::Fail(error) => Err(error),
            Step::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(approve())
            }
        }
    }
}

/// A gateway that answers every call with the same configurable outcome.
#[derive(Debug)]
pub struct StaticGateway {
    outcome: Mutex<AuthorizationOutcome>,
    requests: Mutex<Vec<AuthorizationRequest>>,
}

impl StaticGateway {
    /// Answers every call with `outcome`.
    #[must_use]
    pub fn new(outcome: AuthorizationOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Approves every call with a fixed NSU and code.
    #[must_use]
    pub fn approving() -> Self {
        Self::new(AuthorizationOutcome::Authorized {
            nsu: "000001".into(),
            authorization_code: "AUTH1".into(),
        })
    }

    /// Changes the outcome returned by later calls.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_outcome(&self, outcome: AuthorizationOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    /// Snapshot of every request received.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn requests(&self) -> Vec<AuthorizationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorizationGateway for StaticGateway {
    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationOutcome {
        self.requests.lock().unwrap().push(request.clone());
        self.outcome.lock().unwrap().clone()
    }
}
