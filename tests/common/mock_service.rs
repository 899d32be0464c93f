// Scripted in-process inference services
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use capability_orchestrator::backend::{BackendError, InferenceBackend, InferenceRequest};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

/// What a call answers once the scripted failures are used up
#[derive(Debug, Clone)]
pub enum Reply {
    /// `{<output>: "<output>(<input values sorted by param>)"}`
    Echo,
    /// A fixed payload
    Payload(Map<String, Value>),
    /// Always fail
    Fail(BackendError),
    /// Never answer
    Hang,
}

#[derive(Debug)]
pub struct MockService {
    name: String,
    reply: Reply,
    failures: Mutex<VecDeque<BackendError>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl MockService {
    pub fn new(name: &str, reply: Reply) -> Self {
        Self {
            name: name.to_string(),
            reply,
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn echo(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name, Reply::Echo))
    }

    pub fn failing(name: &str, error: BackendError) -> Arc<Self> {
        Arc::new(Self::new(name, Reply::Fail(error)))
    }

    /// Fail with each error in turn before answering
    pub fn with_failures(mut self, errors: Vec<BackendError>) -> Self {
        self.failures = Mutex::new(errors.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().clone()
    }

    fn echo_payload(request: &InferenceRequest) -> Map<String, Value> {
        let mut params: Vec<(&String, &Value)> = request.inputs.iter().collect();
        params.sort_by(|a, b| a.0.cmp(b.0));
        let args: Vec<String> = params
            .into_iter()
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let mut payload = Map::new();
        payload.insert(
            request.output.clone(),
            json!(format!("{}({})", request.output, args.join(","))),
        );
        payload
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceBackend for MockService {
    async fn invoke(&self, request: InferenceRequest) -> Result<Map<String, Value>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.failures.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        match &self.reply {
            Reply::Echo => Ok(Self::echo_payload(&request)),
            Reply::Payload(payload) => Ok(payload.clone()),
            Reply::Fail(err) => Err(err.clone()),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn unavailable() -> BackendError {
    BackendError::Status {
        status: 503,
        message: "service unavailable".to_string(),
    }
}

pub fn bad_request() -> BackendError {
    BackendError::Status {
        status: 400,
        message: "bad request".to_string(),
    }
}
