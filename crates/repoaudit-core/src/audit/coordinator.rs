use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::sync::Arc;
use std::thread;

use serde_json::{Deserializer, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{Id, JoinSet};
use tracing::{debug, instrument, warn};

use super::{check::Checker, extract::RuleSet, PolicyBackend, Properties, Report};
use crate::error::{AuditError, AuditResult};
use crate::provider::{self, Provider};

/// Default bound on concurrently running rule checks.
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// Decoded records not yet picked up by the auditor.
const INPUT_BUFFER: usize = 32;

/// Input records decoded in the background, in stream order.
pub type InputStream = mpsc::Receiver<AuditResult<Value>>;

/// Fans inputs out to one check task per applicable rule and collects the
/// results into one report per input.
pub struct Auditor<B: ?Sized> {
    checker: Checker<B>,
    rules: Arc<RuleSet>,
    providers: Arc<[Arc<dyn Provider>]>,
    namespace_override: Option<String>,
    limiter: Arc<Semaphore>,
}

impl<B: ?Sized> Clone for Auditor<B> {
    fn clone(&self) -> Self {
        Self {
            checker: self.checker.clone(),
            rules: Arc::clone(&self.rules),
            providers: Arc::clone(&self.providers),
            namespace_override: self.namespace_override.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<B> Auditor<B>
where
    B: PolicyBackend + ?Sized + 'static,
{
    pub fn new(backend: Arc<B>, rules: RuleSet, providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            checker: Checker::new(backend),
            rules: Arc::new(rules),
            providers: providers.into(),
            namespace_override: None,
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
        }
    }

    /// Skip namespace detection and audit every input under `namespace`.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace_override = namespace;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Audit one input record against the rules of its namespace.
    #[instrument(skip_all)]
    pub async fn audit(&self, input: Value) -> AuditResult<Report> {
        let namespace = self.resolve_namespace(&input)?;
        let properties = self.properties(&namespace, &input)?;
        let rules = self.rules.rules_for(&namespace);
        debug!(%namespace, rules = rules.len(), "auditing input");

        let mut report = Report::with_rules(rules.iter().cloned(), properties);
        let input = Arc::new(input);
        let mut tasks = JoinSet::new();
        for rule in rules {
            let checker = self.checker.clone();
            let input = Arc::clone(&input);
            let limiter = Arc::clone(&self.limiter);
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                checker.check(&rule, &input).await
            });
        }

        // Drain every task before returning so no result lands after the report is handed off.
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(AuditError::from).and_then(|result| result) {
                Ok(result) => report.add_result(result)?,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Audit every input concurrently. Reports come back in input order; a
    /// failing input does not affect its siblings.
    #[instrument(skip_all, fields(inputs = inputs.len()))]
    pub async fn audit_batch(&self, inputs: Vec<Value>) -> Vec<AuditResult<Report>> {
        let mut batch = Batch::default();
        for input in inputs {
            batch.spawn(self, input);
        }
        batch.collect().await
    }

    /// Audit records as they arrive from `inputs`, starting each audit
    /// without waiting for the rest of the stream.
    ///
    /// A decode error is fatal: in-flight audits are cancelled and the error
    /// is returned. Otherwise reports come back in stream order.
    #[instrument(skip_all)]
    pub async fn audit_stream(
        &self,
        mut inputs: InputStream,
    ) -> AuditResult<Vec<AuditResult<Report>>> {
        let mut batch = Batch::default();
        while let Some(input) = inputs.recv().await {
            batch.spawn(self, input?);
        }
        debug!(inputs = batch.len(), "input stream finished");
        Ok(batch.collect().await)
    }

    fn resolve_namespace(&self, input: &Value) -> AuditResult<String> {
        if let Some(namespace) = &self.namespace_override {
            return Ok(namespace.clone());
        }
        provider::derive_namespace(&self.providers, input).map(|derivation| derivation.namespace)
    }

    fn properties(&self, namespace: &str, input: &Value) -> AuditResult<Properties> {
        match provider::derive_properties(&self.providers, namespace, input) {
            Ok(properties) => Ok(properties),
            Err(err) if err.is_recoverable() => {
                warn!(%namespace, error = %err, "continuing without report properties");
                Ok(Properties::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// In-flight audits of one batch, each remembering its input position.
#[derive(Default)]
struct Batch {
    tasks: JoinSet<AuditResult<Report>>,
    positions: HashMap<Id, usize>,
}

impl Batch {
    fn spawn<B>(&mut self, auditor: &Auditor<B>, input: Value)
    where
        B: PolicyBackend + ?Sized + 'static,
    {
        let auditor = auditor.clone();
        let position = self.positions.len();
        let handle = self.tasks.spawn(async move { auditor.audit(input).await });
        self.positions.insert(handle.id(), position);
    }

    fn len(&self) -> usize {
        self.positions.len()
    }

    async fn collect(mut self) -> Vec<AuditResult<Report>> {
        let mut slots: Vec<Option<AuditResult<Report>>> = (0..self.len()).map(|_| None).collect();
        while let Some(joined) = self.tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(err) => {
                    warn!(error = %err, "input task failed");
                    (err.id(), Err(AuditError::from(err)))
                }
            };
            if let Some(&position) = self.positions.get(&id) {
                slots[position] = Some(outcome);
            }
        }
        // Every spawned task has been joined, so every slot is filled.
        slots.into_iter().flatten().collect()
    }
}

/// Decode a stream of JSON values into input records.
///
/// Objects are taken as-is and arrays contribute each element; any other
/// top-level value is ignored.
pub fn decode_inputs(bytes: &[u8]) -> AuditResult<Vec<Value>> {
    let mut inputs = Vec::new();
    for value in Deserializer::from_slice(bytes).into_iter::<Value>() {
        inputs.extend(records(value.map_err(|err| AuditError::InvalidInput(err.to_string()))?));
    }
    Ok(inputs)
}

/// Decode `reader` on a dedicated thread, handing each record over as soon
/// as its top-level value is complete.
///
/// The stream ends after the first decode error, which is sent as
/// [`AuditError::InvalidInput`]. Dropping the receiver stops the decoder.
pub fn spawn_decoder<R>(reader: R) -> AuditResult<InputStream>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    // A plain thread rather than `spawn_blocking`: a reader parked on stdin
    // must not keep the runtime from shutting down.
    thread::Builder::new()
        .name("input-decoder".to_string())
        .spawn(move || {
            let values = Deserializer::from_reader(BufReader::new(reader)).into_iter::<Value>();
            for value in values {
                let value = match value {
                    Ok(value) => value,
                    Err(err) => {
                        let _ = tx.blocking_send(Err(AuditError::InvalidInput(err.to_string())));
                        return;
                    }
                };
                for record in records(value) {
                    if tx.blocking_send(Ok(record)).is_err() {
                        return;
                    }
                }
            }
        })
        .map_err(|err| AuditError::InvalidInput(format!("failed to start input decoder: {err}")))?;
    Ok(rx)
}

fn records(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            debug!(value = %other, "ignoring non-object input");
            Vec::new()
        }
    }
}
