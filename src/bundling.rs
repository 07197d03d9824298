//! Request bundling.
//!
//! Concurrent requests that agree on a set of discriminator fields are
//! coalesced into one underlying call: their repeated "bundled" fields are
//! concatenated, the combined request is issued once, and the response is
//! handed back to every contributor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{ApiCallFn, GaxError, OngoingCall, Result};

/// Thresholds and limits of a bundling method. Zero means "not set".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleOptions {
    /// Flush once a task holds this many elements.
    pub element_count_threshold: usize,
    /// Flush once a task holds this many bytes.
    pub request_byte_threshold: usize,
    /// Hard cap on elements in one underlying request.
    pub element_count_limit: usize,
    /// Hard cap on bytes in one underlying request.
    pub request_byte_limit: usize,
    /// Flush this long after a task's first element. Zero flushes on the next
    /// runtime turn, so back-to-back requests still share a task.
    pub delay_threshold_millis: u64,
}

/// Measures one bundled element.
pub type ByteLengthFn = Arc<dyn Fn(&Value) -> usize + Send + Sync>;

/// How requests of one method are bundled.
#[derive(Clone)]
pub struct BundleDescriptor {
    /// Repeated field whose elements are concatenated.
    pub bundled_field: String,
    /// Dot-separated paths; requests agreeing on all of them share a bundle.
    pub request_discriminator_fields: Vec<String>,
    /// Repeated response field sliced back per contributor, if any.
    pub subresponse_field: Option<String>,
    pub byte_length_fn: ByteLengthFn,
}

impl fmt::Debug for BundleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleDescriptor")
            .field("bundled_field", &self.bundled_field)
            .field("request_discriminator_fields", &self.request_discriminator_fields)
            .field("subresponse_field", &self.subresponse_field)
            .finish_non_exhaustive()
    }
}

impl BundleDescriptor {
    /// Elements are measured by their serialized JSON length.
    pub fn new<I, S>(bundled_field: impl Into<String>, request_discriminator_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bundled_field: bundled_field.into(),
            request_discriminator_fields: request_discriminator_fields
                .into_iter()
                .map(Into::into)
                .collect(),
            subresponse_field: None,
            byte_length_fn: Arc::new(|element| element.to_string().len()),
        }
    }

    pub fn with_subresponse_field(mut self, field: impl Into<String>) -> Self {
        self.subresponse_field = Some(field.into());
        self
    }

    pub fn with_byte_length_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> usize + Send + Sync + 'static,
    {
        self.byte_length_fn = Arc::new(f);
        self
    }
}

/// Looks up a dot-separated field path.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |value, key| value.get(key))
}

/// Bundle id of `request`, or `None` when no discriminator field is present.
/// Missing fields contribute `null`.
pub(crate) fn compute_bundle_id(request: &Value, fields: &[String]) -> Option<String> {
    let mut found = false;
    let ids: Vec<Value> = fields
        .iter()
        .map(|field| match lookup(request, field) {
            Some(value) => {
                found = true;
                value.clone()
            }
            None => Value::Null,
        })
        .collect();
    found.then(|| Value::Array(ids).to_string())
}

struct Contribution {
    id: u64,
    request: Value,
    elements: Vec<Value>,
    bytes: usize,
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending aggregation bucket of one bundle id.
struct Task {
    api_call: ApiCallFn,
    contributions: Vec<Contribution>,
    element_count: usize,
    byte_count: usize,
}

impl Task {
    fn new(api_call: ApiCallFn) -> Self {
        Self {
            api_call,
            contributions: Vec::new(),
            element_count: 0,
            byte_count: 0,
        }
    }
}

struct Part {
    id: u64,
    start: usize,
    end: usize,
    tx: Option<oneshot::Sender<Result<Value>>>,
    cancelled: bool,
}

/// A flushed task waiting for its shared response.
struct RunningTask {
    parts: Vec<Part>,
    cancel: CancellationToken,
}

impl RunningTask {
    fn cancel(&mut self, id: u64) {
        if let Some(part) = self.parts.iter_mut().find(|part| part.id == id) {
            part.cancelled = true;
        }
        if self.parts.iter().all(|part| part.cancelled) {
            self.cancel.cancel();
        }
    }

    fn deliver(&mut self, result: &Result<Value>, subresponse_field: Option<&str>) {
        for part in &mut self.parts {
            let Some(tx) = part.tx.take() else {
                continue;
            };
            let outcome = match result {
                _ if part.cancelled => Err(GaxError::cancelled()),
                Ok(response) => Ok(slice_response(response, subresponse_field, part.start, part.end)),
                Err(err) => Err(err.clone()),
            };
            let _ = tx.send(outcome);
        }
    }
}

fn slice_response(response: &Value, field: Option<&str>, start: usize, end: usize) -> Value {
    let mut copy = response.clone();
    if let Some(field) = field {
        if let Some(Value::Array(items)) = copy.get_mut(field) {
            let end = end.min(items.len());
            let start = start.min(end);
            let kept: Vec<Value> = items.drain(start..end).collect();
            *items = kept;
        }
    }
    copy
}

enum Location {
    Pending(String),
    Running(Arc<Mutex<RunningTask>>),
}

#[derive(Default)]
struct State {
    next_id: u64,
    tasks: HashMap<String, Task>,
    /// Running flush timers, tagged with a generation so a stale timer never
    /// flushes a task created after it was aborted.
    timers: HashMap<String, (u64, JoinHandle<()>)>,
    invocations: HashMap<u64, Location>,
}

struct Inner {
    options: BundleOptions,
    descriptor: BundleDescriptor,
    state: Mutex<State>,
}

/// Groups requests of one bundling method into shared underlying calls.
#[derive(Clone)]
pub struct BundleExecutor {
    inner: Arc<Inner>,
}

impl fmt::Debug for BundleExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BundleExecutor")
            .field("options", &self.inner.options)
            .field("descriptor", &self.inner.descriptor)
            .field("pending_bundles", &state.tasks.len())
            .finish()
    }
}

impl BundleExecutor {
    pub fn new(options: BundleOptions, descriptor: BundleDescriptor) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                descriptor,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn options(&self) -> &BundleOptions {
        &self.inner.options
    }

    /// Schedules `request` for bundling through `api_call`.
    ///
    /// A request that alone exceeds a hard limit fails with INVALID_ARGUMENT
    /// without touching `api_call`. Requests that cannot be bundled are
    /// issued directly.
    pub fn schedule(&self, api_call: ApiCallFn, request: Value) -> Result<OngoingCall> {
        let descriptor = &self.inner.descriptor;
        let Some(bundle_id) = compute_bundle_id(&request, &descriptor.request_discriminator_fields)
        else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                fields = ?descriptor.request_discriminator_fields,
                "no discriminator field in request; calling without bundling"
            );
            return Ok(OngoingCall::spawn(api_call(request)));
        };
        let elements = match request.get(&descriptor.bundled_field) {
            Some(Value::Array(elements)) => elements.clone(),
            _ => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    field = %descriptor.bundled_field,
                    "bundled field missing from request; calling without bundling"
                );
                return Ok(OngoingCall::spawn(api_call(request)));
            }
        };

        let options = &self.inner.options;
        let count = elements.len();
        let bytes: usize = elements.iter().map(|element| (descriptor.byte_length_fn)(element)).sum();
        if options.element_count_limit > 0 && count > options.element_count_limit {
            return Err(GaxError::invalid_argument(format!(
                "The number of elements {count} exceeds the limit {}",
                options.element_count_limit
            )));
        }
        if options.request_byte_limit > 0 && bytes > options.request_byte_limit {
            return Err(GaxError::invalid_argument(format!(
                "The required bytes {bytes} exceeds the limit {}",
                options.request_byte_limit
            )));
        }

        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let overflows = state.tasks.get(&bundle_id).is_some_and(|task| {
            (options.element_count_limit > 0
                && task.element_count + count >= options.element_count_limit)
                || (options.request_byte_limit > 0
                    && task.byte_count + bytes >= options.request_byte_limit)
        });
        if overflows {
            self.run_locked(&mut state, &bundle_id);
        }

        let task = state
            .tasks
            .entry(bundle_id.clone())
            .or_insert_with(|| Task::new(api_call));
        task.element_count += count;
        task.byte_count += bytes;
        task.contributions.push(Contribution {
            id,
            request,
            elements,
            bytes,
            tx,
        });
        let reached_threshold = (options.element_count_threshold > 0
            && task.element_count >= options.element_count_threshold)
            || (options.request_byte_threshold > 0
                && task.byte_count >= options.request_byte_threshold);
        state
            .invocations
            .insert(id, Location::Pending(bundle_id.clone()));

        if reached_threshold {
            self.run_locked(&mut state, &bundle_id);
        } else if !state.timers.contains_key(&bundle_id) {
            let generation = state.next_id;
            state.next_id += 1;
            let timer = self.start_timer(bundle_id.clone(), generation);
            state.timers.insert(bundle_id, (generation, timer));
        }
        drop(state);

        let executor = self.clone();
        Ok(OngoingCall::new(rx, move || executor.cancel(id)))
    }

    /// Flushes every pending task.
    pub fn flush_all(&self) {
        let mut state = self.inner.state.lock();
        let bundle_ids: Vec<String> = state.tasks.keys().cloned().collect();
        for bundle_id in bundle_ids {
            self.run_locked(&mut state, &bundle_id);
        }
    }

    fn start_timer(&self, bundle_id: String, generation: u64) -> JoinHandle<()> {
        let executor = self.clone();
        let delay = Duration::from_millis(self.inner.options.delay_threshold_millis);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = executor.inner.state.lock();
            if !matches!(state.timers.get(&bundle_id), Some((current, _)) if *current == generation) {
                return;
            }
            state.timers.remove(&bundle_id);
            executor.run_locked(&mut state, &bundle_id);
        })
    }

    /// Issues the pending task of `bundle_id`, if any. Called with the state
    /// lock held.
    fn run_locked(&self, state: &mut State, bundle_id: &str) {
        if let Some((_, timer)) = state.timers.remove(bundle_id) {
            timer.abort();
        }
        let Some(task) = state.tasks.remove(bundle_id) else {
            return;
        };
        let Some(first) = task.contributions.first() else {
            return;
        };

        let mut request = first.request.clone();
        let mut elements = Vec::with_capacity(task.element_count);
        let mut parts = Vec::with_capacity(task.contributions.len());
        for contribution in task.contributions {
            let start = elements.len();
            elements.extend(contribution.elements);
            parts.push(Part {
                id: contribution.id,
                start,
                end: elements.len(),
                tx: Some(contribution.tx),
                cancelled: false,
            });
        }
        if let Some(object) = request.as_object_mut() {
            object.insert(self.inner.descriptor.bundled_field.clone(), Value::Array(elements));
        }

        let ids: Vec<u64> = parts.iter().map(|part| part.id).collect();
        let cancel = CancellationToken::new();
        let running = Arc::new(Mutex::new(RunningTask {
            parts,
            cancel: cancel.clone(),
        }));
        for id in &ids {
            state
                .invocations
                .insert(*id, Location::Running(Arc::clone(&running)));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            bundle = %bundle_id,
            elements = request[&self.inner.descriptor.bundled_field].as_array().map_or(0, Vec::len),
            callers = ids.len(),
            "flushing bundle"
        );
        let call = (task.api_call)(request);
        let executor = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(GaxError::cancelled()),
                result = call.fuse() => result,
            };
            {
                let mut state = executor.inner.state.lock();
                for id in &ids {
                    state.invocations.remove(id);
                }
            }
            let subresponse_field = executor.inner.descriptor.subresponse_field.as_deref();
            running.lock().deliver(&result, subresponse_field);
        });
    }

    fn cancel(&self, id: u64) {
        let mut state = self.inner.state.lock();
        let running = match state.invocations.get(&id) {
            Some(Location::Pending(bundle_id)) => {
                let bundle_id = bundle_id.clone();
                state.invocations.remove(&id);
                Self::cancel_pending(&mut state, &bundle_id, id);
                return;
            }
            Some(Location::Running(running)) => Arc::clone(running),
            None => return,
        };
        drop(state);
        running.lock().cancel(id);
    }

    fn cancel_pending(state: &mut State, bundle_id: &str, id: u64) {
        let Some(task) = state.tasks.get_mut(bundle_id) else {
            return;
        };
        if let Some(position) = task.contributions.iter().position(|c| c.id == id) {
            let contribution = task.contributions.remove(position);
            task.element_count -= contribution.elements.len();
            task.byte_count -= contribution.bytes;
            let _ = contribution.tx.send(Err(GaxError::cancelled()));
        }
        if task.contributions.is_empty() {
            state.tasks.remove(bundle_id);
            if let Some((_, timer)) = state.timers.remove(bundle_id) {
                timer.abort();
            }
        }
    }
}
