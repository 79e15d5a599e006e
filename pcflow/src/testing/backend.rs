//! A container backend driven by scripted status sequences.

use crate::container::{ContainerBackend, StartRequest};
use crate::core::{ContainerInstance, ContainerStatus};
use crate::errors::ContainerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// In-memory backend whose containers walk through scripted statuses.
///
/// Every poll of a container pops the next status of its script; the last
/// status repeats forever. Containers started without a script complete on
/// their first poll.
///
/// Started containers are named `{binary with '/' as '-'}-{n}` and get the
/// address `10.0.0.{n}`, with `n` counting from 1 across all starts.
#[derive(Debug)]
pub struct ScriptedContainerBackend {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    scripts: HashMap<String, VecDeque<ContainerStatus>>,
    known: HashMap<String, ContainerInstance>,
    binary_scripts: HashMap<String, VecDeque<Vec<ContainerStatus>>>,
    default_script: Vec<ContainerStatus>,
    throttled_starts: usize,
    failing_binaries: HashSet<String>,
    start_attempts: usize,
    starts: Vec<StartRequest>,
    poll_counts: HashMap<String, usize>,
    stopped: Vec<String>,
    next_id: usize,
}

impl Default for ScriptedContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedContainerBackend {
    /// Creates a backend where every container completes on its first poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                scripts: HashMap::new(),
                known: HashMap::new(),
                binary_scripts: HashMap::new(),
                default_script: vec![ContainerStatus::Completed],
                throttled_starts: 0,
                failing_binaries: HashSet::new(),
                start_attempts: 0,
                starts: Vec::new(),
                poll_counts: HashMap::new(),
                stopped: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Script used for containers with no specific script.
    #[must_use]
    pub fn with_default_script(self, statuses: Vec<ContainerStatus>) -> Self {
        self.state.lock().default_script = statuses;
        self
    }

    /// Scripts the polls of a container id, started or not.
    pub fn script_container(&self, id: &str, statuses: Vec<ContainerStatus>) {
        self.state
            .lock()
            .scripts
            .insert(id.to_string(), statuses.into());
    }

    /// Scripts the next containers started for `binary`, one script each in
    /// start order.
    pub fn script_binary(&self, binary: &str, scripts: Vec<Vec<ContainerStatus>>) {
        self.state
            .lock()
            .binary_scripts
            .entry(binary.to_string())
            .or_default()
            .extend(scripts);
    }

    /// Makes the next `n` start calls fail with a throttling error.
    pub fn throttle_next_starts(&self, n: usize) {
        self.state.lock().throttled_starts = n;
    }

    /// Makes every start of `binary` fail with a backend error.
    pub fn fail_starts_for(&self, binary: &str) {
        self.state.lock().failing_binaries.insert(binary.to_string());
    }

    /// Successful start requests, in order.
    #[must_use]
    pub fn starts(&self) -> Vec<StartRequest> {
        self.state.lock().starts.clone()
    }

    /// Binaries of successful starts, in order.
    #[must_use]
    pub fn started_binaries(&self) -> Vec<String> {
        self.state
            .lock()
            .starts
            .iter()
            .map(|r| r.binary_name.clone())
            .collect()
    }

    /// Start calls made, including rejected ones.
    #[must_use]
    pub fn start_attempts(&self) -> usize {
        self.state.lock().start_attempts
    }

    /// Times a container id was polled.
    #[must_use]
    pub fn poll_count(&self, id: &str) -> usize {
        self.state.lock().poll_counts.get(id).copied().unwrap_or(0)
    }

    /// Ids passed to `stop`, in order.
    #[must_use]
    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }
}

#[async_trait]
impl ContainerBackend for ScriptedContainerBackend {
    async fn start_containers(
        &self,
        request: &StartRequest,
    ) -> Result<Vec<ContainerInstance>, ContainerError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.start_attempts += 1;

        if state.throttled_starts > 0 {
            state.throttled_starts -= 1;
            return Err(ContainerError::throttled("scripted throttling"));
        }
        if state.failing_binaries.contains(&request.binary_name) {
            return Err(ContainerError::backend(format!(
                "scripted start failure for {}",
                request.binary_name
            )));
        }

        let prefix = request.binary_name.replace('/', "-");
        let mut containers = Vec::with_capacity(request.cmd_args.len());
        for _ in &request.cmd_args {
            state.next_id += 1;
            let n = state.next_id;
            let container = ContainerInstance::new(format!("{prefix}-{n}"), ContainerStatus::Started)
                .with_ip(format!("10.0.0.{n}"));

            let script = state
                .binary_scripts
                .get_mut(&request.binary_name)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| state.default_script.clone());
            state.scripts.entry(container.id.clone()).or_insert_with(|| script.into());
            state.known.insert(container.id.clone(), container.clone());
            containers.push(container);
        }

        state.starts.push(request.clone());
        Ok(containers)
    }

    async fn poll(&self, ids: &[String]) -> Result<Vec<ContainerInstance>, ContainerError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut polled = Vec::with_capacity(ids.len());

        for id in ids {
            let next = match state.scripts.get_mut(id) {
                Some(script) if script.len() > 1 => script.pop_front(),
                Some(script) => script.front().copied(),
                None => state.known.get(id).map(|c| c.status),
            };
            let Some(status) = next else {
                continue;
            };

            *state.poll_counts.entry(id.clone()).or_insert(0) += 1;
            let container = state
                .known
                .entry(id.clone())
                .or_insert_with(|| ContainerInstance::new(id.clone(), status));
            container.status = status;
            polled.push(container.clone());
        }

        Ok(polled)
    }

    async fn stop(&self, ids: &[String]) -> Vec<Option<ContainerError>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        ids.iter()
            .map(|id| {
                state.stopped.push(id.clone());
                let is_known = state.known.contains_key(id) || state.scripts.contains_key(id);
                if !is_known {
                    return Some(ContainerError::NotFound { id: id.clone() });
                }
                state
                    .scripts
                    .insert(id.clone(), VecDeque::from([ContainerStatus::Failed]));
                if let Some(container) = state.known.get_mut(id) {
                    container.status = ContainerStatus::Failed;
                }
                None
            })
            .collect()
    }
}
