//! In-process [`ContainerEngine`] used by tests and the `memory` engine mode.
//!
//! Builds read the synthesised recipe from the context directory and echo its
//! instructions as build output; containers are plain records. Failure modes
//! can be scripted per engine.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::engine::{BuildSpec, ContainerEngine, ContainerState, EngineResource, LineSink, RunSpec};
use super::project::RECIPE_FILE;

/// What a freshly started container does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartBehaviour {
    /// Reports `running` after the configured number of polls.
    #[default]
    Run,
    /// Exits immediately, as if the entrypoint crashed.
    Exit,
    /// Stays `created` forever.
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    fail_builds: bool,
    build_delay: Duration,
    stop_delay: Duration,
    start: StartBehaviour,
    polls_until_running: u32,
    fail_image_removal: bool,
}

#[derive(Debug)]
struct FakeContainer {
    spec: RunSpec,
    behaviour: StartBehaviour,
    polls: u32,
    stopped: bool,
}

#[derive(Debug, Default)]
struct State {
    networks: HashSet<String>,
    images: BTreeMap<String, BTreeMap<String, String>>,
    containers: BTreeMap<String, FakeContainer>,
    next_id: u64,
    builds: usize,
}

/// Fake container engine keeping everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    script: Mutex<Script>,
    state: Mutex<State>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent build fail.
    pub fn fail_builds(&self, fail: bool) {
        self.script.lock().fail_builds = fail;
    }

    /// Delays every build, simulating a slow image build.
    pub fn set_build_delay(&self, delay: Duration) {
        self.script.lock().build_delay = delay;
    }

    /// Delays every container stop, simulating a slow graceful shutdown.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.script.lock().stop_delay = delay;
    }

    /// Behaviour of containers started from now on.
    pub fn set_start_behaviour(&self, behaviour: StartBehaviour) {
        self.script.lock().start = behaviour;
    }

    /// Polls answered with `created` before a container reports `running`.
    pub fn set_polls_until_running(&self, polls: u32) {
        self.script.lock().polls_until_running = polls;
    }

    pub fn fail_image_removal(&self, fail: bool) {
        self.script.lock().fail_image_removal = fail;
    }

    /// Simulates a crash of a running container.
    pub fn kill(&self, container: &str) -> bool {
        match self.state.lock().containers.get_mut(container) {
            Some(c) => {
                c.behaviour = StartBehaviour::Exit;
                true
            }
            None => false,
        }
    }

    /// Seeds a labelled container that no preview owns.
    pub fn plant_container(&self, spec: RunSpec) -> String {
        let mut state = self.state.lock();
        let id = next_container_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec,
                behaviour: StartBehaviour::Run,
                polls: 0,
                stopped: false,
            },
        );
        id
    }

    /// Seeds a labelled image that no preview owns.
    pub fn plant_image(&self, tag: &str, labels: BTreeMap<String, String>) {
        self.state.lock().images.insert(tag.to_string(), labels);
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Names of containers that have not been stopped.
    pub fn live_container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| !c.stopped)
            .map(|c| c.spec.name.clone())
            .collect()
    }

    pub fn image_tags(&self) -> Vec<String> {
        self.state.lock().images.keys().cloned().collect()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().networks.contains(name)
    }

    /// Number of builds attempted so far.
    pub fn build_count(&self) -> usize {
        self.state.lock().builds
    }

    /// Run spec of the container with the given name, if it exists.
    pub fn run_spec(&self, name: &str) -> Option<RunSpec> {
        self.state
            .lock()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .map(|c| c.spec.clone())
    }
}

fn next_container_id(state: &mut State) -> String {
    state.next_id += 1;
    format!("mem{:012x}", state.next_id)
}

fn no_such(container: &str) -> Error {
    Error::Engine(format!("no such container: {}", container))
}

#[async_trait]
impl ContainerEngine for InMemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_network(&self, network: &str) -> Result<()> {
        self.state.lock().networks.insert(network.to_string());
        Ok(())
    }

    async fn build_image(&self, spec: &BuildSpec<'_>, on_line: LineSink<'_>) -> Result<()> {
        let (fail, delay) = {
            let script = self.script.lock();
            (script.fail_builds, script.build_delay)
        };
        self.state.lock().builds += 1;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let recipe = tokio::fs::read_to_string(spec.context_dir.join(RECIPE_FILE))
            .await
            .map_err(|e| Error::BuildFailure {
                tag: spec.tag.to_string(),
                output: format!("unable to read {}: {}", RECIPE_FILE, e),
            })?;
        let steps: Vec<&str> = recipe
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        for (i, step) in steps.iter().enumerate() {
            on_line(&format!("Step {}/{} : {}", i + 1, steps.len(), step));
        }

        if fail {
            let output = "error: process did not complete successfully: exit code 1";
            on_line(output);
            return Err(Error::BuildFailure {
                tag: spec.tag.to_string(),
                output: output.to_string(),
            });
        }

        on_line(&format!("Successfully tagged {}:latest", spec.tag));
        self.state
            .lock()
            .images
            .insert(spec.tag.to_string(), spec.labels.clone());
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let behaviour = self.script.lock().start;
        let mut state = self.state.lock();

        if !state.images.contains_key(&spec.image) {
            return Err(Error::Engine(format!("no such image: {}", spec.image)));
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(Error::Engine(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let id = next_container_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                behaviour,
                polls: 0,
                stopped: false,
            },
        );
        Ok(id)
    }

    async fn container_state(&self, container: &str) -> Result<ContainerState> {
        let threshold = self.script.lock().polls_until_running;
        let mut state = self.state.lock();
        let c = state
            .containers
            .get_mut(container)
            .ok_or_else(|| no_such(container))?;

        if c.stopped {
            return Ok(ContainerState::Exited);
        }
        Ok(match c.behaviour {
            StartBehaviour::Exit => ContainerState::Exited,
            StartBehaviour::Hang => ContainerState::Created,
            StartBehaviour::Run if c.polls >= threshold => ContainerState::Running,
            StartBehaviour::Run => {
                c.polls += 1;
                ContainerState::Created
            }
        })
    }

    async fn container_logs(&self, container: &str, tail: usize) -> Result<Vec<String>> {
        let state = self.state.lock();
        let c = state
            .containers
            .get(container)
            .ok_or_else(|| no_such(container))?;

        let mut lines = vec![format!("listening on 0.0.0.0:{}", c.spec.container_port)];
        if c.behaviour == StartBehaviour::Exit {
            lines.push("fatal: entrypoint exited with code 1".to_string());
        }
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.split_off(skip))
    }

    async fn stop_container(&self, container: &str, _timeout: Duration) -> Result<()> {
        let delay = self.script.lock().stop_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        let c = state
            .containers
            .get_mut(container)
            .ok_or_else(|| no_such(container))?;
        c.stopped = true;
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.state
            .lock()
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| no_such(container))
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        if self.script.lock().fail_image_removal {
            return Err(Error::Engine(format!("image {} is in use", tag)));
        }
        self.state
            .lock()
            .images
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| Error::Engine(format!("no such image: {}", tag)))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<EngineResource>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| has_label(&c.spec.labels, label))
            .map(|(id, c)| EngineResource {
                id: id.clone(),
                name: c.spec.name.clone(),
            })
            .collect())
    }

    async fn list_images(&self, label: &str) -> Result<Vec<EngineResource>> {
        let state = self.state.lock();
        Ok(state
            .images
            .iter()
            .filter(|(_, labels)| has_label(labels, label))
            .map(|(tag, _)| EngineResource {
                id: tag.clone(),
                name: tag.clone(),
            })
            .collect())
    }
}

fn has_label(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}
