use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error as StdError,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    commands::{RenderKey, encode_datagram},
    compiler::{CompileError, compile},
    model::{AudioSource, DEFAULT_CHANNEL_COUNT, HeaderFormat, SampleFormat},
    persistence,
    process::{self, ProcessRun},
    session::Session,
};

/// An audio source produced by code outside the session graph.
pub trait Renderable: fmt::Debug + Send + Sync {
    /// Stable identity; equal keys are treated as the same audio.
    fn render_key(&self) -> String;

    fn render_to(&self, path: &Path) -> anyhow::Result<()>;

    fn channel_count(&self) -> u32 {
        DEFAULT_CHANNEL_COUNT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub engine_path: PathBuf,
    pub render_directory: PathBuf,
    pub sample_rate: u32,
    pub header_format: HeaderFormat,
    pub sample_format: SampleFormat,
    /// Overrides the session's own duration for the top-level render.
    pub duration: Option<f64>,
    /// Starting memory size; falls back to the session options.
    pub memory_size: Option<u32>,
    pub write_manifest: bool,
    pub max_attempts: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            engine_path: PathBuf::from("scsynth"),
            render_directory: std::env::temp_dir().join("scoreline"),
            sample_rate: 44_100,
            header_format: HeaderFormat::Aiff,
            sample_format: SampleFormat::Int24,
            duration: None,
            memory_size: None,
            write_manifest: false,
            max_attempts: 5,
        }
    }
}

/// Shared flag checked while the engine runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("render dependencies form a cycle through {0}")]
    DependencyCycle(RenderKey),
    #[error("failed to start engine {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("render i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine failed rendering {key} with {exit} after {} attempt(s)", .attempts.len())]
    EngineFailed {
        key: RenderKey,
        exit: String,
        attempts: Vec<RenderAttempt>,
    },
    #[error("engine finished but {0} was not written")]
    OutputMissing(PathBuf),
    #[error("renderable {key} failed: {message}")]
    Renderable { key: String, message: String },
    #[error("render cancelled")]
    Cancelled,
    #[error("failed to persist render artifact")]
    Persistence(#[source] Box<dyn StdError + Send + Sync>),
}

impl RenderError {
    fn persistence(error: anyhow::Error) -> Self {
        Self::Persistence(error.into())
    }

    /// Every line the engine printed across all attempts.
    #[must_use]
    pub fn transcript(&self) -> Vec<&str> {
        match self {
            Self::EngineFailed { attempts, .. } => attempts
                .iter()
                .flat_map(|attempt| attempt.lines.iter().map(String::as_str))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderAttempt {
    pub command: Vec<String>,
    pub memory_size: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub lines: Vec<String>,
}

impl RenderAttempt {
    fn from_run(command: Vec<String>, memory_size: u32, run: ProcessRun) -> Self {
        Self {
            command,
            memory_size,
            exit_code: run.exit_code,
            signal: run.signal,
            lines: run.lines,
        }
    }

    fn describe_exit(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown status".to_string(),
        }
    }

    fn looks_like_allocation_failure(&self) -> bool {
        const SIGABRT: i32 = 6;
        if self.signal == Some(SIGABRT) || self.exit_code == Some(128 + SIGABRT) {
            return true;
        }
        self.lines.iter().any(|line| {
            let line = line.to_ascii_lowercase();
            line.contains("alloc failed")
                || line.contains("out of memory")
                || line.contains("memory allocation")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStep {
    pub key: RenderKey,
    pub hash: String,
    pub output: PathBuf,
    pub cache_hit: bool,
    pub attempts: Vec<RenderAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOutcome {
    /// Where the audio ended up: the caller's path when one was given.
    pub output: PathBuf,
    pub hash: String,
    pub manifest: Option<PathBuf>,
    /// Dependencies first, the requested session last.
    pub steps: Vec<RenderStep>,
}

impl RenderOutcome {
    #[must_use]
    pub fn cache_hit(&self) -> bool {
        self.steps.last().is_some_and(|step| step.cache_hit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderManifest {
    pub render: String,
    pub source: Option<Vec<String>>,
}

/// Directed graph keyed by artifact; edges point at dependencies.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    edges: BTreeMap<K, BTreeSet<K>>,
}

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl<K: Ord + Clone> DependencyGraph<K> {
    pub fn add_node(&mut self, key: K) {
        self.edges.entry(key).or_default();
    }

    pub fn add_edge(&mut self, dependent: K, dependency: K) {
        self.add_node(dependency.clone());
        self.edges.entry(dependent).or_default().insert(dependency);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Dependencies before dependents; `Err` carries a key on a cycle.
    pub fn topological_order(&self) -> Result<Vec<K>, K> {
        let mut marks = BTreeMap::new();
        let mut order = Vec::with_capacity(self.edges.len());
        for key in self.edges.keys() {
            self.visit(key, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit(&self, key: &K, marks: &mut BTreeMap<K, Mark>, order: &mut Vec<K>) -> Result<(), K> {
        match marks.get(key) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(key.clone()),
            None => {}
        }
        marks.insert(key.clone(), Mark::Visiting);
        if let Some(dependencies) = self.edges.get(key) {
            for dependency in dependencies {
                self.visit(dependency, marks, order)?;
            }
        }
        marks.insert(key.clone(), Mark::Done);
        order.push(key.clone());
        Ok(())
    }
}

enum Artifact<'a> {
    Root(&'a Session),
    Session(Arc<Session>),
    Renderable(Arc<dyn Renderable>),
}

#[derive(Debug, Clone)]
struct Rendered {
    hash: String,
    path: PathBuf,
}

fn source_key(source: &AudioSource) -> Option<RenderKey> {
    match source {
        AudioSource::File(_) => None,
        AudioSource::Session(session) => Some(RenderKey::Session(session.id())),
        AudioSource::Renderable(renderable) => {
            Some(RenderKey::Renderable(renderable.render_key()))
        }
    }
}

#[must_use]
pub fn hash_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

/// Compiles sessions and drives the external engine over them.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    options: RenderOptions,
    cancel: CancelToken,
}

impl Renderer {
    #[must_use]
    pub fn new(options: RenderOptions) -> Self {
        Self {
            options,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Renders `session` and everything it reads from, dependencies first.
    #[instrument(skip(self, session, output), fields(session = %session.id()))]
    pub fn render(
        &self,
        session: &Session,
        output: Option<&Path>,
    ) -> Result<RenderOutcome, RenderError> {
        fs::create_dir_all(&self.options.render_directory)?;

        let root_key = RenderKey::Session(session.id());
        let (graph, artifacts) = collect_artifacts(session);
        let order = graph
            .topological_order()
            .map_err(RenderError::DependencyCycle)?;
        debug!(artifacts = order.len(), "render order resolved");

        let mut rendered: BTreeMap<RenderKey, Rendered> = BTreeMap::new();
        let mut steps = Vec::with_capacity(order.len());
        for key in order {
            if self.cancel.is_cancelled() {
                return Err(RenderError::Cancelled);
            }
            let Some(artifact) = artifacts.get(&key) else {
                continue;
            };
            let step = match artifact {
                Artifact::Root(target) => {
                    self.render_session(&key, target, self.options.duration, &rendered)?
                }
                Artifact::Session(target) => self.render_session(&key, target, None, &rendered)?,
                Artifact::Renderable(renderable) => {
                    self.render_renderable(&key, renderable.as_ref())?
                }
            };
            rendered.insert(
                key,
                Rendered {
                    hash: step.hash.clone(),
                    path: step.output.clone(),
                },
            );
            steps.push(step);
        }

        let Some(result) = rendered.get(&root_key) else {
            return Err(RenderError::OutputMissing(
                self.options.render_directory.clone(),
            ));
        };

        let manifest = if self.options.write_manifest {
            let manifest = RenderManifest {
                render: result.hash.clone(),
                source: source_chain(session, &rendered),
            };
            let path = result.path.with_extension("json");
            persistence::save_json(&path, &manifest).map_err(RenderError::persistence)?;
            Some(path)
        } else {
            None
        };

        let final_path = match output {
            Some(target) => {
                if let Some(parent) = target.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::copy(&result.path, target)?;
                target.to_path_buf()
            }
            None => result.path.clone(),
        };
        info!(output = %final_path.display(), hash = %result.hash, "render finished");

        Ok(RenderOutcome {
            output: final_path,
            hash: result.hash.clone(),
            manifest,
            steps,
        })
    }

    /// Content address of `session` as this renderer would compile it.
    /// Only defined for sessions that read no rendered audio.
    pub fn content_hash(&self, session: &Session) -> Result<String, RenderError> {
        let resolved = BTreeMap::new();
        let (_, hash) = self.session_datagram(session, self.options.duration, &resolved)?;
        Ok(hash)
    }

    fn session_datagram(
        &self,
        session: &Session,
        duration: Option<f64>,
        rendered: &BTreeMap<RenderKey, Rendered>,
    ) -> Result<(Vec<u8>, String), RenderError> {
        let bundles = compile(session, duration)?;
        let resolver = |key: &RenderKey| {
            rendered
                .get(key)
                .and_then(|artifact| artifact.path.file_name())
                .map(PathBuf::from)
        };
        let datagram = encode_datagram(&bundles, &resolver)?;
        let input = self.input_argument(session, rendered);

        let options = session.options();
        let mut hasher = Sha256::new();
        hasher.update(&datagram);
        hasher.update(input.as_bytes());
        hasher.update(options.input_bus_channel_count.to_be_bytes());
        hasher.update(options.output_bus_channel_count.to_be_bytes());
        hasher.update(self.options.sample_rate.to_be_bytes());
        hasher.update(self.options.header_format.name().as_bytes());
        hasher.update(self.options.sample_format.name().as_bytes());
        let digest = hasher.finalize();
        Ok((datagram, format!("{digest:x}")))
    }

    fn input_argument(
        &self,
        session: &Session,
        rendered: &BTreeMap<RenderKey, Rendered>,
    ) -> String {
        let Some(source) = session.input() else {
            return "_".to_string();
        };
        match source {
            AudioSource::File(path) => path.display().to_string(),
            other => source_key(other)
                .and_then(|key| rendered.get(&key))
                .and_then(|artifact| artifact.path.file_name())
                .map_or_else(|| "_".to_string(), |name| name.to_string_lossy().into_owned()),
        }
    }

    #[instrument(skip(self, session, rendered), fields(key = %key))]
    fn render_session(
        &self,
        key: &RenderKey,
        session: &Session,
        duration: Option<f64>,
        rendered: &BTreeMap<RenderKey, Rendered>,
    ) -> Result<RenderStep, RenderError> {
        let (datagram, hash) = self.session_datagram(session, duration, rendered)?;
        let stem = format!("session-{hash}");
        let directory = &self.options.render_directory;
        let osc_name = format!("{stem}.osc");
        let output_name = format!("{stem}.{}", self.options.header_format.extension());
        let output_path = directory.join(&output_name);

        persistence::write_if_changed(&directory.join(&osc_name), &datagram)
            .map_err(RenderError::persistence)?;

        if output_path.exists() {
            info!(output = %output_path.display(), "cached render reused");
            return Ok(RenderStep {
                key: key.clone(),
                hash,
                output: output_path,
                cache_hit: true,
                attempts: Vec::new(),
            });
        }

        let input = self.input_argument(session, rendered);
        let base_memory = self
            .options
            .memory_size
            .unwrap_or(session.options().memory_size);
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempts: Vec<RenderAttempt> = Vec::new();

        for attempt in 0..max_attempts {
            let memory_size = base_memory.saturating_mul(2_u32.saturating_pow(attempt));
            let args = self.engine_arguments(session, &osc_name, &input, &output_name, memory_size);
            let mut command = vec![self.options.engine_path.display().to_string()];
            command.extend(args.iter().cloned());
            info!(attempt = attempt + 1, memory_size, "starting engine");

            let run = match process::run_engine(
                &self.options.engine_path,
                &args,
                directory,
                &self.cancel,
            ) {
                Ok(run) => run,
                Err(RenderError::Cancelled) => {
                    if output_path.exists() {
                        fs::remove_file(&output_path)?;
                    }
                    return Err(RenderError::Cancelled);
                }
                Err(error) => return Err(error),
            };
            let succeeded = run.success();
            attempts.push(RenderAttempt::from_run(command, memory_size, run));

            if succeeded {
                if !output_path.exists() {
                    return Err(RenderError::OutputMissing(output_path));
                }
                return Ok(RenderStep {
                    key: key.clone(),
                    hash,
                    output: output_path,
                    cache_hit: false,
                    attempts,
                });
            }

            let Some(last) = attempts.last() else {
                break;
            };
            let retry = last.looks_like_allocation_failure() && attempt + 1 < max_attempts;
            if !retry {
                break;
            }
            warn!(
                exit = %last.describe_exit(),
                memory_size,
                "engine ran out of memory, retrying with more"
            );
        }

        let exit = attempts
            .last()
            .map_or_else(|| "no attempts".to_string(), RenderAttempt::describe_exit);
        warn!(%exit, attempts = attempts.len(), "engine failed");
        Err(RenderError::EngineFailed {
            key: key.clone(),
            exit,
            attempts,
        })
    }

    fn engine_arguments(
        &self,
        session: &Session,
        osc_name: &str,
        input: &str,
        output_name: &str,
        memory_size: u32,
    ) -> Vec<String> {
        let options = session.options();
        vec![
            "-N".to_string(),
            osc_name.to_string(),
            input.to_string(),
            output_name.to_string(),
            self.options.sample_rate.to_string(),
            self.options.header_format.name().to_string(),
            self.options.sample_format.name().to_string(),
            "-i".to_string(),
            options.input_bus_channel_count.to_string(),
            "-o".to_string(),
            options.output_bus_channel_count.to_string(),
            "-m".to_string(),
            memory_size.to_string(),
            "-a".to_string(),
            options.audio_bus_channel_count.to_string(),
            "-c".to_string(),
            options.control_bus_channel_count.to_string(),
            "-b".to_string(),
            options.buffer_count.to_string(),
        ]
    }

    #[instrument(skip(self, renderable), fields(key = %key))]
    fn render_renderable(
        &self,
        key: &RenderKey,
        renderable: &dyn Renderable,
    ) -> Result<RenderStep, RenderError> {
        let render_key = renderable.render_key();
        let hash = hash_hex(render_key.as_bytes());
        let output = self.options.render_directory.join(format!(
            "renderable-{hash}.{}",
            self.options.header_format.extension()
        ));
        let cache_hit = output.exists();
        if cache_hit {
            debug!("cached renderable reused");
        } else {
            renderable
                .render_to(&output)
                .map_err(|error| RenderError::Renderable {
                    key: render_key.clone(),
                    message: format!("{error:#}"),
                })?;
            if !output.exists() {
                return Err(RenderError::OutputMissing(output));
            }
        }
        Ok(RenderStep {
            key: key.clone(),
            hash,
            output,
            cache_hit,
            attempts: Vec::new(),
        })
    }
}

fn collect_artifacts(
    root: &Session,
) -> (DependencyGraph<RenderKey>, BTreeMap<RenderKey, Artifact<'_>>) {
    let mut graph = DependencyGraph::default();
    let mut artifacts = BTreeMap::new();
    let root_key = RenderKey::Session(root.id());
    graph.add_node(root_key.clone());
    artifacts.insert(root_key.clone(), Artifact::Root(root));

    let mut pending = vec![(root_key, root.audio_sources())];
    while let Some((dependent, sources)) = pending.pop() {
        for source in sources {
            let Some(key) = source_key(&source) else {
                continue;
            };
            graph.add_edge(dependent.clone(), key.clone());
            if artifacts.contains_key(&key) {
                continue;
            }
            match source {
                AudioSource::Session(session) => {
                    pending.push((key.clone(), session.audio_sources()));
                    artifacts.insert(key, Artifact::Session(session));
                }
                AudioSource::Renderable(renderable) => {
                    artifacts.insert(key, Artifact::Renderable(renderable));
                }
                AudioSource::File(_) => {}
            }
        }
    }
    (graph, artifacts)
}

/// Content hashes along the session's input chain, nearest first.
fn source_chain(
    session: &Session,
    rendered: &BTreeMap<RenderKey, Rendered>,
) -> Option<Vec<String>> {
    let mut chain = Vec::new();
    let mut next = session.input().cloned();
    while let Some(source) = next.take() {
        let Some(artifact) = source_key(&source).and_then(|key| rendered.get(&key)) else {
            break;
        };
        chain.push(artifact.hash.clone());
        if let AudioSource::Session(upstream) = &source {
            next = upstream.input().cloned();
        }
    }
    if chain.is_empty() { None } else { Some(chain) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_come_first() {
        let mut graph = DependencyGraph::default();
        graph.add_edge("mix", "drums");
        graph.add_edge("mix", "bass");
        graph.add_edge("bass", "sample");
        let order = graph.topological_order().expect("graph is acyclic");
        let position = |key| order.iter().position(|item| *item == key).expect("key is ordered");
        assert!(position("sample") < position("bass"));
        assert!(position("bass") < position("mix"));
        assert!(position("drums") < position("mix"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = DependencyGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 1);
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn allocation_failures_are_recognised() {
        let mut attempt = RenderAttempt {
            command: Vec::new(),
            memory_size: 8192,
            exit_code: Some(1),
            signal: None,
            lines: vec!["FAILURE alloc failed, increase server's memory allocation".to_string()],
        };
        assert!(attempt.looks_like_allocation_failure());

        attempt.lines = vec!["FAILURE /s_new SynthDef not found".to_string()];
        assert!(!attempt.looks_like_allocation_failure());

        attempt.exit_code = None;
        attempt.signal = Some(6);
        assert!(attempt.looks_like_allocation_failure());
    }

    #[test]
    fn identical_sessions_share_a_content_hash() {
        let renderer = Renderer::default();
        let first = crate::fixtures::demo_session().expect("demo session should build");
        let second = crate::fixtures::demo_session().expect("demo session should build");
        assert_ne!(first.id(), second.id());
        assert_eq!(
            renderer.content_hash(&first).expect("first hash"),
            renderer.content_hash(&second).expect("second hash")
        );
    }
}
