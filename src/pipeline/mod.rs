//! Graph orchestration
//!
//! [`PipelineManager`] instantiates blocks through a [`BlockRegistry`],
//! pushes their parameters, wires each source to its sinks and drives the
//! ordered start/stop sequence. Every public call is serialized by one lock;
//! block error callbacks never take it.

pub mod config;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

pub use self::config::{BlockDef, ConfigFormat, Connection, GraphConfig, PipelineInfo};
use crate::block::{Block, BlockState, BlockStats};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::registry::BlockRegistry;
use crate::sink::VideoSink;
use crate::source::VideoSource;

/// User hook for block failures: `(block name, message)`.
pub type PipelineErrorHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct ErrorRouter {
    handler: RwLock<Option<PipelineErrorHandler>>,
}

impl ErrorRouter {
    fn route(&self, block: &str, message: &str) {
        error!(block, error = message, "block failed");
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(block, message);
        }
    }
}

#[derive(Default)]
struct Graph {
    config: GraphConfig,
    blocks: Vec<(String, Arc<dyn Block>)>,
}

impl Graph {
    /// Sink-capable blocks first, then blocks with neither role, then
    /// source-only blocks.
    fn start_order(&self) -> Vec<Arc<dyn Block>> {
        let mut sinks = Vec::new();
        let mut others = Vec::new();
        let mut sources = Vec::new();
        for (_, block) in &self.blocks {
            let caps = block.capabilities();
            if caps.sink {
                sinks.push(block.clone());
            } else if caps.source {
                sources.push(block.clone());
            } else {
                others.push(block.clone());
            }
        }
        sinks.into_iter().chain(others).chain(sources).collect()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Block>> {
        self.blocks.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    fn teardown(&mut self) {
        for (_, block) in &self.blocks {
            block.core().clear_error_callback();
            block.shutdown();
            if let Some(source) = block.as_source() {
                source.clear_consumer();
            }
        }
        self.blocks.clear();
    }
}

pub struct PipelineManager {
    registry: Arc<BlockRegistry>,
    graph: Mutex<Graph>,
    running: AtomicBool,
    errors: Arc<ErrorRouter>,
    last_error: Mutex<String>,
}

impl PipelineManager {
    pub fn new(registry: Arc<BlockRegistry>) -> Self {
        Self {
            registry,
            graph: Mutex::new(Graph::default()),
            running: AtomicBool::new(false),
            errors: Arc::new(ErrorRouter::default()),
            last_error: Mutex::new(String::new()),
        }
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    /// Called for every block error after it has been logged, on the thread
    /// that raised it. The handler must not call back into the manager.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.errors.handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_error_handler(&self) {
        *self.errors.handler.write() = None;
    }

    /// Build, configure and wire the graph. Any failure tears down what was
    /// built so far and is recorded as the last error.
    #[instrument(skip_all, fields(pipeline = %config.name()))]
    pub fn initialize(&self, config: GraphConfig) -> Result<()> {
        let mut graph = self.graph.lock();
        if self.is_running() {
            return Err(self.fail(PipelineError::config(
                "cannot initialize while the pipeline is running",
            )));
        }
        if !graph.blocks.is_empty() {
            debug!("replacing existing graph");
            graph.teardown();
        }

        info!(
            platform = %config.platform(),
            blocks = config.blocks.len(),
            connections = config.connections.len(),
            "initializing pipeline"
        );
        graph.config = config;

        let built = self
            .create_blocks(&mut graph)
            .and_then(|()| self.configure_blocks(&graph))
            .and_then(|()| self.connect_blocks(&graph));
        if let Err(e) = built {
            graph.teardown();
            return Err(self.fail(e));
        }

        info!(pipeline = %graph.config.name(), "pipeline initialized");
        Ok(())
    }

    fn create_blocks(&self, graph: &mut Graph) -> Result<()> {
        let mut seen = HashSet::new();
        let defs = graph.config.blocks.clone();
        for def in &defs {
            if !seen.insert(def.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate block name '{}'",
                    def.name
                )));
            }
            debug!(block = %def.name, block_type = %def.block_type, "creating block");
            let block = self
                .registry
                .create_named(&def.block_type, &def.name)
                .map_err(|e| {
                    PipelineError::config(format!(
                        "failed to create block '{}' of type '{}': {e}",
                        def.name, def.block_type
                    ))
                })?;

            let router = self.errors.clone();
            block
                .core()
                .set_error_callback(Arc::new(move |core, message| {
                    router.route(&core.name(), message)
                }));
            graph.blocks.push((def.name.clone(), block));
        }
        info!(count = graph.blocks.len(), "blocks created");
        Ok(())
    }

    fn configure_blocks(&self, graph: &Graph) -> Result<()> {
        for def in &graph.config.blocks {
            let block = graph
                .find(&def.name)
                .ok_or_else(|| PipelineError::BlockNotFound(def.name.clone()))?;
            debug!(block = %def.name, "configuring block");
            block.core().params().extend(&def.parameters);
            block.configure().map_err(|e| {
                PipelineError::config(format!("failed to configure block '{}': {e}", def.name))
            })?;
        }
        Ok(())
    }

    fn connect_blocks(&self, graph: &Graph) -> Result<()> {
        // One consumer per source; several connections from it fan out.
        let mut routes: Vec<(Arc<dyn Block>, Vec<Arc<dyn Block>>)> = Vec::new();
        let mut route_of: HashMap<&str, usize> = HashMap::new();

        for connection in &graph.config.connections {
            debug!(%connection, "connecting");
            let source_block = graph
                .find(&connection.source)
                .ok_or_else(|| PipelineError::BlockNotFound(connection.source.clone()))?;
            let sink_block = graph
                .find(&connection.sink)
                .ok_or_else(|| PipelineError::BlockNotFound(connection.sink.clone()))?;
            let source = source_capability(source_block.as_ref())?;
            let sink = sink_capability(sink_block.as_ref())?;

            let output = source.output_format();
            if sink.supports_format(output.format) {
                if let Err(e) = sink.set_input_format(output) {
                    warn!(%connection, error = %e, "could not propagate format");
                }
            } else {
                warn!(
                    %connection,
                    format = %output.format,
                    "format mismatch between source and sink"
                );
            }

            let slot = *route_of.entry(connection.source.as_str()).or_insert_with(|| {
                routes.push((source_block.clone(), Vec::new()));
                routes.len() - 1
            });
            routes[slot].1.push(sink_block.clone());
        }

        for (source_block, targets) in routes {
            if let Some(source) = source_block.as_source() {
                source.set_consumer(fan_out(targets));
            }
        }
        info!(
            connections = graph.config.connections.len(),
            "blocks connected"
        );
        Ok(())
    }

    /// Start sink-capable blocks, then the rest, then sources. A block that
    /// refuses to start rolls back the ones already started.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let graph = self.graph.lock();
        if graph.blocks.is_empty() {
            return Err(self.fail(PipelineError::config(
                "no blocks to start; initialize the pipeline first",
            )));
        }
        if self.is_running() {
            warn!(pipeline = %graph.config.name(), "pipeline already running");
            return Ok(());
        }

        info!(pipeline = %graph.config.name(), "starting pipeline");
        let order = graph.start_order();
        for (started, block) in order.iter().enumerate() {
            if let Err(e) = block.start() {
                let failure = PipelineError::Block {
                    block: block.name(),
                    reason: format!("failed to start: {e}"),
                };
                for done in order[..started].iter().rev() {
                    halt(done.as_ref());
                }
                return Err(self.fail(failure));
            }
        }

        self.running.store(true, Ordering::Release);
        metrics::gauge!("vpipe_pipeline_running").set(1.0);
        info!(pipeline = %graph.config.name(), "pipeline started");
        Ok(())
    }

    /// Stop sources, then the rest, then sinks. Blocks in the error state
    /// are shut down instead.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        let graph = self.graph.lock();
        self.stop_locked(&graph);
        Ok(())
    }

    fn stop_locked(&self, graph: &Graph) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(pipeline = %graph.config.name(), "stopping pipeline");
        for block in graph.start_order().iter().rev() {
            halt(block.as_ref());
        }
        metrics::gauge!("vpipe_pipeline_running").set(0.0);
        info!(pipeline = %graph.config.name(), "pipeline stopped");
    }

    /// Stop, release every block and forget the graph. Safe to repeat.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let mut graph = self.graph.lock();
        self.stop_locked(&graph);
        if graph.blocks.is_empty() {
            return;
        }
        graph.teardown();
        graph.config = GraphConfig::default();
        info!("pipeline shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Multi-line report: pipeline name, run state and one line per block.
    pub fn status(&self) -> String {
        let graph = self.graph.lock();
        let mut out = String::new();
        let _ = writeln!(out, "Pipeline: {}", graph.config.name());
        let _ = writeln!(
            out,
            "State: {}",
            if self.is_running() { "RUNNING" } else { "STOPPED" }
        );
        let _ = writeln!(out, "Blocks: {}", graph.blocks.len());
        for (name, block) in &graph.blocks {
            let _ = writeln!(
                out,
                "  {name} [{}] - {}",
                block.core().type_name(),
                block.state()
            );
        }
        out
    }

    pub fn block(&self, name: &str) -> Option<Arc<dyn Block>> {
        self.graph.lock().find(name).cloned()
    }

    pub fn blocks(&self) -> Vec<Arc<dyn Block>> {
        self.graph
            .lock()
            .blocks
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn block_names(&self) -> Vec<String> {
        self.graph
            .lock()
            .blocks
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn all_stats(&self) -> BTreeMap<String, BlockStats> {
        self.graph
            .lock()
            .blocks
            .iter()
            .map(|(n, b)| (n.clone(), b.core().stats()))
            .collect()
    }

    pub fn reset_all_stats(&self) {
        let graph = self.graph.lock();
        for (_, block) in &graph.blocks {
            block.core().reset_stats();
        }
        info!("all block statistics reset");
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    pub fn config(&self) -> GraphConfig {
        self.graph.lock().config.clone()
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let config = GraphConfig::from_file(path).map_err(|e| self.fail(e))?;
        self.initialize(config)
    }

    pub fn load_str(&self, content: &str, format: ConfigFormat) -> Result<()> {
        let config = GraphConfig::from_str(content, format).map_err(|e| self.fail(e))?;
        self.initialize(config)
    }

    fn fail(&self, e: PipelineError) -> PipelineError {
        error!(error = %e, "pipeline operation failed");
        *self.last_error.lock() = e.to_string();
        e
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("blocks", &self.block_names())
            .field("running", &self.is_running())
            .finish()
    }
}

fn source_capability(block: &dyn Block) -> Result<&dyn VideoSource> {
    match block.as_source() {
        Some(source) if block.capabilities().source => Ok(source),
        _ => Err(PipelineError::MissingCapability {
            block: block.name(),
            capability: "source",
        }),
    }
}

fn sink_capability(block: &dyn Block) -> Result<&dyn VideoSink> {
    match block.as_sink() {
        Some(sink) if block.capabilities().sink => Ok(sink),
        _ => Err(PipelineError::MissingCapability {
            block: block.name(),
            capability: "sink",
        }),
    }
}

/// Consumer handing each target its own reference to the frame.
fn fan_out(targets: Vec<Arc<dyn Block>>) -> Box<dyn Fn(Frame) + Send + Sync> {
    Box::new(move |frame: Frame| {
        let Some((last, rest)) = targets.split_last() else {
            return;
        };
        for target in rest {
            deliver(target.as_ref(), frame.retain());
        }
        deliver(last.as_ref(), frame);
    })
}

fn deliver(target: &dyn Block, frame: Frame) {
    if let Some(sink) = target.as_sink() {
        if let Err(e) = sink.submit(frame) {
            debug!(sink = %target.name(), error = %e, "frame not delivered");
        }
    }
}

/// Stop a running block; shut down one that failed.
fn halt(block: &dyn Block) {
    match block.state() {
        BlockState::Running => {
            if let Err(e) = block.stop() {
                warn!(block = %block.name(), error = %e, "failed to stop block");
                block.shutdown();
            }
        }
        BlockState::Error => block.shutdown(),
        _ => {}
    }
}
