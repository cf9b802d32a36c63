//! Compiler and CompiledGraph: turns definition text into a runnable graph
//!
//! # Overview
//!
//! The compilation process:
//! 1. Parses the definition and validates cross references
//! 2. Infers the state shape from declared outputs
//! 3. Builds the transition table and checks cycles for loop limits
//! 4. Resolves executors and tools, and compiles one vertex per node,
//!    recursing into subgraphs
//! 5. Returns a `CompiledGraph` ready for execution
//!
//! Every stage reports all of its errors; nothing runs unless the whole
//! graph compiled.
//!
//! # Example
//!
//! ```ignore
//! let compiler = Compiler::new(ExecutorCache::single(my_executor))
//!     .with_checkpointer(Arc::new(MemoryCheckpointer::new()));
//!
//! let graph = compiler.compile(&std::fs::read_to_string("review.yaml")?).await?;
//! match graph.run(json!({"topic": "rust"}), Some("thread-1")).await? {
//!     RunResult::Suspended { payload, .. } => println!("waiting: {payload}"),
//!     RunResult::Complete { state, .. } => println!("done: {:?}", state.values),
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::definition::{
    self, validate, CompileContext, ErrorPolicy, FsLoader, NodeKind, NodeSpec, SourceLoader,
    SubgraphConfig, WorkflowDefinition,
};
use crate::engine::checkpoint::{create_checkpointer, Checkpointer};
use crate::engine::config::RuntimeConfig;
use crate::engine::runtime::{GraphRuntime, RunResult};
use crate::engine::visualization;
use crate::error::{CompileError, CompileErrors, ConfigError, RunError, RunFailure};
use crate::executor::ExecutorCache;
use crate::shape::{self, StateShape};
use crate::state::ExecutionState;
use crate::tools::{BoundTool, ToolRegistry};
use crate::workflow::graph::TransitionTable;
use crate::workflow::vertices::{
    AgentVertex, CompiledNode, InterruptVertex, MapVertex, MessageSource, NodePolicy, NodeStrategy,
    PassthroughVertex, RouteSource, RouterVertex, SubgraphVertex, TaskBinding, TransformAction,
    TransformVertex,
};

/// Compiles workflow definitions against caller-owned executors and tools.
pub struct Compiler {
    executors: ExecutorCache,
    tools: ToolRegistry,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    loader: Arc<dyn SourceLoader>,
    config: Option<RuntimeConfig>,
}

/// Everything a node needs from the graph it belongs to
struct NodeEnv<'a> {
    def: &'a WorkflowDefinition,
    table: Option<&'a TransitionTable>,
    tools: &'a HashMap<String, BoundTool>,
    checkpointer: Option<&'a Arc<dyn Checkpointer>>,
}

impl Compiler {
    pub fn new(executors: ExecutorCache) -> Self {
        Self {
            executors,
            tools: ToolRegistry::new(),
            checkpointer: None,
            loader: Arc::new(FsLoader),
            config: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Use `checkpointer` instead of the definition's `checkpoint:` block
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Loader for subgraph references (filesystem by default)
    pub fn with_loader(mut self, loader: impl SourceLoader + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    /// Runtime configuration overriding the definition's `defaults:`
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Compile definition text
    pub async fn compile(&self, text: &str) -> Result<CompiledGraph, CompileErrors> {
        self.compile_text(text, CompileContext::new()).await
    }

    /// Compile a definition file; nested references resolve relative to it
    pub async fn compile_file(&self, path: impl AsRef<Path>) -> Result<CompiledGraph, CompileErrors> {
        let path = path.as_ref();
        let source = FsLoader
            .load(&path.to_string_lossy(), None)
            .map_err(|message| {
                CompileErrors::single(CompileError::Source {
                    path: path.display().to_string(),
                    message,
                })
            })?;
        self.compile_text(&source.text, CompileContext::rooted_at(source.key))
            .await
    }

    /// Compile a definition fetched through the configured loader
    pub async fn compile_source(&self, reference: &str) -> Result<CompiledGraph, CompileErrors> {
        let source = self.loader.load(reference, None).map_err(|message| {
            CompileErrors::single(CompileError::Source {
                path: reference.to_string(),
                message,
            })
        })?;
        self.compile_text(&source.text, CompileContext::rooted_at(source.key))
            .await
    }

    async fn compile_text(&self, text: &str, mut ctx: CompileContext) -> Result<CompiledGraph, CompileErrors> {
        let def = definition::parse(text)?;

        let checkpointer = match (&self.checkpointer, &def.checkpoint) {
            (Some(checkpointer), _) => Some(Arc::clone(checkpointer)),
            (None, Some(config)) => Some(create_checkpointer(config).await.map_err(|e| {
                CompileErrors::single(ConfigError::invalid_section("checkpoint", e))
            })?),
            (None, None) => None,
        };

        let mut runtime = self.assemble(&def, checkpointer, &mut ctx)?;
        if let Some(config) = &self.config {
            runtime = runtime.with_config(config.clone());
        }

        info!(graph = %def.name, nodes = def.nodes.len(), fields = runtime.shape().len(), "workflow compiled");
        Ok(CompiledGraph {
            definition: Arc::new(def),
            runtime,
        })
    }

    /// Build the runtime for one (possibly nested) definition
    fn assemble(
        &self,
        def: &WorkflowDefinition,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        ctx: &mut CompileContext,
    ) -> Result<GraphRuntime, CompileErrors> {
        let structural = validate(def);
        if !structural.is_empty() {
            return Err(structural.into());
        }

        let mut errors = CompileErrors::default();

        let shape = match shape::infer(def) {
            Ok(shape) => Some(shape),
            Err(e) => {
                errors.extend(CompileErrors::from(e));
                None
            }
        };
        let table = match TransitionTable::build(def) {
            Ok(table) => Some(table),
            Err(e) => {
                errors.extend(e);
                None
            }
        };

        if let (Some(node), None) = (def.first_interrupt(), &checkpointer) {
            errors.push(CompileError::InterruptWithoutCheckpointer {
                node: node.to_string(),
            });
        }

        let tools = self.bind_tools(def, &mut errors);
        let env = NodeEnv {
            def,
            table: table.as_ref(),
            tools: &tools,
            checkpointer: checkpointer.as_ref(),
        };

        let mut nodes = HashMap::new();
        for spec in &def.nodes {
            if let Some(node) = self.compile_node(&env, spec, None, ctx, &mut errors) {
                debug!(graph = %def.name, node_id = %spec.id, kind = node.kind(), "node compiled");
                nodes.insert(spec.id.clone(), Arc::new(node));
            }
        }

        match (shape, table) {
            (Some(shape), Some(table)) if errors.is_empty() => {
                let config = RuntimeConfig::from_defaults(&def.defaults);
                let runtime = GraphRuntime::new(&def.name, nodes, table, shape, config);
                Ok(match checkpointer {
                    Some(checkpointer) => runtime.with_checkpointer(checkpointer),
                    None => runtime,
                })
            }
            _ => Err(errors),
        }
    }

    fn bind_tools(&self, def: &WorkflowDefinition, errors: &mut CompileErrors) -> HashMap<String, BoundTool> {
        let mut bound = HashMap::new();
        for (name, spec) in &def.tools {
            let binding = spec.binding.as_deref().unwrap_or(name);
            match self.tools.get(binding) {
                Some(tool) => {
                    bound.insert(
                        name.clone(),
                        BoundTool::new(
                            name,
                            Arc::clone(tool),
                            spec.description.as_deref(),
                            spec.parameters.as_ref(),
                        ),
                    );
                }
                None => errors.push(ConfigError::UnresolvedToolBinding {
                    tool: name.clone(),
                    binding: binding.to_string(),
                }),
            }
        }
        bound
    }

    /// Resolve the executors for `task`, checking the executor provides it
    fn bind_task(
        &self,
        env: &NodeEnv<'_>,
        spec: &NodeSpec,
        task: &str,
        errors: &mut CompileErrors,
    ) -> Option<TaskBinding> {
        let unavailable = |message: String| ConfigError::ExecutorUnavailable {
            node: spec.id.clone(),
            message,
        };

        let backend = spec
            .options
            .backend
            .as_ref()
            .or(env.def.defaults.backend.as_ref());
        let primary = match self.executors.resolve(backend) {
            Ok(executor) => executor,
            Err(message) => {
                errors.push(unavailable(message));
                return None;
            }
        };
        if !primary.supports(task) {
            errors.push(ConfigError::UnresolvedTask {
                node: spec.id.clone(),
                task: task.to_string(),
            });
            return None;
        }

        let fallback = match (&spec.options.on_error, &spec.options.fallback) {
            (ErrorPolicy::Fallback, Some(config)) => match self.executors.resolve(Some(config)) {
                Ok(executor) if executor.supports(task) => Some(executor),
                Ok(_) => {
                    errors.push(ConfigError::UnresolvedTask {
                        node: spec.id.clone(),
                        task: task.to_string(),
                    });
                    return None;
                }
                Err(message) => {
                    errors.push(unavailable(message));
                    return None;
                }
            },
            _ => None,
        };

        Some(TaskBinding::new(task, primary, fallback))
    }

    /// Compile one node; `skip_override` forces the skip-if-exists policy
    fn compile_node(
        &self,
        env: &NodeEnv<'_>,
        spec: &NodeSpec,
        skip_override: Option<bool>,
        ctx: &mut CompileContext,
        errors: &mut CompileErrors,
    ) -> Option<CompiledNode> {
        let defaults = &env.def.defaults;
        let id = spec.id.as_str();
        let options = &spec.options;
        let schema = options.output_schema.clone();

        let in_cycle = env.table.is_some_and(|table| table.in_cycle(id));
        let skip = skip_override
            .unwrap_or_else(|| options.skip_if_exists.unwrap_or(!in_cycle && defaults.skip_if_exists));

        let output = spec.output_field();
        let skip_fields: Vec<String> = match &spec.kind {
            NodeKind::Interrupt(config) => vec![config.resume_key.clone()],
            NodeKind::Subgraph(config) => config.output_mapping.values().cloned().collect(),
            NodeKind::Passthrough(config) => config.targets(),
            NodeKind::Map(config) => vec![config.collect.clone()],
            NodeKind::Transform(_) | NodeKind::Router(_) | NodeKind::Agent(_) => {
                output.iter().cloned().collect()
            }
        };

        let strategy = match &spec.kind {
            NodeKind::Transform(config) => {
                let action = match (&config.task, &config.tool) {
                    (Some(task), _) => TransformAction::Task(self.bind_task(env, spec, task, errors)?),
                    (None, Some(tool)) => TransformAction::Tool(env.tools.get(tool)?.clone()),
                    (None, None) => return None,
                };
                NodeStrategy::Transform(TransformVertex::new(
                    id,
                    action,
                    config.inputs.clone(),
                    config.args.clone(),
                    output.clone()?,
                    schema,
                ))
            }
            NodeKind::Router(config) => {
                let source = match (&config.task, &config.from) {
                    (Some(task), _) => RouteSource::Task(self.bind_task(env, spec, task, errors)?),
                    (None, Some(path)) => RouteSource::Field(path.clone()),
                    (None, None) => return None,
                };
                NodeStrategy::Router(RouterVertex::new(
                    id,
                    source,
                    config.inputs.clone(),
                    output.clone()?,
                    &config.classification_key,
                    schema,
                ))
            }
            NodeKind::Agent(config) => {
                let binding = self.bind_task(env, spec, &config.task, errors)?;
                let tools = config
                    .tools
                    .iter()
                    .filter_map(|name| env.tools.get(name).cloned())
                    .collect();
                NodeStrategy::Agent(AgentVertex::new(
                    id,
                    binding,
                    tools,
                    config.inputs.clone(),
                    config.max_iterations.unwrap_or(defaults.max_iterations),
                    config
                        .messages_field
                        .clone()
                        .unwrap_or_else(|| defaults.messages_field.clone()),
                    output.clone(),
                ))
            }
            NodeKind::Map(config) => {
                let nested = self.compile_node(env, &config.node, Some(false), ctx, errors)?;
                NodeStrategy::Map(MapVertex::new(
                    id,
                    &config.over,
                    &config.item,
                    &config.collect,
                    Arc::new(nested),
                    config.max_concurrency,
                ))
            }
            NodeKind::Interrupt(config) => {
                let source = match (&config.message, &config.task) {
                    (Some(message), _) => MessageSource::Template(message.clone()),
                    (None, Some(task)) => MessageSource::Task(self.bind_task(env, spec, task, errors)?),
                    (None, None) => return None,
                };
                NodeStrategy::Interrupt(InterruptVertex::new(
                    id,
                    source,
                    config.inputs.clone(),
                    output.clone()?,
                    &config.resume_key,
                    skip,
                ))
            }
            NodeKind::Subgraph(config) => {
                let graph = self.compile_subgraph(env, spec, config, ctx, errors)?;
                NodeStrategy::Subgraph(SubgraphVertex::new(
                    id,
                    graph,
                    config.input_mapping.clone(),
                    config.output_mapping.clone(),
                    config.interrupt_output_mapping.clone(),
                ))
            }
            NodeKind::Passthrough(config) => {
                NodeStrategy::Passthrough(PassthroughVertex::new(id, config.clone()))
            }
        };

        let policy = NodePolicy {
            on_error: options.on_error,
            max_retries: options.max_retries,
            timeout: options.timeout,
            skip_fields: if skip { skip_fields } else { Vec::new() },
            requires: options.requires.clone(),
        };

        Some(CompiledNode::new(id, output, strategy, policy))
    }

    /// Compile the nested graph of a subgraph node on the parent's checkpointer
    fn compile_subgraph(
        &self,
        env: &NodeEnv<'_>,
        spec: &NodeSpec,
        config: &SubgraphConfig,
        ctx: &mut CompileContext,
        errors: &mut CompileErrors,
    ) -> Option<Arc<GraphRuntime>> {
        let (key, parsed) = match (&config.graph, &config.definition) {
            (Some(reference), _) => match self.loader.load(reference, ctx.current()) {
                Ok(source) => (source.key, definition::parse(&source.text)),
                Err(message) => {
                    errors.push(ConfigError::SubgraphSource {
                        node: spec.id.clone(),
                        reference: reference.clone(),
                        message,
                    });
                    return None;
                }
            },
            (None, Some(inline)) => {
                let parent = ctx.current().unwrap_or(env.def.name.as_str());
                (format!("{}#{}", parent, spec.id), definition::parse_json(inline))
            }
            (None, None) => return None,
        };

        if let Err(e) = ctx.enter(key) {
            errors.push(e);
            return None;
        }

        let result = parsed
            .map_err(CompileErrors::from)
            .and_then(|child| self.assemble(&child, env.checkpointer.cloned(), ctx));
        ctx.exit();

        match result {
            Ok(runtime) => Some(Arc::new(runtime)),
            Err(nested) => {
                errors.push(CompileError::Subgraph {
                    node: spec.id.clone(),
                    errors: nested,
                });
                None
            }
        }
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("executors", &self.executors)
            .field("tools", &self.tools)
            .field("checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}

/// A compiled workflow ready for execution.
///
/// Runs are keyed by thread id; with a checkpointer a thread survives across
/// calls, which is what makes suspension and resume possible.
#[derive(Debug)]
pub struct CompiledGraph {
    definition: Arc<WorkflowDefinition>,
    runtime: GraphRuntime,
}

impl CompiledGraph {
    /// Run from the entry point, or continue an existing thread
    pub async fn run(&self, input: Value, thread_id: Option<&str>) -> Result<RunResult, RunFailure> {
        self.runtime.run(input, thread_id).await
    }

    /// Resume a suspended thread with the caller's value
    pub async fn resume(&self, thread_id: &str, value: Value) -> Result<RunResult, RunFailure> {
        self.runtime.resume(thread_id, value).await
    }

    /// Discard a thread's checkpoints
    pub async fn reset(&self, thread_id: &str) -> Result<(), RunError> {
        self.runtime.reset(thread_id).await
    }

    /// Latest saved state of a thread
    pub async fn state(&self, thread_id: &str) -> Result<Option<ExecutionState>, RunError> {
        self.runtime.state(thread_id).await
    }

    /// Replace the runtime configuration
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime = self.runtime.with_config(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn shape(&self) -> &StateShape {
        self.runtime.shape()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.runtime.config()
    }

    pub fn transitions(&self) -> &TransitionTable {
        self.runtime.transitions()
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.runtime.checkpointer()
    }

    /// Mermaid flowchart of the graph
    pub fn to_mermaid(&self) -> String {
        self.render(None)
    }

    /// Mermaid flowchart highlighting the suspended node and nodes with errors
    pub fn to_mermaid_with_state(&self, state: &ExecutionState) -> String {
        self.render(Some(state))
    }

    fn render(&self, state: Option<&ExecutionState>) -> String {
        let nodes = self
            .definition
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), &node.kind));
        visualization::render_graph(nodes, &self.transitions().edges(), state)
    }
}
