// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The dispatcher: single-writer over [`Run`] state, reacting to
//! events from per-step worker tasks (shell subprocesses, agent
//! spawns, IPC messages) the way the teacher's effect executor reacts
//! to events from session/agent watchers.

use crate::events::{StepOutcome, TerminalStatus};
use crate::scheduler::Scheduler;
use meow_adapters::{AgentAdapter, AgentSpawnConfig, ShellOutcome, ShellRunner};
use meow_core::id::AgentId;
use meow_core::{Clock, Run, RunId, StepId, Value};
use meow_ipc::{AgentMessage, Inbound, OrchestratorMessage};
use meow_core::run::{RunStatus, StepState, StepStatus};
use meow_workflow::bake::Baker;
use meow_workflow::baked::{BakeResult, BakedExecutor, BakedStep, BakedTarget, OnError};
use meow_workflow::context::Context;
use meow_workflow::loader::{LoadContext, Loader, Scope};
use meow_workflow::model::{AgentOutputDecl, Module, OutputDecl, VarType, Workflow};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

const DEFAULT_SPAWN_READINESS: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("baking failed: {0}")]
    Bake(#[from] meow_workflow::bake::BakeError),
}

/// A step worker's request to block on an agent's `step_done`,
/// registered with the dispatcher loop so an inbound IPC message can
/// resolve it.
struct AgentStepRegistration {
    agent: String,
    step_id: String,
    prompt: String,
    outputs: HashMap<String, AgentOutputDecl>,
    reply: oneshot::Sender<StepOutcome>,
}

/// Handles shared by every spawned step worker. Cheaply cloneable
/// (everything behind an `Arc`).
#[derive(Clone)]
struct Worker {
    shell: Arc<ShellRunner>,
    agents: Arc<dyn AgentAdapter>,
    loader: Arc<Loader>,
    /// The module the top-level workflow being run was loaded from.
    /// `expand`/`foreach`/`branch` steps whose `template` starts with
    /// `.` resolve against this directly instead of going back out
    /// through the loader.
    origin: Arc<Module>,
    socket_path: PathBuf,
    workflow_id: String,
    register_tx: mpsc::Sender<AgentStepRegistration>,
}

impl Worker {
    async fn execute(
        &self,
        step: BakedStep,
        attempt: u32,
        outputs_snapshot: HashMap<String, HashMap<String, Value>>,
        agent_ready: Option<oneshot::Receiver<()>>,
    ) -> StepOutcome {
        let span = info_span!("step", step_id = %step.id);
        async move {
            match step.executor {
                BakedExecutor::Shell {
                    command,
                    workdir,
                    env,
                    on_error,
                    outputs,
                } => {
                    self.run_shell(
                        &step.id, &command, workdir, env, on_error, outputs, &outputs_snapshot, attempt,
                    )
                    .await
                }
                BakedExecutor::Spawn {
                    agent,
                    workdir,
                    env,
                    spawn_args,
                    adapter: _,
                    resume_session: _,
                } => {
                    self.run_spawn(
                        &step.id,
                        agent,
                        workdir,
                        env,
                        spawn_args,
                        step.timeout,
                        agent_ready,
                    )
                    .await
                }
                BakedExecutor::Kill {
                    agent,
                    graceful,
                    timeout,
                } => self.run_kill(agent, graceful, timeout).await,
                BakedExecutor::Expand { template, variables } => {
                    self.run_expand(&step.id, &template, variables).await
                }
                BakedExecutor::Branch {
                    condition,
                    on_true,
                    on_false,
                    on_timeout,
                    workdir,
                    env,
                    outputs,
                    on_error,
                } => {
                    self.run_branch(
                        &step.id, &condition, on_true, on_false, on_timeout, workdir, env, outputs,
                        on_error, step.timeout, attempt,
                    )
                    .await
                }
                BakedExecutor::Foreach {
                    items,
                    item_var,
                    index_var,
                    template,
                    variables,
                    parallel,
                    max_concurrent,
                    join,
                } => {
                    self.run_foreach(
                        &step.id, items, item_var, index_var, &template, variables, parallel,
                        max_concurrent, join,
                    )
                    .await
                }
                BakedExecutor::Agent {
                    agent,
                    prompt,
                    outputs,
                    interactive: _,
                    // TODO: interactive clarifying-question flow needs a
                    // run-level public API for an external caller to
                    // answer mid-run; not wired up yet.
                } => self.run_agent(&step.id, agent, prompt, outputs).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_shell(
        &self,
        step_id: &str,
        command: &str,
        workdir: Option<String>,
        env: HashMap<String, String>,
        on_error: OnError,
        outputs: HashMap<String, OutputDecl>,
        outputs_snapshot: &HashMap<String, HashMap<String, Value>>,
        attempt: u32,
    ) -> StepOutcome {
        let command = match finalize(command, outputs_snapshot) {
            Ok(c) => c,
            Err(message) => return terminal_failed(message),
        };
        let cwd = workdir.map(PathBuf::from);
        match self.shell.run(&command, cwd.as_ref(), &env).await {
            Ok(outcome) if outcome.exit_code == 0 => match decode_outputs(&outputs, &outcome) {
                Ok(decoded) => StepOutcome::Terminal {
                    status: TerminalStatus::Done,
                    outputs: decoded,
                    error: None,
                },
                Err(message) => terminal_failed(message),
            },
            Ok(outcome) => {
                warn!(step_id, exit_code = outcome.exit_code, "shell step failed");
                match on_error {
                    OnError::Continue => match decode_outputs(&outputs, &outcome) {
                        Ok(decoded) => StepOutcome::Terminal {
                            status: TerminalStatus::Done,
                            outputs: decoded,
                            error: None,
                        },
                        Err(message) => terminal_failed(message),
                    },
                    OnError::Retry(max) if attempt < max => StepOutcome::Retry,
                    OnError::Retry(_) | OnError::Fail => {
                        terminal_failed(format!("command exited with status {}", outcome.exit_code))
                    }
                }
            }
            Err(e) => terminal_failed(e.to_string()),
        }
    }

    async fn run_spawn(
        &self,
        step_id: &str,
        agent: String,
        workdir: Option<String>,
        mut env: HashMap<String, String>,
        spawn_args: Vec<String>,
        timeout: Option<Duration>,
        agent_ready: Option<oneshot::Receiver<()>>,
    ) -> StepOutcome {
        env.insert("MEOW_ORCH_SOCK".to_string(), self.socket_path.display().to_string());
        env.insert("MEOW_AGENT".to_string(), agent.clone());
        env.insert("MEOW_WORKFLOW".to_string(), self.workflow_id.clone());
        env.insert("MEOW_STEP".to_string(), step_id.to_string());

        let config = AgentSpawnConfig {
            agent_id: AgentId::new(agent.clone()),
            agent_name: agent.clone(),
            command: spawn_args.join(" "),
            env: env.into_iter().collect(),
            cwd: workdir.map(PathBuf::from),
        };

        if let Err(e) = self.agents.spawn(config).await {
            return terminal_failed(e.to_string());
        }

        let readiness_timeout = timeout.unwrap_or(DEFAULT_SPAWN_READINESS);
        let Some(ready_rx) = agent_ready else {
            return terminal_failed("no readiness channel registered for spawn step".to_string());
        };
        match tokio::time::timeout(readiness_timeout, ready_rx).await {
            Ok(_) => {
                info!(step_id, %agent, "agent announced readiness");
                StepOutcome::Terminal {
                    status: TerminalStatus::Done,
                    outputs: HashMap::new(),
                    error: None,
                }
            }
            Err(_) => terminal_failed(format!(
                "agent '{agent}' did not announce readiness within {readiness_timeout:?}"
            )),
        }
    }

    async fn run_kill(&self, agent: String, graceful: bool, timeout: Option<Duration>) -> StepOutcome {
        let id = AgentId::new(agent);
        let result = match timeout {
            Some(d) => tokio::time::timeout(d, self.agents.kill(&id, graceful))
                .await
                .unwrap_or_else(|_| Err(meow_adapters::AgentError::KillFailed(
                    id.to_string(),
                    "timed out waiting for graceful exit".to_string(),
                ))),
            None => self.agents.kill(&id, graceful).await,
        };
        match result {
            Ok(()) => StepOutcome::Terminal {
                status: TerminalStatus::Done,
                outputs: HashMap::new(),
                error: None,
            },
            Err(e) => terminal_failed(e.to_string()),
        }
    }

    async fn run_expand(
        &self,
        step_id: &str,
        template: &str,
        variables: HashMap<String, Value>,
    ) -> StepOutcome {
        match self.load_and_bake(step_id, template, variables) {
            Ok(children) => StepOutcome::Spliced {
                children,
                self_done: false,
            },
            Err(message) => terminal_failed(message),
        }
    }

    async fn run_branch(
        &self,
        step_id: &str,
        condition: &str,
        on_true: Option<BakedTarget>,
        on_false: Option<BakedTarget>,
        on_timeout: Option<BakedTarget>,
        workdir: Option<String>,
        env: HashMap<String, String>,
        outputs: HashMap<String, OutputDecl>,
        on_error: OnError,
        timeout: Option<Duration>,
        attempt: u32,
    ) -> StepOutcome {
        let cwd = workdir.map(PathBuf::from);
        let run_fut = self.shell.run(condition, cwd.as_ref(), &env);
        let outcome = match timeout {
            Some(d) => match tokio::time::timeout(d, run_fut).await {
                Ok(inner) => inner,
                Err(_) => {
                    return match on_timeout {
                        Some(target) => self.splice_target(step_id, target),
                        None => terminal_failed("branch condition timed out".to_string()),
                    }
                }
            },
            None => run_fut.await,
        };

        match outcome {
            Ok(outcome) if outcome.exit_code == 0 => {
                match on_true {
                    Some(target) => self.splice_target(step_id, target),
                    None => match decode_outputs(&outputs, &outcome) {
                        Ok(decoded) => StepOutcome::Terminal {
                            status: TerminalStatus::Done,
                            outputs: decoded,
                            error: None,
                        },
                        Err(message) => terminal_failed(message),
                    },
                }
            }
            Ok(outcome) => match on_false {
                Some(target) => self.splice_target(step_id, target),
                None => match on_error {
                    OnError::Continue => StepOutcome::Terminal {
                        status: TerminalStatus::Done,
                        outputs: HashMap::new(),
                        error: None,
                    },
                    OnError::Retry(max) if attempt < max => StepOutcome::Retry,
                    OnError::Retry(_) | OnError::Fail => {
                        terminal_failed(format!("condition exited with status {}", outcome.exit_code))
                    }
                },
            },
            Err(e) => terminal_failed(e.to_string()),
        }
    }

    async fn run_foreach(
        &self,
        step_id: &str,
        items: Vec<Value>,
        item_var: String,
        index_var: Option<String>,
        template: &str,
        variables: HashMap<String, Value>,
        parallel: bool,
        max_concurrent: Option<usize>,
        join: bool,
    ) -> StepOutcome {
        // `parallel = false` is a concurrency cap of exactly one; a
        // configured `max_concurrent` of zero/unset under `parallel =
        // true` means no cap. Either way this is expressed as `needs`
        // chaining across batches of the flattened child step graph,
        // not as a separate runtime scheduler: each batch's root steps
        // (no internal `needs`) wait on the previous batch's sink
        // steps (nothing inside the child depends on them).
        let limit = if !parallel {
            Some(1)
        } else {
            max_concurrent.filter(|&m| m > 0)
        };

        let mut children: Vec<BakedStep> = Vec::new();
        let mut current_batch_sinks: Vec<String> = Vec::new();
        let mut prev_batch_sinks: Vec<String> = Vec::new();

        for (idx, item) in items.into_iter().enumerate() {
            let mut child_vars = variables.clone();
            child_vars.insert(item_var.clone(), item);
            if let Some(idx_name) = &index_var {
                child_vars.insert(idx_name.clone(), Value::Int(idx as i64));
            }
            let child_prefix = format!("{step_id}.{idx}");
            let mut baked = match self.load_and_bake(&child_prefix, template, child_vars) {
                Ok(baked) => baked,
                Err(message) => return terminal_failed(message),
            };

            if let Some(limit) = limit {
                if idx > 0 && idx % limit == 0 {
                    prev_batch_sinks = std::mem::take(&mut current_batch_sinks);
                }
                if !prev_batch_sinks.is_empty() {
                    let roots = root_ids(&baked);
                    for step in baked.iter_mut() {
                        if roots.contains(&step.id) {
                            step.needs.extend(prev_batch_sinks.iter().cloned());
                        }
                    }
                }
                current_batch_sinks.extend(sink_ids(&baked));
            }

            children.append(&mut baked);
        }
        StepOutcome::Spliced {
            children,
            self_done: !join,
        }
    }

    async fn run_agent(
        &self,
        step_id: &str,
        agent: String,
        prompt: String,
        outputs: HashMap<String, AgentOutputDecl>,
    ) -> StepOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let registration = AgentStepRegistration {
            agent,
            step_id: step_id.to_string(),
            prompt,
            outputs,
            reply: reply_tx,
        };
        if self.register_tx.send(registration).await.is_err() {
            return terminal_failed("dispatcher loop is gone".to_string());
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => terminal_failed("dispatcher dropped the agent step registration".to_string()),
        }
    }

    /// Expand/foreach child splicing: resolve the named template, bake
    /// it with `variables` as caller vars, then prefix every resulting
    /// step id (and internal `needs` reference) with `<prefix>.`.
    fn load_and_bake(
        &self,
        prefix: &str,
        template: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Vec<BakedStep>, String> {
        let workflow = self.resolve_template(template)?;
        let bake = Baker::default()
            .bake(&format!("{prefix}"), &workflow, variables)
            .map_err(|e| e.to_string())?;
        Ok(bake
            .steps
            .into_iter()
            .map(|step| prefix_step(prefix, step))
            .collect())
    }

    /// A leading `.` means the reference is local: it must resolve
    /// within the same module the currently-running workflow came
    /// from, so it's looked up directly against `self.origin` rather
    /// than handed to the loader's tiered file search.
    fn resolve_template(&self, template: &str) -> Result<Workflow, String> {
        if let Some(local_name) = template.strip_prefix('.') {
            return self.origin.workflows.get(local_name).cloned().ok_or_else(|| {
                format!("local reference '{template}' not found in this module")
            });
        }
        let mut ctx = LoadContext::new();
        let (module, section) = self
            .loader
            .load(template, Scope::Project, &mut ctx)
            .map_err(|e| e.to_string())?;
        module
            .workflows
            .get(&section)
            .cloned()
            .ok_or_else(|| format!("workflow section '{section}' not found in '{template}'"))
    }

    fn splice_target(&self, step_id: &str, target: BakedTarget) -> StepOutcome {
        match target {
            BakedTarget::Template { template, variables } => {
                match self.load_and_bake(step_id, &template, variables) {
                    Ok(children) => StepOutcome::Spliced {
                        children,
                        self_done: false,
                    },
                    Err(message) => terminal_failed(message),
                }
            }
            BakedTarget::Inline { steps } => StepOutcome::Spliced {
                children: steps
                    .into_iter()
                    .map(|step| prefix_step(step_id, step))
                    .collect(),
                self_done: false,
            },
        }
    }
}

/// Step ids with no `needs` of their own: the entry points of a
/// spliced child's step graph.
fn root_ids(steps: &[BakedStep]) -> Vec<String> {
    steps
        .iter()
        .filter(|s| s.needs.is_empty())
        .map(|s| s.id.clone())
        .collect()
}

/// Step ids nothing else in `steps` depends on: the exit points of a
/// spliced child's step graph.
fn sink_ids(steps: &[BakedStep]) -> Vec<String> {
    steps
        .iter()
        .filter(|s| {
            !steps.iter().any(|other| {
                other.needs.iter().any(|need| match need.split_once(".*.") {
                    Some((prefix, suffix)) => matches_wildcard(&s.id, prefix, suffix),
                    None => need == &s.id,
                })
            })
        })
        .map(|s| s.id.clone())
        .collect()
}

fn prefix_step(prefix: &str, mut step: BakedStep) -> BakedStep {
    step.id = format!("{prefix}.{}", step.id);
    step.needs = step
        .needs
        .into_iter()
        .map(|need| format!("{prefix}.{need}"))
        .collect();
    step
}

fn terminal_failed(message: String) -> StepOutcome {
    StepOutcome::Terminal {
        status: TerminalStatus::Failed,
        outputs: HashMap::new(),
        error: Some(message),
    }
}

fn finalize(
    template: &str,
    outputs: &HashMap<String, HashMap<String, Value>>,
) -> Result<String, String> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    let mut ctx = Context::new(HashMap::new());
    ctx.outputs = outputs.clone();
    ctx.substitute_for_shell(template).map_err(|e| e.to_string())
}

fn decode_outputs(
    decls: &HashMap<String, OutputDecl>,
    outcome: &ShellOutcome,
) -> Result<HashMap<String, Value>, String> {
    let mut out = HashMap::with_capacity(decls.len());
    for (name, decl) in decls {
        let raw = match decl.source.as_str() {
            "stdout" => outcome.stdout.trim().to_string(),
            "stderr" => outcome.stderr.trim().to_string(),
            "exit_code" => outcome.exit_code.to_string(),
            other => match other.strip_prefix("file:") {
                Some(path) => std::fs::read_to_string(path)
                    .map_err(|e| format!("output '{name}': reading '{path}': {e}"))?
                    .trim()
                    .to_string(),
                None => return Err(format!("output '{name}': unknown source '{other}'")),
            },
        };
        let value = Value::String(raw);
        let value = match decl.var_type {
            Some(var_type) => value
                .coerce(to_core_type(var_type))
                .map_err(|e| format!("output '{name}': {e}"))?,
            None => value,
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn to_core_type(t: VarType) -> meow_core::value::ValueType {
    use meow_core::value::ValueType as VT;
    match t {
        VarType::String => VT::String,
        VarType::Int => VT::Int,
        VarType::Bool => VT::Bool,
        VarType::Object => VT::Object,
        VarType::Json => VT::Json,
        VarType::File => VT::File,
    }
}

/// A single-writer run driver: owns `Run` and the flattened step
/// registry for its lifetime, reacting to worker completions and
/// inbound IPC messages on one task.
pub struct Dispatcher {
    loader: Arc<Loader>,
    shell: Arc<ShellRunner>,
    agents: Arc<dyn AgentAdapter>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        loader: Arc<Loader>,
        shell: Arc<ShellRunner>,
        agents: Arc<dyn AgentAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            loader,
            shell,
            agents,
            clock,
        }
    }

    /// Bake a top-level workflow before handing its steps to
    /// [`Dispatcher::run_workflow`].
    pub fn bake(
        &self,
        workflow_id: &str,
        workflow: &Workflow,
        caller_vars: HashMap<String, Value>,
    ) -> Result<BakeResult, DispatchError> {
        Ok(Baker::default().bake(workflow_id, workflow, caller_vars)?)
    }

    /// Drive `bake` to completion, consuming inbound IPC traffic from
    /// `ipc_rx` as agents connect over the run's socket.
    pub async fn run_workflow(
        &self,
        run_id: RunId,
        workflow_id: String,
        template_ref: String,
        steps: Vec<BakedStep>,
        origin_module: Arc<Module>,
        socket_path: PathBuf,
        caller_variables: HashMap<String, Value>,
        cleanup_on_success: Option<String>,
        cleanup_on_failure: Option<String>,
        cleanup_on_stop: Option<String>,
        mut ipc_rx: mpsc::Receiver<Inbound>,
    ) -> Run {
        let mut run = Run::new(run_id, template_ref, caller_variables);
        run.status = RunStatus::Running;

        let mut registry: HashMap<String, BakedStep> = HashMap::new();
        for step in steps {
            run.steps
                .insert(StepId::new(step.id.clone()), StepState::pending(executor_tag(&step.executor)));
            registry.insert(step.id.clone(), step);
        }

        let (register_tx, mut register_rx) = mpsc::channel::<AgentStepRegistration>(32);
        let worker = Worker {
            shell: Arc::clone(&self.shell),
            agents: Arc::clone(&self.agents),
            loader: Arc::clone(&self.loader),
            origin: origin_module,
            socket_path,
            workflow_id,
            register_tx,
        };

        let mut scheduler = Scheduler::new();
        let mut join_set: JoinSet<(String, StepOutcome)> = JoinSet::new();
        let mut watch_children: HashMap<String, Vec<String>> = HashMap::new();
        let mut agent_ready_tx: HashMap<String, oneshot::Sender<()>> = HashMap::new();
        let mut pending_prompts: HashMap<String, VecDeque<String>> = HashMap::new();
        let mut awaiting_agent_step: HashMap<String, (oneshot::Sender<StepOutcome>, HashMap<String, AgentOutputDecl>)> =
            HashMap::new();

        loop {
            let ready: Vec<String> = registry
                .keys()
                .filter(|id| {
                    run.steps
                        .get(id.as_str())
                        .map(|s| s.status == StepStatus::Pending)
                        .unwrap_or(false)
                })
                .filter(|id| {
                    registry
                        .get(*id)
                        .map(|step| needs_satisfied(&step.needs, &run))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            for id in ready {
                let attempt = run.steps.get(id.as_str()).map(|s| s.attempt).unwrap_or(0);
                if let Some(state) = run.steps.get_mut(id.as_str()) {
                    state.status = StepStatus::Running;
                    state.started_at = std::time::Instant::now();
                }
                let Some(step) = registry.get(&id).cloned() else { continue };
                if let Some(timeout) = step.timeout {
                    scheduler.set_timer(id.clone(), timeout, self.clock.now());
                }
                let outputs_snapshot: HashMap<String, HashMap<String, Value>> = run
                    .steps
                    .iter()
                    .filter(|(_, s)| s.status.is_terminal())
                    .map(|(sid, s)| (sid.to_string(), s.outputs.clone()))
                    .collect();

                let agent_ready_rx = if let BakedExecutor::Spawn { agent, .. } = &step.executor {
                    let (tx, rx) = oneshot::channel();
                    agent_ready_tx.insert(agent.clone(), tx);
                    Some(rx)
                } else {
                    None
                };

                let worker = worker.clone();
                join_set.spawn(async move {
                    let outcome = worker.execute(step, attempt, outputs_snapshot, agent_ready_rx).await;
                    (id, outcome)
                });
            }

            if join_set.is_empty() && awaiting_agent_step.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = join_set.join_next() => {
                    let Ok((id, outcome)) = joined else {
                        warn!("a step worker task panicked");
                        continue;
                    };
                    self.apply_outcome(&mut run, &mut registry, &mut watch_children, id, outcome);
                }
                Some(inbound) = ipc_rx.recv() => {
                    handle_inbound(
                        inbound,
                        &mut agent_ready_tx,
                        &mut pending_prompts,
                        &mut awaiting_agent_step,
                    );
                }
                Some(registration) = register_rx.recv() => {
                    pending_prompts
                        .entry(registration.agent.clone())
                        .or_default()
                        .push_back(registration.prompt.clone());
                    awaiting_agent_step.insert(
                        registration.step_id.clone(),
                        (registration.reply, registration.outputs),
                    );
                }
                else => break,
            }

            let fired = scheduler.fired_timers(self.clock.now());
            for id in fired {
                if let Some(state) = run.steps.get_mut(id.as_str()) {
                    if !state.status.is_terminal() {
                        warn!(step_id = %id, "step timed out");
                        state.status = StepStatus::Failed;
                        state.error = Some("step exceeded its timeout".to_string());
                    }
                }
            }

            self.resolve_watched_parents(&mut run, &mut watch_children);
        }

        self.resolve_watched_parents(&mut run, &mut watch_children);

        run.status = if run.steps.values().any(|s| s.status == StepStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Done
        };

        let cleanup_script = match run.status {
            RunStatus::Done => cleanup_on_success,
            RunStatus::Failed => cleanup_on_failure,
            _ => cleanup_on_stop,
        };
        if let Some(script) = cleanup_script {
            let outcome = self.shell.run(&script, None, &HashMap::new()).await;
            match outcome {
                Ok(o) if o.exit_code != 0 => warn!(exit_code = o.exit_code, "cleanup script failed"),
                Err(e) => warn!(error = %e, "cleanup script could not run"),
                _ => {}
            }
        }

        run.done_at = Some(std::time::Instant::now());
        run
    }

    fn apply_outcome(
        &self,
        run: &mut Run,
        registry: &mut HashMap<String, BakedStep>,
        watch_children: &mut HashMap<String, Vec<String>>,
        id: String,
        outcome: StepOutcome,
    ) {
        match outcome {
            StepOutcome::Terminal { status, outputs, error } => {
                if let Some(state) = run.steps.get_mut(id.as_str()) {
                    state.status = match status {
                        TerminalStatus::Done => StepStatus::Done,
                        TerminalStatus::Failed => StepStatus::Failed,
                        TerminalStatus::Skipped => StepStatus::Skipped,
                    };
                    state.outputs = outputs;
                    state.error = error;
                }
            }
            StepOutcome::Retry => {
                if let Some(state) = run.steps.get_mut(id.as_str()) {
                    state.attempt += 1;
                    state.status = StepStatus::Pending;
                }
            }
            StepOutcome::Spliced { children, self_done } => {
                let child_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
                for child in children {
                    run.steps.insert(
                        StepId::new(child.id.clone()),
                        StepState::pending(executor_tag(&child.executor)),
                    );
                    registry.insert(child.id.clone(), child);
                }
                if self_done {
                    if let Some(state) = run.steps.get_mut(id.as_str()) {
                        state.status = StepStatus::Done;
                    }
                } else {
                    if let Some(state) = run.steps.get_mut(id.as_str()) {
                        state.status = StepStatus::Completing;
                    }
                    watch_children.insert(id, child_ids);
                }
            }
        }
    }

    fn resolve_watched_parents(&self, run: &mut Run, watch_children: &mut HashMap<String, Vec<String>>) {
        let mut resolved = Vec::new();
        for (parent, children) in watch_children.iter() {
            let all_terminal = children
                .iter()
                .all(|c| run.steps.get(c.as_str()).map(|s| s.status.is_terminal()).unwrap_or(false));
            if all_terminal {
                let any_failed = children
                    .iter()
                    .any(|c| run.steps.get(c.as_str()).map(|s| s.status == StepStatus::Failed).unwrap_or(false));
                if let Some(state) = run.steps.get_mut(parent.as_str()) {
                    state.status = if any_failed { StepStatus::Failed } else { StepStatus::Done };
                }
                resolved.push(parent.clone());
            }
        }
        for parent in resolved {
            watch_children.remove(&parent);
        }
    }
}

fn needs_satisfied(needs: &[String], run: &Run) -> bool {
    needs.iter().all(|need| {
        if let Some((prefix, suffix)) = need.split_once(".*.") {
            run.steps.iter().any(|(id, _)| matches_wildcard(id.as_str(), prefix, suffix))
                && run
                    .steps
                    .iter()
                    .filter(|(id, _)| matches_wildcard(id.as_str(), prefix, suffix))
                    .all(|(_, s)| s.status.is_terminal())
        } else {
            run.steps
                .get(need.as_str())
                .map(|s| matches!(s.status, StepStatus::Done | StepStatus::Skipped))
                .unwrap_or(false)
        }
    })
}

fn matches_wildcard(id: &str, prefix: &str, suffix: &str) -> bool {
    let with_dot_prefix = format!("{prefix}.");
    let with_dot_suffix = format!(".{suffix}");
    if id == format!("{prefix}.{suffix}") {
        return true;
    }
    id.starts_with(&with_dot_prefix) && id.ends_with(&with_dot_suffix) && id.len() > with_dot_prefix.len() + with_dot_suffix.len()
}

fn handle_inbound(
    inbound: Inbound,
    agent_ready_tx: &mut HashMap<String, oneshot::Sender<()>>,
    pending_prompts: &mut HashMap<String, VecDeque<String>>,
    awaiting_agent_step: &mut HashMap<String, (oneshot::Sender<StepOutcome>, HashMap<String, AgentOutputDecl>)>,
) {
    let agent_name = match &inbound.message {
        AgentMessage::StepDone { agent, .. }
        | AgentMessage::GetPrompt { agent }
        | AgentMessage::Event { agent, .. } => agent.clone(),
    };
    if let Some(tx) = agent_ready_tx.remove(&agent_name) {
        let _ = tx.send(());
    }

    match inbound.message {
        AgentMessage::GetPrompt { agent } => {
            let content = pending_prompts
                .get_mut(&agent)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default();
            reply(inbound.reply, OrchestratorMessage::Prompt { content });
        }
        AgentMessage::StepDone { step, outputs, .. } => {
            match awaiting_agent_step.remove(&step) {
                Some((tx, decls)) => {
                    let missing_required = decls
                        .iter()
                        .find(|(name, decl)| decl.required && !outputs.contains_key(*name));
                    let outcome = match missing_required {
                        Some((name, _)) => terminal_failed(format!("missing required output '{name}'")),
                        None => StepOutcome::Terminal {
                            status: TerminalStatus::Done,
                            outputs,
                            error: None,
                        },
                    };
                    let is_failed = matches!(
                        &outcome,
                        StepOutcome::Terminal { status: TerminalStatus::Failed, .. }
                    );
                    let _ = tx.send(outcome);
                    reply(
                        inbound.reply,
                        if is_failed {
                            OrchestratorMessage::Error {
                                message: "missing required output".to_string(),
                            }
                        } else {
                            OrchestratorMessage::Ok
                        },
                    );
                }
                None => reply(
                    inbound.reply,
                    OrchestratorMessage::Error {
                        message: format!("no step is awaiting a step_done for '{step}'"),
                    },
                ),
            }
        }
        AgentMessage::Event { event_type, agent, .. } => {
            info!(%agent, event_type, "agent event");
        }
    }
}

fn reply(reply: Option<oneshot::Sender<OrchestratorMessage>>, message: OrchestratorMessage) {
    if let Some(tx) = reply {
        let _ = tx.send(message);
    }
}

fn executor_tag(executor: &BakedExecutor) -> &'static str {
    match executor {
        BakedExecutor::Shell { .. } => "shell",
        BakedExecutor::Spawn { .. } => "spawn",
        BakedExecutor::Kill { .. } => "kill",
        BakedExecutor::Expand { .. } => "expand",
        BakedExecutor::Branch { .. } => "branch",
        BakedExecutor::Foreach { .. } => "foreach",
        BakedExecutor::Agent { .. } => "agent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meow_adapters::FakeAgentAdapter;
    use meow_core::clock::FakeClock;
    use meow_workflow::model::OutputDecl;

    fn shell_step(id: &str, needs: &[&str], command: &str) -> BakedStep {
        BakedStep {
            id: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            executor: BakedExecutor::Shell {
                command: command.to_string(),
                workdir: None,
                env: HashMap::new(),
                on_error: OnError::Fail,
                outputs: HashMap::new(),
            },
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(Loader::new(None, None)),
            Arc::new(ShellRunner::default()),
            Arc::new(FakeAgentAdapter::default()),
            Arc::new(FakeClock::new()),
        )
    }

    #[tokio::test]
    async fn runs_independent_shell_steps_to_completion() {
        let (_tx, rx) = mpsc::channel(1);
        let steps = vec![
            shell_step("a", &[], "true"),
            shell_step("b", &["a"], "true"),
        ];
        let run = dispatcher()
            .run_workflow(
                RunId::new("run-test-00000001"),
                "wf".to_string(),
                "wf.toml#main".to_string(),
                steps,
                Arc::new(Module::default()),
                PathBuf::from("/tmp/does-not-matter.sock"),
                HashMap::new(),
                None,
                None,
                None,
                rx,
            )
            .await;

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.steps.get("a").unwrap().status, StepStatus::Done);
        assert_eq!(run.steps.get("b").unwrap().status, StepStatus::Done);
    }

    #[tokio::test]
    async fn a_failing_step_fails_the_run_but_lets_independent_steps_finish() {
        let (_tx, rx) = mpsc::channel(1);
        let steps = vec![
            shell_step("will_fail", &[], "false"),
            shell_step("unrelated", &[], "true"),
        ];
        let run = dispatcher()
            .run_workflow(
                RunId::new("run-test-00000002"),
                "wf".to_string(),
                "wf.toml#main".to_string(),
                steps,
                Arc::new(Module::default()),
                PathBuf::from("/tmp/does-not-matter.sock"),
                HashMap::new(),
                None,
                None,
                None,
                rx,
            )
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.get("will_fail").unwrap().status, StepStatus::Failed);
        assert_eq!(run.steps.get("unrelated").unwrap().status, StepStatus::Done);
    }

    #[tokio::test]
    async fn downstream_step_never_runs_before_its_dependency_finishes() {
        let (_tx, rx) = mpsc::channel(1);
        let steps = vec![
            shell_step("blocked", &["never_runs"], "true"),
            shell_step("never_runs", &[], "false"),
        ];
        let run = dispatcher()
            .run_workflow(
                RunId::new("run-test-00000003"),
                "wf".to_string(),
                "wf.toml#main".to_string(),
                steps,
                Arc::new(Module::default()),
                PathBuf::from("/tmp/does-not-matter.sock"),
                HashMap::new(),
                None,
                None,
                None,
                rx,
            )
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.get("never_runs").unwrap().status, StepStatus::Failed);
        // never becomes eligible since its only dependency failed rather than
        // reaching `done`/`skipped`.
        assert_eq!(run.steps.get("blocked").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted_then_the_step_fails() {
        let (_tx, rx) = mpsc::channel(1);
        // `false` always exits 1, so this re-dispatches twice (the declared
        // budget) and then gives up rather than retrying forever.
        let step = BakedStep {
            id: "flaky".to_string(),
            needs: vec![],
            timeout: None,
            executor: BakedExecutor::Shell {
                command: "false".to_string(),
                workdir: None,
                env: HashMap::new(),
                on_error: OnError::Retry(2),
                outputs: HashMap::new(),
            },
        };
        let run = dispatcher()
            .run_workflow(
                RunId::new("run-test-00000004"),
                "wf".to_string(),
                "wf.toml#main".to_string(),
                vec![step],
                Arc::new(Module::default()),
                PathBuf::from("/tmp/does-not-matter.sock"),
                HashMap::new(),
                None,
                None,
                None,
                rx,
            )
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        let state = run.steps.get("flaky").unwrap();
        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.attempt, 2);
    }

    #[tokio::test]
    async fn output_reference_is_substituted_into_a_dependent_shell_command() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "greeting".to_string(),
            OutputDecl {
                source: "stdout".to_string(),
                var_type: None,
            },
        );
        let producer = BakedStep {
            id: "produce".to_string(),
            needs: vec![],
            timeout: None,
            executor: BakedExecutor::Shell {
                command: "echo hello".to_string(),
                workdir: None,
                env: HashMap::new(),
                on_error: OnError::Fail,
                outputs,
            },
        };
        let consumer = shell_step(
            "consume",
            &["produce"],
            "test \"{{produce.outputs.greeting}}\" = 'hello'",
        );

        let (_tx, rx) = mpsc::channel(1);
        let run = dispatcher()
            .run_workflow(
                RunId::new("run-test-00000005"),
                "wf".to_string(),
                "wf.toml#main".to_string(),
                vec![producer, consumer],
                Arc::new(Module::default()),
                PathBuf::from("/tmp/does-not-matter.sock"),
                HashMap::new(),
                None,
                None,
                None,
                rx,
            )
            .await;

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.steps.get("consume").unwrap().status, StepStatus::Done);
    }

    #[test]
    fn wildcard_need_matches_only_direct_children_of_the_prefix() {
        assert!(matches_wildcard("expand.0.child", "expand", "child"));
        assert!(matches_wildcard("expand.child", "expand", "child"));
        assert!(!matches_wildcard("expand.0.other", "expand", "child"));
        assert!(!matches_wildcard("other.0.child", "expand", "child"));
    }

    fn worker_with_origin(origin: Module) -> Worker {
        let (register_tx, _register_rx) = mpsc::channel(1);
        Worker {
            shell: Arc::new(ShellRunner::default()),
            agents: Arc::new(FakeAgentAdapter::default()),
            loader: Arc::new(Loader::new(None, None)),
            origin: Arc::new(origin),
            socket_path: PathBuf::from("/tmp/does-not-matter.sock"),
            workflow_id: "wf".to_string(),
            register_tx,
        }
    }

    fn one_step_module(name: &str, step_id: &str) -> Module {
        use meow_workflow::model::{ExecutorDef, StepDef};
        let mut workflows = indexmap::IndexMap::new();
        workflows.insert(
            name.to_string(),
            Workflow {
                steps: vec![StepDef {
                    id: step_id.to_string(),
                    needs: Vec::new(),
                    timeout: None,
                    executor: ExecutorDef::Shell {
                        command: "true".to_string(),
                        workdir: None,
                        env: HashMap::new(),
                        on_error: None,
                        shell_outputs: HashMap::new(),
                    },
                }],
                ..Default::default()
            },
        );
        Module { path: None, workflows }
    }

    #[tokio::test]
    async fn expand_resolves_a_local_dot_prefixed_template_against_the_origin_module() {
        let worker = worker_with_origin(one_step_module("helper", "only"));
        let outcome = worker.run_expand("go", ".helper", HashMap::new()).await;
        match outcome {
            StepOutcome::Spliced { children, self_done } => {
                assert!(!self_done);
                assert_eq!(children.len(), 1);
                assert_eq!(children[0].id, "go.only");
            }
            other => panic!("expected Spliced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreach_sequential_children_chain_through_needs() {
        let worker = worker_with_origin(one_step_module("child", "only"));
        let outcome = worker
            .run_foreach(
                "fe",
                vec![Value::Int(0), Value::Int(1), Value::Int(2)],
                "it".to_string(),
                None,
                ".child",
                HashMap::new(),
                false,
                None,
                true,
            )
            .await;
        let StepOutcome::Spliced { children, .. } = outcome else {
            panic!("expected Spliced");
        };
        let by_id: HashMap<&str, &BakedStep> = children.iter().map(|s| (s.id.as_str(), s)).collect();
        assert!(by_id["fe.0.only"].needs.is_empty());
        assert_eq!(by_id["fe.1.only"].needs, vec!["fe.0.only".to_string()]);
        assert_eq!(by_id["fe.2.only"].needs, vec!["fe.1.only".to_string()]);
    }

    #[tokio::test]
    async fn foreach_parallel_batches_respect_max_concurrent() {
        let worker = worker_with_origin(one_step_module("child", "only"));
        let outcome = worker
            .run_foreach(
                "fe",
                vec![Value::Int(0), Value::Int(1), Value::Int(2), Value::Int(3)],
                "it".to_string(),
                None,
                ".child",
                HashMap::new(),
                true,
                Some(2),
                true,
            )
            .await;
        let StepOutcome::Spliced { children, .. } = outcome else {
            panic!("expected Spliced");
        };
        let by_id: HashMap<&str, &BakedStep> = children.iter().map(|s| (s.id.as_str(), s)).collect();
        assert!(by_id["fe.0.only"].needs.is_empty());
        assert!(by_id["fe.1.only"].needs.is_empty());
        let mut batch1_needs = by_id["fe.2.only"].needs.clone();
        batch1_needs.sort();
        assert_eq!(batch1_needs, vec!["fe.0.only".to_string(), "fe.1.only".to_string()]);
        let mut batch1_needs_b = by_id["fe.3.only"].needs.clone();
        batch1_needs_b.sort();
        assert_eq!(batch1_needs_b, vec!["fe.0.only".to_string(), "fe.1.only".to_string()]);
    }

    #[test]
    fn finalize_leaves_plain_commands_untouched() {
        let out = finalize("echo hi", &HashMap::new()).unwrap();
        assert_eq!(out, "echo hi");
    }

    #[test]
    fn finalize_resolves_a_known_step_output() {
        let mut outputs = HashMap::new();
        let mut fields = HashMap::new();
        fields.insert("r".to_string(), Value::String("1".to_string()));
        outputs.insert("producer".to_string(), fields);

        let out = finalize("echo {{producer.outputs.r}}", &outputs).unwrap();
        assert_eq!(out, "echo '1'");
    }

    #[test]
    fn decode_outputs_coerces_to_the_declared_type() {
        let mut decls = HashMap::new();
        decls.insert(
            "count".to_string(),
            OutputDecl {
                source: "stdout".to_string(),
                var_type: Some(VarType::Int),
            },
        );
        let outcome = ShellOutcome {
            exit_code: 0,
            stdout: "42\n".to_string(),
            stderr: String::new(),
        };
        let decoded = decode_outputs(&decls, &outcome).unwrap();
        assert_eq!(decoded.get("count"), Some(&Value::Int(42)));
    }

    #[test]
    fn decode_outputs_rejects_an_unknown_source() {
        let mut decls = HashMap::new();
        decls.insert(
            "x".to_string(),
            OutputDecl {
                source: "nonsense".to_string(),
                var_type: None,
            },
        );
        let outcome = ShellOutcome {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(decode_outputs(&decls, &outcome).is_err());
    }
}
