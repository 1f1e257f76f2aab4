/// Executor - one worker thread per task, finish propagates on drain
///
/// The executor places every task on a compute node, wires channels
/// between producers and consumers and drives each task through
/// Created -> SetUp -> Running -> Draining -> Finished. Any error moves the
/// task to Failed, which still finishes its output so downstream tasks
/// drain instead of waiting forever.

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::{EngineError, Result};
use crate::graph::{Graph, TaskId};
use crate::hal::{ComputeNode, NodeId};
use crate::profiler::{KernelSummary, Profiler};
use crate::resources::ResourceManager;
use crate::task::{Task, TaskEnv};
use crate::types::{TaskState, MAX_DIMENSIONS};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Outcome of one task
#[derive(Debug)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub node: NodeId,
    pub state: TaskState,
    /// Invocations whose output was delivered (or consumed, for sinks)
    pub processed: u64,
    pub error: Option<EngineError>,
    pub elapsed: Duration,
}

/// Outcome of a whole pipeline run
#[derive(Debug)]
pub struct ExecutionReport {
    pub tasks: Vec<TaskReport>,
    pub elapsed: Duration,
    pub profile: Vec<KernelSummary>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Finished)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &EngineError)> {
        self.tasks
            .iter()
            .filter_map(|t| t.error.as_ref().map(|e| (t.name.as_str(), e)))
    }

    pub fn first_error(&self) -> Option<&EngineError> {
        self.errors().next().map(|(_, e)| e)
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Turn a partial failure into an error
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failed().count();
        if failed == 0 {
            return Ok(self);
        }
        let first = self
            .errors()
            .next()
            .map(|(task, e)| format!("{task}: {e}"))
            .unwrap_or_default();
        Err(EngineError::PipelineFailed { failed, first })
    }
}

pub struct Executor {
    resources: Arc<ResourceManager>,
    profiler: Profiler,
}

impl Executor {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        let profiler = Profiler::new(resources.config().profiling);
        Self {
            resources,
            profiler,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Run `graph` to completion
    ///
    /// Returns `Err` only if the graph is rejected before any task starts;
    /// task failures are reported in the `ExecutionReport`.
    pub fn run(&self, graph: Graph) -> Result<ExecutionReport> {
        graph.validate()?;
        let start = Instant::now();

        let pool_size = self.resources.config().pool_size;
        let outputs: Vec<Option<Channel>> = (0..graph.len())
            .map(|id| {
                graph.has_consumers(id).then(|| {
                    let name = graph.task(id).map(|t| t.name()).unwrap_or("task");
                    Channel::new(format!("{name}#{id}"), pool_size)
                })
            })
            .collect();

        let mut inputs: Vec<Vec<Channel>> = Vec::with_capacity(graph.len());
        for id in 0..graph.len() {
            let wired = graph
                .producers(id)
                .into_iter()
                .map(|producer| producer.and_then(|p| outputs[p].clone()))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| EngineError::Wiring(format!("task {id} has an unwired input")))?;
            inputs.push(wired);
        }
        for channel in inputs.iter().flatten() {
            channel.attach_consumer();
        }

        let nodes = self.place(&graph)?;

        log::info!(
            "Executing {} task(s) with pool size {}",
            graph.len(),
            pool_size
        );

        let mut workers = Vec::with_capacity(graph.len());
        let mut stranded: Vec<Channel> = Vec::new();
        let tasks = graph.into_tasks();
        for (id, ((task, inputs), node)) in tasks.into_iter().zip(inputs).zip(nodes).enumerate() {
            let name = task.name().to_string();
            let runner = TaskRunner {
                id,
                task,
                env: TaskEnv::new(Arc::clone(&self.resources), node, self.profiler.clone()),
                inputs,
                output: outputs[id].clone(),
                state: TaskState::Created,
                processed: 0,
            };

            let node = runner.env.node.id();
            let wired_inputs = runner.inputs.clone();
            let handle = thread::Builder::new()
                .name(format!("tomoflow-{name}"))
                .spawn(move || runner.run());

            match handle {
                Ok(handle) => workers.push((id, name, node, Some(handle))),
                Err(e) => {
                    log::error!("Failed to spawn worker for {}: {e}", name);
                    // Unblock consumers of the task that never ran.
                    if let Some(output) = &outputs[id] {
                        output.finish();
                    }
                    stranded.extend(wired_inputs);
                    workers.push((id, name, node, None));
                }
            }
        }

        // Inputs of tasks that never ran are released here so their
        // producers can finish.
        detach_and_drain(&stranded);

        let reports: Vec<TaskReport> = workers
            .into_iter()
            .map(|(id, name, node, handle)| {
                let joined = handle
                    .ok_or_else(|| "worker thread could not be spawned".to_string())
                    .and_then(|h| h.join().map_err(|p| panic_message(p.as_ref())));
                joined.unwrap_or_else(|reason| TaskReport {
                    id,
                    node,
                    state: TaskState::Failed,
                    processed: 0,
                    error: Some(EngineError::process(name.as_str(), reason)),
                    name,
                    elapsed: Duration::ZERO,
                })
            })
            .collect();

        let report = ExecutionReport {
            tasks: reports,
            elapsed: start.elapsed(),
            profile: self.profiler.summary(),
        };

        if report.is_success() {
            log::info!("Pipeline finished in {:?}", report.elapsed);
        } else {
            log::warn!(
                "Pipeline finished with {} failed task(s) in {:?}",
                report.failed().count(),
                report.elapsed
            );
        }
        Ok(report)
    }

    /// GPU tasks go round-robin over GPU nodes; everything else runs on
    /// the CPU node
    fn place(&self, graph: &Graph) -> Result<Vec<ComputeNode>> {
        let gpus: Vec<&ComputeNode> = self.resources.gpu_nodes().collect();
        let mut next_gpu = 0;
        let mut placement = Vec::with_capacity(graph.len());

        for id in 0..graph.len() {
            let Some(task) = graph.task(id) else {
                continue;
            };
            let node = if task.mode().wants_gpu() {
                if gpus.is_empty() {
                    if self.resources.config().require_gpu {
                        return Err(EngineError::ResourceUnavailable(format!(
                            "task `{}` requires a GPU",
                            task.name()
                        )));
                    }
                    log::warn!(
                        "No GPU for task `{}`, running on emulated host node",
                        task.name()
                    );
                    self.resources.cpu_node().clone()
                } else {
                    let node = gpus[next_gpu % gpus.len()].clone();
                    next_gpu += 1;
                    node
                }
            } else {
                self.resources.cpu_node().clone()
            };
            log::debug!("Task `{}` placed on node {}", task.name(), node.id());
            placement.push(node);
        }
        Ok(placement)
    }
}

struct TaskRunner {
    id: TaskId,
    task: Box<dyn Task>,
    env: TaskEnv,
    inputs: Vec<Channel>,
    output: Option<Channel>,
    state: TaskState,
    processed: u64,
}

impl TaskRunner {
    fn run(mut self) -> TaskReport {
        let start = Instant::now();
        let name = self.task.name().to_string();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&name)))
            .unwrap_or_else(|payload| {
                Err(EngineError::process(name.as_str(), panic_message(payload.as_ref())))
            });
        let mut error = match result {
            Ok(()) => None,
            Err(e) => {
                log::error!("Task `{}` failed: {}", name, e);
                self.state = TaskState::Failed;
                Some(e)
            }
        };

        if let Some(output) = &self.output {
            output.finish();
        }
        self.drain_inputs();

        if self.state != TaskState::Created {
            let task = &mut self.task;
            let env = &self.env;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.teardown(env))) {
                let e = EngineError::process(name.as_str(), panic_message(payload.as_ref()));
                log::error!("Task `{}` teardown failed: {}", name, e);
                self.state = TaskState::Failed;
                error.get_or_insert(e);
            }
        }
        if !self.state.is_terminal() {
            self.state = TaskState::Finished;
        }

        log::info!(
            "Task `{}` {:?} after {} invocation(s)",
            name,
            self.state,
            self.processed
        );

        TaskReport {
            id: self.id,
            name,
            node: self.env.node.id(),
            state: self.state,
            processed: self.processed,
            error,
            elapsed: start.elapsed(),
        }
    }

    fn execute(&mut self, name: &str) -> Result<()> {
        let task = &mut self.task;
        let env = &self.env;
        panic::catch_unwind(AssertUnwindSafe(|| task.setup(env)))
            .unwrap_or_else(|payload| {
                Err(EngineError::setup(name, panic_message(payload.as_ref())))
            })
            .map_err(|e| match e {
                EngineError::SetupFailed { .. } => e,
                other => EngineError::setup(name, other),
            })?;
        self.state = TaskState::SetUp;

        let mut pool_allocated = false;

        loop {
            let Some(mut inputs) = self.pop_inputs() else {
                break;
            };
            self.state = TaskState::Running;

            // Inputs stay owned here so a panic cannot leak them from the pool.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.invoke(name, &mut inputs, &mut pool_allocated)
            }))
            .unwrap_or_else(|payload| {
                Err(EngineError::process(name, panic_message(payload.as_ref())))
            });

            for (channel, buffer) in self.inputs.iter().zip(inputs) {
                channel.release_input_buffer(buffer);
            }

            if !outcome? {
                break;
            }
        }

        self.state = TaskState::Draining;
        Ok(())
    }

    /// One buffer from every input, or `None` once any input is finished
    fn pop_inputs(&self) -> Option<Vec<Buffer>> {
        let mut popped = Vec::with_capacity(self.inputs.len());
        for channel in &self.inputs {
            match channel.pop_input_buffer() {
                Some(buffer) => popped.push(buffer),
                None => {
                    for (channel, buffer) in self.inputs.iter().zip(popped) {
                        channel.release_input_buffer(buffer);
                    }
                    return None;
                }
            }
        }
        Some(popped)
    }

    fn invoke(&mut self, name: &str, inputs: &mut [Buffer], pool_allocated: &mut bool) -> Result<bool> {
        for (i, buffer) in inputs.iter().enumerate() {
            let expected = self.task.num_dimensions(i);
            if expected != 0 && buffer.requisition().rank() != expected {
                return Err(EngineError::ShapeMismatch(format!(
                    "{name}: input {i} has rank {}, expected {expected}",
                    buffer.requisition().rank()
                )));
            }
        }

        let requisition = self.task.requisition(inputs)?;
        if requisition.rank() > MAX_DIMENSIONS {
            return Err(EngineError::ShapeMismatch(format!(
                "{name}: requisition {requisition} exceeds {MAX_DIMENSIONS} dimensions"
            )));
        }

        let mut output = match &self.output {
            Some(channel) => {
                if !*pool_allocated {
                    channel.allocate_output_buffers(&requisition)?;
                    *pool_allocated = true;
                }
                let mut buffer = channel.get_output_buffer()?;
                buffer.set_requisition(&requisition)?;
                Some(buffer)
            }
            None => None,
        };

        let task = &mut self.task;
        let env = &self.env;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            task.process(env, inputs, output.as_mut(), &requisition)
        }))
        .unwrap_or_else(|payload| Err(EngineError::process(name, panic_message(payload.as_ref()))));

        if let (Some(channel), Some(buffer)) = (&self.output, output) {
            if matches!(result, Ok(true)) {
                channel.finalize_output_buffer(buffer);
            } else {
                channel.discard_output_buffer(buffer);
            }
        }

        if matches!(result, Ok(true)) {
            self.processed += 1;
        }
        result
    }

    /// Stop consuming; inputs nobody else reads are drained until their
    /// producers finish
    fn drain_inputs(&self) {
        detach_and_drain(&self.inputs);
    }
}

fn detach_and_drain(inputs: &[Channel]) {
    let mut pending: Vec<&Channel> = inputs.iter().filter(|c| c.detach_consumer()).collect();
    while !pending.is_empty() {
        pending.retain(|channel| !channel.drain_for(DRAIN_POLL));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tasks::CollectSink;
    use crate::types::{Requisition, TaskMode};

    struct Counter {
        remaining: usize,
    }

    impl Task for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
            Ok(())
        }

        fn num_inputs(&self) -> usize {
            0
        }

        fn mode(&self) -> TaskMode {
            TaskMode::CPU_GENERATOR
        }

        fn requisition(&mut self, _inputs: &[Buffer]) -> Result<Requisition> {
            Ok(Requisition::new(&[1]))
        }

        fn process(
            &mut self,
            _env: &TaskEnv,
            _inputs: &mut [Buffer],
            output: Option<&mut Buffer>,
            _requisition: &Requisition,
        ) -> Result<bool> {
            if self.remaining == 0 {
                return Ok(false);
            }
            self.remaining -= 1;
            if let Some(output) = output {
                output.host_view()?[0] = self.remaining as f32;
            }
            Ok(true)
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Stage {
        Setup,
        Requisition,
        Process,
        Teardown,
    }

    struct Panicker(Stage);

    impl Panicker {
        fn panic_at(&self, stage: Stage) {
            if self.0 == stage {
                panic!("boom");
            }
        }
    }

    impl Task for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn setup(&mut self, _env: &TaskEnv) -> Result<()> {
            self.panic_at(Stage::Setup);
            Ok(())
        }

        fn num_inputs(&self) -> usize {
            1
        }

        fn mode(&self) -> TaskMode {
            TaskMode::CPU_PROCESSOR
        }

        fn requisition(&mut self, inputs: &[Buffer]) -> Result<Requisition> {
            self.panic_at(Stage::Requisition);
            Ok(inputs[0].requisition().clone())
        }

        fn process(
            &mut self,
            _env: &TaskEnv,
            _inputs: &mut [Buffer],
            _output: Option<&mut Buffer>,
            _requisition: &Requisition,
        ) -> Result<bool> {
            self.panic_at(Stage::Process);
            Ok(true)
        }

        fn teardown(&mut self, _env: &TaskEnv) {
            self.panic_at(Stage::Teardown);
        }
    }

    /// counter -> panicker -> collecting sink, pool of one
    fn run_panicking(stage: Stage) -> ExecutionReport {
        let executor = Executor::new(Arc::new(ResourceManager::host_only(EngineConfig {
            pool_size: 1,
            ..EngineConfig::default()
        })));
        let mut graph = Graph::new();
        let source = graph.add_task(Counter { remaining: 10 });
        let middle = graph.add_task(Panicker(stage));
        let (sink, _frames) = CollectSink::new();
        let sink = graph.add_task(sink);
        graph.connect(source, middle, 0).unwrap();
        graph.connect(middle, sink, 0).unwrap();
        executor.run(graph).unwrap()
    }

    fn executor() -> Executor {
        Executor::new(Arc::new(ResourceManager::host_only(EngineConfig {
            pool_size: 2,
            ..EngineConfig::default()
        })))
    }

    #[test]
    fn lone_generator_finishes() {
        let mut graph = Graph::new();
        graph.add_task(Counter { remaining: 3 });
        let report = executor().run(graph).unwrap();
        assert!(report.is_success());
        assert_eq!(report.tasks[0].processed, 3);
        assert_eq!(report.tasks[0].state, TaskState::Finished);
    }

    #[test]
    fn panics_become_process_failures() {
        let mut graph = Graph::new();
        let source = graph.add_task(Counter { remaining: 10 });
        let sink = graph.add_task(Panicker(Stage::Process));
        graph.connect(source, sink, 0).unwrap();

        let report = executor().run(graph).unwrap();
        assert!(!report.is_success());
        let failed = report.task("panicker").unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(matches!(
            failed.error,
            Some(EngineError::ProcessFailed { .. })
        ));
        assert_eq!(report.task("counter").unwrap().state, TaskState::Finished);
        assert!(matches!(
            report.into_result(),
            Err(EngineError::PipelineFailed { failed: 1, .. })
        ));
    }

    #[test]
    fn invalid_graph_is_rejected_before_running() {
        let mut graph = Graph::new();
        graph.add_task(Panicker(Stage::Process));
        assert!(matches!(
            executor().run(graph),
            Err(EngineError::Wiring(_))
        ));
    }

    #[test]
    fn panic_in_setup_is_a_setup_failure() {
        let report = run_panicking(Stage::Setup);
        let failed = report.task("panicker").unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(matches!(failed.error, Some(EngineError::SetupFailed { .. })));
        assert_eq!(report.task("counter").unwrap().state, TaskState::Finished);
        assert_eq!(report.task("collect-sink").unwrap().state, TaskState::Finished);
    }

    #[test]
    fn panic_in_requisition_still_finishes_neighbours() {
        let report = run_panicking(Stage::Requisition);
        let failed = report.task("panicker").unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(matches!(failed.error, Some(EngineError::ProcessFailed { .. })));
        assert_eq!(report.task("counter").unwrap().state, TaskState::Finished);
        assert_eq!(report.task("collect-sink").unwrap().processed, 0);
    }

    #[test]
    fn panic_in_teardown_fails_the_task() {
        let report = run_panicking(Stage::Teardown);
        let failed = report.task("panicker").unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.processed, 10);
        assert!(failed.error.is_some());
        assert_eq!(report.task("collect-sink").unwrap().processed, 10);
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops");
        assert_eq!(panic_message(payload.as_ref()), "panicked: oops");
    }
}
