/// Task graph
///
/// Tasks are added as boxed trait objects and wired output-to-input. The
/// executor only accepts a graph that passes `validate`.

use crate::error::{EngineError, Result};
use crate::task::Task;
use std::collections::VecDeque;

pub type TaskId = usize;

/// Output of `from` feeds input slot `input` of `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: TaskId,
    pub to: TaskId,
    pub input: usize,
}

#[derive(Default)]
pub struct Graph {
    tasks: Vec<Box<dyn Task>>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: impl Task + 'static) -> TaskId {
        self.add_boxed(Box::new(task))
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>) -> TaskId {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn task(&self, id: TaskId) -> Option<&dyn Task> {
        self.tasks.get(id).map(|t| t.as_ref())
    }

    /// Feed the output of `from` into input slot `input` of `to`
    pub fn connect(&mut self, from: TaskId, to: TaskId, input: usize) -> Result<()> {
        let (producer, consumer) = match (self.tasks.get(from), self.tasks.get(to)) {
            (Some(p), Some(c)) => (p, c),
            _ => {
                return Err(EngineError::Wiring(format!(
                    "unknown task in edge {from} -> {to}"
                )))
            }
        };
        if from == to {
            return Err(EngineError::Wiring(format!(
                "task `{}` cannot consume its own output",
                producer.name()
            )));
        }
        if input >= consumer.num_inputs() {
            return Err(EngineError::Wiring(format!(
                "task `{}` has {} input(s), cannot wire input {}",
                consumer.name(),
                consumer.num_inputs(),
                input
            )));
        }
        if self.edges.iter().any(|e| e.to == to && e.input == input) {
            return Err(EngineError::Wiring(format!(
                "input {} of task `{}` is already connected",
                input,
                consumer.name()
            )));
        }
        if let Some(edge) = self.edges.iter().find(|e| e.from == from && e.to == to) {
            return Err(EngineError::Wiring(format!(
                "task `{}` already feeds input {} of task `{}`",
                producer.name(),
                edge.input,
                consumer.name()
            )));
        }

        self.edges.push(Edge { from, to, input });
        Ok(())
    }

    /// Check that every input is wired, generators have no inputs and
    /// the graph is acyclic
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::Wiring("graph has no tasks".into()));
        }

        for (id, task) in self.tasks.iter().enumerate() {
            let inputs = task.num_inputs();
            if task.mode().is_generator() && inputs != 0 {
                return Err(EngineError::Wiring(format!(
                    "generator `{}` declares {} input(s)",
                    task.name(),
                    inputs
                )));
            }
            if !task.mode().is_generator() && inputs == 0 {
                return Err(EngineError::Wiring(format!(
                    "processor `{}` has no inputs",
                    task.name()
                )));
            }
            for input in 0..inputs {
                if !self.edges.iter().any(|e| e.to == id && e.input == input) {
                    return Err(EngineError::Wiring(format!(
                        "input {} of task `{}` is not connected",
                        input,
                        task.name()
                    )));
                }
            }
        }

        if self.topological_order().len() != self.tasks.len() {
            return Err(EngineError::Wiring("graph contains a cycle".into()));
        }
        Ok(())
    }

    /// Kahn's algorithm; shorter than `len()` if there is a cycle
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree = vec![0usize; self.tasks.len()];
        for edge in &self.edges {
            in_degree[edge.to] += 1;
        }

        let mut ready: VecDeque<TaskId> = (0..self.tasks.len())
            .filter(|id| in_degree[*id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.from == id) {
                in_degree[edge.to] -= 1;
                if in_degree[edge.to] == 0 {
                    ready.push_back(edge.to);
                }
            }
        }
        order
    }

    /// Producer feeding each input slot of `id`, in slot order
    pub fn producers(&self, id: TaskId) -> Vec<Option<TaskId>> {
        let inputs = self.tasks.get(id).map(|t| t.num_inputs()).unwrap_or(0);
        (0..inputs)
            .map(|input| {
                self.edges
                    .iter()
                    .find(|e| e.to == id && e.input == input)
                    .map(|e| e.from)
            })
            .collect()
    }

    pub fn has_consumers(&self, id: TaskId) -> bool {
        self.edges.iter().any(|e| e.from == id)
    }

    pub(crate) fn into_tasks(self) -> Vec<Box<dyn Task>> {
        self.tasks
    }
}
