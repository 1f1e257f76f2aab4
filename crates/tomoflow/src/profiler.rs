/// Profiler - kernel dispatch wrapper with optional timing
///
/// Every task gets a profiler bound to its node. When enabled, each call
/// waits for the queue to drain and records the wall-clock time of the
/// kernel.

use crate::error::Result;
use crate::hal::{CommandQueue, DeviceArray, NodeId};
use crate::resources::Kernel;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One timed kernel execution
#[derive(Debug, Clone)]
pub struct KernelEvent {
    pub kernel: String,
    pub node: NodeId,
    pub global: [u32; 3],
    pub elapsed: Duration,
}

/// Aggregated timings for one kernel
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSummary {
    pub kernel: String,
    pub calls: usize,
    pub total: Duration,
}

#[derive(Clone, Default)]
pub struct Profiler {
    enabled: bool,
    events: Arc<Mutex<Vec<KernelEvent>>>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Dispatch `kernel` on `queue`, timing it when profiling is enabled
    pub fn call(
        &self,
        queue: &CommandQueue,
        kernel: &Kernel,
        args: &[&DeviceArray],
        global: [u32; 3],
    ) -> Result<()> {
        if !self.enabled {
            return queue.dispatch(kernel, args, global);
        }

        let start = Instant::now();
        queue.dispatch(kernel, args, global)?;
        queue.finish()?;
        let elapsed = start.elapsed();

        self.events.lock().push(KernelEvent {
            kernel: kernel.key().to_string(),
            node: queue.node(),
            global,
            elapsed,
        });
        Ok(())
    }

    pub fn events(&self) -> Vec<KernelEvent> {
        self.events.lock().clone()
    }

    /// Per-kernel totals, sorted by kernel name
    pub fn summary(&self) -> Vec<KernelSummary> {
        let mut totals: BTreeMap<String, (usize, Duration)> = BTreeMap::new();
        for event in self.events.lock().iter() {
            let entry = totals.entry(event.kernel.clone()).or_default();
            entry.0 += 1;
            entry.1 += event.elapsed;
        }
        totals
            .into_iter()
            .map(|(kernel, (calls, total))| KernelSummary {
                kernel,
                calls,
                total,
            })
            .collect()
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("enabled", &self.enabled)
            .field("events", &self.events.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::resources::{ResourceManager, CPU_NODE};

    fn setup() -> (ResourceManager, CommandQueue, Kernel) {
        let manager = ResourceManager::host_only(EngineConfig::default());
        manager.register_host_kernel("ops", "fill", |args, _| {
            args[0].fill(1.0);
            Ok(())
        });
        let kernel = manager.get_kernel("ops", "fill").unwrap();
        let queue = manager.command_queue(CPU_NODE).unwrap();
        (manager, queue, kernel)
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let (_manager, queue, kernel) = setup();
        let array = queue.allocate(16).unwrap();
        let profiler = Profiler::new(false);
        profiler.call(&queue, &kernel, &[&array], [4, 1, 1]).unwrap();
        assert!(profiler.events().is_empty());

        let mut out = [0.0; 4];
        queue.read(&array, &mut out).unwrap();
        assert_eq!(out, [1.0; 4]);
    }

    #[test]
    fn enabled_profiler_summarizes_calls() {
        let (_manager, queue, kernel) = setup();
        let array = queue.allocate(16).unwrap();
        let profiler = Profiler::new(true);
        for _ in 0..3 {
            profiler.call(&queue, &kernel, &[&array], [4, 1, 1]).unwrap();
        }

        let events = profiler.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].node, CPU_NODE);

        let summary = profiler.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].kernel, "ops::fill");
        assert_eq!(summary[0].calls, 3);
    }
}
