//! Heap statistics.
//!
//! The engine lock is held while an op runs, so the runtime cannot be asked
//! for its memory usage from inside one. The event loop samples the runtime
//! between callbacks with [`sample`] and the op reports the last sample.

use super::HostResult;
use crate::context::EngineContext;
use crate::protocol::HeapStatistics;
use rquickjs::Runtime;

/// Read the current memory usage of a runtime
pub fn sample(runtime: &Runtime) -> HeapStatistics {
    let usage = runtime.memory_usage();
    HeapStatistics {
        heap_total: u64::try_from(usage.malloc_size).unwrap_or(0),
        heap_used: u64::try_from(usage.memory_used_size).unwrap_or(0),
        external: u64::try_from(usage.binary_object_size).unwrap_or(0),
    }
}

/// Last heap sample as `{ heapTotal, heapUsed, external }` JSON
pub fn get_memory_usage(ctx: &EngineContext) -> HostResult<String> {
    Ok(serde_json::to_string(&ctx.heap())?)
}
