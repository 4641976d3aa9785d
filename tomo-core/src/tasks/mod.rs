//! Sample task implementations used by tests and the graph-document loader's
//! built-in plugin registry. Not part of the resource-manager/scheduler/
//! messenger core itself.

pub mod kernel_map;
