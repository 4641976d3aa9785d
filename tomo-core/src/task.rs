//! The task interface every pipeline stage implements.

use std::collections::HashMap;

use crate::buffer::{Buffer, Dims};
use crate::error::Result;
use crate::resource::ResourceManager;

/// The role a task plays in a graph; purely descriptive, the scheduler
/// doesn't branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Source,
    Sink,
    Transform,
    Reduce,
    Remote,
}

/// A value in a task's enumerated configuration map.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

pub type Configuration = HashMap<String, ConfigValue>;

/// The shape an about-to-be-produced output frame must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requisition {
    pub dims: Dims,
    pub element_count: usize,
}

impl Requisition {
    pub fn new(dims: Dims) -> Self {
        Requisition { dims, element_count: dims.element_count() }
    }
}

/// What a `process` call reports back to its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Continue,
    Finish,
}

/// The contract every pipeline stage satisfies.
///
/// `setup` runs once before the first frame; `get_requisition` and `process`
/// run once per frame thereafter. Implementations that need device kernels
/// load them from `resources` in `setup`, never lazily inside `process`.
pub trait Task: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> TaskKind;

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    fn is_gpu_enabled(&self) -> bool {
        false
    }

    /// Dimensionality of the frames this task expects: 2 for plane images, 3
    /// for volumes (a [`Dims`] with `depth` set). Defaults to 2; a task built
    /// around volumetric kernels overrides it.
    fn expected_rank(&self) -> usize {
        2
    }

    /// True for the framework-supplied identity placeholder; lets the graph
    /// loader find and strip it from a root per §4.4.
    fn is_dummy(&self) -> bool {
        false
    }

    fn configuration(&self) -> &Configuration;

    fn setup(&mut self, resources: &ResourceManager) -> Result<()>;

    fn get_requisition(&mut self, inputs: &[&Buffer]) -> Result<Requisition>;

    fn process(&mut self, inputs: &mut [Buffer], output: &mut Buffer) -> Result<ProcessOutcome>;
}
