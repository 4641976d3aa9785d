//! A GPU transform task that invokes one element-wise kernel per frame.
//!
//! Grounded on `examples/original_source/core/filters/ufo-filter-backproject.c`'s
//! setup/get_requisition/process triad: load the named kernel once in
//! `setup`, size the output identically to the input in `get_requisition`,
//! upload/enqueue/download in `process`.

use ocl::Queue;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::resource::ResourceManager;
use crate::task::{Configuration, ConfigValue, ProcessOutcome, Requisition, Task, TaskKind};

/// Invokes a single-argument-pair kernel (`__kernel void f(__global float*
/// in, __global float* out)`) over the whole frame.
pub struct KernelMapTask {
    name: String,
    kernel_name: String,
    config: Configuration,
    kernel: Option<ocl::Kernel>,
    queue: Option<Queue>,
}

impl KernelMapTask {
    pub fn new(name: impl Into<String>, kernel_name: impl Into<String>) -> Self {
        let kernel_name = kernel_name.into();
        let mut config = Configuration::new();
        config.insert("kernel".to_string(), ConfigValue::Text(kernel_name.clone()));
        KernelMapTask { name: name.into(), kernel_name, config, kernel: None, queue: None }
    }
}

impl Task for KernelMapTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn is_gpu_enabled(&self) -> bool {
        true
    }

    fn configuration(&self) -> &Configuration {
        &self.config
    }

    fn setup(&mut self, resources: &ResourceManager) -> Result<()> {
        let queue = resources.get_command_queue(0)?.clone();
        let kernel = resources.get_kernel(&self.kernel_name)?;
        self.kernel = Some(kernel);
        self.queue = Some(queue);
        Ok(())
    }

    fn get_requisition(&mut self, inputs: &[&Buffer]) -> Result<Requisition> {
        Ok(Requisition::new(inputs[0].dims()))
    }

    fn process(&mut self, inputs: &mut [Buffer], output: &mut Buffer) -> Result<ProcessOutcome> {
        if inputs[0].is_finish() {
            return Ok(ProcessOutcome::Finish);
        }
        let queue = self.queue.as_ref().expect("setup ran before the first frame");
        let kernel = self.kernel.as_ref().expect("setup ran before the first frame");

        let in_dev = inputs[0].device_array(queue)?.clone();
        let out_dev = output.device_array(queue)?.clone();

        kernel.set_arg(0, &in_dev).map_err(Error::from)?;
        kernel.set_arg(1, &out_dev).map_err(Error::from)?;

        let mut event = ocl::Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .gws(inputs[0].dims().element_count().max(1))
                .enew(&mut event)
                .enq()
                .map_err(Error::from)?;
        }

        output.transfer_id(&inputs[0]);
        output.attach_event(event);
        Ok(ProcessOutcome::Continue)
    }
}
