//! The resource manager: device context, kernel cache, and buffer pool.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ocl::enums::ProgramInfo;
use ocl::{Context, Device, Kernel, Program, Queue};
use parking_lot::Mutex;

use crate::buffer::{Buffer, Dims};
use crate::error::{Error, Result};

struct KernelTable {
    kernels: HashMap<String, Kernel>,
    programs: Vec<Program>,
}

impl KernelTable {
    fn new() -> Self {
        KernelTable { kernels: HashMap::new(), programs: Vec::new() }
    }
}

struct BufferPool {
    free: HashMap<u64, Vec<Buffer>>,
}

impl BufferPool {
    fn new() -> Self {
        BufferPool { free: HashMap::new() }
    }

    fn pop(&mut self, dims: Dims) -> Option<Buffer> {
        let stack = self.free.get_mut(&dims.pool_hash())?;
        // Pool hash collisions are possible; pop the most-recently-released
        // buffer (LIFO) that actually matches the requested dimensions.
        if let Some(pos) = stack.iter().rposition(|b| b.dims() == dims) {
            Some(stack.remove(pos))
        } else {
            None
        }
    }

    fn push(&mut self, buffer: Buffer) {
        self.free.entry(buffer.dims().pool_hash()).or_default().push(buffer);
    }
}

/// Owns the device context, the compiled-kernel cache, and the free-buffer
/// pool. One `ResourceManager` is bound to a single scheduler run.
pub struct ResourceManager {
    context: Option<Context>,
    queues: Vec<Queue>,
    kernels: Mutex<KernelTable>,
    pool: Mutex<BufferPool>,
}

impl ResourceManager {
    /// Builds a context over all devices visible to the default platform and
    /// one command queue per device.
    pub fn new() -> Result<Self> {
        let context = Context::builder().build().map_err(Error::from)?;
        let queues = context
            .devices()
            .into_iter()
            .map(|device| Queue::new(&context, device, None).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResourceManager {
            context: Some(context),
            queues,
            kernels: Mutex::new(KernelTable::new()),
            pool: Mutex::new(BufferPool::new()),
        })
    }

    /// Builds a `ResourceManager` with no device context and no queues at
    /// all, for exercising graph/scheduler/pool logic that never requests an
    /// unseeded (device-resident) buffer or touches a kernel. `add_program`
    /// and an unseeded `request_buffer` both fail against this instance;
    /// host-seeded buffers and the free-buffer pool work normally.
    pub fn without_devices() -> Self {
        ResourceManager {
            context: None,
            queues: Vec::new(),
            kernels: Mutex::new(KernelTable::new()),
            pool: Mutex::new(BufferPool::new()),
        }
    }

    pub fn get_context(&self) -> Result<&Context> {
        self.context.as_ref().ok_or_else(|| Error::Other("no device context available".into()))
    }

    pub fn get_command_queue(&self, device_idx: usize) -> Result<&Queue> {
        self.queues
            .get(device_idx)
            .ok_or_else(|| Error::Other(format!("no command queue for device {device_idx}")))
    }

    pub fn num_devices(&self) -> usize {
        self.queues.len()
    }

    /// Compiles `path` for every registered device and enumerates its kernels
    /// into the kernel table, keyed by declared entry-point name.
    pub fn add_program(&self, path: &Path) -> Result<()> {
        let src = fs::read_to_string(path).map_err(|source| Error::LoadProgram {
            path: path.display().to_string(),
            source,
        })?;

        let context = self.get_context()?;
        let devices: Vec<Device> = context.devices();
        let program = Program::builder()
            .src(src)
            .devices(&devices[..])
            .build(context)
            .map_err(|err| Error::CompileProgram {
                path: path.display().to_string(),
                log: err.to_string(),
            })?;

        let names = match program
            .info(ProgramInfo::KernelNames)
            .map_err(|e| Error::Ocl(e.into()))?
        {
            ocl::enums::ProgramInfoResult::KernelNames(s) => s,
            other => other.to_string(),
        };

        let mut table = self.kernels.lock();
        for name in names.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let kernel = Kernel::builder()
                .program(&program)
                .name(name)
                .queue(self.queues[0].clone())
                .build()
                .map_err(Error::from)?;
            table.kernels.insert(name.to_string(), kernel);
        }
        table.programs.push(program);
        Ok(())
    }

    /// Pure lookup; never compiles on demand.
    pub fn get_kernel(&self, name: &str) -> Result<Kernel> {
        self.kernels
            .lock()
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::KernelNotFound(name.to_string()))
    }

    /// Pops from the free pool for `dims`'s hash, allocating on a miss. If
    /// `host_seed` is present and `upload_now` is set, the returned buffer is
    /// already queued for an asynchronous host-to-device transfer.
    pub fn request_buffer(
        &self,
        dims: Dims,
        host_seed: Option<Vec<f32>>,
        upload_now: bool,
    ) -> Result<Buffer> {
        if let Some(mut buffer) = self.pool.lock().pop(dims) {
            if let Some(seed) = host_seed {
                buffer.seed_host(seed);
                if upload_now {
                    let queue = self.queues.first().ok_or_else(|| {
                        Error::AllocationFailed("no device queue available".into())
                    })?;
                    buffer.device_array(queue)?;
                }
            }
            return Ok(buffer);
        }

        match host_seed {
            Some(seed) => {
                let mut buffer = Buffer::from_host(dims, seed);
                if upload_now {
                    let queue = self.queues.first().ok_or_else(|| {
                        Error::AllocationFailed("no device queue available".into())
                    })?;
                    buffer.device_array(queue)?;
                }
                Ok(buffer)
            }
            // Unseeded buffers are allocated device-side: they're about to be
            // written by a device-enabled task's kernel, so there is no host
            // data worth staging first.
            None => {
                let queue = self
                    .queues
                    .first()
                    .ok_or_else(|| Error::AllocationFailed("no device queue available".into()))?;
                let device = ocl::Buffer::<f32>::builder()
                    .queue(queue.clone())
                    .len(dims.element_count().max(1))
                    .build()
                    .map_err(Error::from)?;
                Ok(Buffer::from_device(dims, device))
            }
        }
    }

    /// Returns logical ownership of `buffer` to the free pool.
    pub fn release_buffer(&self, buffer: Buffer) {
        self.pool.lock().push(buffer);
    }

    pub fn request_finish_buffer(&self) -> Buffer {
        Buffer::finish_sentinel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_pop_matches_exact_dims_on_hash_collision() {
        // `pool_hash` folds width into bits 12+ and height into bits 0-11, so
        // a height of exactly 4096 lands on the same bit as a width of 1.
        let mut pool = BufferPool::new();
        let a = Dims::new(1, 0);
        let b = Dims::new(0, 4096);
        assert_eq!(a.pool_hash(), b.pool_hash(), "test assumes a crafted collision");
        assert_ne!(a, b);

        pool.push(Buffer::from_host(a, vec![]));
        pool.push(Buffer::from_host(b, vec![]));

        let popped = pool.pop(b).expect("exact dims match should be found past the collision");
        assert_eq!(popped.dims(), b);
        let popped = pool.pop(a).expect("the other buffer is still in the pool");
        assert_eq!(popped.dims(), a);
        assert!(pool.pop(a).is_none());
    }

    #[test]
    fn pool_pop_is_lifo_for_same_dims() {
        let mut pool = BufferPool::new();
        let dims = Dims::new(3, 3);
        let first = Buffer::from_host(dims, vec![1.0; 9]);
        let second = Buffer::from_host(dims, vec![2.0; 9]);

        let first_id = first.id();
        let second_id = second.id();
        pool.push(first);
        pool.push(second);

        let popped = pool.pop(dims).expect("pool has two buffers");
        assert_eq!(popped.id(), second_id);
        let popped = pool.pop(dims).expect("pool has one buffer left");
        assert_eq!(popped.id(), first_id);
        assert!(pool.pop(dims).is_none());
    }

    #[test]
    fn pop_on_empty_pool_returns_none() {
        let mut pool = BufferPool::new();
        assert!(pool.pop(Dims::new(1, 1)).is_none());
    }

    #[test]
    fn request_buffer_reuses_released_buffer_over_allocating() {
        let resources = ResourceManager::without_devices();
        let dims = Dims::new(4, 4);
        let buffer = resources.request_buffer(dims, Some(vec![7.0; 16]), false).unwrap();
        let released_id = buffer.id();
        resources.release_buffer(buffer);

        let reused = resources.request_buffer(dims, Some(vec![9.0; 16]), false).unwrap();
        assert_eq!(reused.host_snapshot().unwrap(), &[9.0; 16]);
        assert_eq!(resources.pool.lock().free.values().map(Vec::len).sum::<usize>(), 0);
        drop(released_id);
    }

    #[test]
    fn request_buffer_without_devices_rejects_unseeded_request() {
        let resources = ResourceManager::without_devices();
        let err = resources.request_buffer(Dims::new(4, 4), None, false).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
    }
}
