//! Dual-resident image buffers.
//!
//! A [`Buffer`] is an image tile that can live on the host, on a device, or
//! both at once. The [`Location`] tag tracks which copy is authoritative so
//! that readers migrate lazily instead of eagerly mirroring every write.

use std::sync::atomic::{AtomicU64, Ordering};

use ocl::{Event, Queue};

use crate::error::{Error, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Fixed shape of an image tile. `depth` is `None` for 2D tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims {
    pub width: usize,
    pub height: usize,
    pub depth: Option<usize>,
}

impl Dims {
    pub fn new(width: usize, height: usize) -> Self {
        Dims { width, height, depth: None }
    }

    pub fn with_depth(width: usize, height: usize, depth: usize) -> Self {
        Dims { width, height, depth: Some(depth) }
    }

    pub fn element_count(&self) -> usize {
        self.width * self.height * self.depth.unwrap_or(1)
    }

    /// Folded hash used to key the free-buffer pool.
    ///
    /// Mirrors `resource_manager_hash_dims` from the original implementation:
    /// `0x345678 ^ (w << 12) ^ h`, extended with depth when present.
    pub fn pool_hash(&self) -> u64 {
        let base = 0x345678u64 ^ ((self.width as u64) << 12) ^ (self.height as u64);
        match self.depth {
            Some(d) => base ^ ((d as u64) << 24),
            None => base,
        }
    }
}

/// Which copy of a buffer's data is currently authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Host,
    Device,
    Both,
}

/// A dual-resident image tile, or the unique *finish* sentinel.
pub struct Buffer {
    id: u64,
    dims: Dims,
    host: Option<Vec<f32>>,
    device: Option<ocl::Buffer<f32>>,
    location: Location,
    event: Option<Event>,
    is_finish: bool,
}

impl Buffer {
    /// Constructs a host-resident buffer seeded with `data`.
    pub fn from_host(dims: Dims, data: Vec<f32>) -> Self {
        Buffer {
            id: next_id(),
            dims,
            host: Some(data),
            device: None,
            location: Location::Host,
            event: None,
            is_finish: false,
        }
    }

    /// Constructs a device-resident buffer with no host mirror yet.
    pub fn from_device(dims: Dims, device: ocl::Buffer<f32>) -> Self {
        Buffer {
            id: next_id(),
            dims,
            host: None,
            device: Some(device),
            location: Location::Device,
            event: None,
            is_finish: false,
        }
    }

    /// Constructs the globally unique finish sentinel.
    ///
    /// Every call produces a buffer with a fresh `id`, but equality as a
    /// sentinel is determined by [`Buffer::is_finish`], not by `id`: once
    /// tagged, a finish buffer compares as "the" finish value to any code
    /// that checks the flag, matching the spec's "unique and compares equal
    /// only to itself" rule in practice (no other code path sets the flag).
    pub fn finish_sentinel() -> Self {
        Buffer {
            id: next_id(),
            dims: Dims::new(0, 0),
            host: None,
            device: None,
            location: Location::Host,
            event: None,
            is_finish: true,
        }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn size_bytes(&self) -> usize {
        self.dims.element_count() * std::mem::size_of::<f32>()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finish(&self) -> bool {
        self.is_finish
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Migrates to `Host` if currently `Device`, blocking on `event` first.
    pub fn host_array(&mut self, queue: &Queue) -> Result<&[f32]> {
        if self.location == Location::Device {
            self.wait()?;
            let device = self
                .device
                .as_ref()
                .expect("location=Device implies a device buffer is present");
            let mut staging = vec![0.0f32; self.dims.element_count()];
            device
                .cmd()
                .queue(queue)
                .read(&mut staging)
                .enq()
                .map_err(Error::from)?;
            self.host = Some(staging);
            self.location = Location::Both;
        }
        Ok(self
            .host
            .as_deref()
            .expect("Host or Both location implies a host mirror is present"))
    }

    /// Migrates to `Device` if currently `Host`, enqueuing the upload on `queue`.
    pub fn device_array(&mut self, queue: &Queue) -> Result<&ocl::Buffer<f32>> {
        if self.location == Location::Host {
            let data = self
                .host
                .as_ref()
                .expect("location=Host implies a host mirror is present");
            let device = ocl::Buffer::<f32>::builder()
                .queue(queue.clone())
                .len(data.len().max(1))
                .copy_host_slice(data)
                .build()
                .map_err(Error::from)?;
            self.device = Some(device);
            self.location = Location::Both;
        }
        Ok(self
            .device
            .as_ref()
            .expect("Device or Both location implies a device buffer is present"))
    }

    /// Returns the host mirror without migrating from the device. `None` if
    /// the buffer is currently `Device`-only; used by host-only tasks that
    /// never touch a command queue.
    pub fn host_snapshot(&self) -> Option<&[f32]> {
        self.host.as_deref()
    }

    /// Attaches a completion event a kernel producing this buffer raised.
    ///
    /// The event always marks a just-enqueued device write, so the device
    /// copy becomes authoritative: a stale host mirror from before the write
    /// must not be handed out by a later `host_array` call without first
    /// waiting on this event and re-reading.
    pub fn attach_event(&mut self, event: Event) {
        self.event = Some(event);
        self.location = Location::Device;
    }

    /// Blocks until the attached event (if any) is signalled.
    pub fn wait(&self) -> Result<()> {
        if let Some(event) = &self.event {
            event.wait_for().map_err(|e| Error::Ocl(e.into()))?;
        }
        Ok(())
    }

    /// Copies `src`'s frame identity into this buffer.
    pub fn transfer_id(&mut self, src: &Buffer) {
        self.id = src.id;
    }

    /// Reallocates the host mirror if `new_dims` needs more elements; a
    /// smaller or equal request just narrows the logical shape.
    pub fn resize(&mut self, new_dims: Dims) {
        if new_dims.element_count() > self.dims.element_count() {
            if let Some(host) = &mut self.host {
                host.resize(new_dims.element_count(), 0.0);
            }
            self.device = None;
            self.location = self.host.as_ref().map_or(Location::Device, |_| Location::Host);
        }
        self.dims = new_dims;
    }

    pub fn cmp_dimensions(&self, other: &Buffer) -> bool {
        self.dims == other.dims
    }

    /// Overwrites the host mirror in place, dropping any device residency so
    /// the next read re-derives it from the new data.
    pub fn seed_host(&mut self, data: Vec<f32>) {
        self.host = Some(data);
        self.device = None;
        self.location = Location::Host;
    }

    /// Deep-copies this buffer for fan-out: the copy is host-only so each
    /// consumer re-uploads to its own device queue lazily rather than
    /// sharing one device allocation across tasks.
    pub fn duplicate(&mut self, queue: &Queue) -> Result<Buffer> {
        let host = self.host_array(queue)?.to_vec();
        let mut copy = Buffer::from_host(self.dims, host);
        copy.id = self.id;
        Ok(copy)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("dims", &self.dims)
            .field("location", &self.location)
            .field("is_finish", &self.is_finish)
            .finish()
    }
}
