// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Ordered device work queues.
//!
//! A stream owns one worker thread that retires operations in submission
//! order. Enqueueing never waits: the queue is bounded and a full queue is
//! reported as `ResourceExhausted`. The first failing operation poisons the
//! stream until the next [`Stream::block_host_until_done`], which reports the
//! fault and clears it; operations submitted in between are skipped, event
//! markers excepted.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytemuck::Pod;
use tracing::{error, trace, warn};

use crate::device::{Device, DeviceId};
use crate::error::{fault, internal, invalid, Error, Result};
use crate::memory::{DeviceBuffer, DeviceMemoryBase, HostAllocation};

type Work = Box<dyn FnOnce(&Device) -> Result<()> + Send>;

enum Op {
    Work { label: &'static str, run: Work },
    Marker(Arc<EventState>),
}

#[derive(Default)]
struct StreamState {
    pending: usize,
    fault: Option<Error>,
}

struct Shared {
    state: Mutex<StreamState>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, StreamState>> {
        self.state
            .lock()
            .map_err(|_| internal("stream state poisoned"))
    }
}

/// Ordered queue of device operations.
pub struct Stream {
    device: Device,
    shared: Arc<Shared>,
    sender: Option<SyncSender<Op>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device.id())
            .finish_non_exhaustive()
    }
}

static NEXT_STREAM: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

impl Stream {
    pub(crate) fn new(device: Device) -> Result<Self> {
        let depth = device.caps().stream_queue_depth.max(1) as usize;
        let (sender, receiver) = sync_channel::<Op>(depth);
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState::default()),
            idle: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_device = device.clone();
        let serial = NEXT_STREAM.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let worker = std::thread::Builder::new()
            .name(format!("st-stream{serial}"))
            .spawn(move || {
                for op in receiver {
                    retire(&worker_shared, &worker_device, op);
                }
            })
            .map_err(|err| Error::Internal(format!("stream worker: {err}")))?;

        Ok(Self {
            device,
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    fn submit(&self, op: Op) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| internal("stream already shut down"))?;
        self.shared.lock()?.pending += 1;
        match sender.try_send(op) {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut state = self.shared.lock()?;
                state.pending -= 1;
                if state.pending == 0 {
                    self.shared.idle.notify_all();
                }
                match err {
                    TrySendError::Full(_) => Err(Error::ResourceExhausted(format!(
                        "stream queue full ({} operations)",
                        self.device.caps().stream_queue_depth
                    ))),
                    TrySendError::Disconnected(_) => Err(internal("stream worker exited")),
                }
            }
        }
    }

    fn check_device(&self, region: &DeviceMemoryBase, role: &str) -> Result<()> {
        if region.device_id() != self.device.id() {
            return Err(Error::InvalidArgument(format!(
                "{role} lives on {} but the stream runs on {}",
                region.device_id(),
                self.device.id()
            )));
        }
        Ok(())
    }

    pub(crate) fn then_launch(
        &self,
        label: &'static str,
        kernel: impl FnOnce(&Device) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.submit(Op::Work {
            label,
            run: Box::new(kernel),
        })
    }

    /// Copies `src` into the start of `dst`. The host slice is captured at
    /// enqueue time.
    pub fn then_memcpy_h2d<T: Pod>(&self, dst: &DeviceBuffer<T>, src: &[T]) -> Result<()> {
        self.check_device(dst.as_base(), "copy destination")?;
        if src.len() > dst.len() {
            return Err(Error::InvalidArgument(format!(
                "host source of {} elements does not fit a {}-element buffer",
                src.len(),
                dst.len()
            )));
        }
        let bytes: Vec<u8> = bytemuck::cast_slice(src).to_vec();
        let dst = dst.as_base().clone();
        self.then_launch("memcpy_h2d", move |_| {
            dst.with_bytes_mut(|region| region[..bytes.len()].copy_from_slice(&bytes))
        })
    }

    pub fn then_memcpy_d2h(&self, dst: &HostAllocation, src: &DeviceMemoryBase) -> Result<()> {
        self.check_device(src, "copy source")?;
        if src.size() > dst.size() {
            return Err(Error::InvalidArgument(format!(
                "device source of {} bytes does not fit a {}-byte host allocation",
                src.size(),
                dst.size()
            )));
        }
        let dst = dst.clone();
        let src = src.clone();
        self.then_launch("memcpy_d2h", move |_| {
            let bytes = src.with_bytes(|region| region.to_vec())?;
            dst.write_prefix(&bytes)
        })
    }

    pub fn then_memcpy_d2d(&self, dst: &DeviceMemoryBase, src: &DeviceMemoryBase) -> Result<()> {
        self.check_device(dst, "copy destination")?;
        self.check_device(src, "copy source")?;
        if src.size() > dst.size() {
            return Err(Error::InvalidArgument(format!(
                "device source of {} bytes does not fit a {}-byte destination",
                src.size(),
                dst.size()
            )));
        }
        let dst = dst.clone();
        let src = src.clone();
        self.then_launch("memcpy_d2d", move |_| {
            let bytes = src.with_bytes(|region| region.to_vec())?;
            dst.with_bytes_mut(|region| region[..bytes.len()].copy_from_slice(&bytes))
        })
    }

    /// Fills `dst` with a repeated 32-bit pattern.
    pub fn then_memset32(&self, dst: &DeviceMemoryBase, pattern: u32) -> Result<()> {
        self.check_device(dst, "memset destination")?;
        if dst.size() % 4 != 0 {
            return Err(Error::InvalidArgument(format!(
                "memset32 needs a multiple of 4 bytes, got {}",
                dst.size()
            )));
        }
        let dst = dst.clone();
        let word = pattern.to_ne_bytes();
        self.then_launch("memset32", move |_| {
            dst.with_bytes_mut(|region| {
                for chunk in region.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&word);
                }
            })
        })
    }

    /// Runs `callback` on the stream worker once prior work has retired. An
    /// `Err` is recorded as an execution fault.
    pub fn then_host_callback(
        &self,
        callback: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.then_launch("host_callback", move |_| callback())
    }

    /// Marks `event` complete once every earlier operation has retired.
    pub fn record_event(&self, event: &Event) -> Result<()> {
        event.state.reset()?;
        self.submit(Op::Marker(Arc::clone(&event.state)))
    }

    /// Blocks until all submitted work has retired and reports (then clears)
    /// the first fault since the previous call.
    pub fn block_host_until_done(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        while state.pending > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .map_err(|_| internal("stream state poisoned"))?;
        }
        match state.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Enqueues a device-to-host copy of `src` and blocks until it lands.
    pub fn copy_to_host_blocking<T: Pod>(&self, src: &DeviceBuffer<T>) -> Result<Vec<T>> {
        if src.is_empty() {
            return Ok(Vec::new());
        }
        let host = self.device.allocate_host(src.as_base().size())?;
        self.then_memcpy_d2h(&host, src.as_base())?;
        self.block_host_until_done()?;
        host.read::<T>()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("stream worker panicked during shutdown");
            }
        }
    }
}

fn retire(shared: &Shared, device: &Device, op: Op) {
    match op {
        Op::Marker(event) => event.complete(),
        Op::Work { label, run } => {
            let skip = match shared.state.lock() {
                Ok(state) => state.fault.is_some(),
                Err(_) => true,
            };
            if skip {
                trace!(label, "skipping operation on faulted stream");
            } else {
                trace!(label, "retiring operation");
                let outcome = catch_unwind(AssertUnwindSafe(|| run(device)))
                    .unwrap_or_else(|_| Err(fault(&format!("{label} panicked on the device"))));
                if let Err(err) = outcome {
                    warn!(label, %err, "stream operation faulted");
                    let err = if matches!(err, Error::ExecutionFault(_)) {
                        err
                    } else {
                        Error::ExecutionFault(err.to_string())
                    };
                    if let Ok(mut state) = shared.state.lock() {
                        state.fault.get_or_insert(err);
                    }
                }
            }
        }
    }
    if let Ok(mut state) = shared.state.lock() {
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            shared.idle.notify_all();
        }
    }
}

struct EventState {
    completed: Mutex<Option<Instant>>,
    signal: Condvar,
}

impl EventState {
    fn reset(&self) -> Result<()> {
        *self
            .completed
            .lock()
            .map_err(|_| internal("event state poisoned"))? = None;
        Ok(())
    }

    fn complete(&self) {
        if let Ok(mut completed) = self.completed.lock() {
            *completed = Some(Instant::now());
            self.signal.notify_all();
        }
    }
}

/// Stream-ordered marker carrying the time it completed.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EventState {
                completed: Mutex::new(None),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state
            .completed
            .lock()
            .map(|completed| completed.is_some())
            .unwrap_or(false)
    }

    /// Blocks until the marker retires and returns its completion time.
    pub fn wait(&self) -> Result<Instant> {
        let mut completed = self
            .state
            .completed
            .lock()
            .map_err(|_| internal("event state poisoned"))?;
        loop {
            if let Some(at) = *completed {
                return Ok(at);
            }
            completed = self
                .state
                .signal
                .wait(completed)
                .map_err(|_| internal("event state poisoned"))?;
        }
    }
}

/// Measures stream time between two markers.
#[derive(Debug)]
pub struct EventTimer {
    start: Event,
    stop: Option<Event>,
}

impl EventTimer {
    /// Records the start marker on `stream`.
    pub fn start(stream: &Stream) -> Result<Self> {
        let start = Event::new();
        stream.record_event(&start)?;
        Ok(Self { start, stop: None })
    }

    /// Records the stop marker on `stream`.
    pub fn stop(&mut self, stream: &Stream) -> Result<()> {
        let stop = Event::new();
        stream.record_event(&stop)?;
        self.stop = Some(stop);
        Ok(())
    }

    /// Waits for the stop marker only and returns the time between markers.
    pub fn elapsed(&self) -> Result<Duration> {
        let stop = self
            .stop
            .as_ref()
            .ok_or_else(|| invalid("timer was never stopped"))?;
        let end = stop.wait()?;
        let begin = self.start.wait()?;
        Ok(end.saturating_duration_since(begin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCaps;
    use std::sync::mpsc::channel;

    fn device(depth: u32) -> Device {
        Device::new(0, DeviceCaps::simulated().with_queue_depth(depth)).unwrap()
    }

    #[test]
    fn copies_retire_in_submission_order() {
        let device = device(64);
        let stream = device.create_stream().unwrap();
        let buf = device.allocate::<u32>(4).unwrap();
        stream.then_memset32(buf.as_base(), 7).unwrap();
        stream.then_memcpy_h2d(&buf, &[1u32, 2]).unwrap();
        assert_eq!(stream.copy_to_host_blocking(&buf).unwrap(), vec![1, 2, 7, 7]);
    }

    #[test]
    fn device_to_device_copy_moves_bytes() {
        let device = device(64);
        let stream = device.create_stream().unwrap();
        let src = device.allocate::<f32>(3).unwrap();
        let dst = device.allocate::<f32>(3).unwrap();
        stream.then_memcpy_h2d(&src, &[1.5f32, -2.0, 4.0]).unwrap();
        stream.then_memcpy_d2d(dst.as_base(), src.as_base()).unwrap();
        assert_eq!(stream.copy_to_host_blocking(&dst).unwrap(), vec![1.5, -2.0, 4.0]);
    }

    #[test]
    fn full_queue_is_resource_exhausted() {
        let device = device(2);
        let stream = device.create_stream().unwrap();
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();
        stream
            .then_host_callback(move || {
                started_tx.send(()).ok();
                release_rx.recv().ok();
                Ok(())
            })
            .unwrap();
        started_rx.recv().unwrap();

        stream.then_host_callback(|| Ok(())).unwrap();
        stream.then_host_callback(|| Ok(())).unwrap();
        let err = stream.then_host_callback(|| Ok(())).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));

        release_tx.send(()).unwrap();
        stream.block_host_until_done().unwrap();
    }

    #[test]
    fn faults_surface_at_sync_and_then_clear() {
        let device = device(64);
        let stream = device.create_stream().unwrap();
        let buf = device.allocate::<u32>(2).unwrap();
        stream.then_host_callback(|| Err(fault("injected"))).unwrap();
        stream.then_memset32(buf.as_base(), 9).unwrap();
        let err = stream.block_host_until_done().unwrap_err();
        assert_eq!(err, fault("injected"));

        // the memset after the fault was skipped
        assert_eq!(stream.copy_to_host_blocking(&buf).unwrap(), vec![0, 0]);
        stream.block_host_until_done().unwrap();
    }

    #[test]
    fn panics_become_faults() {
        let device = device(64);
        let stream = device.create_stream().unwrap();
        stream
            .then_host_callback(|| panic!("kernel exploded"))
            .unwrap();
        let err = stream.block_host_until_done().unwrap_err();
        assert!(matches!(err, Error::ExecutionFault(_)));
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let a = device(64);
        let b = device(64);
        let stream = a.create_stream().unwrap();
        let foreign = b.allocate::<u32>(4).unwrap();
        let err = stream.then_memset32(foreign.as_base(), 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn timer_measures_enclosed_work() {
        let device = device(64);
        let stream = device.create_stream().unwrap();
        let mut timer = EventTimer::start(&stream).unwrap();
        stream
            .then_host_callback(|| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(())
            })
            .unwrap();
        timer.stop(&stream).unwrap();
        assert!(timer.elapsed().unwrap() >= Duration::from_millis(5));
    }

    #[test]
    fn events_complete_even_on_a_faulted_stream() {
        let device = device(64);
        let stream = device.create_stream().unwrap();
        let event = Event::new();
        stream.then_host_callback(|| Err(fault("boom"))).unwrap();
        stream.record_event(&event).unwrap();
        event.wait().unwrap();
        assert!(event.is_complete());
        assert!(stream.block_host_until_done().is_err());
    }
}
