//! Software stand-in for a platform decoder.
//!
//! "Decodes" by echoing every queued frame back as an output with the same
//! presentation time, from its own callback thread, the way MediaCodec
//! answers on its looper thread. [`LoopbackControl`] lets tests hold outputs
//! back, inject errors and inspect what the decoder was asked to do.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use framelink_core::{DecoderError, VideoCodec};
use framelink_renderer::SurfaceHandle;
use tracing::{debug, trace};

use crate::backend::{CodecCallbacks, DecoderBackend, DecoderFormat, DecoderParams, DecoderProvider, InputKind};

/// Input slots handed out per decoder.
pub const DEFAULT_INPUT_SLOTS: usize = 4;
/// Bytes each input slot can hold.
pub const INPUT_CAPACITY: usize = 512 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// MARK: - LoopbackControl

/// One input the decoder accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInput {
    pub index: usize,
    pub presentation_time_us: u64,
    pub kind: InputKind,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopbackStats {
    pub created: u64,
    pub configured: u64,
    pub started: u64,
    pub stopped: u64,
    pub parameter_updates: u64,
    pub rendered_outputs: u64,
    pub discarded_outputs: u64,
    pub last_format: Option<DecoderFormat>,
    pub last_params: Option<DecoderParams>,
}

#[derive(Default)]
struct ControlInner {
    hold_outputs: AtomicBool,
    reject_configuration: AtomicBool,
    held: Mutex<Vec<(usize, u64)>>,
    current: Mutex<Option<(u64, Arc<dyn CodecCallbacks>)>>,
    queued: Mutex<Vec<QueuedInput>>,
    stats: Mutex<LoopbackStats>,
    next_decoder: AtomicU64,
}

/// Test handle shared by a [`LoopbackProvider`] and every decoder it creates.
#[derive(Clone, Default)]
pub struct LoopbackControl {
    inner: Arc<ControlInner>,
}

impl LoopbackControl {
    /// While set, decoded outputs are kept back until [`flush_outputs`].
    ///
    /// [`flush_outputs`]: LoopbackControl::flush_outputs
    pub fn hold_outputs(&self, hold: bool) {
        self.inner.hold_outputs.store(hold, Ordering::Release);
    }

    pub fn reject_configuration(&self, reject: bool) {
        self.inner.reject_configuration.store(reject, Ordering::Release);
    }

    /// Deliver every held output to the running decoder's callbacks, inline
    /// on the calling thread. Returns how many were delivered.
    pub fn flush_outputs(&self) -> usize {
        let held = std::mem::take(&mut *lock(&self.inner.held));
        let Some(callbacks) = self.callbacks() else {
            return 0;
        };
        for (index, pts) in &held {
            callbacks.on_output_buffer_available(*index, *pts);
        }
        held.len()
    }

    pub fn held_outputs(&self) -> usize {
        lock(&self.inner.held).len()
    }

    /// Report an output nobody queued, as a misbehaving decoder might.
    pub fn emit_output(&self, presentation_time_us: u64) -> bool {
        match self.callbacks() {
            Some(callbacks) => {
                callbacks.on_output_buffer_available(usize::MAX, presentation_time_us);
                true
            }
            None => false,
        }
    }

    /// Make the running decoder fail.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        match self.callbacks() {
            Some(callbacks) => {
                callbacks.on_error(DecoderError::Fatal { reason: reason.into() });
                true
            }
            None => false,
        }
    }

    pub fn has_running_decoder(&self) -> bool {
        lock(&self.inner.current).is_some()
    }

    pub fn stats(&self) -> LoopbackStats {
        lock(&self.inner.stats).clone()
    }

    pub fn queued(&self) -> Vec<QueuedInput> {
        lock(&self.inner.queued).clone()
    }

    pub fn last_presentation_time(&self) -> Option<u64> {
        lock(&self.inner.queued)
            .iter()
            .rev()
            .find(|q| q.kind == InputKind::Frame)
            .map(|q| q.presentation_time_us)
    }

    fn callbacks(&self) -> Option<Arc<dyn CodecCallbacks>> {
        lock(&self.inner.current).as_ref().map(|(_, cb)| Arc::clone(cb))
    }

    fn update(&self, f: impl FnOnce(&mut LoopbackStats)) {
        f(&mut lock(&self.inner.stats));
    }
}

// MARK: - LoopbackProvider

pub struct LoopbackProvider {
    name: String,
    codecs: Vec<VideoCodec>,
    input_slots: usize,
    control: LoopbackControl,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            name: "loopback".into(),
            codecs: vec![VideoCodec::H264, VideoCodec::H265],
            input_slots: DEFAULT_INPUT_SLOTS,
            control: LoopbackControl::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_codecs(mut self, codecs: &[VideoCodec]) -> Self {
        self.codecs = codecs.to_vec();
        self
    }

    pub fn with_input_slots(mut self, slots: usize) -> Self {
        self.input_slots = slots.max(1);
        self
    }

    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderProvider for LoopbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, codec: VideoCodec) -> bool {
        self.codecs.contains(&codec)
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    fn create(&self) -> Result<Box<dyn DecoderBackend>, DecoderError> {
        self.control.update(|s| s.created += 1);
        Ok(Box::new(LoopbackDecoder {
            id: self.control.inner.next_decoder.fetch_add(1, Ordering::Relaxed),
            name: self.name.clone(),
            input_slots: self.input_slots,
            control: self.control.clone(),
            callbacks: None,
            surface: None,
            worker: None,
            next_output: 0,
        }))
    }
}

// MARK: - LoopbackDecoder

enum Job {
    InputAvailable(usize),
    Output { index: usize, pts: u64 },
    Shutdown,
}

struct Worker {
    jobs: std_mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

struct LoopbackDecoder {
    id: u64,
    name: String,
    input_slots: usize,
    control: LoopbackControl,
    callbacks: Option<Arc<dyn CodecCallbacks>>,
    surface: Option<SurfaceHandle>,
    worker: Option<Worker>,
    next_output: usize,
}

impl LoopbackDecoder {
    fn send(&self, job: Job) -> Result<(), DecoderError> {
        let worker = self.worker.as_ref().ok_or(DecoderError::NotInitialized)?;
        worker.jobs.send(job).map_err(|_| DecoderError::Fatal {
            reason: "loopback callback thread exited".into(),
        })
    }
}

impl DecoderBackend for LoopbackDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(
        &mut self,
        format: &DecoderFormat,
        surface: SurfaceHandle,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> Result<(), DecoderError> {
        if self.control.inner.reject_configuration.load(Ordering::Acquire) {
            return Err(DecoderError::ConfigurationRejected {
                reason: format!("{} refused {}", self.name, format.mime),
            });
        }
        self.control.update(|s| {
            s.configured += 1;
            s.last_format = Some(format.clone());
            s.last_params = Some(format.params);
        });
        self.surface = Some(surface);
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        let callbacks = self.callbacks.clone().ok_or(DecoderError::NotInitialized)?;
        if self.worker.is_some() {
            return Ok(());
        }
        let (jobs, rx) = std_mpsc::channel::<Job>();
        let thread_callbacks = Arc::clone(&callbacks);
        let handle = std::thread::Builder::new()
            .name(format!("loopback-decoder-{}", self.id))
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::InputAvailable(index) => {
                            thread_callbacks.on_input_buffer_available(index, INPUT_CAPACITY)
                        }
                        Job::Output { index, pts } => thread_callbacks.on_output_buffer_available(index, pts),
                        Job::Shutdown => break,
                    }
                }
            })
            .map_err(|e| DecoderError::Fatal {
                reason: format!("spawning loopback callback thread: {e}"),
            })?;
        self.worker = Some(Worker { jobs, handle });
        *lock(&self.control.inner.current) = Some((self.id, callbacks));
        self.control.update(|s| s.started += 1);

        for index in 0..self.input_slots {
            self.send(Job::InputAvailable(index))?;
        }
        debug!("{} #{} started ({} input slots)", self.name, self.id, self.input_slots);
        Ok(())
    }

    fn queue_input(
        &mut self,
        index: usize,
        data: &[u8],
        presentation_time_us: u64,
        kind: InputKind,
    ) -> Result<(), DecoderError> {
        if self.worker.is_none() {
            return Err(DecoderError::NotInitialized);
        }
        if index >= self.input_slots {
            return Err(DecoderError::QueueFailed {
                reason: format!("input index {index} out of range"),
            });
        }
        lock(&self.control.inner.queued).push(QueuedInput {
            index,
            presentation_time_us,
            kind,
            len: data.len(),
        });
        trace!("{} #{}: queued {:?} pts={}us", self.name, self.id, kind, presentation_time_us);

        if kind == InputKind::Frame {
            let output = self.next_output;
            self.next_output = self.next_output.wrapping_add(1);
            if self.control.inner.hold_outputs.load(Ordering::Acquire) {
                lock(&self.control.inner.held).push((output, presentation_time_us));
            } else {
                self.send(Job::Output {
                    index: output,
                    pts: presentation_time_us,
                })?;
            }
        }
        self.send(Job::InputAvailable(index))
    }

    fn release_output(&mut self, _index: usize, render: bool) -> Result<(), DecoderError> {
        if render {
            let written = self.surface.as_ref().map_or(false, SurfaceHandle::write_frame);
            if written {
                self.control.update(|s| s.rendered_outputs += 1);
                return Ok(());
            }
        }
        self.control.update(|s| s.discarded_outputs += 1);
        Ok(())
    }

    fn set_parameters(&mut self, params: &DecoderParams) -> Result<(), DecoderError> {
        self.control.update(|s| {
            s.parameter_updates += 1;
            s.last_params = Some(*params);
        });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.jobs.send(Job::Shutdown);
        if worker.handle.thread().id() != std::thread::current().id() {
            let _ = worker.handle.join();
        }
        {
            let mut current = lock(&self.control.inner.current);
            if matches!(&*current, Some((id, _)) if *id == self.id) {
                *current = None;
            }
        }
        lock(&self.control.inner.held).clear();
        self.callbacks = None;
        self.control.update(|s| s.stopped += 1);
        debug!("{} #{} stopped", self.name, self.id);
    }
}

impl Drop for LoopbackDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}
