//! Background image decoding into a fixed pool of staging buffers.
//!
//! One worker thread turns [`DecodeRequest`]s into texels sitting in a
//! staging buffer. The pool has a fixed number of slots and a slot travels
//! between the two threads:
//!
//! ```text
//! free-slot channel --> worker reserves a slot
//!                       worker blocks for the next request
//!                       decode (+ resize) into the slot's staging buffer
//! result channel    <-- worker posts the completion
//!                       driver drains it, uploads, frees the slot
//! free-slot channel <-- slot index goes back
//! ```
//!
//! The worker reserves a slot before it takes a request off the queue, so a
//! popped request always has somewhere to go. Completions are only ever
//! handled on the thread that calls [`AsyncDecodeWorker::drain_results`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, trace, warn};

use lumen_resources::{DecodedImage, ImageDecoder};
use lumen_rhi::{GpuDevice, RhiResult};

use crate::error::{RenderError, RenderResult};

/// Which texture slot of a material a decoded image belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    BaseColor,
    MetallicRoughness,
    Normal,
}

impl TextureKind {
    /// Whether texels of this kind are sRGB-encoded color.
    pub fn is_srgb(self) -> bool {
        matches!(self, TextureKind::BaseColor)
    }
}

/// Where a finished decode should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecodeTarget {
    /// One texture of a scene material.
    Material { material: u32, kind: TextureKind },
    /// An environment map.
    Environment,
    /// Caller-defined destination.
    Custom(u64),
}

/// A request to decode one image file.
#[derive(Clone, Debug)]
pub struct DecodeRequest {
    pub path: PathBuf,
    /// Resample to this size; `None` keeps the file's size.
    pub extent: Option<(u32, u32)>,
    pub channels: u8,
    pub srgb: bool,
    pub is_float: bool,
    pub target: DecodeTarget,
    slot: Option<usize>,
    sequence: u64,
}

impl DecodeRequest {
    /// An 8-bit, linear request for `channels` channels at the file's size.
    pub fn new(path: impl Into<PathBuf>, channels: u8, target: DecodeTarget) -> Self {
        Self {
            path: path.into(),
            extent: None,
            channels,
            srgb: false,
            is_float: false,
            target,
            slot: None,
            sequence: 0,
        }
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Some((width, height));
        self
    }

    pub fn with_srgb(mut self, srgb: bool) -> Self {
        self.srgb = srgb;
        self
    }

    pub fn with_float(mut self, is_float: bool) -> Self {
        self.is_float = is_float;
        self
    }

    /// Staging slot assigned by the worker.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Sequence id stamped at submission.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes the decoded texels will occupy, if the extent is known.
    pub fn expected_bytes(&self) -> Option<u64> {
        let texel = if self.is_float { 4 } else { 1 };
        self.extent
            .map(|(w, h)| w as u64 * h as u64 * self.channels as u64 * texel)
    }
}

/// A decode that finished with its texels in a staging slot.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeCompletion {
    pub sequence: u64,
    pub target: DecodeTarget,
    pub path: PathBuf,
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub srgb: bool,
    pub is_float: bool,
    /// Length of the texel data at offset 0 of the staging buffer.
    pub byte_len: u64,
}

/// A decode that failed; the texture keeps its fallback.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeFailure {
    pub sequence: u64,
    pub target: DecodeTarget,
    pub path: PathBuf,
    pub message: String,
}

/// What one [`AsyncDecodeWorker::drain_results`] call processed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    pub completed: usize,
    pub failures: Vec<DecodeFailure>,
}

struct WorkerResult {
    slot: usize,
    outcome: Result<DecodeCompletion, DecodeFailure>,
}

struct StagingSlot<S> {
    staging: S,
    /// Cleared by the worker on reservation, set by the driver on release.
    free: AtomicBool,
}

/// Single-thread decoder feeding a fixed pool of staging buffers.
pub struct AsyncDecodeWorker<D: GpuDevice + 'static> {
    slots: Arc<Vec<StagingSlot<D::Staging>>>,
    slot_size: u64,
    request_tx: Option<Sender<DecodeRequest>>,
    free_tx: Option<Sender<usize>>,
    result_rx: Receiver<WorkerResult>,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    next_sequence: u64,
    /// Submitted but not yet drained.
    outstanding: usize,
}

impl<D: GpuDevice + 'static> AsyncDecodeWorker<D> {
    /// Creates `slot_count` staging buffers of `slot_size` bytes and starts
    /// the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a staging buffer cannot be created or the thread
    /// cannot be spawned.
    pub fn start(
        device: Arc<D>,
        decoder: Arc<dyn ImageDecoder>,
        slot_count: usize,
        slot_size: u64,
    ) -> RenderResult<Self> {
        let slots = (0..slot_count)
            .map(|i| {
                Ok(StagingSlot {
                    staging: device.create_staging(slot_size, &format!("decode slot {}", i))?,
                    free: AtomicBool::new(true),
                })
            })
            .collect::<RhiResult<Vec<_>>>()?;
        let slots = Arc::new(slots);

        let (request_tx, request_rx) = unbounded();
        let (free_tx, free_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        for slot in 0..slot_count {
            // The receiver is alive; this cannot fail.
            let _ = free_tx.send(slot);
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            device,
            decoder,
            slots: slots.clone(),
            slot_size,
            requests: request_rx,
            free_slots: free_rx,
            results: result_tx,
            stopping: stopping.clone(),
        };
        let thread = thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || worker.run())
            .map_err(RenderError::WorkerSpawn)?;

        info!(
            "Decode worker started: {} staging slot(s) of {} bytes",
            slot_count, slot_size
        );

        Ok(Self {
            slots,
            slot_size,
            request_tx: Some(request_tx),
            free_tx: Some(free_tx),
            result_rx,
            stopping,
            thread: Some(thread),
            next_sequence: 0,
            outstanding: 0,
        })
    }

    /// Queues a request and returns its sequence id. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::WorkerStopped`] after [`Self::stop`].
    pub fn submit(&mut self, mut request: DecodeRequest) -> RenderResult<u64> {
        let tx = self.request_tx.as_ref().ok_or(RenderError::WorkerStopped)?;

        if let Some(bytes) = request.expected_bytes() {
            debug_assert!(
                bytes <= self.slot_size,
                "request for {} needs {} bytes, staging slots hold {}",
                request.path.display(),
                bytes,
                self.slot_size
            );
        }

        self.next_sequence += 1;
        request.sequence = self.next_sequence;
        request.slot = None;
        let sequence = request.sequence;

        trace!("Queued decode #{} for '{}'", sequence, request.path.display());
        tx.send(request).map_err(|_| RenderError::WorkerStopped)?;
        self.outstanding += 1;
        Ok(sequence)
    }

    /// Handles every completion posted so far, on the calling thread.
    ///
    /// `handler` receives each successful completion together with the
    /// staging buffer holding its texels. Failures are logged and collected
    /// in the report. The slot is released after each completion either way.
    ///
    /// # Errors
    ///
    /// Returns the first handler error, after releasing that completion's
    /// slot. Completions not yet handled stay queued.
    pub fn drain_results<F>(&mut self, mut handler: F) -> RhiResult<DrainReport>
    where
        F: FnMut(&DecodeCompletion, &D::Staging) -> RhiResult<()>,
    {
        let mut report = DrainReport::default();

        while let Ok(result) = self.result_rx.try_recv() {
            self.outstanding = self.outstanding.saturating_sub(1);

            let handled = match result.outcome {
                Ok(completion) => {
                    report.completed += 1;
                    handler(&completion, &self.slots[result.slot].staging)
                }
                Err(failure) => {
                    warn!(
                        "Decode #{} of '{}' failed: {}",
                        failure.sequence,
                        failure.path.display(),
                        failure.message
                    );
                    report.failures.push(failure);
                    Ok(())
                }
            };

            self.release_slot(result.slot);
            handled?;
        }

        Ok(report)
    }

    fn release_slot(&self, slot: usize) {
        self.slots[slot].free.store(true, Ordering::Release);
        if let Some(tx) = &self.free_tx {
            let _ = tx.send(slot);
        }
    }

    /// Whether `slot` is waiting in the pool.
    pub fn is_slot_free(&self, slot: usize) -> bool {
        self.slots[slot].free.load(Ordering::Acquire)
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Requests submitted but not yet drained.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stops the worker and joins it.
    ///
    /// A decode already in progress finishes; queued requests are dropped.
    /// Results already posted can still be drained.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.stopping.store(true, Ordering::Release);
        // Disconnecting both inbound channels wakes a blocked worker.
        self.request_tx = None;
        self.free_tx = None;

        if thread.join().is_err() {
            error!("Decode worker panicked");
        }
        info!("Decode worker stopped");
    }
}

impl<D: GpuDevice + 'static> Drop for AsyncDecodeWorker<D> {
    fn drop(&mut self) {
        let queued_results = self.result_rx.len();
        if self.outstanding > 0 || queued_results > 0 {
            warn!(
                "Dropping decode worker with {} request(s) outstanding, {} result(s) undrained",
                self.outstanding, queued_results
            );
        }
        self.stop();
    }
}

/// State moved onto the worker thread.
struct Worker<D: GpuDevice> {
    device: Arc<D>,
    decoder: Arc<dyn ImageDecoder>,
    slots: Arc<Vec<StagingSlot<D::Staging>>>,
    slot_size: u64,
    requests: Receiver<DecodeRequest>,
    free_slots: Receiver<usize>,
    results: Sender<WorkerResult>,
    stopping: Arc<AtomicBool>,
}

impl<D: GpuDevice> Worker<D> {
    fn run(self) {
        debug!("Decode worker running");

        loop {
            let Ok(slot) = self.free_slots.recv() else {
                break;
            };
            let Ok(mut request) = self.requests.recv() else {
                break;
            };
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let was_free = self.slots[slot].free.swap(false, Ordering::AcqRel);
            debug_assert!(was_free, "staging slot {} handed out twice", slot);
            request.slot = Some(slot);

            let outcome = self.decode_into(&request, slot);
            if self.results.send(WorkerResult { slot, outcome }).is_err() {
                break;
            }
        }

        debug!("Decode worker exiting");
    }

    fn decode_into(
        &self,
        request: &DecodeRequest,
        slot: usize,
    ) -> Result<DecodeCompletion, DecodeFailure> {
        let fail = |message: String| DecodeFailure {
            sequence: request.sequence,
            target: request.target,
            path: request.path.clone(),
            message,
        };

        let image = self.decode(request).map_err(|e| fail(e.to_string()))?;

        let byte_len = image.byte_len() as u64;
        if byte_len > self.slot_size {
            return Err(fail(format!(
                "{}x{} image needs {} bytes, staging slot holds {}",
                image.width, image.height, byte_len, self.slot_size
            )));
        }

        self.device
            .write_staging(&self.slots[slot].staging, 0, image.as_bytes())
            .map_err(|e| fail(e.to_string()))?;

        trace!(
            "Decoded #{} '{}' into slot {}",
            request.sequence,
            request.path.display(),
            slot
        );

        Ok(DecodeCompletion {
            sequence: request.sequence,
            target: request.target,
            path: request.path.clone(),
            slot,
            width: image.width,
            height: image.height,
            channels: image.channels,
            srgb: image.srgb,
            is_float: image.is_float(),
            byte_len,
        })
    }

    fn decode(&self, request: &DecodeRequest) -> lumen_resources::ResourceResult<DecodedImage> {
        let image = self.decoder.decode(
            &request.path,
            request.channels,
            request.srgb,
            request.is_float,
        )?;

        match request.extent {
            Some((width, height)) if (width, height) != (image.width, image.height) => {
                self.decoder.resize(&image, width, height)
            }
            _ => Ok(image),
        }
    }
}
