//! Shipping read-back images to remote frame data.
//!
//! ```text
//!  producer ──▶ Transmitter queue (FIFO) ──▶ transmit task
//!                                               │
//!        FinishReadback ── spawn_blocking ──────┤ renderer.finish_async_readback
//!        Transmit ──────── spawn_blocking ──────┤ ROI crop, compress, encode
//!                                               ├─▶ per sink: send token ─▶ packet
//!        SetReady ──────────────────────────────┴─▶ per sink: ready signal
//! ```
//!
//! Jobs run strictly in queue order, so a ready signal always follows the
//! images queued before it. A sink that fails is logged and skipped; the
//! remaining sinks still get the payload.

pub mod link;
pub mod token;
pub mod tracker;

pub use link::{COMPRESSION_THRESHOLD, LinkInfo};
pub use token::{CompletionToken, SendGuard, SendToken};
pub use tracker::FrameTracker;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compressor::CompressorRegistry;
use crate::error::TesseraError;
use crate::frame_data::FrameDataPtr;
use crate::image::Image;
use crate::message::Command;
use crate::packet::Packet;
use crate::pool::ImageRef;
use crate::renderer::Renderer;
use crate::roi::RoiFinder;
use crate::stats::{StatEvent, Statistic, StatisticsHook};
use crate::types::{ObjectVersion, StorageType};
use crate::wire::{self, ReadySignal, TransmitHeader};

// ── ImageSink ────────────────────────────────────────────────────

/// A destination for pixel payloads and ready signals.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Human-readable destination name for logs.
    fn name(&self) -> String;

    fn link(&self) -> LinkInfo;

    /// Token serializing image payloads onto this destination.
    fn send_token(&self) -> SendToken;

    async fn send(&self, packet: Packet) -> Result<(), TesseraError>;
}

pub type SinkRef = Arc<dyn ImageSink>;

// ── Jobs ─────────────────────────────────────────────────────────

enum Job {
    FinishReadback {
        target: ObjectVersion,
        images: Vec<ImageRef>,
        renderer: Arc<dyn Renderer>,
        sinks: Vec<SinkRef>,
        token: CompletionToken,
    },
    Transmit {
        target: ObjectVersion,
        image: ImageRef,
        sinks: Vec<SinkRef>,
        token: CompletionToken,
    },
    SetReady {
        frame_data: FrameDataPtr,
        target: ObjectVersion,
        sinks: Vec<SinkRef>,
        token: CompletionToken,
    },
}

impl Job {
    fn token(&self) -> CompletionToken {
        match self {
            Job::FinishReadback { token, .. }
            | Job::Transmit { token, .. }
            | Job::SetReady { token, .. } => *token,
        }
    }
}

/// One encoded image, raw and/or compressed.
#[derive(Debug, Default)]
struct Payload {
    raw: Option<Bytes>,
    compressed: Option<Bytes>,
    raw_bytes: u64,
}

// ── Transmitter ──────────────────────────────────────────────────

/// Handle to the transmit task. Dropping every handle lets the task
/// drain its queue and exit.
pub struct Transmitter {
    tx: mpsc::UnboundedSender<Job>,
    tracker: Arc<FrameTracker>,
    sequence: std::sync::atomic::AtomicU64,
    handle: JoinHandle<()>,
}

/// State owned by the transmit task.
struct Worker {
    registry: Arc<dyn CompressorRegistry>,
    stats: Arc<dyn StatisticsHook>,
    roi: Option<Arc<Mutex<RoiFinder>>>,
    tracker: Arc<FrameTracker>,
}

impl Transmitter {
    /// Start the transmit task. `roi` restricts payloads to regions of
    /// interest when set.
    pub fn spawn(
        registry: Arc<dyn CompressorRegistry>,
        stats: Arc<dyn StatisticsHook>,
        roi: Option<RoiFinder>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(FrameTracker::new());
        let worker = Worker {
            registry,
            stats,
            roi: roi.map(|r| Arc::new(Mutex::new(r))),
            tracker: Arc::clone(&tracker),
        };
        let handle = tokio::spawn(worker.run(rx));
        Self {
            tx,
            tracker,
            sequence: std::sync::atomic::AtomicU64::new(0),
            handle,
        }
    }

    pub fn tracker(&self) -> &Arc<FrameTracker> {
        &self.tracker
    }

    /// Queue completion of asynchronous readbacks, then transmission of
    /// the finished images.
    pub fn finish_readback(
        &self,
        frame_data: &FrameDataPtr,
        images: Vec<ImageRef>,
        renderer: Arc<dyn Renderer>,
        sinks: Vec<SinkRef>,
        frame_number: u32,
    ) -> Result<(), TesseraError> {
        let target = ObjectVersion::new(frame_data.id(), frame_data.version());
        let token = self.token(frame_number);
        self.queue(Job::FinishReadback {
            target,
            images,
            renderer,
            sinks,
            token,
        })
    }

    /// Queue one already read-back image.
    pub fn transmit(
        &self,
        frame_data: &FrameDataPtr,
        image: ImageRef,
        sinks: Vec<SinkRef>,
        frame_number: u32,
    ) -> Result<(), TesseraError> {
        let target = ObjectVersion::new(frame_data.id(), frame_data.version());
        let token = self.token(frame_number);
        self.queue(Job::Transmit {
            target,
            image,
            sinks,
            token,
        })
    }

    /// Queue the ready signal for the current version of `frame_data`,
    /// after everything queued before it. Marks it ready locally too.
    pub fn set_ready(
        &self,
        frame_data: &FrameDataPtr,
        sinks: Vec<SinkRef>,
        frame_number: u32,
    ) -> Result<(), TesseraError> {
        let target = ObjectVersion::new(frame_data.id(), frame_data.version());
        let token = self.token(frame_number);
        self.queue(Job::SetReady {
            frame_data: Arc::clone(frame_data),
            target,
            sinks,
            token,
        })
    }

    /// Close the queue and wait until every queued job has run.
    pub async fn shutdown(self) -> Result<(), TesseraError> {
        drop(self.tx);
        self.handle.await?;
        Ok(())
    }

    fn token(&self, frame_number: u32) -> CompletionToken {
        let sequence = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        CompletionToken::new(frame_number, sequence)
    }

    fn queue(&self, job: Job) -> Result<(), TesseraError> {
        let frame = job.token().frame_number;
        self.tracker.begin(frame);
        if self.tx.send(job).is_err() {
            self.tracker.end(frame);
            return Err(TesseraError::ChannelClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("tracker", &self.tracker)
            .finish()
    }
}

// ── Worker ───────────────────────────────────────────────────────

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        info!("transmit task started");
        while let Some(job) = rx.recv().await {
            let token = job.token();
            if let Err(e) = self.handle(job).await {
                warn!(
                    frame = token.frame_number,
                    sequence = token.sequence,
                    "transmit job failed: {e}"
                );
            }
            debug!(
                frame = token.frame_number,
                sequence = token.sequence,
                micros = token.age().as_micros() as u64,
                "transmit job done"
            );
            self.tracker.end(token.frame_number);
        }
        info!("transmit task stopped");
    }

    async fn handle(&self, job: Job) -> Result<(), TesseraError> {
        match job {
            Job::FinishReadback {
                target,
                images,
                renderer,
                sinks,
                token,
            } => {
                let stats = Arc::clone(&self.stats);
                let finished = tokio::task::spawn_blocking(move || {
                    let _event = StatEvent::start(&*stats, Statistic::Readback, token.frame_number);
                    images
                        .into_iter()
                        .filter(|image| match image.write().finish_readback(&*renderer) {
                            Ok(()) => true,
                            Err(e) => {
                                warn!("dropping image after failed readback: {e}");
                                false
                            }
                        })
                        .collect::<Vec<_>>()
                })
                .await?;
                for image in finished {
                    self.transmit(target, image, &sinks, token).await?;
                }
                Ok(())
            }
            Job::Transmit {
                target,
                image,
                sinks,
                token,
            } => self.transmit(target, image, &sinks, token).await,
            Job::SetReady {
                frame_data,
                target,
                sinks,
                token,
            } => {
                let signal = ReadySignal {
                    frame_data: target,
                    frame_number: token.frame_number,
                    params: frame_data.params(),
                };
                let payload = signal.encode()?;
                for sink in &sinks {
                    let packet = Packet::new(Command::FrameDataReady, token.sequence, payload.clone())?;
                    if let Err(e) = sink.send(packet).await {
                        warn!(sink = %sink.name(), %target, "ready signal not delivered: {e}");
                    }
                }
                if frame_data.version() == target.version {
                    frame_data.set_ready();
                }
                Ok(())
            }
        }
    }

    async fn transmit(
        &self,
        target: ObjectVersion,
        image: ImageRef,
        sinks: &[SinkRef],
        token: CompletionToken,
    ) -> Result<(), TesseraError> {
        if sinks.is_empty() {
            return Ok(());
        }
        let need_raw = sinks.iter().any(|s| !s.link().should_compress());
        let need_compressed = sinks.iter().any(|s| s.link().should_compress());

        let payloads = {
            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            let roi = self.roi.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = image.write();
                let ctx = Encode {
                    target,
                    frame_number: token.frame_number,
                    need_raw,
                    need_compressed,
                    registry: &*registry,
                    stats: &*stats,
                };
                ctx.prepare(&mut guard, roi.as_deref())
            })
            .await??
        };

        for payload in &payloads {
            for sink in sinks {
                let compress = sink.link().should_compress();
                let bytes = if compress { &payload.compressed } else { &payload.raw };
                let Some(bytes) = bytes else {
                    continue;
                };
                let packet = Packet::new(Command::FrameDataTransmit, token.sequence, bytes.clone())?;
                let sent = packet.encoded_len() as u64;

                let send_token = sink.send_token();
                let _guard = {
                    let _event =
                        StatEvent::start(&*self.stats, Statistic::WaitSendToken, token.frame_number);
                    send_token.acquire().await
                };
                let mut event = StatEvent::start(&*self.stats, Statistic::Transmit, token.frame_number);
                event.add_bytes(payload.raw_bytes, sent);
                if let Err(e) = sink.send(packet).await {
                    warn!(sink = %sink.name(), %target, "dropping image for unreachable destination: {e}");
                }
            }
        }
        Ok(())
    }
}

// ── Encoding ─────────────────────────────────────────────────────

struct Encode<'a> {
    target: ObjectVersion,
    frame_number: u32,
    need_raw: bool,
    need_compressed: bool,
    registry: &'a dyn CompressorRegistry,
    stats: &'a dyn StatisticsHook,
}

impl Encode<'_> {
    /// Encode `image`, split into regions of interest when `roi` is set.
    fn prepare(
        &self,
        image: &mut Image,
        roi: Option<&Mutex<RoiFinder>>,
    ) -> Result<Vec<Payload>, TesseraError> {
        if image.storage_type() != StorageType::Memory {
            warn!(target = %self.target, "only host-memory images can be transmitted");
            return Ok(Vec::new());
        }
        let buffers = image.buffers();
        if buffers.is_empty() {
            warn!(target = %self.target, "image without pixel data, nothing to transmit");
            return Ok(Vec::new());
        }

        let pvp = image.viewport();
        let regions = match roi {
            Some(roi) => roi.lock().unwrap_or_else(PoisonError::into_inner).find_regions(
                buffers,
                pvp,
                image.zoom(),
                0,
                self.frame_number as u64,
                &*image,
            ),
            None => vec![pvp],
        };

        if regions.len() == 1 && regions[0] == pvp {
            return Ok(vec![self.encode(image)?]);
        }
        debug!(target = %self.target, %pvp, regions = regions.len(), "transmitting regions of interest");
        let mut payloads = Vec::with_capacity(regions.len());
        for region in &regions {
            if let Some(mut part) = image.crop(region) {
                payloads.push(self.encode(&mut part)?);
            }
        }
        Ok(payloads)
    }

    fn encode(&self, image: &mut Image) -> Result<Payload, TesseraError> {
        let buffers = image.buffers();
        let header = TransmitHeader {
            frame_data: self.target,
            viewport: image.viewport(),
            zoom: image.zoom(),
            buffers,
            frame_number: self.frame_number,
            use_alpha: !image.ignores_alpha(),
        };
        let raw_bytes = buffers
            .each()
            .map(|b| image.pixel_data(b).pixels.len() as u64)
            .sum();

        let mut payload = Payload {
            raw_bytes,
            ..Payload::default()
        };
        if self.need_raw {
            let mut blocks = BytesMut::new();
            for buffer in buffers.each() {
                wire::encode_buffer(&mut blocks, image.pixel_data(buffer), image.quality(buffer));
            }
            payload.raw = Some(header.encode_with(&blocks)?);
        }
        if self.need_compressed {
            let mut event = StatEvent::start(self.stats, Statistic::Compress, self.frame_number);
            let mut blocks = BytesMut::new();
            for buffer in buffers.each() {
                let quality = image.quality(buffer);
                let data = image.compress_pixel_data(buffer, self.registry)?;
                wire::encode_buffer(&mut blocks, data, quality);
            }
            event.add_bytes(raw_bytes, blocks.len() as u64);
            payload.compressed = Some(header.encode_with(&blocks)?);
        }
        Ok(payload)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::compressor::{BuiltinCompressors, COMPRESSOR_NONE};
    use crate::frame_data::FrameData;
    use crate::pixel::PixelData;
    use crate::renderer::{Readback, ReadbackHandle};
    use crate::roi::{EmptySpaceFinder, RoiTracker};
    use crate::stats::NullStatistics;
    use crate::types::{Buffer, Buffers, DrawableConfig, Viewport, Zoom, format};

    /// Collects every packet it is handed.
    struct MemorySink {
        link: LinkInfo,
        token: SendToken,
        tx: mpsc::UnboundedSender<Packet>,
    }

    #[async_trait]
    impl ImageSink for MemorySink {
        fn name(&self) -> String {
            "memory".into()
        }

        fn link(&self) -> LinkInfo {
            self.link
        }

        fn send_token(&self) -> SendToken {
            self.token.clone()
        }

        async fn send(&self, packet: Packet) -> Result<(), TesseraError> {
            self.tx.send(packet)?;
            Ok(())
        }
    }

    struct DeadSink;

    #[async_trait]
    impl ImageSink for DeadSink {
        fn name(&self) -> String {
            "dead".into()
        }

        fn link(&self) -> LinkInfo {
            LinkInfo::new(u64::MAX)
        }

        fn send_token(&self) -> SendToken {
            SendToken::new()
        }

        async fn send(&self, _packet: Packet) -> Result<(), TesseraError> {
            Err(TesseraError::Unreachable {
                node: "dead".into(),
                reason: "test".into(),
            })
        }
    }

    /// Returns a quarter-covered color image, asynchronously.
    struct QuarterRenderer;

    impl Renderer for QuarterRenderer {
        fn begin_async_readback(
            &self,
            _buffers: Buffers,
            _viewport: Viewport,
            _zoom: Zoom,
        ) -> Result<Readback, TesseraError> {
            Ok(Readback::Pending(ReadbackHandle(1)))
        }

        fn finish_async_readback(
            &self,
            _handle: ReadbackHandle,
        ) -> Result<Vec<(Buffer, PixelData)>, TesseraError> {
            Ok(vec![(Buffer::Color, quarter(Viewport::new(0, 0, 64, 64)))])
        }
    }

    fn quarter(vp: Viewport) -> PixelData {
        let mut data = PixelData::cleared(Buffer::Color, format::RGBA, format::RGBA, vp).unwrap();
        let w = vp.w as usize;
        for y in 0..vp.h as usize / 2 {
            for x in 0..w / 2 {
                data.pixels[(y * w + x) * 4] = 255;
            }
        }
        data
    }

    fn sink(bandwidth: u64) -> (SinkRef, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = MemorySink {
            link: LinkInfo::new(bandwidth),
            token: SendToken::new(),
            tx,
        };
        (Arc::new(sink), rx)
    }

    fn source(vp: Viewport) -> (FrameDataPtr, ImageRef) {
        let fd = Arc::new(FrameData::new(0x42));
        fd.set_viewport(vp);
        fd.set_version(1).unwrap();
        let image = fd.new_image(StorageType::Memory, &DrawableConfig::default());
        image.write().set_flat_pixel_data(Buffer::Color, quarter(vp)).unwrap();
        (fd, image)
    }

    fn transmitter(roi: Option<RoiFinder>) -> Transmitter {
        Transmitter::spawn(
            Arc::new(BuiltinCompressors::new()),
            Arc::new(NullStatistics),
            roi,
        )
    }

    fn decode(packet: &Packet) -> (TransmitHeader, Vec<wire::DecodedBuffer>) {
        let (header, blocks) = TransmitHeader::decode_from(packet.payload()).unwrap();
        let decoded = wire::decode_buffers(header.buffers, &blocks).unwrap();
        (header, decoded)
    }

    #[tokio::test]
    async fn fast_link_gets_raw_and_slow_link_compressed() {
        let vp = Viewport::new(0, 0, 64, 64);
        let (fd, image) = source(vp);
        let (fast, mut fast_rx) = sink(1_000_000_000);
        let (slow, mut slow_rx) = sink(100_000);

        let tx = transmitter(None);
        tx.transmit(&fd, image, vec![fast, slow], 7).unwrap();
        tx.shutdown().await.unwrap();

        let (header, raw) = decode(&fast_rx.recv().await.unwrap());
        assert_eq!(header.frame_data, ObjectVersion::new(0x42, 1));
        assert_eq!(header.frame_number, 7);
        assert_eq!(raw[0].data.compressed, None);
        assert_eq!(raw[0].data, quarter(vp));

        let (_, compressed) = decode(&slow_rx.recv().await.unwrap());
        let chunks = compressed[0].data.compressed.as_ref().unwrap();
        assert_ne!(chunks.compressor, COMPRESSOR_NONE);
    }

    #[tokio::test]
    async fn ready_signal_follows_images_and_marks_local_ready() {
        let vp = Viewport::new(0, 0, 64, 64);
        let (fd, image) = source(vp);
        let (dest, mut rx) = sink(u64::MAX);

        let tx = transmitter(None);
        tx.transmit(&fd, image, vec![Arc::clone(&dest)], 1).unwrap();
        tx.set_ready(&fd, vec![dest], 1).unwrap();
        tx.shutdown().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.command().unwrap(), Command::FrameDataTransmit);
        assert_eq!(second.command().unwrap(), Command::FrameDataReady);
        let signal = ReadySignal::decode(second.payload()).unwrap();
        assert_eq!(signal.frame_data, ObjectVersion::new(0x42, 1));
        assert_eq!(signal.params.viewport, vp);
        assert!(fd.is_ready());
    }

    #[tokio::test]
    async fn roi_sends_only_the_covered_quarter() {
        let vp = Viewport::new(0, 0, 64, 64);
        let (fd, image) = source(vp);
        let (dest, mut rx) = sink(u64::MAX);

        let mut roi = RoiFinder::new(EmptySpaceFinder::new(1, 0.0), RoiTracker::default());
        roi.set_background([0, 0, 0, 255]);
        let tx = transmitter(Some(roi));
        tx.transmit(&fd, image, vec![dest], 1).unwrap();
        tx.shutdown().await.unwrap();

        let (header, blocks) = decode(&rx.recv().await.unwrap());
        assert_eq!(header.viewport, Viewport::new(0, 0, 32, 32));
        assert_eq!(blocks[0].data.viewport, Viewport::new(0, 0, 32, 32));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let vp = Viewport::new(0, 0, 16, 16);
        let (fd, image) = source(vp);
        let (dest, mut rx) = sink(u64::MAX);

        let dead: SinkRef = Arc::new(DeadSink);
        let tx = transmitter(None);
        tx.transmit(&fd, image, vec![dead, dest], 1).unwrap();
        tx.shutdown().await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn finished_readback_is_transmitted_and_tracked() {
        let fd = Arc::new(FrameData::new(1));
        fd.set_viewport(Viewport::new(0, 0, 64, 64));
        fd.set_version(1).unwrap();
        let renderer: Arc<dyn Renderer> = Arc::new(QuarterRenderer);
        let images = fd
            .start_readback(
                crate::types::Offset::ZERO,
                &*renderer,
                &DrawableConfig::default(),
                &[Viewport::new(0, 0, 64, 64)],
            )
            .unwrap();
        assert!(images[0].read().has_async_readback());

        let (dest, mut rx) = sink(u64::MAX);
        let tx = transmitter(None);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tx.tracker().on_frame_finished(move |frame| {
            let _ = done_tx.send(frame);
        });
        tx.finish_readback(&fd, images, renderer, vec![dest], 5).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, 5);
        let (_, blocks) = decode(&rx.recv().await.unwrap());
        assert_eq!(blocks[0].data, quarter(Viewport::new(0, 0, 64, 64)));
        tx.shutdown().await.unwrap();
    }
}
