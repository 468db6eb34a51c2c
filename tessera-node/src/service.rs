//! Node service core logic.
//!
//! A **source** renders frames with the synthetic renderer, reads them
//! back and hands them to a [`Transmitter`] for every configured peer.
//! A **sink** accepts sources, applies their packets to a
//! [`FrameDataStore`] and composites each output frame once all inputs
//! are ready.
//!
//! ```text
//!  source                                   sink
//!  ──────                                   ────
//!  set_version(n)                           accept ──▶ per-peer reader
//!  start_readback ──▶ Transmitter ── TCP ──▶            │
//!  set_ready(n)                                         ▼
//!                                        FrameDataStore::dispatch
//!                                                       │ all inputs of n ready
//!                                                       ▼
//!                                        Compositor ──▶ Canvas ──▶ digest
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use tessera_core::transmit::SinkRef;
use tessera_core::{
    BuiltinCompressors, Canvas, Command, Compositor, CompressorRegistry, Connection, Dispatched,
    DrawableConfig, Frame, FrameData, FrameDataStore, ObjectVersion, Offset, Packet,
    StatisticsHook, SubPixel, TesseraError, TracingStatistics, Transmitter,
};

use crate::config::{NodeConfig, NodeRole};
use crate::synthetic::SyntheticRenderer;

/// Packets buffered between peer readers and the compositing loop.
const INBOX_DEPTH: usize = 256;

// ── NodeService ──────────────────────────────────────────────────

/// The top-level node service.
pub struct NodeService {
    config: NodeConfig,
    running: Arc<AtomicBool>,
    registry: Arc<dyn CompressorRegistry>,
    stats: Arc<dyn StatisticsHook>,
    /// Last output frame a sink composited.
    composited: Arc<watch::Sender<u32>>,
}

impl NodeService {
    /// Create a new node service with the given config.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(BuiltinCompressors::new()),
            stats: Arc::new(TracingStatistics),
            composited: Arc::new(watch::channel(0).0),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Follows the frame numbers a sink composites.
    pub fn composited_frames(&self) -> watch::Receiver<u32> {
        self.composited.subscribe()
    }

    /// Run the configured role until stopped.
    pub async fn run(&self) -> Result<(), TesseraError> {
        match self.config.node.role {
            NodeRole::Source => self.run_source().await,
            NodeRole::Sink => {
                let addr = SocketAddr::from(([0, 0, 0, 0], self.config.network.listen_port));
                let listener = TcpListener::bind(addr).await?;
                self.serve(listener).await
            }
        }
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Source ───────────────────────────────────────────────────

    /// Produce frames for every peer until stopped or the configured
    /// frame count is reached.
    pub async fn run_source(&self) -> Result<(), TesseraError> {
        self.running.store(true, Ordering::SeqCst);
        let cfg = &self.config;

        let mut connections = Vec::new();
        let mut sinks: Vec<SinkRef> = Vec::new();
        for peer in &cfg.network.peers {
            let info = peer.to_connection_info()?;
            let conn = Connection::connect(&info).await?;
            conn.set_bandwidth(peer.bandwidth);
            let sender = conn.sender();
            sinks.push(Arc::new(if peer.ordered { sender } else { sender.unordered() }));
            info!(peer = %info, bandwidth = peer.bandwidth, "connected to sink");
            connections.push(conn);
        }

        let drawable = DrawableConfig::default();
        let frame_data = Arc::new(FrameData::new(cfg.node.id));
        cfg.apply_frame(&frame_data)?;
        let renderer = Arc::new(SyntheticRenderer::new(cfg.node.id, drawable));
        let transmitter = Transmitter::spawn(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            cfg.to_roi_finder(),
        );

        // One frame in flight: images are recycled once the previous
        // frame has left the transmitter.
        let (finished_tx, mut finished) = watch::channel(0u32);
        transmitter.tracker().on_frame_finished(move |frame| {
            finished_tx.send_modify(|last| *last = (*last).max(frame));
        });

        let mut interval = tokio::time::interval(cfg.frame_interval());
        let mut frame_number = 0u32;
        while self.is_running() && (cfg.frame.count == 0 || frame_number < cfg.frame.count) {
            interval.tick().await;
            if frame_number > 0 {
                let previous = frame_number;
                if finished.wait_for(|last| *last >= previous).await.is_err() {
                    break;
                }
            }
            frame_number += 1;

            frame_data.clear();
            frame_data.set_version(frame_number as u64)?;
            renderer.set_frame(frame_number);
            let viewport = frame_data.viewport();
            let images =
                frame_data.start_readback(Offset::ZERO, &*renderer, &drawable, &[viewport])?;
            debug!(frame = frame_number, images = images.len(), "readback started");
            // Keep the frame open until both jobs are queued.
            transmitter.tracker().begin(frame_number);
            transmitter.finish_readback(
                &frame_data,
                images,
                renderer.clone(),
                sinks.clone(),
                frame_number,
            )?;
            transmitter.set_ready(&frame_data, sinks.clone(), frame_number)?;
            transmitter.tracker().end(frame_number);
        }

        transmitter.shutdown().await?;
        drop(connections);
        self.running.store(false, Ordering::SeqCst);
        info!(frames = frame_number, "source stopped");
        Ok(())
    }

    // ── Sink ─────────────────────────────────────────────────────

    /// Accept sources on `listener` and composite their frames until
    /// stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TesseraError> {
        self.running.store(true, Ordering::SeqCst);
        info!("sink listening on {}", listener.local_addr()?);

        let store = Arc::new(FrameDataStore::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
        ));
        let (inbox_tx, inbox) = mpsc::channel::<Packet>(INBOX_DEPTH);
        let compositing = tokio::spawn(composite_loop(
            self.config.clone(),
            Arc::clone(&store),
            Arc::clone(&self.stats),
            inbox,
            Arc::clone(&self.composited),
        ));

        while self.is_running() {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = wait_for_stop(&self.running) => break,
            };
            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            info!("source connected from {peer}");

            let inbox_tx = inbox_tx.clone();
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                let mut conn = Connection::new(stream);
                loop {
                    let packet = tokio::select! {
                        packet = conn.recv() => packet,
                        _ = wait_for_stop(&running) => None,
                    };
                    let Some(packet) = packet else { break };
                    if inbox_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                info!("source {peer} disconnected");
            });
        }

        drop(inbox_tx);
        compositing.abort();
        self.running.store(false, Ordering::SeqCst);
        info!("sink stopped");
        Ok(())
    }
}

// ── Compositing loop ─────────────────────────────────────────────

/// Apply packets in arrival order and composite every output frame
/// whose inputs are all ready.
async fn composite_loop(
    config: NodeConfig,
    store: Arc<FrameDataStore>,
    stats: Arc<dyn StatisticsHook>,
    mut inbox: mpsc::Receiver<Packet>,
    composited: Arc<watch::Sender<u32>>,
) {
    let expected = config.compositing.inputs.max(1);
    let mut ready: BTreeMap<u32, HashSet<ObjectVersion>> = BTreeMap::new();

    while let Some(packet) = inbox.recv().await {
        let (frame_data, frame_number) = match dispatch(&store, packet).await {
            Ok(Dispatched::Ready {
                frame_data,
                frame_number,
            }) => (frame_data, frame_number),
            Ok(_) => continue,
            Err(e) => {
                warn!("dropping packet: {e}");
                continue;
            }
        };
        let inputs = ready.entry(frame_number).or_default();
        inputs.insert(frame_data);
        if inputs.len() < expected {
            continue;
        }
        let Some(inputs) = ready.remove(&frame_number) else {
            continue;
        };
        // Frames that never completed are superseded.
        ready.retain(|&n, _| n > frame_number);

        let mut ids: Vec<ObjectVersion> = inputs.into_iter().collect();
        ids.sort_by_key(|v| v.id);
        let current = ids.iter().all(|v| {
            store
                .frame_data(v.id)
                .is_some_and(|fd| fd.version() == v.version && fd.is_ready())
        });
        if !current {
            debug!(frame = frame_number, "inputs moved on, skipping frame");
            continue;
        }
        let frames = input_frames(&config, &store, &ids);
        let job_config = config.clone();
        let job_stats = Arc::clone(&stats);
        let result = tokio::task::spawn_blocking(move || {
            composite(&job_config, job_stats, frame_number, &frames)
        })
        .await;
        match result {
            Ok(Ok(passes)) => {
                composited.send_replace(frame_number);
                debug!(frame = frame_number, passes, "frame done");
            }
            Ok(Err(e)) => error!(frame = frame_number, "compositing failed: {e}"),
            Err(e) => error!(frame = frame_number, "compositing task failed: {e}"),
        }
    }
}

/// Apply one packet to `store`. Image payloads are decompressed on the
/// blocking pool.
async fn dispatch(store: &Arc<FrameDataStore>, packet: Packet) -> Result<Dispatched, TesseraError> {
    if !matches!(packet.command(), Ok(Command::FrameDataTransmit)) {
        return store.dispatch(&packet);
    }
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.dispatch(&packet)).await?
}

/// Consumer-side frames for the inputs of one output frame, tagged
/// with jitter samples when several are configured.
fn input_frames(config: &NodeConfig, store: &FrameDataStore, ids: &[ObjectVersion]) -> Vec<Frame> {
    let sub_pixels = config.compositing.sub_pixels.max(1);
    ids.iter()
        .enumerate()
        .filter_map(|(i, target)| {
            let mut frame = Frame::new(format!("input-{:#x}", target.id), store.frame_data(target.id)?);
            if sub_pixels > 1 {
                frame.set_sub_pixel(SubPixel::new(i as u32 % sub_pixels, sub_pixels));
            }
            Some(frame)
        })
        .collect()
}

fn composite(
    config: &NodeConfig,
    stats: Arc<dyn StatisticsHook>,
    frame_number: u32,
    frames: &[Frame],
) -> Result<u32, TesseraError> {
    let mut compositor = Compositor::new(config.input_timeout()).with_statistics(stats);
    compositor.set_frame_number(frame_number);
    let mut canvas = Canvas::new(config.to_viewport());
    let passes = if config.compositing.blend {
        compositor.blend_frames(frames, &mut canvas, None)?
    } else {
        compositor.assemble_frames_unsorted(frames, &mut canvas, None)?
    };
    info!(
        frame = frame_number,
        inputs = frames.len(),
        digest = %canvas.digest().to_hex(),
        "frame composited"
    );
    Ok(passes)
}

/// Async helper: resolves when `running` becomes false.
async fn wait_for_stop(running: &Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PeerConfig;

    #[test]
    fn service_creates_with_defaults() {
        let svc = NodeService::new(NodeConfig::default());
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = NodeService::new(NodeConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn image_packets_dispatch_on_the_blocking_pool() {
        use tessera_core::wire::TransmitHeader;
        use tessera_core::{Buffers, NullStatistics, Viewport, Zoom};
        use tokio_test::{assert_err, assert_ok};

        let store = Arc::new(FrameDataStore::new(
            Arc::new(BuiltinCompressors::new()),
            Arc::new(NullStatistics),
        ));
        let target = ObjectVersion::new(3, 1);
        let header = TransmitHeader {
            frame_data: target,
            viewport: Viewport::new(0, 0, 4, 4),
            zoom: Zoom::NONE,
            buffers: Buffers::empty(),
            frame_number: 1,
            use_alpha: false,
        };
        let packet = Packet::new(Command::FrameDataTransmit, 1, header.encode_with(&[]).unwrap()).unwrap();
        let outcome = assert_ok!(dispatch(&store, packet).await);
        assert_eq!(outcome, Dispatched::Image { frame_data: target, frame_number: 1 });

        let garbage = Packet::new(Command::FrameDataTransmit, 2, vec![1u8].into()).unwrap();
        assert_err!(dispatch(&store, garbage).await);
        assert_eq!(assert_ok!(dispatch(&store, Packet::heartbeat()).await), Dispatched::Ignored);
    }

    fn small_frame(cfg: &mut NodeConfig) {
        cfg.frame.width = 96;
        cfg.frame.height = 48;
        cfg.frame.interval_ms = 5;
    }

    async fn sink() -> (Arc<NodeService>, u16) {
        let mut cfg = NodeConfig::default();
        small_frame(&mut cfg);
        cfg.compositing.inputs = 2;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sink = Arc::new(NodeService::new(cfg));
        let serving = Arc::clone(&sink);
        tokio::spawn(async move { serving.serve(listener).await.unwrap() });
        (sink, port)
    }

    fn source(id: u64, port: u16, bandwidth: u64, roi: bool) -> NodeService {
        let mut cfg = NodeConfig::default();
        small_frame(&mut cfg);
        cfg.node.id = id;
        cfg.node.role = NodeRole::Source;
        cfg.frame.count = 3;
        cfg.roi.enabled = roi;
        cfg.network.peers = vec![PeerConfig {
            address: format!("127.0.0.1:{port}"),
            bandwidth,
            ordered: true,
        }];
        NodeService::new(cfg)
    }

    #[tokio::test]
    async fn two_sources_feed_one_sink() {
        let (sink, port) = sink().await;
        let mut composited = sink.composited_frames();

        let a = source(1, port, 0, false);
        let b = source(2, port, 10_000_000, true);
        let (ra, rb) = tokio::join!(a.run(), b.run());
        ra.unwrap();
        rb.unwrap();

        tokio::time::timeout(Duration::from_secs(10), composited.wait_for(|&n| n >= 3))
            .await
            .expect("timeout")
            .unwrap();
        sink.stop();
    }
}
