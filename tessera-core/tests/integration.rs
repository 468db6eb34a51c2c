//! Integration tests: images read back on one node, transmitted over a
//! real TCP connection on localhost and composited on the other.

use std::sync::Arc;
use std::time::Duration;

use tessera_core::{
    Buffer, Buffers, BuiltinCompressors, Canvas, CompositeTarget, Compositor, Connection,
    ConnectionInfo, Dispatched, DrawableConfig, Frame, FrameData, FrameDataPtr, FrameDataStore,
    ImageRef, NullStatistics, ObjectVersion, PixelData, RoiFinder, StorageType, Transmitter,
    Viewport, transmit::SinkRef, types::format,
};
use tokio::net::TcpListener;

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];
const BLACK: [u8; 4] = [0, 0, 0, 255];

// ── Helpers ──────────────────────────────────────────────────────

/// Spin up a listener on an OS-assigned port and return the connection
/// info.  The listener is returned so the caller can accept on it.
async fn ephemeral_listener() -> (TcpListener, ConnectionInfo) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());
    (listener, info)
}

/// A connected `(source, sink)` pair.
async fn link() -> (Connection, Connection) {
    let (listener, info) = ephemeral_listener().await;
    let source = tokio::spawn(async move { Connection::connect(&info).await.unwrap() });
    let (stream, _) = listener.accept().await.unwrap();
    (source.await.unwrap(), Connection::new(stream))
}

fn store() -> Arc<FrameDataStore> {
    Arc::new(FrameDataStore::new(
        Arc::new(BuiltinCompressors::new()),
        Arc::new(NullStatistics),
    ))
}

fn transmitter(roi: Option<RoiFinder>) -> Transmitter {
    Transmitter::spawn(
        Arc::new(BuiltinCompressors::new()),
        Arc::new(NullStatistics),
        roi,
    )
}

/// Dispatch packets from `sink` into `store` until `readies` versions
/// became ready.
async fn pump(sink: &mut Connection, store: &FrameDataStore, readies: usize) {
    let mut seen = 0;
    while seen < readies {
        let packet = tokio::time::timeout(Duration::from_secs(5), sink.recv())
            .await
            .expect("timeout")
            .expect("recv returned None");
        if let Dispatched::Ready { .. } = store.dispatch(&packet).unwrap() {
            seen += 1;
        }
    }
}

fn color(vp: Viewport, rgba: [u8; 4]) -> PixelData {
    let mut pd = PixelData::new(format::RGBA, format::RGBA, vp).unwrap();
    pd.pixels.chunks_exact_mut(4).for_each(|px| px.copy_from_slice(&rgba));
    pd
}

fn depth(vp: Viewport, z: u32) -> PixelData {
    let mut pd = PixelData::new(format::DEPTH, format::DEPTH_UNSIGNED_INT, vp).unwrap();
    pd.pixels.chunks_exact_mut(4).for_each(|px| px.copy_from_slice(&z.to_le_bytes()));
    pd
}

/// Source-side frame data at version 1 with one image of `vp`.
fn source(id: u64, vp: Viewport, rgba: [u8; 4], z: Option<u32>) -> (FrameDataPtr, ImageRef) {
    let fd = Arc::new(FrameData::new(id));
    fd.set_viewport(vp);
    fd.set_buffers(match z {
        Some(_) => Buffers::COLOR | Buffers::DEPTH,
        None => Buffers::COLOR,
    });
    fd.set_version(1).unwrap();
    let image = fd.new_image(StorageType::Memory, &DrawableConfig::default());
    {
        let mut img = image.write();
        img.set_flat_pixel_data(Buffer::Color, color(vp, rgba)).unwrap();
        if let Some(z) = z {
            img.set_flat_pixel_data(Buffer::Depth, depth(vp, z)).unwrap();
        }
    }
    (fd, image)
}

fn uniform(canvas: &Canvas, rgba: [u8; 4]) -> bool {
    canvas.color().chunks_exact(4).all(|px| px == rgba)
}

async fn depth_composite(bandwidth: u64) {
    let vp = Viewport::new(0, 0, 32, 32);
    let (source_conn, mut sink_conn) = link().await;
    source_conn.set_bandwidth(bandwidth);
    let dest: SinkRef = Arc::new(source_conn.sender());

    let tx = transmitter(None);
    for (id, rgba, z) in [(1, RED, 100), (2, BLUE, 50)] {
        let (fd, image) = source(id, vp, rgba, Some(z));
        tx.transmit(&fd, image, vec![dest.clone()], 1).unwrap();
        tx.set_ready(&fd, vec![dest.clone()], 1).unwrap();
    }

    let store = store();
    pump(&mut sink_conn, &store, 2).await;
    tx.shutdown().await.unwrap();

    let frames: Vec<Frame> = [1, 2]
        .map(|id| Frame::new(format!("input-{id}"), store.frame_data(id).unwrap()))
        .into();
    let compositor = Compositor::new(Some(Duration::from_secs(1)));
    let mut canvas = Canvas::new(vp);
    assert_eq!(compositor.assemble_frames(&frames, &mut canvas, None).unwrap(), 1);
    assert!(uniform(&canvas, BLUE));
    assert_eq!(canvas.depth_at(31, 31), Some(50));
}

// ── End-to-end compositing ───────────────────────────────────────

#[tokio::test]
async fn test_depth_composite_over_raw_link() {
    depth_composite(10_000_000).await;
}

#[tokio::test]
async fn test_depth_composite_over_compressed_link() {
    depth_composite(1_000).await;
}

#[tokio::test]
async fn test_tiles_composite_as_they_arrive() {
    let left = Viewport::new(0, 0, 16, 16);
    let right = Viewport::new(16, 0, 16, 16);
    let (source_conn, mut sink_conn) = link().await;
    let dest: SinkRef = Arc::new(source_conn.sender());
    let store = store();

    // The sink knows which versions it expects before any data arrives.
    let frames: Vec<Frame> = [1, 2]
        .map(|id| {
            let fd = store.get_frame_data(ObjectVersion::new(id, 1));
            Frame::new(format!("tile-{id}"), fd)
        })
        .into();
    let compositing = tokio::task::spawn_blocking(move || {
        let compositor = Compositor::new(Some(Duration::from_secs(5)));
        let mut canvas = Canvas::new(Viewport::new(0, 0, 32, 16));
        let count = compositor
            .assemble_frames_unsorted(&frames, &mut canvas, None)
            .unwrap();
        (count, canvas)
    });

    let tx = transmitter(None);
    for (id, vp, rgba) in [(2, right, BLUE), (1, left, RED)] {
        let (fd, image) = source(id, vp, rgba, None);
        tx.transmit(&fd, image, vec![dest.clone()], 4).unwrap();
        tx.set_ready(&fd, vec![dest.clone()], 4).unwrap();
    }
    pump(&mut sink_conn, &store, 2).await;
    tx.shutdown().await.unwrap();

    let (count, canvas) = compositing.await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(canvas.color_at(3, 3), Some(RED));
    assert_eq!(canvas.color_at(20, 12), Some(BLUE));
}

#[tokio::test]
async fn test_roi_sends_only_covered_pixels() {
    let vp = Viewport::new(0, 0, 64, 64);
    let covered = Viewport::new(0, 0, 32, 32);
    let (source_conn, mut sink_conn) = link().await;
    let dest: SinkRef = Arc::new(source_conn.sender());

    // Red geometry in the top-left quarter, cleared elsewhere.
    let (fd, image) = source(7, vp, BLACK, Some(u32::MAX));
    {
        let mut img = image.write();
        let mut rgba = color(vp, BLACK);
        let mut z = depth(vp, u32::MAX);
        for y in 0..32 {
            for x in 0..32 {
                let i = (y * 64 + x) * 4;
                rgba.pixels[i..i + 4].copy_from_slice(&RED);
                z.pixels[i..i + 4].copy_from_slice(&100u32.to_le_bytes());
            }
        }
        img.set_flat_pixel_data(Buffer::Color, rgba).unwrap();
        img.set_flat_pixel_data(Buffer::Depth, z).unwrap();
    }

    let tx = transmitter(Some(RoiFinder::default()));
    tx.transmit(&fd, image, vec![dest.clone()], 1).unwrap();
    tx.set_ready(&fd, vec![dest], 1).unwrap();

    let store = store();
    pump(&mut sink_conn, &store, 1).await;
    tx.shutdown().await.unwrap();

    let received = store.frame_data(7).unwrap();
    let images = received.images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].read().viewport(), covered);

    let compositor = Compositor::new(Some(Duration::from_secs(1)));
    let frame = Frame::new("roi", received);
    let mut canvas = Canvas::new(vp);
    compositor.assemble_frames_unsorted(&[frame], &mut canvas, None).unwrap();
    assert_eq!(canvas.color_at(10, 10), Some(RED));
    assert_eq!(canvas.depth_at(10, 10), Some(100));
    assert_eq!(canvas.color_at(40, 40), Some(BLACK));
}

#[tokio::test]
async fn test_dropped_source_connection_ends_stream() {
    let (source_conn, mut sink_conn) = link().await;
    drop(source_conn);
    let next = tokio::time::timeout(Duration::from_secs(5), sink_conn.recv())
        .await
        .expect("timeout");
    assert!(next.is_none());
}
