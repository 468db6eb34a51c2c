//! Receiver-side registry of frame data.
//!
//! Incoming packets name their destination by [`ObjectVersion`]. The
//! store maps object ids to local [`FrameData`] instances, creating them
//! on first contact, and applies each packet:
//!
//! | Command             | Effect                                        |
//! |---------------------|-----------------------------------------------|
//! | `FrameDataTransmit` | decode, decompress, `add_image` as pending    |
//! | `FrameDataReady`    | `set_ready_remote` with the replicated params |
//! | `Ping`              | nothing                                       |
//!
//! Late images are logged and dropped; they never fail the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, trace};

use crate::compressor::CompressorRegistry;
use crate::error::TesseraError;
use crate::frame_data::{FrameData, FrameDataPtr};
use crate::message::Command;
use crate::packet::Packet;
use crate::stats::{StatEvent, Statistic, StatisticsHook};
use crate::types::ObjectVersion;
use crate::wire::{ReadySignal, TransmitHeader};

// ── Dispatched ───────────────────────────────────────────────────

/// What [`FrameDataStore::dispatch`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// An image is pending for this version.
    Image {
        frame_data: ObjectVersion,
        frame_number: u32,
    },
    /// The version became ready.
    Ready {
        frame_data: ObjectVersion,
        frame_number: u32,
    },
    /// Image for an already ready version, dropped.
    Late(ObjectVersion),
    /// Heartbeat or other packet without effect.
    Ignored,
}

// ── FrameDataStore ───────────────────────────────────────────────

pub struct FrameDataStore {
    frames: Mutex<HashMap<u64, FrameDataPtr>>,
    registry: Arc<dyn CompressorRegistry>,
    stats: Arc<dyn StatisticsHook>,
}

impl FrameDataStore {
    pub fn new(registry: Arc<dyn CompressorRegistry>, stats: Arc<dyn StatisticsHook>) -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            registry,
            stats,
        }
    }

    /// The frame data for `target.id`, created on demand and advanced
    /// to `target.version` if it is behind.
    pub fn get_frame_data(&self, target: ObjectVersion) -> FrameDataPtr {
        let frame_data = Arc::clone(self.lock().entry(target.id).or_insert_with(|| {
            debug!(%target, "new frame data");
            Arc::new(FrameData::new(target.id))
        }));
        if frame_data.version() < target.version {
            // Only fails on regression, which the guard above excludes.
            let _ = frame_data.set_version(target.version);
        }
        frame_data
    }

    /// The frame data for `id`, if any packet has named it.
    pub fn frame_data(&self, id: u64) -> Option<FrameDataPtr> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<FrameDataPtr> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply one packet. Malformed payloads are errors; late data is
    /// logged and reported as [`Dispatched::Late`].
    pub fn dispatch(&self, packet: &Packet) -> Result<Dispatched, TesseraError> {
        match packet.command()? {
            Command::Ping => {
                trace!("ping");
                Ok(Dispatched::Ignored)
            }
            Command::FrameDataTransmit => self.insert_image(packet),
            Command::FrameDataReady => {
                let signal = ReadySignal::decode(packet.payload())?;
                let frame_data = self.get_frame_data(signal.frame_data);
                frame_data.set_ready_remote(signal.frame_data.version, signal.params);
                Ok(Dispatched::Ready {
                    frame_data: signal.frame_data,
                    frame_number: signal.frame_number,
                })
            }
        }
    }

    fn insert_image(&self, packet: &Packet) -> Result<Dispatched, TesseraError> {
        let (header, blocks) = TransmitHeader::decode_from(packet.payload())?;
        let target = header.frame_data;
        let frame_data = self.get_frame_data(target);

        let mut event = StatEvent::start(&*self.stats, Statistic::Decompress, header.frame_number);
        event.add_bytes(0, blocks.len() as u64);
        let added = frame_data.add_image(
            target.version,
            header.viewport,
            header.zoom,
            header.buffers,
            header.use_alpha,
            &blocks,
            &*self.registry,
        )?;
        if !added {
            let err = TesseraError::LateImage {
                version: target.version,
                ready: frame_data.ready_version(),
            };
            error!(%target, frame = header.frame_number, "{err}");
            return Ok(Dispatched::Late(target));
        }
        trace!(%target, viewport = %header.viewport, "image pending");
        Ok(Dispatched::Image {
            frame_data: target,
            frame_number: header.frame_number,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, FrameDataPtr>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FrameDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDataStore")
            .field("frames", &self.len())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;
    use crate::compressor::{BuiltinCompressors, COMPRESSOR_ZSTD, CompressorFlags};
    use crate::frame_data::FrameDataParams;
    use crate::pixel::{CompressedData, PixelData};
    use crate::stats::NullStatistics;
    use crate::types::{Buffer, Buffers, Viewport, Zoom, format};
    use crate::wire;

    fn store() -> FrameDataStore {
        FrameDataStore::new(Arc::new(BuiltinCompressors::new()), Arc::new(NullStatistics))
    }

    fn transmit_packet(target: ObjectVersion, vp: Viewport, buffers: Buffers, blocks: &[u8]) -> Packet {
        let header = TransmitHeader {
            frame_data: target,
            viewport: vp,
            zoom: Zoom::NONE,
            buffers,
            frame_number: 3,
            use_alpha: true,
        };
        Packet::new(Command::FrameDataTransmit, 1, header.encode_with(blocks).unwrap()).unwrap()
    }

    fn image_packet(target: ObjectVersion, vp: Viewport, value: u8) -> Packet {
        let mut pd = PixelData::new(format::RGBA, format::RGBA, vp).unwrap();
        pd.pixels.fill(value);
        let mut blocks = BytesMut::new();
        wire::encode_buffer(&mut blocks, &pd, 1.0);
        transmit_packet(target, vp, Buffers::COLOR, &blocks)
    }

    fn ready_packet(target: ObjectVersion, vp: Viewport) -> Packet {
        let signal = ReadySignal {
            frame_data: target,
            frame_number: 3,
            params: FrameDataParams {
                viewport: vp,
                ..FrameDataParams::default()
            },
        };
        Packet::new(Command::FrameDataReady, 2, signal.encode().unwrap()).unwrap()
    }

    #[test]
    fn frame_data_is_created_and_advanced() {
        let store = store();
        let fd = store.get_frame_data(ObjectVersion::new(7, 2));
        assert_eq!(fd.version(), 2);
        let again = store.get_frame_data(ObjectVersion::new(7, 5));
        assert!(Arc::ptr_eq(&fd, &again));
        assert_eq!(fd.version(), 5);

        // Older tokens never move the version back.
        store.get_frame_data(ObjectVersion::new(7, 1));
        assert_eq!(fd.version(), 5);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn images_become_visible_on_ready() {
        let store = store();
        let target = ObjectVersion::new(1, 1);
        let vp = Viewport::new(0, 0, 8, 8);

        let outcome = store.dispatch(&image_packet(target, vp, 9)).unwrap();
        assert_eq!(outcome, Dispatched::Image { frame_data: target, frame_number: 3 });
        let fd = store.frame_data(1).unwrap();
        assert!(!fd.is_ready());
        assert!(fd.images().is_empty());

        let outcome = store.dispatch(&ready_packet(target, vp)).unwrap();
        assert_eq!(outcome, Dispatched::Ready { frame_data: target, frame_number: 3 });
        assert!(fd.is_ready());
        let images = fd.images();
        assert_eq!(images.len(), 1);
        let image = images[0].read();
        assert_eq!(image.viewport(), vp);
        assert!(image.pixel_data(Buffer::Color).pixels.iter().all(|&b| b == 9));
        assert_eq!(fd.params().viewport, vp);
    }

    #[test]
    fn late_image_is_dropped() {
        let store = store();
        let target = ObjectVersion::new(1, 1);
        let vp = Viewport::new(0, 0, 4, 4);
        store.dispatch(&ready_packet(target, vp)).unwrap();

        let outcome = store.dispatch(&image_packet(target, vp, 1)).unwrap();
        assert_eq!(outcome, Dispatched::Late(target));
        assert!(store.frame_data(1).unwrap().images().is_empty());
    }

    #[test]
    fn ping_is_ignored_and_garbage_fails() {
        let store = store();
        assert_eq!(store.dispatch(&Packet::heartbeat()).unwrap(), Dispatched::Ignored);

        let garbage = Packet::new(Command::FrameDataReady, 1, Bytes::from_static(b"\x01")).unwrap();
        assert!(store.dispatch(&garbage).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn blocks_must_share_the_transmitted_viewport() {
        let store = store();
        let target = ObjectVersion::new(1, 1);
        let vp = Viewport::new(0, 0, 4, 4);
        let color = PixelData::new(format::RGBA, format::RGBA, vp).unwrap();
        let depth =
            PixelData::new(format::DEPTH, format::DEPTH_UNSIGNED_INT, Viewport::new(0, 0, 1, 1))
                .unwrap();
        let mut blocks = BytesMut::new();
        wire::encode_buffer(&mut blocks, &color, 1.0);
        wire::encode_buffer(&mut blocks, &depth, 1.0);

        let packet = transmit_packet(target, vp, Buffers::COLOR | Buffers::DEPTH, &blocks);
        assert!(matches!(store.dispatch(&packet), Err(TesseraError::InvalidHeader(_))));

        store.dispatch(&ready_packet(target, vp)).unwrap();
        assert!(store.frame_data(1).unwrap().images().is_empty());
    }

    #[test]
    fn hostile_image_sizes_fail_without_allocating() {
        let store = store();
        let target = ObjectVersion::new(1, 1);
        for vp in [
            Viewport::new(0, 0, i32::MAX, i32::MAX),
            Viewport::new(0, 0, 30_000, 30_000),
            Viewport::new(-8, 0, 4, 4),
        ] {
            let header = wire::ImageHeader {
                internal_format: format::RGBA,
                external_format: format::RGBA,
                pixel_size: 4,
                viewport: vp,
                compressor_name: COMPRESSOR_ZSTD,
                compressor_flags: 0,
                chunk_count: 1,
                quality: 1.0,
            };
            let mut blocks = BytesMut::from(&header.encode()[..]);
            blocks.put_u64_le(16);
            blocks.put_slice(&[0u8; 16]);
            let packet = transmit_packet(target, vp, Buffers::COLOR, &blocks);
            assert!(matches!(store.dispatch(&packet), Err(TesseraError::InvalidHeader(_))));
        }
    }

    #[test]
    fn chunk_decoding_past_its_viewport_fails() {
        let store = store();
        let target = ObjectVersion::new(1, 1);
        let tall = Viewport::new(0, 0, 8, 8);
        let short = Viewport::new(0, 0, 8, 2);
        let reg = BuiltinCompressors::new();
        let src = PixelData::new(format::RGBA, format::RGBA, tall).unwrap();
        let mut claimed = PixelData::new(format::RGBA, format::RGBA, short).unwrap();
        claimed.compressed = Some(CompressedData {
            compressor: COMPRESSOR_ZSTD,
            flags: CompressorFlags::DATA_2D,
            chunks: reg.compress(COMPRESSOR_ZSTD, &src, CompressorFlags::DATA_2D).unwrap(),
        });
        let mut blocks = BytesMut::new();
        wire::encode_buffer(&mut blocks, &claimed, 1.0);

        let packet = transmit_packet(target, short, Buffers::COLOR, &blocks);
        assert!(matches!(store.dispatch(&packet), Err(TesseraError::Compression(_))));
    }
}
