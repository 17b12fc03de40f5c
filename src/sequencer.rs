//! Frame sequencing: timestamp clamping, cluster boundaries and SimpleBlock layout.
//!
//! Every accepted frame gets a millisecond timestamp strictly greater than the
//! previous one. A cluster is started on every keyframe, and whenever the next
//! frame would not fit the signed 16-bit relative timecode of the open cluster.

use std::io::{Seek, Write};

use log::{debug, warn};

use crate::error::{MuxError, Result};
use crate::webm::{ContainerMarker, EbmlWriter, CLUSTER_ID, SIMPLE_BLOCK_ID, TIMECODE_ID};

/// Track number used for the single video track.
pub const VIDEO_TRACK_NUMBER: u8 = 1;

/// Largest relative timecode a SimpleBlock can carry.
pub const MAX_RELATIVE_TIMECODE: i64 = i16::MAX as i64;

/// Largest accepted frame timestamp in ms; keeps `last + 1` representable.
pub const MAX_TIMESTAMP_MS: i64 = i64::MAX - 1;

/// Track number, relative timecode and flags preceding the payload.
pub const BLOCK_HEADER_LEN: u64 = 4;

pub const BLOCK_FLAG_KEYFRAME: u8 = 0x80;
pub const BLOCK_FLAG_INVISIBLE: u8 = 0x08;

/// Rational time unit of the encoder's presentation timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub num: u32,
    pub den: u32,
}

impl Timebase {
    pub const MILLISECONDS: Timebase = Timebase { num: 1, den: 1000 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num == 0 || self.den == 0 {
            return Err(MuxError::InvalidTimebase {
                num: self.num,
                den: self.den,
            });
        }
        Ok(())
    }

    /// Convert a timestamp in this timebase to whole milliseconds (truncating).
    pub fn to_millis(&self, pts: i64) -> i64 {
        let ms = pts as i128 * 1000 * self.num as i128 / self.den as i128;
        ms.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// One compressed packet handed over by the encoder.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    /// Presentation timestamp in the session's timebase
    pub pts: i64,
    pub keyframe: bool,
    /// Decoded but not displayed (e.g. alt-ref frames)
    pub invisible: bool,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8], pts: i64, keyframe: bool) -> Self {
        Self {
            data,
            pts,
            keyframe,
            invisible: false,
        }
    }

    pub fn invisible(mut self, invisible: bool) -> Self {
        self.invisible = invisible;
        self
    }
}

/// Seek index entry for a cluster that starts on a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueEntry {
    pub timecode: u64,
    /// Offset of the Cluster element relative to the Segment payload start
    pub cluster_position: u64,
}

/// Order-dependent fingerprint of every payload written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentHash(u32);

impl ContentHash {
    pub fn update(&mut self, data: &[u8]) {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.0 ^ data.len() as u32);
        hasher.update(data);
        self.0 = hasher.finalize();
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Why a new cluster was started; logged for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterReason {
    First,
    Keyframe,
    TimecodeOverflow,
}

struct OpenCluster {
    marker: ContainerMarker,
    timecode: i64,
}

/// Where a submitted frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlacement {
    /// Absolute timestamp after clamping
    pub timecode: u64,
    pub relative_timecode: i16,
    pub new_cluster: Option<ClusterReason>,
}

/// Per-session state turning frames into clusters and SimpleBlocks.
pub struct FrameSequencer {
    timebase: Timebase,
    segment_data_start: u64,
    last_pts_ms: i64,
    cluster: Option<OpenCluster>,
    cues: Vec<CueEntry>,
    hash: ContentHash,
    frames: u64,
    clusters: u64,
    clamped: u64,
}

impl FrameSequencer {
    /// `segment_data_start` is the absolute offset that cue positions are relative to.
    pub fn new(timebase: Timebase, segment_data_start: u64) -> Self {
        Self {
            timebase,
            segment_data_start,
            last_pts_ms: -1,
            cluster: None,
            cues: Vec::new(),
            hash: ContentHash::default(),
            frames: 0,
            clusters: 0,
            clamped: 0,
        }
    }

    pub fn submit_frame<W: Write + Seek>(
        &mut self,
        writer: &mut EbmlWriter<W>,
        frame: &Frame<'_>,
    ) -> Result<BlockPlacement> {
        let requested = self.timebase.to_millis(frame.pts);
        if requested > MAX_TIMESTAMP_MS {
            return Err(MuxError::TimestampOutOfRange { pts_ms: requested });
        }
        let pts_ms = if requested <= self.last_pts_ms {
            if self.last_pts_ms >= MAX_TIMESTAMP_MS {
                return Err(MuxError::TimestampOutOfRange {
                    pts_ms: self.last_pts_ms,
                });
            }
            self.clamped += 1;
            warn!(
                "Frame timestamp {} ms is not after {} ms, clamping to {} ms",
                requested,
                self.last_pts_ms,
                self.last_pts_ms + 1
            );
            self.last_pts_ms + 1
        } else {
            requested
        };
        self.last_pts_ms = pts_ms;

        let reason = match &self.cluster {
            None => Some(ClusterReason::First),
            Some(_) if frame.keyframe => Some(ClusterReason::Keyframe),
            Some(open) if pts_ms - open.timecode > MAX_RELATIVE_TIMECODE => {
                Some(ClusterReason::TimecodeOverflow)
            }
            Some(_) => None,
        };
        if let Some(reason) = reason {
            self.start_cluster(writer, pts_ms, frame.keyframe, reason)?;
        }

        let cluster_timecode = self.cluster.as_ref().map_or(pts_ms, |c| c.timecode);
        let relative = (pts_ms - cluster_timecode) as i16;

        let mut flags = 0u8;
        if frame.keyframe {
            flags |= BLOCK_FLAG_KEYFRAME;
        }
        if frame.invisible {
            flags |= BLOCK_FLAG_INVISIBLE;
        }

        writer.write_element_header(SIMPLE_BLOCK_ID, frame.data.len() as u64 + BLOCK_HEADER_LEN)?;
        let [tc_hi, tc_lo] = relative.to_be_bytes();
        writer.write_raw(&[0x80 | VIDEO_TRACK_NUMBER, tc_hi, tc_lo, flags])?;
        writer.write_raw(frame.data)?;

        self.hash.update(frame.data);
        self.frames += 1;

        Ok(BlockPlacement {
            timecode: pts_ms as u64,
            relative_timecode: relative,
            new_cluster: reason,
        })
    }

    fn start_cluster<W: Write + Seek>(
        &mut self,
        writer: &mut EbmlWriter<W>,
        pts_ms: i64,
        keyframe: bool,
        reason: ClusterReason,
    ) -> Result<()> {
        self.close_cluster(writer)?;

        let cluster_start = writer.position()?;
        let marker = writer.open_container(CLUSTER_ID)?;
        writer.write_uint(TIMECODE_ID, pts_ms as u64)?;
        debug!(
            "Started cluster at {} ms (offset {}, {:?})",
            pts_ms, cluster_start, reason
        );

        if keyframe {
            self.cues.push(CueEntry {
                timecode: pts_ms as u64,
                cluster_position: cluster_start - self.segment_data_start,
            });
        }
        self.cluster = Some(OpenCluster {
            marker,
            timecode: pts_ms,
        });
        self.clusters += 1;
        Ok(())
    }

    /// Close the open cluster, if any.
    pub fn close_cluster<W: Write + Seek>(&mut self, writer: &mut EbmlWriter<W>) -> Result<()> {
        if let Some(open) = self.cluster.take() {
            writer.close_container(open.marker)?;
        }
        Ok(())
    }

    pub fn cues(&self) -> &[CueEntry] {
        &self.cues
    }

    pub fn content_hash(&self) -> ContentHash {
        self.hash
    }

    /// Last written timestamp in ms, `None` before the first frame.
    pub fn last_timecode(&self) -> Option<u64> {
        (self.last_pts_ms >= 0).then_some(self.last_pts_ms as u64)
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn cluster_count(&self) -> u64 {
        self.clusters
    }

    pub fn clamped_count(&self) -> u64 {
        self.clamped
    }

    pub fn is_cluster_open(&self) -> bool {
        self.cluster.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn setup() -> (EbmlWriter<Cursor<Vec<u8>>>, FrameSequencer) {
        (
            EbmlWriter::new(Cursor::new(Vec::new())),
            FrameSequencer::new(Timebase::MILLISECONDS, 0),
        )
    }

    #[test]
    fn test_timebase_scaling() {
        assert_eq!(Timebase::new(1, 30).to_millis(3), 100);
        assert_eq!(Timebase::new(1, 30).to_millis(1), 33);
        assert_eq!(Timebase::new(1, 90_000).to_millis(90_000), 1000);
        assert_eq!(Timebase::MILLISECONDS.to_millis(-5), -5);
        assert!(Timebase::new(0, 30).validate().is_err());
        assert!(Timebase::new(1, 0).validate().is_err());
    }

    #[test]
    fn test_duplicate_and_decreasing_timestamps_are_clamped() {
        let (mut w, mut seq) = setup();
        let mut timecodes = Vec::new();
        for pts in [0, 0, 10, 5, 5] {
            let placed = seq.submit_frame(&mut w, &Frame::new(b"x", pts, false)).unwrap();
            timecodes.push(placed.timecode);
        }
        assert_eq!(timecodes, vec![0, 1, 10, 11, 12]);
        assert_eq!(seq.clamped_count(), 3);
    }

    #[test]
    fn test_negative_first_timestamp_clamps_to_zero() {
        let (mut w, mut seq) = setup();
        let placed = seq.submit_frame(&mut w, &Frame::new(b"x", -40, true)).unwrap();
        assert_eq!(placed.timecode, 0);
    }

    #[test]
    fn test_out_of_range_timestamp_is_rejected() {
        let (mut w, _) = setup();
        let mut seq = FrameSequencer::new(Timebase::new(1, 30), 0);
        // Rescaling saturates to i64::MAX
        let result = seq.submit_frame(&mut w, &Frame::new(b"a", i64::MAX, true));
        assert!(matches!(result, Err(MuxError::TimestampOutOfRange { .. })));
        assert_eq!(seq.frame_count(), 0);
        assert_eq!(w.position().unwrap(), 0);

        let placed = seq.submit_frame(&mut w, &Frame::new(b"b", 0, false)).unwrap();
        assert_eq!(placed.timecode, 0);
    }

    #[test]
    fn test_clamp_at_largest_timestamp_is_rejected() {
        let (mut w, mut seq) = setup();
        let placed = seq
            .submit_frame(&mut w, &Frame::new(b"a", MAX_TIMESTAMP_MS, true))
            .unwrap();
        assert_eq!(placed.timecode, MAX_TIMESTAMP_MS as u64);

        let result = seq.submit_frame(&mut w, &Frame::new(b"b", 0, false));
        assert!(matches!(
            result,
            Err(MuxError::TimestampOutOfRange {
                pts_ms: MAX_TIMESTAMP_MS
            })
        ));
        assert_eq!(seq.frame_count(), 1);
        assert_eq!(seq.clamped_count(), 0);
    }

    #[test]
    fn test_cluster_boundaries() {
        let (mut w, mut seq) = setup();
        let first = seq.submit_frame(&mut w, &Frame::new(b"a", 0, false)).unwrap();
        assert_eq!(first.new_cluster, Some(ClusterReason::First));

        let same = seq.submit_frame(&mut w, &Frame::new(b"b", 32_767, false)).unwrap();
        assert_eq!(same.new_cluster, None);
        assert_eq!(same.relative_timecode, i16::MAX);

        let overflow = seq.submit_frame(&mut w, &Frame::new(b"c", 32_768, false)).unwrap();
        assert_eq!(overflow.new_cluster, Some(ClusterReason::TimecodeOverflow));
        assert_eq!(overflow.relative_timecode, 0);

        let key = seq.submit_frame(&mut w, &Frame::new(b"d", 32_800, true)).unwrap();
        assert_eq!(key.new_cluster, Some(ClusterReason::Keyframe));

        assert_eq!(seq.cluster_count(), 3);
        // Only the keyframe cluster is indexed
        assert_eq!(seq.cues().len(), 1);
        assert_eq!(seq.cues()[0].timecode, 32_800);
    }

    #[test]
    fn test_simple_block_layout() {
        let (mut w, mut seq) = setup();
        seq.submit_frame(&mut w, &Frame::new(&[0xAA, 0xBB], 0, true))
            .unwrap();
        seq.submit_frame(&mut w, &Frame::new(&[0xCC], 40, false).invisible(true))
            .unwrap();
        seq.close_cluster(&mut w).unwrap();
        assert!(!seq.is_cluster_open());

        let bytes = w.into_inner().into_inner();
        // Cluster header (4 + 8), Timecode 0 (3)
        assert_eq!(&bytes[..4], &[0x1F, 0x43, 0xB6, 0x75]);
        assert_eq!(&bytes[12..15], &[0xE7, 0x81, 0x00]);
        assert_eq!(
            &bytes[15..23],
            &[0xA3, 0x86, 0x81, 0x00, 0x00, 0x80, 0xAA, 0xBB]
        );
        assert_eq!(&bytes[23..30], &[0xA3, 0x85, 0x81, 0x00, 0x28, 0x08, 0xCC]);
        assert_eq!(&bytes[4..12], &[0x01, 0, 0, 0, 0, 0, 0, 18]);
    }

    #[test]
    fn test_empty_payload_is_accepted() {
        let (mut w, mut seq) = setup();
        seq.submit_frame(&mut w, &Frame::new(&[], 0, true)).unwrap();
        let bytes = w.into_inner().into_inner();
        assert_eq!(&bytes[15..], &[0xA3, 0x84, 0x81, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_content_hash_is_order_dependent() {
        let mut a = ContentHash::default();
        a.update(b"first");
        a.update(b"second");
        let mut b = ContentHash::default();
        b.update(b"second");
        b.update(b"first");
        assert_ne!(a, b);

        let mut c = ContentHash::default();
        c.update(b"first");
        c.update(b"second");
        assert_eq!(a, c);
    }
}
