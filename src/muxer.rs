//! WebM document builder.
//!
//! A session writes the EBML header and an open Segment up front, streams
//! clusters as frames arrive, and on `finalize` appends the Cues index and
//! patches the regions that could not be known earlier: the Segment size,
//! the SeekHead positions, the Info duration and the Track UID.
//!
//! ```text
//! EBML header
//! Segment (size patched)
//!   SeekHead (rewritten)
//!   Info (duration patched)
//!   Tracks / TrackEntry (UID patched)
//!   Cluster*
//!   Cues
//! ```

use std::io::{Seek, SeekFrom, Write};

use log::info;

use crate::error::{MuxError, Result};
use crate::sequencer::{
    BlockPlacement, CueEntry, Frame, FrameSequencer, Timebase, VIDEO_TRACK_NUMBER,
};
use crate::webm::*;

/// Application name written to MuxingApp and WritingApp.
pub const MUXING_APP: &str = concat!("capture_webm-", env!("CARGO_PKG_VERSION"));

const TIMECODE_SCALE_NS: u64 = 1_000_000;

/// Placeholder stored in TrackUID until the content hash is known.
const TRACK_UID_PLACEHOLDER: u64 = 0xDEAD_BEEF;

/// Description of the single video track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoTrack {
    pub width: u32,
    pub height: u32,
    pub timebase: Timebase,
    /// Added to the last timestamp to compute the Segment duration
    pub frame_duration_ms: f64,
}

impl VideoTrack {
    pub fn new(width: u32, height: u32, timebase: Timebase) -> Self {
        Self {
            width,
            height,
            timebase,
            frame_duration_ms: 0.0,
        }
    }

    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.frame_duration_ms = if fps == 0 { 0.0 } else { 1000.0 / fps as f64 };
        self
    }
}

/// Offsets of top-level elements relative to the Segment payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SeekPositions {
    info: u64,
    tracks: u64,
    cues: u64,
}

/// Summary returned by `finalize`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub frames: u64,
    pub clusters: u64,
    pub cues: u64,
    pub clamped_timestamps: u64,
    pub duration_ms: f64,
    pub track_uid: u32,
    pub bytes_written: u64,
}

/// Streaming WebM writer for one capture session.
///
/// Constructed by `open` and consumed by `finalize`, so frames cannot be
/// submitted before the header exists or after the index was written.
pub struct WebmMuxer<W: Write + Seek> {
    writer: EbmlWriter<W>,
    segment: ContainerMarker,
    track: VideoTrack,
    seek_head_pos: u64,
    seek_head_len: u64,
    positions: SeekPositions,
    duration_pos: u64,
    track_uid_pos: u64,
    sequencer: FrameSequencer,
}

impl<W: Write + Seek> WebmMuxer<W> {
    /// Write the EBML header, SeekHead placeholder, Info and Tracks.
    pub fn open(inner: W, track: VideoTrack) -> Result<Self> {
        track.timebase.validate()?;

        let mut writer = EbmlWriter::new(inner);
        write_ebml_header(&mut writer)?;

        let segment = writer.open_container(SEGMENT_ID)?;
        let segment_start = segment.data_start();

        let seek_head_pos = writer.position()?;
        write_seek_head(&mut writer, &SeekPositions::default())?;
        let seek_head_len = writer.position()? - seek_head_pos;

        let mut positions = SeekPositions {
            info: writer.position()? - segment_start,
            ..SeekPositions::default()
        };
        let info = writer.open_container(INFO_ID)?;
        writer.write_uint(TIMECODE_SCALE_ID, TIMECODE_SCALE_NS)?;
        let duration_pos = writer.write_float(DURATION_ID, 0.0)?;
        writer.write_string(MUXING_APP_ID, MUXING_APP)?;
        writer.write_string(WRITING_APP_ID, MUXING_APP)?;
        writer.close_container(info)?;

        positions.tracks = writer.position()? - segment_start;
        let tracks = writer.open_container(TRACKS_ID)?;
        let entry = writer.open_container(TRACK_ENTRY_ID)?;
        writer.write_uint(TRACK_NUMBER_ID, VIDEO_TRACK_NUMBER as u64)?;
        let track_uid_pos = writer.write_uint_fixed(TRACK_UID_ID, TRACK_UID_PLACEHOLDER, 4)?;
        writer.write_uint(TRACK_TYPE_ID, TRACK_TYPE_VIDEO)?;
        writer.write_string(CODEC_ID_ID, CODEC_VP8)?;
        let video = writer.open_container(VIDEO_ID)?;
        writer.write_uint(PIXEL_WIDTH_ID, track.width as u64)?;
        writer.write_uint(PIXEL_HEIGHT_ID, track.height as u64)?;
        writer.write_uint(STEREO_MODE_ID, STEREO_MODE_MONO)?;
        writer.close_container(video)?;
        writer.close_container(entry)?;
        writer.close_container(tracks)?;

        info!(
            "Opened WebM session {}x{} (timebase {}/{})",
            track.width, track.height, track.timebase.num, track.timebase.den
        );

        Ok(Self {
            sequencer: FrameSequencer::new(track.timebase, segment_start),
            writer,
            segment,
            track,
            seek_head_pos,
            seek_head_len,
            positions,
            duration_pos,
            track_uid_pos,
        })
    }

    /// Append one encoded frame.
    pub fn submit_frame(&mut self, frame: &Frame<'_>) -> Result<BlockPlacement> {
        self.sequencer.submit_frame(&mut self.writer, frame)
    }

    pub fn frame_count(&self) -> u64 {
        self.sequencer.frame_count()
    }

    pub fn cues(&self) -> &[CueEntry] {
        self.sequencer.cues()
    }

    /// Write the Cues, close the Segment and patch the header regions.
    ///
    /// Returns the sink positioned at end of file together with a summary.
    pub fn finalize(mut self) -> Result<(W, SessionStats)> {
        self.sequencer.close_cluster(&mut self.writer)?;

        let segment_start = self.segment.data_start();
        self.positions.cues = self.writer.position()? - segment_start;
        write_cues(&mut self.writer, self.sequencer.cues())?;
        self.writer.close_container(self.segment)?;

        let positions = self.positions;
        rewrite_reserved(
            &mut self.writer,
            self.seek_head_pos,
            self.seek_head_len,
            |w| write_seek_head(w, &positions),
        )?;

        let duration_ms = match self.sequencer.last_timecode() {
            Some(last) => last as f64 + self.track.frame_duration_ms,
            None => 0.0,
        };
        self.writer.patch_be(self.duration_pos, duration_ms.to_bits(), 8)?;

        // TrackUID must be non-zero
        let track_uid = self.sequencer.content_hash().value().max(1);
        self.writer.patch_be(self.track_uid_pos, track_uid as u64, 4)?;

        let mut inner = self.writer.into_inner();
        let bytes_written = inner.seek(SeekFrom::End(0))?;
        inner.flush()?;

        let stats = SessionStats {
            frames: self.sequencer.frame_count(),
            clusters: self.sequencer.cluster_count(),
            cues: self.sequencer.cues().len() as u64,
            clamped_timestamps: self.sequencer.clamped_count(),
            duration_ms,
            track_uid,
            bytes_written,
        };
        info!(
            "Finalized WebM session: {} frames, {} clusters, {} cues, {:.1} ms, {} bytes",
            stats.frames, stats.clusters, stats.cues, stats.duration_ms, stats.bytes_written
        );
        Ok((inner, stats))
    }
}

/// Rewrite a region reserved at `offset`; the new bytes must fill it exactly.
fn rewrite_reserved<W, F>(
    writer: &mut EbmlWriter<W>,
    offset: u64,
    reserved: u64,
    rewrite: F,
) -> Result<()>
where
    W: Write + Seek,
    F: FnOnce(&mut EbmlWriter<W>) -> Result<()>,
{
    let written = writer.patch_at(offset, rewrite)?;
    if written != reserved {
        return Err(MuxError::PatchSizeMismatch {
            offset,
            reserved,
            written,
        });
    }
    Ok(())
}

fn write_ebml_header<W: Write + Seek>(writer: &mut EbmlWriter<W>) -> Result<()> {
    let header = writer.open_container(EBML_ID)?;
    writer.write_uint(EBML_VERSION_ID, 1)?;
    writer.write_uint(EBML_READ_VERSION_ID, 1)?;
    writer.write_uint(EBML_MAX_ID_LENGTH_ID, 4)?;
    writer.write_uint(EBML_MAX_SIZE_LENGTH_ID, 8)?;
    writer.write_string(DOC_TYPE_ID, "webm")?;
    writer.write_uint(DOC_TYPE_VERSION_ID, 2)?;
    writer.write_uint(DOC_TYPE_READ_VERSION_ID, 2)?;
    writer.close_container(header)?;
    Ok(())
}

/// SeekHead with fixed-width positions so the rewrite at finalize has the same length.
fn write_seek_head<W: Write + Seek>(
    writer: &mut EbmlWriter<W>,
    positions: &SeekPositions,
) -> Result<()> {
    let seek_head = writer.open_container(SEEK_HEAD_ID)?;
    for (id, position) in [
        (INFO_ID, positions.info),
        (TRACKS_ID, positions.tracks),
        (CUES_ID, positions.cues),
    ] {
        let seek = writer.open_container(SEEK_ID)?;
        writer.write_binary(SEEK_ID_ID, &id.to_be_bytes())?;
        writer.write_uint_fixed(SEEK_POSITION_ID, position, 8)?;
        writer.close_container(seek)?;
    }
    writer.close_container(seek_head)?;
    Ok(())
}

fn write_cues<W: Write + Seek>(writer: &mut EbmlWriter<W>, cues: &[CueEntry]) -> Result<()> {
    let cues_marker = writer.open_container(CUES_ID)?;
    for cue in cues {
        let point = writer.open_container(CUE_POINT_ID)?;
        writer.write_uint(CUE_TIME_ID, cue.timecode)?;
        let positions = writer.open_container(CUE_TRACK_POSITIONS_ID)?;
        writer.write_uint(CUE_TRACK_ID, VIDEO_TRACK_NUMBER as u64)?;
        writer.write_uint(CUE_CLUSTER_POSITION_ID, cue.cluster_position)?;
        writer.close_container(positions)?;
        writer.close_container(point)?;
    }
    writer.close_container(cues_marker)?;
    Ok(())
}
