// EBML/WebM element writing

use std::io::{Seek, SeekFrom, Write};

use crate::ebml::{
    id_len, uint_len, write_be, write_bytes, write_text, write_unknown_size, write_vint,
    write_vint_fixed8, RESERVED_SIZE_LEN,
};
use crate::error::{MuxError, Result};

pub const EBML_ID: u32 = 0x1A45DFA3;
pub const EBML_VERSION_ID: u32 = 0x4286;
pub const EBML_READ_VERSION_ID: u32 = 0x42F7;
pub const EBML_MAX_ID_LENGTH_ID: u32 = 0x42F2;
pub const EBML_MAX_SIZE_LENGTH_ID: u32 = 0x42F3;
pub const DOC_TYPE_ID: u32 = 0x4282;
pub const DOC_TYPE_VERSION_ID: u32 = 0x4287;
pub const DOC_TYPE_READ_VERSION_ID: u32 = 0x4285;

pub const SEGMENT_ID: u32 = 0x18538067;

pub const SEEK_HEAD_ID: u32 = 0x114D9B74;
pub const SEEK_ID: u32 = 0x4DBB;
pub const SEEK_ID_ID: u32 = 0x53AB;
pub const SEEK_POSITION_ID: u32 = 0x53AC;

pub const INFO_ID: u32 = 0x1549A966;
pub const TIMECODE_SCALE_ID: u32 = 0x2AD7B1;
pub const DURATION_ID: u32 = 0x4489;
pub const MUXING_APP_ID: u32 = 0x4D80;
pub const WRITING_APP_ID: u32 = 0x5741;

pub const TRACKS_ID: u32 = 0x1654AE6B;
pub const TRACK_ENTRY_ID: u32 = 0xAE;
pub const TRACK_NUMBER_ID: u32 = 0xD7;
pub const TRACK_UID_ID: u32 = 0x73C5;
pub const TRACK_TYPE_ID: u32 = 0x83;
pub const CODEC_ID_ID: u32 = 0x86;
pub const VIDEO_ID: u32 = 0xE0;
pub const PIXEL_WIDTH_ID: u32 = 0xB0;
pub const PIXEL_HEIGHT_ID: u32 = 0xBA;
pub const STEREO_MODE_ID: u32 = 0x53B8;

pub const CLUSTER_ID: u32 = 0x1F43B675;
pub const TIMECODE_ID: u32 = 0xE7;
pub const SIMPLE_BLOCK_ID: u32 = 0xA3;

pub const CUES_ID: u32 = 0x1C53BB6B;
pub const CUE_POINT_ID: u32 = 0xBB;
pub const CUE_TIME_ID: u32 = 0xB3;
pub const CUE_TRACK_POSITIONS_ID: u32 = 0xB7;
pub const CUE_TRACK_ID: u32 = 0xF7;
pub const CUE_CLUSTER_POSITION_ID: u32 = 0xF1;

pub const TRACK_TYPE_VIDEO: u64 = 1;
pub const STEREO_MODE_MONO: u64 = 0;
pub const CODEC_VP8: &str = "V_VP8";

/// Handle to a container whose size field is still the "unknown" placeholder.
///
/// Not `Clone`: closing consumes it, so a container cannot be closed twice.
#[derive(Debug)]
#[must_use = "an open container must be closed or the document is left with an unknown size"]
pub struct ContainerMarker {
    id: u32,
    offset: u64,
}

impl ContainerMarker {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Offset of the first byte of the reserved size field.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the first payload byte.
    pub fn data_start(&self) -> u64 {
        self.offset + RESERVED_SIZE_LEN
    }
}

/// Streams EBML elements to a seekable sink, patching container sizes in place.
pub struct EbmlWriter<W> {
    inner: W,
    open: Vec<u64>,
}

impl<W: Write + Seek> EbmlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            open: Vec::new(),
        }
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Number of containers opened and not yet closed.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn write_raw(&mut self, buf: &[u8]) -> Result<()> {
        write_bytes(&mut self.inner, buf)
    }

    pub fn write_element_id(&mut self, id: u32) -> Result<()> {
        let len = id_len(id);
        write_bytes(&mut self.inner, &id.to_be_bytes()[4 - len..])
    }

    /// Unsigned integer using the fewest bytes that hold `value`.
    pub fn write_uint(&mut self, id: u32, value: u64) -> Result<()> {
        let len = uint_len(value);
        self.write_element_id(id)?;
        write_vint(&mut self.inner, len as u64)?;
        write_bytes(&mut self.inner, &value.to_be_bytes()[8 - len..])
    }

    /// Unsigned integer with a fixed payload width (4 or 8 bytes typically).
    ///
    /// Returns the offset of the payload so the value can be rewritten later.
    pub fn write_uint_fixed(&mut self, id: u32, value: u64, width: usize) -> Result<u64> {
        self.write_element_id(id)?;
        write_vint(&mut self.inner, width as u64)?;
        let value_pos = self.position()?;
        write_be(&mut self.inner, value, width)?;
        Ok(value_pos)
    }

    /// IEEE-754 double; returns the payload offset like `write_uint_fixed`.
    pub fn write_float(&mut self, id: u32, value: f64) -> Result<u64> {
        self.write_element_id(id)?;
        write_vint(&mut self.inner, 8)?;
        let value_pos = self.position()?;
        write_be(&mut self.inner, value.to_bits(), 8)?;
        Ok(value_pos)
    }

    pub fn write_string(&mut self, id: u32, text: &str) -> Result<()> {
        self.write_element_id(id)?;
        write_text(&mut self.inner, text)
    }

    pub fn write_binary(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.write_element_id(id)?;
        write_vint(&mut self.inner, data.len() as u64)?;
        write_bytes(&mut self.inner, data)
    }

    /// Write an element header with a known payload size; the caller writes the payload.
    pub fn write_element_header(&mut self, id: u32, size: u64) -> Result<()> {
        self.write_element_id(id)?;
        write_vint(&mut self.inner, size)
    }

    /// Start a master element whose size is patched by `close_container`.
    pub fn open_container(&mut self, id: u32) -> Result<ContainerMarker> {
        self.write_element_id(id)?;
        let offset = self.position()?;
        write_unknown_size(&mut self.inner)?;
        self.open.push(offset);
        Ok(ContainerMarker { id, offset })
    }

    /// Patch the size of the innermost open container and return its payload size.
    pub fn close_container(&mut self, marker: ContainerMarker) -> Result<u64> {
        let innermost = self.open.last().copied();
        if innermost != Some(marker.offset) {
            return Err(MuxError::UnbalancedContainer {
                id: marker.id(),
                offset: marker.offset,
                innermost,
            });
        }

        let end = self.position()?;
        let size = end - marker.data_start();
        self.inner.seek(SeekFrom::Start(marker.offset))?;
        write_vint_fixed8(&mut self.inner, size)?;
        self.inner.seek(SeekFrom::Start(end))?;
        self.open.pop();
        Ok(size)
    }

    /// Rewrite an already-emitted region starting at `offset`, then restore the position.
    ///
    /// Returns the number of bytes `rewrite` produced.
    pub fn patch_at<F>(&mut self, offset: u64, rewrite: F) -> Result<u64>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let resume = self.position()?;
        self.inner.seek(SeekFrom::Start(offset))?;
        rewrite(self)?;
        let written = self.position()? - offset;
        self.inner.seek(SeekFrom::Start(resume))?;
        Ok(written)
    }

    /// Overwrite a fixed-width big-endian integer at `offset`.
    pub fn patch_be(&mut self, offset: u64, value: u64, width: usize) -> Result<()> {
        self.patch_at(offset, |w| write_be(&mut w.inner, value, width))?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn writer() -> EbmlWriter<Cursor<Vec<u8>>> {
        EbmlWriter::new(Cursor::new(Vec::new()))
    }

    #[test]
    fn test_element_id_uses_minimal_width() {
        let mut w = writer();
        w.write_element_id(SIMPLE_BLOCK_ID).unwrap();
        w.write_element_id(TRACK_UID_ID).unwrap();
        w.write_element_id(TIMECODE_SCALE_ID).unwrap();
        w.write_element_id(SEGMENT_ID).unwrap();
        assert_eq!(
            w.into_inner().into_inner(),
            vec![0xA3, 0x73, 0xC5, 0x2A, 0xD7, 0xB1, 0x18, 0x53, 0x80, 0x67]
        );
    }

    #[test]
    fn test_uint_elements() {
        let mut w = writer();
        w.write_uint(TRACK_NUMBER_ID, 1).unwrap();
        w.write_uint(TIMECODE_SCALE_ID, 1_000_000).unwrap();
        let pos = w.write_uint_fixed(TRACK_UID_ID, 0xDEAD, 4).unwrap();
        assert_eq!(pos, 3 + 7 + 3);
        assert_eq!(
            w.into_inner().into_inner(),
            vec![
                0xD7, 0x81, 0x01, // TrackNumber
                0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40, // TimecodeScale
                0x73, 0xC5, 0x84, 0x00, 0x00, 0xDE, 0xAD, // TrackUID
            ]
        );
    }

    #[test]
    fn test_float_string_and_binary() {
        let mut w = writer();
        w.write_float(DURATION_ID, 1.5).unwrap();
        w.write_string(CODEC_ID_ID, CODEC_VP8).unwrap();
        w.write_binary(SEEK_ID_ID, &[1, 2]).unwrap();
        let mut expected = vec![0x44, 0x89, 0x88];
        expected.extend_from_slice(&1.5f64.to_be_bytes());
        expected.extend_from_slice(&[0x86, 0x85, b'V', b'_', b'V', b'P', b'8']);
        expected.extend_from_slice(&[0x53, 0xAB, 0x82, 1, 2]);
        assert_eq!(w.into_inner().into_inner(), expected);
    }

    #[test]
    fn test_close_container_patches_size() {
        let mut w = writer();
        let outer = w.open_container(TRACKS_ID).unwrap();
        let inner = w.open_container(TRACK_ENTRY_ID).unwrap();
        w.write_uint(TRACK_NUMBER_ID, 1).unwrap();
        assert_eq!(w.depth(), 2);
        assert_eq!(w.close_container(inner).unwrap(), 3);
        assert_eq!(w.close_container(outer).unwrap(), 1 + 8 + 3);
        assert_eq!(w.depth(), 0);

        let bytes = w.into_inner().into_inner();
        assert_eq!(&bytes[4..12], &[0x01, 0, 0, 0, 0, 0, 0, 12]);
        assert_eq!(&bytes[13..21], &[0x01, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(bytes.len(), 4 + 8 + 12);
    }

    #[test]
    fn test_close_out_of_order_is_rejected() {
        let mut w = writer();
        let outer = w.open_container(CUES_ID).unwrap();
        let inner = w.open_container(CUE_POINT_ID).unwrap();
        let inner_offset = inner.offset();
        match w.close_container(outer) {
            Err(MuxError::UnbalancedContainer { innermost, .. }) => {
                assert_eq!(innermost, Some(inner_offset))
            }
            other => panic!("expected UnbalancedContainer, got {:?}", other),
        }
        // Inner container is untouched and can still be closed
        assert_eq!(w.close_container(inner).unwrap(), 0);
    }

    #[test]
    fn test_patch_at_restores_position() {
        let mut w = writer();
        let pos = w.write_uint_fixed(TRACK_UID_ID, 0, 4).unwrap();
        w.write_uint(TRACK_TYPE_ID, TRACK_TYPE_VIDEO).unwrap();
        let end = w.position().unwrap();
        w.patch_be(pos, 0x0102_0304, 4).unwrap();
        assert_eq!(w.position().unwrap(), end);
        let bytes = w.into_inner().into_inner();
        assert_eq!(&bytes[3..7], &[1, 2, 3, 4]);
        assert_eq!(&bytes[7..], &[0x83, 0x81, 0x01]);
    }
}
