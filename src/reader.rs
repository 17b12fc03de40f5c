//! Minimal EBML reader for inspecting and verifying written documents.
//!
//! Parses a byte span into an element tree, descending into the master
//! elements this crate writes. Every child must lie inside its parent, so a
//! successful parse proves that declared sizes match the actual spans.

use crate::error::ParseError;
use crate::sequencer::{BLOCK_FLAG_INVISIBLE, BLOCK_FLAG_KEYFRAME};
use crate::webm::*;

/// One parsed element; `children` is empty for non-master elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: u32,
    /// Absolute offset of the ID's first byte
    pub offset: u64,
    /// ID plus size field length
    pub header_len: usize,
    /// Payload size in bytes
    pub size: u64,
    /// Size field held the "unknown size" sentinel
    pub unknown_size: bool,
    pub children: Vec<Element>,
}

impl Element {
    pub fn data_offset(&self) -> u64 {
        self.offset + self.header_len as u64
    }

    pub fn end(&self) -> u64 {
        self.data_offset() + self.size
    }

    pub fn find(&self, id: u32) -> Option<&Element> {
        self.children.iter().find(|child| child.id == id)
    }

    pub fn find_all(&self, id: u32) -> impl Iterator<Item = &Element> {
        self.children.iter().filter(move |child| child.id == id)
    }

    /// Payload bytes of this element within the full document.
    pub fn payload<'a>(&self, document: &'a [u8]) -> &'a [u8] {
        &document[self.data_offset() as usize..self.end() as usize]
    }
}

pub fn is_master(id: u32) -> bool {
    matches!(
        id,
        EBML_ID
            | SEGMENT_ID
            | SEEK_HEAD_ID
            | SEEK_ID
            | INFO_ID
            | TRACKS_ID
            | TRACK_ENTRY_ID
            | VIDEO_ID
            | CLUSTER_ID
            | CUES_ID
            | CUE_POINT_ID
            | CUE_TRACK_POSITIONS_ID
    )
}

/// Human-readable element name, for inspection output.
pub fn element_name(id: u32) -> &'static str {
    match id {
        EBML_ID => "EBML",
        EBML_VERSION_ID => "EBMLVersion",
        EBML_READ_VERSION_ID => "EBMLReadVersion",
        EBML_MAX_ID_LENGTH_ID => "EBMLMaxIDLength",
        EBML_MAX_SIZE_LENGTH_ID => "EBMLMaxSizeLength",
        DOC_TYPE_ID => "DocType",
        DOC_TYPE_VERSION_ID => "DocTypeVersion",
        DOC_TYPE_READ_VERSION_ID => "DocTypeReadVersion",
        SEGMENT_ID => "Segment",
        SEEK_HEAD_ID => "SeekHead",
        SEEK_ID => "Seek",
        SEEK_ID_ID => "SeekID",
        SEEK_POSITION_ID => "SeekPosition",
        INFO_ID => "Info",
        TIMECODE_SCALE_ID => "TimecodeScale",
        DURATION_ID => "Duration",
        MUXING_APP_ID => "MuxingApp",
        WRITING_APP_ID => "WritingApp",
        TRACKS_ID => "Tracks",
        TRACK_ENTRY_ID => "TrackEntry",
        TRACK_NUMBER_ID => "TrackNumber",
        TRACK_UID_ID => "TrackUID",
        TRACK_TYPE_ID => "TrackType",
        CODEC_ID_ID => "CodecID",
        VIDEO_ID => "Video",
        PIXEL_WIDTH_ID => "PixelWidth",
        PIXEL_HEIGHT_ID => "PixelHeight",
        STEREO_MODE_ID => "StereoMode",
        CLUSTER_ID => "Cluster",
        TIMECODE_ID => "Timecode",
        SIMPLE_BLOCK_ID => "SimpleBlock",
        CUES_ID => "Cues",
        CUE_POINT_ID => "CuePoint",
        CUE_TIME_ID => "CueTime",
        CUE_TRACK_POSITIONS_ID => "CueTrackPositions",
        CUE_TRACK_ID => "CueTrack",
        CUE_CLUSTER_POSITION_ID => "CueClusterPosition",
        _ => "Unknown",
    }
}

/// Decode a size field; returns the value without its marker bit and the field length.
pub fn read_vint(data: &[u8]) -> Result<(u64, usize), ParseError> {
    read_vint_at(data, 0)
}

fn read_vint_at(data: &[u8], offset: u64) -> Result<(u64, usize), ParseError> {
    let first = *data
        .first()
        .ok_or(ParseError::Truncated { offset, needed: 1 })?;
    if first == 0 {
        return Err(ParseError::InvalidVint { offset });
    }
    let len = first.leading_zeros() as usize + 1;
    if data.len() < len {
        return Err(ParseError::Truncated {
            offset,
            needed: len,
        });
    }
    let mut value = (first as u64) & (0xFF >> len);
    for &byte in &data[1..len] {
        value = (value << 8) | byte as u64;
    }
    Ok((value, len))
}

/// Decode an element ID, keeping its marker bits.
pub fn read_element_id(data: &[u8]) -> Result<(u32, usize), ParseError> {
    read_element_id_at(data, 0)
}

fn read_element_id_at(data: &[u8], offset: u64) -> Result<(u32, usize), ParseError> {
    let first = *data
        .first()
        .ok_or(ParseError::Truncated { offset, needed: 1 })?;
    let len = first.leading_zeros() as usize + 1;
    if len > 4 {
        return Err(ParseError::InvalidVint { offset });
    }
    if data.len() < len {
        return Err(ParseError::Truncated {
            offset,
            needed: len,
        });
    }
    let id = data[..len]
        .iter()
        .fold(0u32, |acc, &byte| (acc << 8) | byte as u32);
    Ok((id, len))
}

/// Parse a whole document into its top-level elements.
pub fn parse_elements(data: &[u8]) -> Result<Vec<Element>, ParseError> {
    parse_span(data, 0, data.len() as u64)
}

fn parse_span(data: &[u8], start: u64, end: u64) -> Result<Vec<Element>, ParseError> {
    let mut elements = Vec::new();
    let mut pos = start;

    while pos < end {
        let window = &data[pos as usize..end as usize];
        let (id, id_len) = read_element_id_at(window, pos)?;
        let (raw_size, size_len) = read_vint_at(&window[id_len..], pos + id_len as u64)?;
        let header_len = id_len + size_len;
        let data_offset = pos + header_len as u64;

        let unknown_size = raw_size == (1u64 << (7 * size_len)) - 1;
        let size = if unknown_size {
            end - data_offset
        } else {
            raw_size
        };
        let element_end = data_offset + size;
        if element_end > end {
            return Err(ParseError::Overrun {
                id,
                offset: pos,
                excess: element_end - end,
            });
        }

        let children = if is_master(id) {
            parse_span(data, data_offset, element_end)?
        } else {
            Vec::new()
        };

        elements.push(Element {
            id,
            offset: pos,
            header_len,
            size,
            unknown_size,
            children,
        });
        pos = element_end;
    }

    Ok(elements)
}

/// Big-endian unsigned integer payload (0 to 8 bytes).
pub fn read_uint(payload: &[u8]) -> Result<u64, ParseError> {
    if payload.len() > 8 {
        return Err(ParseError::InvalidPayload {
            kind: "unsigned integer",
            len: payload.len(),
        });
    }
    Ok(payload
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | byte as u64))
}

/// 4- or 8-byte IEEE-754 float payload.
pub fn read_float(payload: &[u8]) -> Result<f64, ParseError> {
    match payload.len() {
        4 => {
            let bits = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(f32::from_bits(bits) as f64)
        }
        8 => Ok(f64::from_bits(read_uint(payload)?)),
        len => Err(ParseError::InvalidPayload { kind: "float", len }),
    }
}

/// Leading fields of a SimpleBlock payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleBlockHeader {
    pub track_number: u64,
    pub relative_timecode: i16,
    pub keyframe: bool,
    pub invisible: bool,
    /// Bytes before the frame data
    pub header_len: usize,
}

impl SimpleBlockHeader {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let (track_number, track_len) = read_vint(payload)?;
        let rest = &payload[track_len..];
        if rest.len() < 3 {
            return Err(ParseError::InvalidPayload {
                kind: "SimpleBlock header",
                len: payload.len(),
            });
        }
        let flags = rest[2];
        Ok(Self {
            track_number,
            relative_timecode: i16::from_be_bytes([rest[0], rest[1]]),
            keyframe: flags & BLOCK_FLAG_KEYFRAME != 0,
            invisible: flags & BLOCK_FLAG_INVISIBLE != 0,
            header_len: track_len + 3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::write_vint;

    #[test]
    fn test_vint_round_trip_representative_values() {
        for value in [0u64, 127, 128, 16383, 16384, 1 << 35] {
            let mut buf = Vec::new();
            write_vint(&mut buf, value).unwrap();
            let (decoded, len) = read_vint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn test_read_vint_errors() {
        assert!(matches!(read_vint(&[]), Err(ParseError::Truncated { .. })));
        assert!(matches!(read_vint(&[0x00]), Err(ParseError::InvalidVint { .. })));
        assert!(matches!(read_vint(&[0x40]), Err(ParseError::Truncated { needed: 2, .. })));
    }

    #[test]
    fn test_read_element_id() {
        assert_eq!(read_element_id(&[0xA3, 0x00]).unwrap(), (0xA3, 1));
        assert_eq!(
            read_element_id(&[0x1A, 0x45, 0xDF, 0xA3]).unwrap(),
            (EBML_ID, 4)
        );
        assert!(read_element_id(&[0x08, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_parse_nested_and_detect_overrun() {
        // Tracks { TrackEntry { TrackNumber 1 } }
        let doc = [
            0x16, 0x54, 0xAE, 0x6B, 0x85, 0xAE, 0x83, 0xD7, 0x81, 0x01,
        ];
        let elements = parse_elements(&doc).unwrap();
        assert_eq!(elements.len(), 1);
        let entry = elements[0].find(TRACK_ENTRY_ID).unwrap();
        let number = entry.find(TRACK_NUMBER_ID).unwrap();
        assert_eq!(read_uint(number.payload(&doc)).unwrap(), 1);

        // Inner size claims one byte more than the parent holds
        let mut bad = doc;
        bad[6] = 0x84;
        assert!(matches!(
            parse_elements(&bad),
            Err(ParseError::Overrun { id: TRACK_ENTRY_ID, .. })
        ));
    }

    #[test]
    fn test_unknown_size_extends_to_parent_end() {
        let doc = [
            0x1F, 0x43, 0xB6, 0x75, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xE7, 0x81,
            0x00,
        ];
        let elements = parse_elements(&doc).unwrap();
        assert!(elements[0].unknown_size);
        assert_eq!(elements[0].size, 3);
        assert_eq!(elements[0].children.len(), 1);
    }

    #[test]
    fn test_simple_block_header() {
        let header = SimpleBlockHeader::parse(&[0x81, 0xFF, 0xFE, 0x88, 0xAA]).unwrap();
        assert_eq!(header.track_number, 1);
        assert_eq!(header.relative_timecode, -2);
        assert!(header.keyframe);
        assert!(header.invisible);
        assert_eq!(header.header_len, 4);
    }

    #[test]
    fn test_read_float() {
        assert_eq!(read_float(&2.5f64.to_be_bytes()).unwrap(), 2.5);
        assert_eq!(read_float(&0.5f32.to_be_bytes()).unwrap(), 0.5);
        assert!(read_float(&[0; 3]).is_err());
    }
}
