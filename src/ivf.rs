//! IVF packet reader.
//!
//! IVF is the bare framing VP8 encoders emit: a 32-byte file header followed
//! by frames, each prefixed with its size and presentation timestamp.
//!
//! ## File header (32 bytes, little-endian)
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Signature "DKIF" |
//! | 4 | 2 | Version (0) |
//! | 6 | 2 | Header length (32) |
//! | 8 | 4 | FourCC ("VP80") |
//! | 12 | 2 | Width |
//! | 14 | 2 | Height |
//! | 16 | 4 | Timebase denominator |
//! | 20 | 4 | Timebase numerator |
//! | 24 | 4 | Frame count |
//! | 28 | 4 | Unused |
//!
//! ## Frame header (12 bytes)
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Payload size |
//! | 4 | 8 | Presentation timestamp |

use std::io::{ErrorKind, Read, Seek, Write};

use log::warn;

use crate::error::{IvfError, MuxError};
use crate::muxer::WebmMuxer;
use crate::sequencer::{Frame, Timebase};

pub const SIGNATURE: [u8; 4] = *b"DKIF";
pub const FOURCC_VP8: [u8; 4] = *b"VP80";
pub const FILE_HEADER_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase: Timebase,
    /// Frame count as declared by the writer; may be zero for streamed files
    pub frame_count: u32,
}

impl IvfHeader {
    pub fn parse(data: &[u8]) -> Result<Self, IvfError> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(IvfError::TruncatedHeader {
                expected: FILE_HEADER_SIZE,
                got: data.len(),
            });
        }

        let signature = [data[0], data[1], data[2], data[3]];
        if signature != SIGNATURE {
            return Err(IvfError::InvalidSignature(signature));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != 0 {
            return Err(IvfError::UnsupportedVersion(version));
        }

        let fourcc = [data[8], data[9], data[10], data[11]];
        if fourcc != FOURCC_VP8 {
            return Err(IvfError::UnsupportedCodec(fourcc));
        }

        let den = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
        let num = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);

        Ok(Self {
            fourcc,
            width: u16::from_le_bytes([data[12], data[13]]),
            height: u16::from_le_bytes([data[14], data[15]]),
            timebase: Timebase::new(num, den),
            frame_count: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut header = [0u8; FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&SIGNATURE);
        header[4..6].copy_from_slice(&0u16.to_le_bytes()); // version
        header[6..8].copy_from_slice(&(FILE_HEADER_SIZE as u16).to_le_bytes());
        header[8..12].copy_from_slice(&self.fourcc);
        header[12..14].copy_from_slice(&self.width.to_le_bytes());
        header[14..16].copy_from_slice(&self.height.to_le_bytes());
        header[16..20].copy_from_slice(&self.timebase.den.to_le_bytes());
        header[20..24].copy_from_slice(&self.timebase.num.to_le_bytes());
        header[24..28].copy_from_slice(&self.frame_count.to_le_bytes());
        header
    }
}

/// One compressed packet read from an IVF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfFrame {
    pub pts: i64,
    pub data: Vec<u8>,
}

impl IvfFrame {
    /// Borrow as a muxer frame, deriving flags from the VP8 frame tag.
    pub fn as_frame(&self) -> Frame<'_> {
        Frame::new(&self.data, self.pts, vp8_is_keyframe(&self.data))
            .invisible(vp8_is_invisible(&self.data))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.pts as u64).to_le_bytes());
        out.extend_from_slice(&self.data);
    }
}

/// VP8 frame tag: bit 0 of the first byte is 0 for keyframes.
pub fn vp8_is_keyframe(data: &[u8]) -> bool {
    data.first().is_some_and(|tag| tag & 0x01 == 0)
}

/// VP8 frame tag: bit 4 of the first byte is the show_frame flag.
pub fn vp8_is_invisible(data: &[u8]) -> bool {
    data.first().is_some_and(|tag| tag & 0x10 == 0)
}

/// Streams frames out of an IVF source.
pub struct IvfReader<R> {
    inner: R,
    header: IvfHeader,
    frames_read: u64,
}

impl<R: Read> IvfReader<R> {
    pub fn new(mut inner: R) -> Result<Self, IvfError> {
        let mut header = [0u8; FILE_HEADER_SIZE];
        let got = read_full(&mut inner, &mut header)?;
        let header = IvfHeader::parse(&header[..got])?;
        Ok(Self {
            inner,
            header,
            frames_read: 0,
        })
    }

    pub fn header(&self) -> &IvfHeader {
        &self.header
    }

    /// Next frame, or `None` at a clean end of file.
    pub fn next_frame(&mut self) -> Result<Option<IvfFrame>, IvfError> {
        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        let got = read_full(&mut self.inner, &mut frame_header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < FRAME_HEADER_SIZE {
            return Err(IvfError::TruncatedFrame {
                frame_index: self.frames_read,
                expected: FRAME_HEADER_SIZE,
                got,
            });
        }

        let size = u32::from_le_bytes([
            frame_header[0],
            frame_header[1],
            frame_header[2],
            frame_header[3],
        ]) as usize;
        let pts = u64::from_le_bytes([
            frame_header[4],
            frame_header[5],
            frame_header[6],
            frame_header[7],
            frame_header[8],
            frame_header[9],
            frame_header[10],
            frame_header[11],
        ]) as i64;

        // Grows with the bytes actually present, not the declared size
        let mut data = Vec::new();
        let got = (&mut self.inner).take(size as u64).read_to_end(&mut data)?;
        if got < size {
            return Err(IvfError::TruncatedFrame {
                frame_index: self.frames_read,
                expected: size,
                got,
            });
        }

        self.frames_read += 1;
        Ok(Some(IvfFrame { pts, data }))
    }
}

impl<R: Read> IvfReader<R> {
    /// Feed every remaining frame to `muxer`.
    ///
    /// A read error stops the transfer and is returned as `Ok(Some(_))`; frames
    /// submitted before it stay in the muxer. Muxer errors abort.
    pub fn submit_all<W: Write + Seek>(
        &mut self,
        muxer: &mut WebmMuxer<W>,
    ) -> Result<Option<IvfError>, MuxError> {
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => {
                    muxer.submit_frame(&frame.as_frame())?;
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(
                        "Stopped reading IVF input after {} frames: {}",
                        self.frames_read, e
                    );
                    return Ok(Some(e));
                }
            }
        }
    }
}

impl<R: Read> Iterator for IvfReader<R> {
    type Item = Result<IvfFrame, IvfError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Fill `buf` as far as the source allows; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, IvfError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
