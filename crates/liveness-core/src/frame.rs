//! Image frames and their wire encoding.
//!
//! A frame travels as a fixed 9-byte header followed by the raw pixels:
//!
//! ```text
//! ┌────────────┬─────────────┬───────────┬──────────────────────────────┐
//! │ width: u32 │ height: u32 │ format:u8 │ pixels (width*height*bpp)    │
//! └────────────┴─────────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! Integers are big-endian, matching the network byte order used by the
//! native detector server. Pixels are sent uncompressed so that the round
//! trip is pixel-exact.

use std::fmt;

use crate::error::CodecError;

/// Size of the encoded frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Pixel layout of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit blue/green/red, the detector's native layout.
    Bgr8,
    Rgb8,
    Bgra8,
    Rgba8,
    Gray8,
}

impl PixelFormat {
    /// Number of bytes used by a single pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    /// Wire identifier for this format.
    pub const fn as_u8(self) -> u8 {
        match self {
            PixelFormat::Bgr8 => 0,
            PixelFormat::Rgb8 => 1,
            PixelFormat::Bgra8 => 2,
            PixelFormat::Rgba8 => 3,
            PixelFormat::Gray8 => 4,
        }
    }

    /// Parses a wire identifier.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::Bgr8),
            1 => Some(PixelFormat::Rgb8),
            2 => Some(PixelFormat::Bgra8),
            3 => Some(PixelFormat::Rgba8),
            4 => Some(PixelFormat::Gray8),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Gray8 => "gray8",
        };
        f.write_str(name)
    }
}

/// A single image: contiguous pixel bytes in row-major order.
///
/// The payload length always equals `width * height * bytes_per_pixel`;
/// constructors reject anything else.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Creates a frame, validating that `data` matches the dimensions.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, CodecError> {
        let expected = expected_len(width, height, format)?;
        if data.len() != expected {
            return Err(CodecError::malformed(format!(
                "{width}x{height} {format} frame needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Creates a frame with every byte set to `value`.
    pub fn filled(
        width: u32,
        height: u32,
        format: PixelFormat,
        value: u8,
    ) -> Result<Self, CodecError> {
        let len = expected_len(width, height, format)?;
        Self::new(width, height, format, vec![value; len])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Size of this frame once encoded.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.data.len()
    }
}

impl fmt::Debug for Frame {
    // Pixel data is elided; frames are routinely megabytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .finish()
    }
}

fn expected_len(width: u32, height: u32, format: PixelFormat) -> Result<usize, CodecError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| CodecError::malformed(format!("{width}x{height} frame is too large")))
}

/// Serializes a frame to its wire representation.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.encoded_len());
    encode_frame_into(frame, &mut out);
    out
}

/// Appends the wire representation of `frame` to `out`.
pub fn encode_frame_into(frame: &Frame, out: &mut Vec<u8>) {
    out.reserve(frame.encoded_len());
    out.extend_from_slice(&frame.width.to_be_bytes());
    out.extend_from_slice(&frame.height.to_be_bytes());
    out.push(frame.format.as_u8());
    out.extend_from_slice(&frame.data);
}

/// Parses a frame previously produced by [`encode_frame`].
///
/// The whole of `bytes` must be consumed; trailing data is rejected.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let header = bytes.get(..FRAME_HEADER_SIZE).ok_or_else(|| {
        CodecError::malformed(format!(
            "header needs {FRAME_HEADER_SIZE} bytes, got {}",
            bytes.len()
        ))
    })?;
    let pixels = bytes.get(FRAME_HEADER_SIZE..).unwrap_or_default();

    let width = read_u32(header, 0)?;
    let height = read_u32(header, 4)?;
    let format_id = header
        .get(8)
        .copied()
        .ok_or_else(|| CodecError::malformed("missing pixel format"))?;
    let format = PixelFormat::from_u8(format_id)
        .ok_or_else(|| CodecError::malformed(format!("unknown pixel format {format_id}")))?;

    Frame::new(width, height, format, pixels.to_vec())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, CodecError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| CodecError::malformed("truncated header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, format: PixelFormat) -> Frame {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        Frame::new(width, height, format, data).unwrap()
    }

    #[test]
    fn test_round_trip_is_pixel_exact() {
        for format in [
            PixelFormat::Bgr8,
            PixelFormat::Rgb8,
            PixelFormat::Bgra8,
            PixelFormat::Rgba8,
            PixelFormat::Gray8,
        ] {
            let frame = gradient(7, 5, format);
            let decoded = decode_frame(&encode_frame(&frame)).unwrap();
            assert_eq!(decoded, frame, "round trip failed for {format}");
        }
    }

    #[test]
    fn test_empty_frame_round_trip() {
        let frame = Frame::new(0, 0, PixelFormat::Bgr8, Vec::new()).unwrap();
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_encoding_layout() {
        let frame = Frame::filled(2, 1, PixelFormat::Gray8, 0xAB).unwrap();
        assert_eq!(
            encode_frame(&frame),
            vec![0, 0, 0, 2, 0, 0, 0, 1, 4, 0xAB, 0xAB]
        );
    }

    #[test]
    fn test_new_rejects_length_mismatch() {
        let result = Frame::new(2, 2, PixelFormat::Rgb8, vec![0; 11]);
        assert!(matches!(result, Err(CodecError::MalformedPayload { .. })));
    }

    #[test]
    fn test_decode_short_header() {
        let err = decode_frame(&[0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("header"));
    }

    #[test]
    fn test_decode_unknown_format() {
        let mut bytes = encode_frame(&Frame::filled(1, 1, PixelFormat::Gray8, 1).unwrap());
        bytes[8] = 99;
        let err = decode_frame(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown pixel format"));
    }

    #[test]
    fn test_decode_truncated_pixels() {
        let mut bytes = encode_frame(&gradient(4, 4, PixelFormat::Bgr8));
        bytes.truncate(bytes.len() - 1);
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode_frame(&gradient(2, 2, PixelFormat::Gray8));
        bytes.push(0);
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn test_decode_huge_dimensions_does_not_panic() {
        let mut bytes = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 2];
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn test_debug_elides_pixels() {
        let frame = gradient(3, 3, PixelFormat::Rgb8);
        let debug = format!("{frame:?}");
        assert!(debug.contains("len: 27"));
        assert!(!debug.contains("data"));
    }

    #[test]
    fn test_pixel_format_ids_round_trip() {
        for id in 0..=4 {
            let format = PixelFormat::from_u8(id).unwrap();
            assert_eq!(format.as_u8(), id);
        }
        assert!(PixelFormat::from_u8(5).is_none());
    }
}
