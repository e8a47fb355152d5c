//! Alpha thresholding of captured frames into 1-bit input masks.

use bytemuck::{Pod, Zeroable};

use crate::geometry::Size;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    LsbFirst,
    MsbFirst,
}

/// Server layout rules for depth-1 images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapFormat {
    /// Every scanline is padded to a multiple of this many bits.
    pub scanline_pad: u32,
    pub bit_order: ByteOrder,
}

impl Default for BitmapFormat {
    fn default() -> Self {
        Self {
            scanline_pad: 32,
            bit_order: ByteOrder::LsbFirst,
        }
    }
}

/// One 32-bit ARGB pixel as it arrives on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Argb32Pixel([u8; 4]);

impl Argb32Pixel {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Alpha is the most significant byte of the pixel value.
    pub fn alpha(self, order: ByteOrder) -> u8 {
        match order {
            ByteOrder::LsbFirst => self.0[3],
            ByteOrder::MsbFirst => self.0[0],
        }
    }
}

/// A captured 32-bpp window image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub size: Size,
    pub byte_order: ByteOrder,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(size: Size, byte_order: ByteOrder, data: Vec<u8>) -> Self {
        Self {
            size,
            byte_order,
            data,
        }
    }

    pub fn expected_len(size: Size) -> usize {
        size.area() * 4
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskError {
    /// The pixel buffer does not hold exactly `width * height` 32-bit pixels.
    LengthMismatch { expected: usize, actual: usize },
    /// The capture no longer matches the window size it is meant for.
    SizeMismatch { captured: Size, wanted: Size },
    Empty,
}

impl std::fmt::Display for MaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskError::LengthMismatch { expected, actual } => {
                write!(f, "pixel buffer holds {actual} bytes, expected {expected}")
            }
            MaskError::SizeMismatch { captured, wanted } => {
                write!(f, "captured {captured} but window is {wanted}")
            }
            MaskError::Empty => f.write_str("zero-sized frame"),
        }
    }
}

/// Depth-1 bitmap laid out the way the server expects it in `PutImage`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelMask {
    size: Size,
    stride: usize,
    bit_order: ByteOrder,
    bits: Vec<u8>,
    accepting: usize,
}

impl PixelMask {
    /// A mask where no pixel accepts input.
    pub fn empty(size: Size, format: BitmapFormat) -> Self {
        let stride = stride_for(size.width, format.scanline_pad);
        Self {
            size,
            stride,
            bit_order: format.bit_order,
            bits: vec![0; stride * size.height as usize],
            accepting: 0,
        }
    }

    /// Sets a bit for every pixel of `frame` whose alpha is non-zero.
    pub fn from_frame(frame: &Frame, wanted: Size, format: BitmapFormat) -> Result<Self, MaskError> {
        if frame.size != wanted {
            return Err(MaskError::SizeMismatch {
                captured: frame.size,
                wanted,
            });
        }
        if frame.size.is_empty() {
            return Err(MaskError::Empty);
        }
        let expected = Frame::expected_len(frame.size);
        if frame.data.len() != expected {
            return Err(MaskError::LengthMismatch {
                expected,
                actual: frame.data.len(),
            });
        }

        let pixels: &[Argb32Pixel] = bytemuck::cast_slice(frame.data.as_slice());
        let mut mask = Self::empty(frame.size, format);
        let width = frame.size.width as usize;

        for (y, row) in pixels.chunks_exact(width).enumerate() {
            for (x, pixel) in row.iter().enumerate() {
                if pixel.alpha(frame.byte_order) > 0 {
                    mask.set(x, y);
                }
            }
        }

        Ok(mask)
    }

    fn set(&mut self, x: usize, y: usize) {
        let byte = y * self.stride + x / 8;
        let bit = match self.bit_order {
            ByteOrder::LsbFirst => 1u8 << (x % 8),
            ByteOrder::MsbFirst => 0x80u8 >> (x % 8),
        };
        self.bits[byte] |= bit;
        self.accepting += 1;
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        if x >= self.size.width as usize || y >= self.size.height as usize {
            return false;
        }
        let byte = self.bits[y * self.stride + x / 8];
        let bit = match self.bit_order {
            ByteOrder::LsbFirst => 1u8 << (x % 8),
            ByteOrder::MsbFirst => 0x80u8 >> (x % 8),
        };
        byte & bit != 0
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pixels that accept input.
    pub fn accepting_pixels(&self) -> usize {
        self.accepting
    }

    pub fn is_fully_transparent(&self) -> bool {
        self.accepting == 0
    }

    /// Row slices of at most `max_bytes`, for splitting uploads that would
    /// exceed the maximum request length.
    pub fn row_chunks(&self, max_bytes: usize) -> impl Iterator<Item = (u32, u32, &[u8])> {
        let rows_per_chunk = (max_bytes / self.stride.max(1)).max(1);
        self.bits
            .chunks(rows_per_chunk * self.stride.max(1))
            .enumerate()
            .map(move |(index, chunk)| {
                let first_row = (index * rows_per_chunk) as u32;
                let rows = (chunk.len() / self.stride.max(1)) as u32;
                (first_row, rows, chunk)
            })
    }
}

fn stride_for(width: u32, scanline_pad: u32) -> usize {
    let pad = scanline_pad.max(8) as usize;
    let bits = width as usize;
    bits.div_ceil(pad) * pad / 8
}
