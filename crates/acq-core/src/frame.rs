//! Captured image frames.

use serde::{Deserialize, Serialize};

/// Largest accepted frame dimension, in pixels.
pub const MAX_FRAME_DIMENSION: u32 = 4096;

/// Largest accepted bit depth.
pub const MAX_BITS_PER_PIXEL: u32 = 30;

/// Bytes needed to store one sample of `bits` bits.
#[must_use]
pub const fn bits_to_bytes(bits: u32) -> u32 {
    bits.div_ceil(8)
}

/// One captured image.
///
/// Frames live in ring buffer slots and are refilled in place by the hardware
/// layer, so the payload vector keeps its allocation across captures.
///
/// # Storage
/// Each pixel occupies `bits_to_bytes(bits_per_pixel)` little-endian bytes,
/// row-major. A frame is valid when the declared size, the payload length and
/// the geometry agree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Device error code for this capture; zero when the capture succeeded.
    pub error_code: u32,
    /// Significant bits per pixel.
    pub bits_per_pixel: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Sequence number assigned by the device, incremented per capture.
    pub frame_number: u32,
    /// Device timestamp in milliseconds.
    pub timestamp: u32,
    /// Declared payload size in bytes.
    pub data_size_bytes: u32,
    /// Raw pixel bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Allocate a zeroed frame with consistent geometry.
    #[must_use]
    pub fn allocate(width: u32, height: u32, bits_per_pixel: u32) -> Self {
        let mut frame = Self::default();
        frame.reshape(width, height, bits_per_pixel);
        frame
    }

    /// Create a 16-bit frame from pixel values.
    #[must_use]
    pub fn from_u16(width: u32, height: u32, bits_per_pixel: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self {
            bits_per_pixel,
            width,
            height,
            data_size_bytes: data.len() as u32,
            data,
            ..Self::default()
        }
    }

    /// Resize the payload for new geometry, reusing the allocation.
    pub fn reshape(&mut self, width: u32, height: u32, bits_per_pixel: u32) {
        let size = Self::expected_size(width, height, bits_per_pixel);
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.data_size_bytes = u32::try_from(size).unwrap_or(u32::MAX);
        self.data.resize(size as usize, 0);
    }

    /// Payload size implied by the geometry.
    #[must_use]
    pub fn expected_size(width: u32, height: u32, bits_per_pixel: u32) -> u64 {
        u64::from(bits_to_bytes(bits_per_pixel)) * u64::from(width) * u64::from(height)
    }

    /// Bytes per stored pixel.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> u32 {
        bits_to_bytes(self.bits_per_pixel)
    }

    /// Whether geometry, declared size and payload agree.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !(1..=MAX_BITS_PER_PIXEL).contains(&self.bits_per_pixel) {
            return false;
        }
        if !(1..=MAX_FRAME_DIMENSION).contains(&self.width)
            || !(1..=MAX_FRAME_DIMENSION).contains(&self.height)
        {
            return false;
        }
        let expected = Self::expected_size(self.width, self.height, self.bits_per_pixel);
        expected == u64::from(self.data_size_bytes) && expected == self.data.len() as u64
    }

    /// Pixel value at (x, y), for depths stored in one or two bytes.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize) + x as usize;
        match self.bytes_per_pixel() {
            1 => self.data.get(idx).map(|&v| u32::from(v)),
            2 => {
                let start = idx * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
            }
            _ => None,
        }
    }

    /// Mean pixel value, for depths stored in one or two bytes.
    #[must_use]
    pub fn mean(&self) -> f64 {
        let (sum, count) = match self.bytes_per_pixel() {
            1 => (
                self.data.iter().map(|&v| u64::from(v)).sum::<u64>(),
                self.data.len(),
            ),
            2 => (
                self.data
                    .chunks_exact(2)
                    .map(|c| u64::from(u16::from_le_bytes([c[0], c[1]])))
                    .sum::<u64>(),
                self.data.len() / 2,
            ),
            _ => return 0.0,
        };
        if count == 0 {
            return 0.0;
        }
        sum as f64 / count as f64
    }

    /// Copy another frame into this one, reusing the payload allocation.
    pub fn copy_from(&mut self, other: &Frame) {
        self.error_code = other.error_code;
        self.bits_per_pixel = other.bits_per_pixel;
        self.width = other.width;
        self.height = other.height;
        self.frame_number = other.frame_number;
        self.timestamp = other.timestamp;
        self.data_size_bytes = other.data_size_bytes;
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_to_bytes_rounds_up() {
        assert_eq!(bits_to_bytes(1), 1);
        assert_eq!(bits_to_bytes(8), 1);
        assert_eq!(bits_to_bytes(12), 2);
        assert_eq!(bits_to_bytes(14), 2);
        assert_eq!(bits_to_bytes(17), 3);
    }

    #[test]
    fn test_allocated_frame_is_valid() {
        let frame = Frame::allocate(512, 256, 14);
        assert!(frame.is_valid());
        assert_eq!(frame.data.len(), 512 * 256 * 2);
    }

    #[test]
    fn test_validity_rules() {
        let mut frame = Frame::allocate(16, 16, 8);
        frame.data.pop();
        assert!(!frame.is_valid(), "payload shorter than declared");

        let mut frame = Frame::allocate(16, 16, 8);
        frame.data_size_bytes += 1;
        assert!(!frame.is_valid(), "declared size mismatch");

        assert!(!Frame::allocate(4097, 1, 8).is_valid());
        assert!(!Frame::allocate(0, 16, 8).is_valid());
        assert!(!Frame::allocate(16, 16, 31).is_valid());
        assert!(!Frame::default().is_valid());
    }

    #[test]
    fn test_pixel_access_16bit() {
        let frame = Frame::from_u16(2, 2, 12, &[1, 2, 3, 4095]);
        assert_eq!(frame.pixel(0, 0), Some(1));
        assert_eq!(frame.pixel(1, 1), Some(4095));
        assert_eq!(frame.pixel(2, 0), None);
        assert!((frame.mean() - 1025.25).abs() < 1e-9);
    }

    #[test]
    fn test_reshape_reuses_allocation() {
        let mut frame = Frame::allocate(64, 64, 16);
        let capacity = frame.data.capacity();
        frame.reshape(32, 32, 16);
        assert!(frame.is_valid());
        assert_eq!(frame.data.capacity(), capacity);
    }

    #[test]
    fn test_copy_from() {
        let mut src = Frame::allocate(4, 4, 8);
        src.frame_number = 9;
        src.data[3] = 200;
        let mut dst = Frame::default();
        dst.copy_from(&src);
        assert_eq!(dst, src);
    }
}
