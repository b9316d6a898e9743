//! Test pattern generation for fake camera frames.

use acq_core::{Frame, VideoSettingsDynamic};

/// glibc LCG, for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fff_ffff
}

/// Fill `frame` in place with a diagnostic pattern for `frame_number`.
///
/// The frame must already have its geometry set. Layers, bottom to top:
/// - checkerboard background with per-frame noise
/// - horizontal gradient across the top tenth
/// - a bright hotspot orbiting the centre, one step per frame
/// - the low 16 bits of the frame number in the first pixel
///
/// Values are scaled to the frame's bit depth, then `gain`/`offset` from the
/// dynamic settings are applied and the result clamped to the depth.
pub fn fill_test_pattern(frame: &mut Frame, frame_number: u32, dynamic: &VideoSettingsDynamic) {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let bpp = frame.bits_per_pixel.clamp(1, 16);
    let max = (1u32 << bpp) - 1;
    let gain = 10f64.powf(f64::from(dynamic.analog_gain_db) / 20.0);
    let offset = f64::from(dynamic.analog_offset);

    let checker = (w.min(h) / 16).max(1);
    let gradient_rows = (h / 10).max(1);
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let orbit = w.min(h) as f64 / 5.0;
    let angle = (f64::from(frame_number) * 0.05) % std::f64::consts::TAU;
    let (hx, hy) = (cx + orbit * angle.cos(), cy + orbit * angle.sin());
    let sigma = (w.min(h) as f64 / 16.0).max(1.0);
    let frame_seed = u64::from(frame_number).wrapping_mul(2654435761);

    let bytes = frame.bytes_per_pixel() as usize;
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            // Work in 16-bit full scale, then shift down to the depth.
            let noise = (prng(frame_seed ^ idx as u64) & 0x3ff) as f64 - 512.0;
            let mut value = if ((x / checker) + (y / checker)) % 2 == 0 {
                16384.0
            } else {
                19660.0
            } + noise;
            if y < gradient_rows {
                value = (x as f64 * 65535.0) / w as f64;
            }
            let (dx, dy) = (x as f64 - hx, y as f64 - hy);
            value += 32768.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();

            let scaled = value.clamp(0.0, 65535.0) / 65535.0 * f64::from(max);
            let mut sample = (scaled * gain + offset).round().clamp(0.0, f64::from(max)) as u32;
            if idx == 0 {
                sample = frame_number & 0xffff & max;
            }
            write_sample(&mut frame.data, idx, bytes, sample);
        }
    }
}

fn write_sample(data: &mut [u8], idx: usize, bytes: usize, sample: u32) {
    match bytes {
        1 => {
            if let Some(b) = data.get_mut(idx) {
                *b = sample as u8;
            }
        }
        _ => {
            let start = idx * 2;
            if let Some(b) = data.get_mut(start..start + 2) {
                b.copy_from_slice(&(sample as u16).to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_fills_valid_frame() {
        let mut frame = Frame::allocate(64, 48, 14);
        fill_test_pattern(&mut frame, 3, &VideoSettingsDynamic::default());
        assert!(frame.is_valid());
        assert_eq!(frame.pixel(0, 0), Some(3));
        assert!((0..64).all(|x| frame.pixel(x, 10).unwrap() < (1 << 14)));
    }

    #[test]
    fn test_pattern_varies_with_frame_number() {
        let mut a = Frame::allocate(32, 32, 12);
        let mut b = Frame::allocate(32, 32, 12);
        fill_test_pattern(&mut a, 0, &VideoSettingsDynamic::default());
        fill_test_pattern(&mut b, 1, &VideoSettingsDynamic::default());
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_eight_bit_depth_uses_one_byte() {
        let mut frame = Frame::allocate(16, 16, 8);
        fill_test_pattern(&mut frame, 300, &VideoSettingsDynamic::default());
        assert_eq!(frame.data.len(), 256);
        assert_eq!(frame.pixel(0, 0), Some(300 & 0xff));
    }

    #[test]
    fn test_offset_raises_mean() {
        let mut plain = Frame::allocate(32, 32, 12);
        let mut offset = Frame::allocate(32, 32, 12);
        fill_test_pattern(&mut plain, 5, &VideoSettingsDynamic::default());
        fill_test_pattern(
            &mut offset,
            5,
            &VideoSettingsDynamic {
                analog_gain_db: 0.0,
                analog_offset: 100,
            },
        );
        assert!(offset.mean() > plain.mean());
    }
}
