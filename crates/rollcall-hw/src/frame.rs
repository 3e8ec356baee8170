//! Grayscale frame type and raw-buffer conversion.

use std::time::Instant;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;
const DARK_PIXEL_LEVEL: u8 = 32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{format} buffer too short: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// A captured grayscale camera frame (`width * height` bytes).
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl Frame {
    /// True when nearly every pixel is black (lens covered, emitter off).
    pub fn is_dark(&self) -> bool {
        is_dark(&self.data, DARK_FRAME_RATIO)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Negotiated pixel layout of the raw capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, luma on even bytes.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    /// Convert a raw buffer of this format into 8-bit grayscale.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Grey => {
                check_len("GREY", buf, pixels)?;
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => {
                check_len("YUYV", buf, pixels * 2)?;
                Ok(buf[..pixels * 2].iter().step_by(2).copied().collect())
            }
            PixelFormat::Y16 => {
                check_len("Y16", buf, pixels * 2)?;
                // Keep the high byte of each little-endian sample.
                Ok(buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
            }
        }
    }
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// True if more than `ratio` of the pixels are near black. Empty input is dark.
pub fn is_dark(gray: &[u8], ratio: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_LEVEL).count();
    (dark as f32 / gray.len() as f32) > ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_takes_luma() {
        // 2x1: [Y0, U, Y1, V]
        let yuyv = [10, 128, 20, 128];
        assert_eq!(PixelFormat::Yuyv.to_grayscale(&yuyv, 2, 1).unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let y16 = [0xFF, 0x12, 0x00, 0x80];
        assert_eq!(PixelFormat::Y16.to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0x80]);
    }

    #[test]
    fn test_grey_truncates_padding() {
        let grey = [1, 2, 3, 4, 99, 99];
        assert_eq!(PixelFormat::Grey.to_grayscale(&grey, 2, 2).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = PixelFormat::Yuyv.to_grayscale(&[0u8; 6], 2, 2).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength { format: "YUYV", expected: 8, actual: 6 }
        ));
    }

    #[test]
    fn test_dark_detection() {
        assert!(is_dark(&[], DARK_FRAME_RATIO));
        assert!(is_dark(&[0u8; 100], DARK_FRAME_RATIO));
        assert!(!is_dark(&[128u8; 100], DARK_FRAME_RATIO));

        let mut mostly = vec![0u8; 100];
        mostly[..10].fill(200);
        assert!(!is_dark(&mostly, DARK_FRAME_RATIO));
    }
}
