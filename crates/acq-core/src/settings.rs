//! Camera description and acquisition settings.
//!
//! These are plain values: they are copied across the RPC boundary by
//! serialization, so a client never holds a reference into server state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geometry::NaturalRect;

/// On-sensor pixel binning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinningMode {
    /// No binning.
    #[default]
    Binning1x1,
    /// 2x2 binning.
    Binning2x2,
    /// 4x4 binning.
    Binning4x4,
    /// 8x8 binning.
    Binning8x8,
}

impl BinningMode {
    /// Every binning mode, smallest first.
    pub const ALL: [BinningMode; 4] = [
        BinningMode::Binning1x1,
        BinningMode::Binning2x2,
        BinningMode::Binning4x4,
        BinningMode::Binning8x8,
    ];

    /// Pixels combined along each axis.
    #[must_use]
    pub const fn factor(self) -> i32 {
        match self {
            BinningMode::Binning1x1 => 1,
            BinningMode::Binning2x2 => 2,
            BinningMode::Binning4x4 => 4,
            BinningMode::Binning8x8 => 8,
        }
    }

    /// Mode for a per-axis factor.
    #[must_use]
    pub fn from_factor(factor: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.factor() == factor)
    }
}

impl fmt::Display for BinningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factor = self.factor();
        write!(f, "{factor}x{factor}")
    }
}

/// How exposures are triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TriggerMode {
    /// Free-running at the device's own rate.
    #[default]
    Freerun = 0,
    /// One exposure per software trigger.
    Software = 1,
    /// Hardware trigger on a rising edge.
    HardwareEdgeHigh = 2,
    /// Hardware trigger on a falling edge.
    HardwareEdgeLow = 4,
}

/// Device description that does not change while the device is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraAttributes {
    /// Supported binning modes.
    pub supported_binning: Vec<BinningMode>,
    /// Sensor width in pixels.
    pub full_width: i32,
    /// Sensor height in pixels.
    pub full_height: i32,
    /// Digitizer bit depth.
    pub bit_depth: i32,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
}

impl CameraAttributes {
    /// Whether the device supports `binning`.
    #[must_use]
    pub fn supports(&self, binning: BinningMode) -> bool {
        self.supported_binning.contains(&binning)
    }

    /// The whole sensor as a rectangle.
    #[must_use]
    pub fn sensor_rect(&self) -> NaturalRect {
        NaturalRect::new(0, 0, self.full_width, self.full_height)
    }
}

impl fmt::Display for CameraAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binning: Vec<String> = self.supported_binning.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} {} Area={}x{}, {} bpp, supports [{}]",
            self.model,
            self.serial_number,
            self.full_width,
            self.full_height,
            self.bit_depth,
            binning.join("|")
        )
    }
}

/// Settings that may only change while the device is not streaming.
///
/// The ROI is expressed in binned pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettingsStatic {
    /// Binning mode.
    pub binning: BinningMode,
    /// Region of interest.
    pub roi: NaturalRect,
    /// Trigger mode.
    pub trigger: TriggerMode,
}

impl fmt::Display for VideoSettingsStatic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.roi, self.binning, self.trigger)
    }
}

/// Settings that may change while streaming; applied between frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoSettingsDynamic {
    /// Analog gain before digitization, in dB. Zero is the factory default.
    pub analog_gain_db: f32,
    /// Analog offset before digitization. Zero is the factory default.
    pub analog_offset: i32,
}

/// Static settings covering the whole sensor at `binning`.
#[must_use]
pub fn full_frame_settings(attributes: &CameraAttributes, binning: BinningMode) -> VideoSettingsStatic {
    let factor = binning.factor();
    VideoSettingsStatic {
        binning,
        roi: NaturalRect::new(
            0,
            0,
            attributes.full_width / factor,
            attributes.full_height / factor,
        ),
        trigger: TriggerMode::Freerun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes() -> CameraAttributes {
        CameraAttributes {
            supported_binning: vec![BinningMode::Binning1x1, BinningMode::Binning2x2],
            full_width: 640,
            full_height: 480,
            bit_depth: 12,
            model: "Model-X".into(),
            serial_number: "SN42".into(),
        }
    }

    #[test]
    fn test_attributes_display() {
        assert_eq!(
            attributes().to_string(),
            "Model-X SN42 Area=640x480, 12 bpp, supports [1x1|2x2]"
        );
    }

    #[test]
    fn test_full_frame_settings_scale_with_binning() {
        let settings = full_frame_settings(&attributes(), BinningMode::Binning2x2);
        assert_eq!(settings.roi, NaturalRect::new(0, 0, 320, 240));
        assert_eq!(settings.trigger, TriggerMode::Freerun);
    }

    #[test]
    fn test_binning_factor_round_trip() {
        for mode in BinningMode::ALL {
            assert_eq!(BinningMode::from_factor(mode.factor()), Some(mode));
        }
        assert_eq!(BinningMode::from_factor(3), None);
    }

    #[test]
    fn test_static_defaults() {
        let settings = VideoSettingsStatic::default();
        assert_eq!(settings.binning, BinningMode::Binning1x1);
        assert_eq!(settings.trigger, TriggerMode::Freerun);
    }
}
