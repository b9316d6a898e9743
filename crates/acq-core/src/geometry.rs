//! Rectangles and region-of-interest constraints in sensor pixel coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AcqError, AcqResult};

/// Axis-aligned rectangle with a non-negative origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalRect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
}

impl NaturalRect {
    /// Construct a rectangle.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Origin is non-negative and the extent is non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.x >= 0 && self.y >= 0 && self.width > 0 && self.height > 0
    }

    /// One past the right edge.
    #[must_use]
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    /// One past the bottom edge.
    #[must_use]
    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    /// Whether `inner` lies entirely within this rectangle.
    #[must_use]
    pub fn contains(&self, inner: &NaturalRect) -> bool {
        inner.x >= self.x
            && inner.y >= self.y
            && inner.right() <= self.right()
            && inner.bottom() <= self.bottom()
    }

    /// Scale every coordinate down by `factor`, truncating.
    #[must_use]
    pub fn divided_by(&self, factor: i32) -> Self {
        let factor = factor.max(1);
        Self::new(
            self.x / factor,
            self.y / factor,
            self.width / factor,
            self.height / factor,
        )
    }

    /// Scale every coordinate up by `factor`.
    #[must_use]
    pub fn multiplied_by(&self, factor: i32) -> Self {
        Self::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }
}

impl fmt::Display for NaturalRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{};{}x{})", self.x, self.y, self.width, self.height)
    }
}

/// Grid a device imposes on ROI position and size.
///
/// Positions must be multiples of the position unit and sizes multiples of
/// the size unit, within `[0, max)` on each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoiConstraints {
    h_max: i32,
    v_max: i32,
    h_position_unit: i32,
    v_position_unit: i32,
    h_size_unit: i32,
    v_size_unit: i32,
}

impl RoiConstraints {
    /// Build constraints; every value must be positive.
    pub fn new(
        h_max: i32,
        v_max: i32,
        h_position_unit: i32,
        v_position_unit: i32,
        h_size_unit: i32,
        v_size_unit: i32,
    ) -> AcqResult<Self> {
        let all = [
            h_max,
            v_max,
            h_position_unit,
            v_position_unit,
            h_size_unit,
            v_size_unit,
        ];
        if all.iter().any(|&v| v <= 0) {
            return Err(AcqError::InvalidArgument(format!(
                "ROI constraints must be positive: {:?}",
                all
            )));
        }
        Ok(Self {
            h_max,
            v_max,
            h_position_unit,
            v_position_unit,
            h_size_unit,
            v_size_unit,
        })
    }

    /// Unconstrained grid over a `width` x `height` sensor.
    pub fn unit_grid(width: i32, height: i32) -> AcqResult<Self> {
        Self::new(width, height, 1, 1, 1, 1)
    }

    /// Horizontal extent.
    #[must_use]
    pub fn h_max(&self) -> i32 {
        self.h_max
    }

    /// Vertical extent.
    #[must_use]
    pub fn v_max(&self) -> i32 {
        self.v_max
    }

    /// Constraints expressed in binned pixels.
    pub fn binned(&self, factor: i32) -> AcqResult<Self> {
        if factor <= 0 {
            return Err(AcqError::InvalidArgument(format!(
                "binning factor must be positive, got {factor}"
            )));
        }
        Self::new(
            self.h_max / factor,
            self.v_max / factor,
            (self.h_position_unit / factor).max(1),
            (self.v_position_unit / factor).max(1),
            (self.h_size_unit / factor).max(1),
            (self.v_size_unit / factor).max(1),
        )
    }

    /// Whether `roi` is inside the extent and on the grid.
    #[must_use]
    pub fn validate(&self, roi: &NaturalRect) -> bool {
        validate_axis(self.h_max, self.h_position_unit, self.h_size_unit, roi.x, roi.width)
            && validate_axis(self.v_max, self.v_position_unit, self.v_size_unit, roi.y, roi.height)
    }

    /// Snap `rect` down onto the grid.
    ///
    /// The rectangle must have a non-negative origin and be at least one size
    /// unit in each direction.
    pub fn coerce_down(&self, rect: &NaturalRect) -> AcqResult<NaturalRect> {
        if rect.x < 0 || rect.y < 0 || rect.width < self.h_size_unit || rect.height < self.v_size_unit
        {
            return Err(AcqError::InvalidArgument(format!(
                "cannot coerce {rect} onto {self}"
            )));
        }
        Ok(NaturalRect::new(
            round_down(rect.x, self.h_position_unit),
            round_down(rect.y, self.v_position_unit),
            round_down(rect.width, self.h_size_unit),
            round_down(rect.height, self.v_size_unit),
        ))
    }

    /// Smallest allowed width not below `width`.
    #[must_use]
    pub fn round_up_width(&self, width: i32) -> i32 {
        round_up(width.max(0), self.h_size_unit)
    }

    /// Largest allowed width not above `width`.
    #[must_use]
    pub fn round_down_width(&self, width: i32) -> i32 {
        round_down(width.max(self.h_size_unit), self.h_size_unit)
    }

    /// Largest allowed height not above `height`.
    #[must_use]
    pub fn round_down_height(&self, height: i32) -> i32 {
        round_down(height.max(self.v_size_unit), self.v_size_unit)
    }

    /// Allowed left edges.
    #[must_use]
    pub fn allowed_left(&self) -> Vec<i32> {
        count_up(0, self.h_max - self.h_size_unit, self.h_position_unit)
    }

    /// Allowed top edges.
    #[must_use]
    pub fn allowed_top(&self) -> Vec<i32> {
        count_up(0, self.v_max - self.v_size_unit, self.v_position_unit)
    }

    /// Allowed widths.
    #[must_use]
    pub fn allowed_width(&self) -> Vec<i32> {
        count_up(self.h_size_unit, self.h_max, self.h_size_unit)
    }

    /// Allowed heights.
    #[must_use]
    pub fn allowed_height(&self) -> Vec<i32> {
        count_up(self.v_size_unit, self.v_max, self.v_size_unit)
    }
}

impl fmt::Display for RoiConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ROI constraints: max=({},{}) position unit=({},{}) size unit=({},{})",
            self.h_max,
            self.v_max,
            self.h_position_unit,
            self.v_position_unit,
            self.h_size_unit,
            self.v_size_unit
        )
    }
}

fn validate_axis(max: i32, position_unit: i32, size_unit: i32, position: i32, size: i32) -> bool {
    let in_range = position >= 0 && size > 0 && i64::from(position) + i64::from(size) <= i64::from(max);
    in_range && position % position_unit == 0 && size % size_unit == 0
}

fn round_down(x: i32, step: i32) -> i32 {
    x - x % step
}

fn round_up(x: i32, step: i32) -> i32 {
    match x % step {
        0 => x,
        rem => x + step - rem,
    }
}

fn count_up(min: i32, max: i32, step: i32) -> Vec<i32> {
    if max < min {
        return Vec::new();
    }
    (min..=max).step_by(step as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let outer = NaturalRect::new(0, 0, 100, 50);
        assert!(outer.contains(&NaturalRect::new(10, 10, 90, 40)));
        assert!(!outer.contains(&NaturalRect::new(10, 10, 91, 40)));
        assert!(!outer.contains(&NaturalRect::new(-1, 0, 10, 10)));
    }

    #[test]
    fn test_rect_validity() {
        assert!(NaturalRect::new(0, 0, 1, 1).is_valid());
        assert!(!NaturalRect::new(0, 0, 0, 1).is_valid());
        assert!(!NaturalRect::new(-2, 0, 4, 4).is_valid());
    }

    #[test]
    fn test_constraints_reject_non_positive() {
        assert!(RoiConstraints::new(0, 10, 1, 1, 1, 1).is_err());
        assert!(RoiConstraints::new(10, 10, 1, 1, 1, -1).is_err());
    }

    #[test]
    fn test_validate_on_grid() {
        let c = RoiConstraints::new(512, 512, 4, 2, 8, 8).unwrap();
        assert!(c.validate(&NaturalRect::new(4, 2, 64, 64)));
        assert!(!c.validate(&NaturalRect::new(3, 2, 64, 64)), "x off grid");
        assert!(!c.validate(&NaturalRect::new(4, 2, 60, 64)), "width off grid");
        assert!(!c.validate(&NaturalRect::new(456, 0, 64, 64)), "past right edge");
    }

    #[test]
    fn test_coerce_down() {
        let c = RoiConstraints::new(512, 512, 4, 4, 8, 8).unwrap();
        let snapped = c.coerce_down(&NaturalRect::new(5, 7, 70, 17)).unwrap();
        assert_eq!(snapped, NaturalRect::new(4, 4, 64, 16));
        assert!(c.coerce_down(&NaturalRect::new(0, 0, 4, 16)).is_err());
    }

    #[test]
    fn test_rounding() {
        let c = RoiConstraints::new(64, 64, 1, 1, 8, 4).unwrap();
        assert_eq!(c.round_up_width(9), 16);
        assert_eq!(c.round_up_width(16), 16);
        assert_eq!(c.round_down_width(15), 8);
        assert_eq!(c.round_down_height(7), 4);
    }

    #[test]
    fn test_allowed_lists() {
        let c = RoiConstraints::new(16, 8, 4, 4, 8, 4).unwrap();
        assert_eq!(c.allowed_left(), vec![0, 4, 8]);
        assert_eq!(c.allowed_top(), vec![0, 4]);
        assert_eq!(c.allowed_width(), vec![8, 16]);
        assert_eq!(c.allowed_height(), vec![4, 8]);
    }

    #[test]
    fn test_binned_constraints() {
        let c = RoiConstraints::new(512, 256, 1, 1, 1, 1).unwrap();
        let b = c.binned(2).unwrap();
        assert_eq!((b.h_max(), b.v_max()), (256, 128));
        assert!(c.binned(0).is_err());
    }
}
