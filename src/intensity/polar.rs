//! Rectangular to polar conversion of normalized intensities.
//!
//! R is the sum of both channels (not the Euclidean norm) and theta is the
//! quadrant-correct angle rescaled from radians to [-1, 1] by `2/π`, so
//! theta = 0 is all signal in x and theta = 1 is all signal in y.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Normalized two-channel intensity of one marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawIntensity {
    pub x: f64,
    pub y: f64,
}

impl RawIntensity {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for RawIntensity {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Polar form of a [`RawIntensity`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolarIntensity {
    /// Both channels are zero; R and theta are undefined.
    NoSignal,
    Signal { r: f64, theta: f64 },
}

impl PolarIntensity {
    pub fn r(&self) -> Option<f64> {
        match self {
            PolarIntensity::NoSignal => None,
            PolarIntensity::Signal { r, .. } => Some(*r),
        }
    }

    pub fn theta(&self) -> Option<f64> {
        match self {
            PolarIntensity::NoSignal => None,
            PolarIntensity::Signal { theta, .. } => Some(*theta),
        }
    }

    pub fn is_no_signal(&self) -> bool {
        matches!(self, PolarIntensity::NoSignal)
    }
}

/// Converts one intensity pair.
pub fn to_polar(raw: RawIntensity) -> PolarIntensity {
    let RawIntensity { x, y } = raw;
    if x == 0.0 && y == 0.0 {
        return PolarIntensity::NoSignal;
    }
    PolarIntensity::Signal {
        r: x + y,
        theta: y.atan2(x) * 2.0 / PI,
    }
}

/// Converts a whole sample. `output[i]` corresponds to `raw[i]`.
pub fn transform(raw: &[RawIntensity]) -> Vec<PolarIntensity> {
    raw.iter().copied().map(to_polar).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(p: PolarIntensity) -> (f64, f64) {
        match p {
            PolarIntensity::Signal { r, theta } => (r, theta),
            PolarIntensity::NoSignal => panic!("expected a signal"),
        }
    }

    #[test]
    fn test_origin_is_no_signal() {
        assert_eq!(to_polar(RawIntensity::new(0.0, 0.0)), PolarIntensity::NoSignal);
        assert_eq!(to_polar(RawIntensity::new(-0.0, 0.0)), PolarIntensity::NoSignal);

        let p = to_polar(RawIntensity::new(0.0, 0.0));
        assert!(p.r().is_none());
        assert!(p.theta().is_none());
    }

    #[test]
    fn test_axis_angles() {
        let (r, theta) = signal(to_polar(RawIntensity::new(0.0, 5.0)));
        assert_eq!(r, 5.0);
        assert!((theta - 1.0).abs() < 1e-12);

        let (r, theta) = signal(to_polar(RawIntensity::new(0.0, -2.0)));
        assert_eq!(r, -2.0);
        assert!((theta + 1.0).abs() < 1e-12);

        let (r, theta) = signal(to_polar(RawIntensity::new(3.0, 0.0)));
        assert_eq!(r, 3.0);
        assert_eq!(theta, 0.0);
    }

    #[test]
    fn test_diagonal_is_half() {
        let (r, theta) = signal(to_polar(RawIntensity::new(1.0, 1.0)));
        assert_eq!(r, 2.0);
        assert!((theta - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_r_is_channel_sum() {
        let (r, _) = signal(to_polar(RawIntensity::new(0.125, 1.75)));
        assert_eq!(r, 0.125 + 1.75);
    }

    #[test]
    fn test_theta_bounded_for_non_negative_x() {
        let samples = [
            (1.0, 0.0),
            (0.3, 0.9),
            (2.5, 0.01),
            (0.5, -1.0),
            (0.0, -0.5),
            (0.0, 1e-9),
            (1e6, 3e5),
        ];
        for (x, y) in samples {
            let (_, theta) = signal(to_polar(RawIntensity::new(x, y)));
            assert!((-1.0..=1.0).contains(&theta), "theta {} out of range", theta);
        }
    }

    #[test]
    fn test_transform_preserves_order() {
        let raw: Vec<RawIntensity> = [(0.0, 0.0), (1.0, 1.0), (0.0, 5.0), (3.0, 0.0)]
            .into_iter()
            .map(RawIntensity::from)
            .collect();

        let polar = transform(&raw);
        assert_eq!(polar.len(), 4);
        assert!(polar[0].is_no_signal());
        assert_eq!(polar[1].r(), Some(2.0));
        assert_eq!(polar[2].r(), Some(5.0));
        assert_eq!(polar[3].r(), Some(3.0));
        assert_eq!(polar[3].theta(), Some(0.0));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let raw: Vec<RawIntensity> = (0..100)
            .map(|i| RawIntensity::new(i as f64 * 0.37, (100 - i) as f64 * 0.11))
            .collect();
        assert_eq!(transform(&raw), transform(&raw));
    }

    #[test]
    fn test_transform_empty() {
        assert!(transform(&[]).is_empty());
    }
}
