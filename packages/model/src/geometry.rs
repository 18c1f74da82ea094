//! Canvas geometry primitives.

use serde::{Deserialize, Serialize};

/// A point on the canvas, in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle (position + size).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Top-left corner.
    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.x + self.w && p.y >= self.y && p.y <= self.y + self.h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_contains() {
        let b = Bounds::new(10.0, 10.0, 20.0, 20.0);
        assert!(b.contains(Point::new(10.0, 10.0)));
        assert!(b.contains(Point::new(30.0, 30.0)));
        assert!(!b.contains(Point::new(31.0, 30.0)));
    }

    #[test]
    fn test_bounds_translated() {
        let b = Bounds::new(1.0, 2.0, 3.0, 4.0);
        let t = b.translated(9.0, 8.0);
        assert_eq!(t, Bounds::new(10.0, 10.0, 3.0, 4.0));
    }
}
