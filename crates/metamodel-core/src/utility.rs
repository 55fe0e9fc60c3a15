//! Static utility field evaluated once per cell at build time.

use metamodel_index::GridPoint;
use serde::{Deserialize, Serialize};

/// Shape parameter of the inverse utility: a cell at exactly one radius from
/// an attractor scores `INVERSE_BETA`.
pub const INVERSE_BETA: f32 = 0.5;

/// Utility assigned inside a step attractor's radius.
pub const STEP_PEAK: f32 = 1000.0;

/// Point of interest raising the utility of nearby cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "((i64, i64), f32)", into = "((i64, i64), f32)")]
pub struct Attractor {
    pub center: GridPoint,
    pub radius: f32,
}

impl Attractor {
    #[must_use]
    pub const fn new(center: GridPoint, radius: f32) -> Self {
        Self { center, radius }
    }
}

impl From<((i64, i64), f32)> for Attractor {
    fn from(((x, y), radius): ((i64, i64), f32)) -> Self {
        Self::new(GridPoint::new(x, y), radius)
    }
}

impl From<Attractor> for ((i64, i64), f32) {
    fn from(attractor: Attractor) -> Self {
        ((attractor.center.x, attractor.center.y), attractor.radius)
    }
}

/// Shape of the contribution of a single attractor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UtilityKind {
    #[default]
    Uniform,
    Linear,
    Inverse,
    Step,
}

impl UtilityKind {
    /// Contribution of `attractor` to the cell at `point`. Never negative.
    #[must_use]
    pub fn evaluate(self, attractor: &Attractor, point: GridPoint) -> f32 {
        let distance = attractor.center.distance(&point);
        match self {
            Self::Uniform => 1.0,
            Self::Linear => (1.0 - distance / attractor.radius).max(0.0),
            Self::Inverse => inverse(distance, attractor.radius, 0.0),
            Self::Step => {
                if distance < attractor.radius {
                    STEP_PEAK
                } else {
                    inverse(distance, attractor.radius, attractor.radius)
                }
            }
        }
    }
}

fn inverse(distance: f32, radius: f32, offset: f32) -> f32 {
    // 1 / (1 + alpha * (d - offset)) with alpha = (1 - beta) / (beta * radius)
    1.0 / (1.0 + (1.0 - INVERSE_BETA) * (distance - offset) / (INVERSE_BETA * radius))
}

/// Sum of every attractor's contribution over the grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UtilityField {
    kind: UtilityKind,
    attractors: Vec<Attractor>,
}

impl UtilityField {
    #[must_use]
    pub fn new(kind: UtilityKind, attractors: Vec<Attractor>) -> Self {
        Self { kind, attractors }
    }

    #[must_use]
    pub fn kind(&self) -> UtilityKind {
        self.kind
    }

    #[must_use]
    pub fn attractors(&self) -> &[Attractor] {
        &self.attractors
    }

    /// Utility of the cell at `point`.
    ///
    /// A uniform field without attractors scores every cell 1 so that random
    /// moves still have something to weigh.
    #[must_use]
    pub fn utility_at(&self, point: GridPoint) -> f32 {
        if self.kind == UtilityKind::Uniform && self.attractors.is_empty() {
            return 1.0;
        }
        self.attractors
            .iter()
            .map(|attractor| self.kind.evaluate(attractor, point))
            .sum()
    }
}
