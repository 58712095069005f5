//! Distance-to-loss policies.
//!
//! A [`LossModel`] maps a Euclidean distance between two nodes to an integer
//! loss percentage. Implementations must be monotonic non-decreasing in
//! distance; the resolver and the `tc` synthesizer only ever see the
//! resulting percentages.

use serde::{Deserialize, Serialize};

pub trait LossModel: Send + Sync + std::fmt::Debug {
    /// Loss percentage (0..=100) at the given distance.
    fn loss_at(&self, distance: f64) -> u8;
}

/// One step of a [`StepLossTable`]: distances up to and including
/// `max_distance` see `loss` percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossBand {
    pub max_distance: f64,
    pub loss: u8,
}

/// Step function over distance bands, fully disconnected past the last band
/// by default.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLossTable {
    bands: Vec<LossBand>,
    beyond: u8,
}

impl Default for StepLossTable {
    fn default() -> Self {
        Self {
            bands: vec![
                LossBand {
                    max_distance: 100.0,
                    loss: 0,
                },
                LossBand {
                    max_distance: 200.0,
                    loss: 20,
                },
                LossBand {
                    max_distance: 300.0,
                    loss: 40,
                },
                LossBand {
                    max_distance: 400.0,
                    loss: 60,
                },
            ],
            beyond: 100,
        }
    }
}

impl StepLossTable {
    /// Builds a table, rejecting bands that would break monotonicity.
    pub fn new(bands: Vec<LossBand>, beyond: u8) -> Result<Self, String> {
        let mut prev: Option<LossBand> = None;
        for band in &bands {
            if band.loss > 100 {
                return Err(format!("loss {}% exceeds 100%", band.loss));
            }
            if band.max_distance.is_nan() {
                return Err("band max_distance is NaN".into());
            }
            if let Some(p) = prev {
                if band.max_distance <= p.max_distance {
                    return Err(format!(
                        "band distances must increase ({} after {})",
                        band.max_distance, p.max_distance
                    ));
                }
                if band.loss < p.loss {
                    return Err(format!(
                        "band loss must not decrease ({}% after {}%)",
                        band.loss, p.loss
                    ));
                }
            }
            prev = Some(*band);
        }
        if beyond > 100 {
            return Err(format!("beyond loss {}% exceeds 100%", beyond));
        }
        if let Some(last) = prev {
            if beyond < last.loss {
                return Err(format!(
                    "beyond loss {}% is below last band {}%",
                    beyond, last.loss
                ));
            }
        }
        Ok(Self { bands, beyond })
    }

    pub fn bands(&self) -> &[LossBand] {
        &self.bands
    }

    pub fn beyond(&self) -> u8 {
        self.beyond
    }
}

impl LossModel for StepLossTable {
    fn loss_at(&self, distance: f64) -> u8 {
        self.bands
            .iter()
            .find(|band| distance <= band.max_distance)
            .map(|band| band.loss)
            .unwrap_or(self.beyond)
    }
}
