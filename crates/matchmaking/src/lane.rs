use core::str::FromStr;

use serde::{Deserialize, Serialize};

use wager_core::{DomainError, DomainResult, MinorUnits};

use crate::keys;
use crate::ticket::Mode;

/// Inclusive skill band, written `"{min}-{max}"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EloBand {
    pub min: u32,
    pub max: u32,
}

impl EloBand {
    pub fn new(min: u32, max: u32) -> DomainResult<Self> {
        if min >= max {
            return Err(DomainError::validation(format!(
                "elo band min must be below max, got {min}-{max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn width(&self) -> u32 {
        self.max - self.min
    }

    /// Band of the same width shifted by `steps` widths; `None` below zero.
    pub fn shifted(&self, steps: i64) -> Option<EloBand> {
        let width = i64::from(self.width());
        let min = i64::from(self.min) + steps * width;
        let max = i64::from(self.max) + steps * width;
        let min = u32::try_from(min).ok()?;
        let max = u32::try_from(max).ok()?;
        Some(EloBand { min, max })
    }

    /// Neighbouring bands up to `steps` away, nearest first (below before above).
    pub fn adjacent(&self, steps: u32) -> Vec<EloBand> {
        let mut out = Vec::with_capacity(steps as usize * 2);
        for step in 1..=i64::from(steps) {
            if let Some(below) = self.shifted(-step) {
                out.push(below);
            }
            if let Some(above) = self.shifted(step) {
                out.push(above);
            }
        }
        out
    }
}

impl core::fmt::Display for EloBand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for EloBand {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| DomainError::validation(format!("elo band must be 'min-max', got '{s}'")))?;
        let min: u32 = min
            .trim()
            .parse()
            .map_err(|_| DomainError::validation(format!("invalid elo band lower bound in '{s}'")))?;
        let max: u32 = max
            .trim()
            .parse()
            .map_err(|_| DomainError::validation(format!("invalid elo band upper bound in '{s}'")))?;
        EloBand::new(min, max)
    }
}

/// Identity of one FIFO lane: tickets only pair within the same lane
/// (or, when widening, with lanes that differ only in skill band).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneKey {
    pub game_id: String,
    pub mode: Mode,
    pub region: String,
    /// Stake band: the exact stake in minor units.
    pub stake_minor: MinorUnits,
    pub elo_band: EloBand,
}

impl LaneKey {
    pub fn with_band(&self, elo_band: EloBand) -> LaneKey {
        LaneKey {
            elo_band,
            ..self.clone()
        }
    }

    /// Lanes reachable by widening `steps` bands, nearest first.
    pub fn adjacent(&self, steps: u32) -> Vec<LaneKey> {
        self.elo_band
            .adjacent(steps)
            .into_iter()
            .map(|band| self.with_band(band))
            .collect()
    }
}

impl core::fmt::Display for LaneKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&keys::lane_key(self))
    }
}

impl FromStr for LaneKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(keys::LANE_PREFIX)
            .ok_or_else(|| DomainError::validation(format!("not a lane key: '{s}'")))?;
        let parts: Vec<&str> = rest.split(':').collect();
        let [game_id, mode, region, stake, band] = parts.as_slice() else {
            return Err(DomainError::validation(format!("malformed lane key: '{s}'")));
        };
        let stake_minor: MinorUnits = stake
            .parse()
            .map_err(|_| DomainError::validation(format!("invalid stake in lane key '{s}'")))?;
        let key = LaneKey {
            game_id: keys::check_segment("gameId", game_id)?.to_string(),
            mode: mode.parse()?,
            region: keys::check_segment("region", region)?.to_string(),
            stake_minor,
            elo_band: band.parse()?,
        };
        Ok(key)
    }
}
