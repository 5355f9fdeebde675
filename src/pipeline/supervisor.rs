//! Portfolio Risk Supervisor
//!
//! Audits a batch of proposed targets (one strategy, one as-of date) before
//! they are persisted. The audit is a pure transformation: rows are never
//! added, removed, or reordered; only `approved`, `weight`, and
//! `risk_flags` change.
//!
//! # Rule Order
//!
//! Rules run in a fixed order and later rules see the effects of earlier ones:
//!
//! 1. **R2** max weight per symbol (advisory: flagged, never clipped)
//! 2. **R5** score floor (rejects)
//! 3. **R3** max positions among still-approved rows, best scores kept
//! 4. **R1** gross exposure cap, scaling every still-approved weight

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

// =============================================================================
// TARGET
// =============================================================================

/// One proposed or finalized allocation for (strategy, as-of date, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub strategy_id: String,
    pub version: String,
    pub as_of: NaiveDate,
    pub symbol: String,
    /// Target allocation in [0, 1].
    pub weight: f64,
    /// Ranking signal.
    pub score: f64,
    /// Survived the supervisor audit.
    pub approved: bool,
    /// Rule violations and adjustments, in the order applied.
    pub risk_flags: Vec<String>,
}

impl Target {
    /// A freshly proposed, not yet audited row.
    pub fn proposed(
        strategy_id: &str,
        version: &str,
        as_of: NaiveDate,
        symbol: &str,
        weight: f64,
        score: f64,
    ) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            version: version.to_string(),
            as_of,
            symbol: symbol.to_string(),
            weight,
            score,
            approved: false,
            risk_flags: Vec::new(),
        }
    }
}

// =============================================================================
// RULES
// =============================================================================

/// Rule configuration, read from the strategy's `supervisor` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorRules {
    /// R1: cap on the sum of approved weights.
    pub gross_exposure_cap: f64,
    /// R2: advisory per-symbol weight limit.
    pub max_weight_per_symbol: f64,
    /// R3: cap on approved positions.
    pub max_positions: usize,
    /// R5: minimum score, when set.
    pub score_floor: Option<f64>,
}

impl Default for SupervisorRules {
    fn default() -> Self {
        Self {
            gross_exposure_cap: 1.0,
            max_weight_per_symbol: 0.15,
            max_positions: 10,
            score_floor: None,
        }
    }
}

/// A rule hit recorded on a target row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskFlag {
    /// R2
    WeightExceeded { actual: f64, limit: f64 },
    /// R5
    ScoreTooLow { score: f64, floor: f64 },
    /// R3
    MaxPositionsExceeded,
    /// R1
    Scaled(f64),
}

impl std::fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskFlag::WeightExceeded { actual, limit } => {
                write!(f, "R2:WeightExceeded({:.2}>{:.2})", actual, limit)
            }
            RiskFlag::ScoreTooLow { score, floor } => {
                write!(f, "R5:ScoreTooLow({:.2}<{:.2})", score, floor)
            }
            RiskFlag::MaxPositionsExceeded => write!(f, "R3:MaxPositionsExceeded"),
            RiskFlag::Scaled(factor) => write!(f, "R1:Scaled({:.2})", factor),
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct PortfolioSupervisor {
    rules: SupervisorRules,
}

impl PortfolioSupervisor {
    pub fn new(rules: SupervisorRules) -> Self {
        Self { rules }
    }

    pub fn builder() -> PortfolioSupervisorBuilder {
        PortfolioSupervisorBuilder::default()
    }

    pub fn rules(&self) -> &SupervisorRules {
        &self.rules
    }

    /// Apply R2, R5, R3, R1 in that order.
    pub fn audit(&self, proposed: Vec<Target>) -> Vec<Target> {
        let mut rows = proposed;
        if rows.is_empty() {
            return rows;
        }
        let rules = &self.rules;

        for row in rows.iter_mut() {
            row.approved = true;
            row.risk_flags.clear();
        }

        // R2, R5
        for row in rows.iter_mut() {
            if row.weight > rules.max_weight_per_symbol {
                row.risk_flags.push(
                    RiskFlag::WeightExceeded {
                        actual: row.weight,
                        limit: rules.max_weight_per_symbol,
                    }
                    .to_string(),
                );
            }
            if let Some(floor) = rules.score_floor {
                if row.score < floor {
                    row.approved = false;
                    row.risk_flags.push(
                        RiskFlag::ScoreTooLow {
                            score: row.score,
                            floor,
                        }
                        .to_string(),
                    );
                }
            }
        }

        // R3
        let mut approved: Vec<usize> = (0..rows.len()).filter(|&i| rows[i].approved).collect();
        if approved.len() > rules.max_positions {
            approved.sort_by(|&a, &b| {
                rows[b]
                    .score
                    .partial_cmp(&rows[a].score)
                    .unwrap_or(Ordering::Equal)
            });
            for &idx in &approved[rules.max_positions..] {
                rows[idx].approved = false;
                rows[idx]
                    .risk_flags
                    .push(RiskFlag::MaxPositionsExceeded.to_string());
            }
        }

        // R1
        let gross: f64 = rows.iter().filter(|r| r.approved).map(|r| r.weight).sum();
        if gross > rules.gross_exposure_cap {
            let factor = rules.gross_exposure_cap / gross;
            for row in rows.iter_mut().filter(|r| r.approved) {
                row.weight *= factor;
                row.risk_flags.push(RiskFlag::Scaled(factor).to_string());
            }
        }

        debug!(
            rows = rows.len(),
            approved = rows.iter().filter(|r| r.approved).count(),
            gross_before = gross,
            "supervisor audit complete"
        );
        rows
    }
}

/// Builder for PortfolioSupervisor.
#[derive(Debug, Default)]
pub struct PortfolioSupervisorBuilder {
    rules: SupervisorRules,
}

impl PortfolioSupervisorBuilder {
    pub fn rules(mut self, rules: SupervisorRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn gross_exposure_cap(mut self, cap: f64) -> Self {
        self.rules.gross_exposure_cap = cap;
        self
    }

    pub fn max_weight_per_symbol(mut self, limit: f64) -> Self {
        self.rules.max_weight_per_symbol = limit;
        self
    }

    pub fn max_positions(mut self, n: usize) -> Self {
        self.rules.max_positions = n;
        self
    }

    pub fn score_floor(mut self, floor: f64) -> Self {
        self.rules.score_floor = Some(floor);
        self
    }

    pub fn build(self) -> PortfolioSupervisor {
        PortfolioSupervisor::new(self.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn rows(entries: &[(&str, f64, f64)]) -> Vec<Target> {
        entries.iter()
            .map(|(sym, w, s)| Target::proposed("momo", "1", day(), sym, *w, *s))
            .collect()
    }

    #[test]
    fn test_score_floor_then_position_cap() {
        let supervisor = PortfolioSupervisor::builder()
            .max_positions(2)
            .score_floor(0.3)
            .build();
        let audited = supervisor.audit(rows(&[("A", 0.5, 0.9), ("B", 0.4, 0.8), ("C", 0.3, 0.2)]));

        let symbols: Vec<&str> = audited.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["A", "B", "C"]);
        assert!(audited[0].approved);
        assert!(audited[1].approved);
        assert!(!audited[2].approved);
        assert!((audited[0].weight - 0.5).abs() < 1e-12);
        assert!((audited[1].weight - 0.4).abs() < 1e-12);
        assert_eq!(
            audited[2].risk_flags,
            vec!["R2:WeightExceeded(0.30>0.15)", "R5:ScoreTooLow(0.20<0.30)"]
        );
        assert!(audited[0]
            .risk_flags
            .iter()
            .all(|f| !f.starts_with("R3") && !f.starts_with("R1")));
    }

    #[test]
    fn test_position_cap_keeps_best_scores() {
        let supervisor = PortfolioSupervisor::builder()
            .max_positions(2)
            .max_weight_per_symbol(1.0)
            .build();
        let audited = supervisor.audit(rows(&[("A", 0.1, 0.1), ("B", 0.1, 0.9), ("C", 0.1, 0.5)]));
        assert!(!audited[0].approved);
        assert_eq!(audited[0].risk_flags, vec!["R3:MaxPositionsExceeded"]);
        assert!(audited[1].approved);
        assert!(audited[2].approved);
    }

    #[test]
    fn test_gross_cap_scales_approved_rows_only() {
        let supervisor = PortfolioSupervisor::builder()
            .max_weight_per_symbol(1.0)
            .score_floor(0.0)
            .build();
        let audited = supervisor.audit(rows(&[("A", 0.8, 1.0), ("B", 0.7, 0.5), ("C", 0.5, -1.0)]));

        assert!((audited[0].weight - 0.8 / 1.5).abs() < 1e-12);
        assert!((audited[1].weight - 0.7 / 1.5).abs() < 1e-12);
        assert_eq!(audited[0].risk_flags, vec!["R1:Scaled(0.67)"]);
        assert!(!audited[2].approved);
        assert!((audited[2].weight - 0.5).abs() < 1e-12);
        let gross: f64 = audited.iter().filter(|t| t.approved).map(|t| t.weight).sum();
        assert!((gross - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weight_limit_is_advisory() {
        let audited = PortfolioSupervisor::default().audit(rows(&[("A", 0.6, 1.0)]));
        assert!(audited[0].approved);
        assert!((audited[0].weight - 0.6).abs() < 1e-12);
        assert_eq!(audited[0].risk_flags, vec!["R2:WeightExceeded(0.60>0.15)"]);
    }

    #[test]
    fn test_empty_batch_passes_through() {
        assert!(PortfolioSupervisor::default().audit(Vec::new()).is_empty());
    }

    #[test]
    fn test_audit_is_repeatable() {
        let supervisor = PortfolioSupervisor::builder()
            .max_positions(1)
            .gross_exposure_cap(0.5)
            .build();
        let input = rows(&[("A", 0.9, 0.3), ("B", 0.7, 0.6)]);
        let first = supervisor.audit(input.clone());
        assert_eq!(first, supervisor.audit(input));
        assert!(!first[0].approved);
        assert!((first[1].weight - 0.5).abs() < 1e-12);
    }
}
