//! Static phase definitions: fan-out, tolerance and progress weight per pipeline phase.

use crate::config::EngineConfig;
use crate::job::record::Phase;
use serde::{Deserialize, Serialize};

/// How many units a phase decomposes into for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    /// One unit covering the whole course
    Single,
    /// One unit per chapter
    PerChapter,
}

/// How many failed units a phase absorbs before the job fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TolerancePolicy {
    Zero,
    /// Fraction of the chapter count, rounded down
    Fraction(f64),
}

impl TolerancePolicy {
    pub fn allowed_failures(&self, chapter_count: usize) -> usize {
        match self {
            TolerancePolicy::Zero => 0,
            // epsilon keeps 5 * 0.2 at 1 rather than 0.999..
            TolerancePolicy::Fraction(fraction) => {
                (chapter_count as f64 * fraction + 1e-9).floor() as usize
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseDefinition {
    pub phase: Phase,
    pub fan_out: FanOut,
    pub tolerance: TolerancePolicy,
    /// Share of the 0-100 progress range
    pub weight: u8,
}

/// Ordered phase definitions for one engine configuration.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: [PhaseDefinition; 5],
}

impl PhasePlan {
    pub fn from_config(config: &EngineConfig) -> Self {
        let partial = TolerancePolicy::Fraction(config.degraded_tolerance_fraction);
        // A single assessment unit covers every chapter, so losing it loses them all
        let assessment_tolerance = match config.assessment_fanout {
            FanOut::PerChapter => partial,
            FanOut::Single => TolerancePolicy::Zero,
        };
        Self {
            phases: [
                PhaseDefinition {
                    phase: Phase::Structure,
                    fan_out: FanOut::Single,
                    tolerance: TolerancePolicy::Zero,
                    weight: 10,
                },
                PhaseDefinition {
                    phase: Phase::Content,
                    fan_out: FanOut::PerChapter,
                    tolerance: partial,
                    weight: 50,
                },
                PhaseDefinition {
                    phase: Phase::Assessment,
                    fan_out: config.assessment_fanout,
                    tolerance: assessment_tolerance,
                    weight: 15,
                },
                PhaseDefinition {
                    phase: Phase::Validation,
                    fan_out: config.validation_fanout,
                    tolerance: TolerancePolicy::Zero,
                    weight: 15,
                },
                PhaseDefinition {
                    phase: Phase::Export,
                    fan_out: FanOut::Single,
                    tolerance: TolerancePolicy::Zero,
                    weight: 10,
                },
            ],
        }
    }

    pub fn definition(&self, phase: Phase) -> Option<&PhaseDefinition> {
        phase.pipeline_index().map(|i| &self.phases[i])
    }

    /// Phase following `phase`, or `None` after Export.
    pub fn next(&self, phase: Phase) -> Option<Phase> {
        let index = phase.pipeline_index()?;
        self.phases.get(index + 1).map(|d| d.phase)
    }

    /// Progress already earned when `phase` starts.
    pub fn progress_base(&self, phase: Phase) -> u32 {
        match phase.pipeline_index() {
            Some(index) => self.phases[..index].iter().map(|d| d.weight as u32).sum(),
            None => 100,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseDefinition> {
        self.phases.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_rounds_down() {
        let policy = TolerancePolicy::Fraction(0.2);
        assert_eq!(policy.allowed_failures(5), 1);
        assert_eq!(policy.allowed_failures(4), 0);
        assert_eq!(policy.allowed_failures(10), 2);
        assert_eq!(TolerancePolicy::Zero.allowed_failures(50), 0);
    }

    #[test]
    fn plan_follows_pipeline_order() {
        let plan = PhasePlan::from_config(&EngineConfig::default());
        assert_eq!(plan.next(Phase::Structure), Some(Phase::Content));
        assert_eq!(plan.next(Phase::Validation), Some(Phase::Export));
        assert_eq!(plan.next(Phase::Export), None);
        assert_eq!(plan.progress_base(Phase::Structure), 0);
        assert_eq!(plan.progress_base(Phase::Content), 10);
        assert_eq!(plan.progress_base(Phase::Export), 90);
        assert_eq!(plan.iter().map(|d| d.weight as u32).sum::<u32>(), 100);
    }

    #[test]
    fn single_assessment_has_zero_tolerance() {
        let config = EngineConfig {
            assessment_fanout: FanOut::Single,
            ..EngineConfig::default()
        };
        let plan = PhasePlan::from_config(&config);
        let assessment = plan.definition(Phase::Assessment).unwrap();
        assert_eq!(assessment.tolerance, TolerancePolicy::Zero);
        let content = plan.definition(Phase::Content).unwrap();
        assert_eq!(content.fan_out, FanOut::PerChapter);
    }
}
