//! Progress computation.
//!
//! Each working phase owns a slice of 0-100 proportional to its weight. Within the current
//! phase, the slice fills with the fraction of the current round's main-track units that are
//! terminal. The job record keeps the highest value reported so far.

use crate::job::{Job, Phase, PhasePlan, Unit, UnitTrack};

pub fn compute_progress(plan: &PhasePlan, job: &Job, units: &[Unit]) -> u8 {
    match job.phase {
        Phase::Done => return 100,
        Phase::Degraded if job.export_ref.is_some() => return 100,
        Phase::Failed | Phase::Degraded => return job.progress_percent,
        _ => {}
    }

    let Some(definition) = plan.definition(job.phase) else {
        return job.progress_percent;
    };
    let base = plan.progress_base(job.phase);

    let (terminal, total) = units
        .iter()
        .filter(|u| {
            u.track == UnitTrack::Main && u.kind.phase() == job.phase && u.round == job.round
        })
        .fold((0u32, 0u32), |(terminal, total), u| {
            (terminal + u.is_terminal() as u32, total + 1)
        });

    let within = if total == 0 {
        0
    } else {
        definition.weight as u32 * terminal / total
    };
    // 100 is reserved for a finished job
    (base + within).min(99) as u8
}
