//! The fixed stage order.
//!
//! One ordered table carries both the sequence and each stage's phase, so
//! "what comes next" and "which phase is this" can never disagree.

use serde::Serialize;

use crate::engine::types::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageSpec {
    pub name: &'static str,
    pub phase: Phase,
}

pub const PIPELINE: &[StageSpec] = &[
    StageSpec { name: "project-planner", phase: Phase::Planning },
    StageSpec { name: "code-architect", phase: Phase::Architecture },
    StageSpec { name: "implementation-agent", phase: Phase::Implementation },
    StageSpec { name: "code-reviewer", phase: Phase::Review },
    StageSpec { name: "testing-agent", phase: Phase::Testing },
    StageSpec { name: "documentation-agent", phase: Phase::Documentation },
    StageSpec { name: "git-agent", phase: Phase::Git },
    StageSpec { name: "cleanup-agent", phase: Phase::Cleanup },
    StageSpec { name: "retrospective-agent", phase: Phase::Retrospective },
];

pub fn first_stage() -> &'static StageSpec {
    &PIPELINE[0]
}

pub fn last_stage() -> &'static StageSpec {
    &PIPELINE[PIPELINE.len() - 1]
}

pub fn position(name: &str) -> Option<usize> {
    PIPELINE.iter().position(|s| s.name == name)
}

pub fn stage(name: &str) -> Option<&'static StageSpec> {
    PIPELINE.iter().find(|s| s.name == name)
}

pub fn is_known(name: &str) -> bool {
    stage(name).is_some()
}

pub fn phase_for(name: &str) -> Option<Phase> {
    stage(name).map(|s| s.phase)
}

/// The stage after `name`; `None` for the last stage or an unknown name.
pub fn next_stage(name: &str) -> Option<&'static StageSpec> {
    position(name).and_then(|idx| PIPELINE.get(idx + 1))
}
