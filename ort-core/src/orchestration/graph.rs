//! Static description of stage ordering and eligibility.
//!
//! Eligibility is always recomputed from the current job statuses of a run,
//! never from an expected message sequence, so duplicate and reordered
//! messages converge to the same decisions.

use std::collections::{BTreeMap, BTreeSet};

use ort_model::{
    JobConfigurations, JobStatus, OrtRun, OrtRunStatus, Stage, WorkerJob,
};

/// Scheduling rules of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleInfo {
    /// Stage the rules apply to.
    pub stage: Stage,
    /// Must be terminal before this stage starts.
    pub depends_on: &'static [Stage],
    /// Must not be pending when this stage starts. Unlike `depends_on`,
    /// a stage that will never run does not block.
    pub runs_after: &'static [Stage],
    /// Run even when an earlier job of the run failed.
    pub run_after_failure: bool,
}

impl ScheduleInfo {
    fn predecessors(&self) -> impl Iterator<Item = Stage> + '_ {
        self.depends_on.iter().chain(self.runs_after).copied()
    }
}

const SCHEDULE: [ScheduleInfo; 6] = [
    ScheduleInfo {
        stage: Stage::Analyzer,
        depends_on: &[],
        runs_after: &[],
        run_after_failure: false,
    },
    ScheduleInfo {
        stage: Stage::Advisor,
        depends_on: &[Stage::Analyzer],
        runs_after: &[],
        run_after_failure: false,
    },
    ScheduleInfo {
        stage: Stage::Scanner,
        depends_on: &[Stage::Analyzer],
        runs_after: &[],
        run_after_failure: false,
    },
    ScheduleInfo {
        stage: Stage::Evaluator,
        depends_on: &[Stage::Analyzer],
        runs_after: &[Stage::Advisor, Stage::Scanner],
        run_after_failure: false,
    },
    ScheduleInfo {
        stage: Stage::Reporter,
        depends_on: &[],
        runs_after: &[Stage::Evaluator],
        run_after_failure: true,
    },
    ScheduleInfo {
        stage: Stage::Notifier,
        depends_on: &[Stage::Reporter],
        runs_after: &[],
        run_after_failure: true,
    },
];

/// Snapshot of a run's progress: which stages are enabled and the status of
/// every job created so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    enabled: BTreeSet<Stage>,
    jobs: BTreeMap<Stage, JobStatus>,
    run_failed: bool,
}

impl RunProgress {
    /// Progress of `run` given all of its jobs.
    pub fn new(run: &OrtRun, jobs: &[WorkerJob]) -> Self {
        Self {
            enabled: run.job_configs.enabled_stages().into_iter().collect(),
            jobs: jobs.iter().map(|job| (job.stage, job.status)).collect(),
            run_failed: run.status == OrtRunStatus::Failed,
        }
    }

    /// Progress of a run that has no jobs yet.
    pub fn empty(configs: &JobConfigurations) -> Self {
        Self {
            enabled: configs.enabled_stages().into_iter().collect(),
            jobs: BTreeMap::new(),
            run_failed: false,
        }
    }

    /// Records the status of one more job.
    pub fn with_job(mut self, stage: Stage, status: JobStatus) -> Self {
        self.jobs.insert(stage, status);
        self
    }

    /// The run has a configuration for the stage.
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.enabled.contains(&stage)
    }

    /// A job exists for the stage.
    pub fn was_scheduled(&self, stage: Stage) -> bool {
        self.jobs.contains_key(&stage)
    }

    /// The job of the stage is terminal.
    pub fn is_completed(&self, stage: Stage) -> bool {
        self.jobs.get(&stage).is_some_and(|status| status.is_terminal())
    }

    /// The run or one of its jobs failed.
    pub fn is_failed(&self) -> bool {
        self.run_failed
            || self.jobs.values().any(|status| *status == JobStatus::Failed)
    }

    /// Some job has not reached a terminal status.
    pub fn has_unfinished_jobs(&self) -> bool {
        self.jobs.values().any(|status| !status.is_terminal())
    }

    /// Final run status once nothing is left to schedule: FAILED beats
    /// FINISHED_WITH_ISSUES beats FINISHED.
    pub fn final_status(&self) -> OrtRunStatus {
        if self.is_failed() {
            OrtRunStatus::Failed
        } else if self
            .jobs
            .values()
            .any(|status| *status == JobStatus::FinishedWithIssues)
        {
            OrtRunStatus::FinishedWithIssues
        } else {
            OrtRunStatus::Finished
        }
    }
}

/// The pipeline's stage ordering. Static data; holds no run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageGraph {
    schedule: &'static [ScheduleInfo; 6],
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl StageGraph {
    /// Analyzer, then advisor and scanner, evaluator, reporter, notifier.
    pub const fn standard() -> Self {
        Self {
            schedule: &SCHEDULE,
        }
    }

    /// Scheduling rules of `stage`.
    pub fn info(&self, stage: Stage) -> &ScheduleInfo {
        let index = Stage::ALL
            .iter()
            .position(|candidate| *candidate == stage)
            .unwrap_or_default();
        &self.schedule[index]
    }

    /// Stages to start for a run without jobs.
    pub fn initial_stages(&self, configs: &JobConfigurations) -> Vec<Stage> {
        self.eligible_stages(&RunProgress::empty(configs))
    }

    /// Stages that became eligible now that `completed` is terminal.
    pub fn next_stages(&self, completed: Stage, progress: &RunProgress) -> Vec<Stage> {
        let downstream = self.downstream(completed);
        self.eligible_stages(progress)
            .into_iter()
            .filter(|stage| downstream.contains(stage))
            .collect()
    }

    /// Every stage that can be started given the current progress.
    pub fn eligible_stages(&self, progress: &RunProgress) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.can_run(*stage, progress))
            .collect()
    }

    /// A stage is pending if it is running or will run later. Stages that
    /// will not run themselves are transparent and count as pending while
    /// any of their predecessors is.
    pub fn is_pending(&self, stage: Stage, progress: &RunProgress) -> bool {
        if progress.was_scheduled(stage) {
            return !progress.is_completed(stage);
        }
        if self.will_run(stage, progress) {
            return true;
        }
        self.info(stage)
            .predecessors()
            .any(|predecessor| self.is_pending(predecessor, progress))
    }

    fn can_run(&self, stage: Stage, progress: &RunProgress) -> bool {
        let info = self.info(stage);
        progress.is_enabled(stage)
            && !progress.was_scheduled(stage)
            && self.failure_allows(stage, progress)
            && info
                .depends_on
                .iter()
                .all(|dependency| self.dependency_met(*dependency, progress))
            && !info
                .runs_after
                .iter()
                .any(|earlier| self.is_pending(*earlier, progress))
    }

    /// Not scheduled yet, but expected to get a job eventually.
    fn will_run(&self, stage: Stage, progress: &RunProgress) -> bool {
        progress.is_enabled(stage)
            && !progress.was_scheduled(stage)
            && self.failure_allows(stage, progress)
            && self
                .info(stage)
                .depends_on
                .iter()
                .all(|dependency| self.can_complete(*dependency, progress))
    }

    fn can_complete(&self, stage: Stage, progress: &RunProgress) -> bool {
        !progress.is_enabled(stage)
            || progress.was_scheduled(stage)
            || self.will_run(stage, progress)
    }

    fn dependency_met(&self, dependency: Stage, progress: &RunProgress) -> bool {
        if progress.is_enabled(dependency) {
            progress.is_completed(dependency)
        } else {
            !self.is_pending(dependency, progress)
        }
    }

    fn failure_allows(&self, stage: Stage, progress: &RunProgress) -> bool {
        self.info(stage).run_after_failure || !progress.is_failed()
    }

    /// Stages reachable from `stage` through dependency edges.
    fn downstream(&self, stage: Stage) -> BTreeSet<Stage> {
        let mut reached = BTreeSet::new();
        let mut frontier = vec![stage];
        while let Some(current) = frontier.pop() {
            for info in self.schedule {
                if info.predecessors().any(|p| p == current)
                    && reached.insert(info.stage)
                {
                    frontier.push(info.stage);
                }
            }
        }
        reached
    }
}
