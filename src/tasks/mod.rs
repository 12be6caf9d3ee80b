//! The per-cycle processing chain
//!
//! A chain is an ordered list of [`Task`]s built once at startup from the
//! `tasks.*` section of the parset. Every cycle's chunk is lent to each task
//! in turn; the first failure aborts the cycle, so sinks further down the
//! chain never see a partially processed chunk.

pub mod cal;
pub mod calc_uvw;
pub mod chan_avg;
pub mod chan_sel;
pub mod flag;
pub mod monitor;
pub mod phase_track;
pub mod sink;

use crate::{
    chunk::{ShapeError, VisChunk},
    config::{ConfigError, ObsConfig, Parset},
};
use std::{fmt, str::FromStr};
use tracing::{debug, info};

pub use self::{
    cal::CalTask, calc_uvw::CalcUvwTask, chan_avg::ChannelAvgTask, chan_sel::ChannelSelTask,
    flag::AmplitudeFlagTask, monitor::MonitorTask, phase_track::PhaseTrackTask,
    sink::{FileSinkTask, NullSinkTask},
};

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Chunk has an inconsistent shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Antenna index {0} is not in the antenna table")]
    UnknownAntenna(u32),
    #[error("{0}")]
    Invalid(String),
    #[error("Sink I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One processing stage
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Process one cycle in place. The chunk must not be retained past the call.
    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError>;
}

/// The task kinds the factory knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Noop,
    CalcUvw,
    ChannelAvg,
    ChannelSel,
    Cal,
    PhaseTrack,
    AmplitudeFlag,
    FileSink,
    NullSink,
    Monitor,
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NoopTask" => TaskKind::Noop,
            "CalcUVWTask" => TaskKind::CalcUvw,
            "ChannelAvgTask" => TaskKind::ChannelAvg,
            "ChannelSelTask" => TaskKind::ChannelSel,
            "CalTask" => TaskKind::Cal,
            "PhaseTrackTask" => TaskKind::PhaseTrack,
            "AmplitudeFlagTask" => TaskKind::AmplitudeFlag,
            "FileSinkTask" => TaskKind::FileSink,
            "NullSinkTask" => TaskKind::NullSink,
            "MonitorTask" => TaskKind::Monitor,
            other => return Err(format!("unknown task type {other}")),
        })
    }
}

/// Immutable description of one stage of the chain
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDesc {
    pub name: String,
    pub kind: TaskKind,
    /// Everything under `tasks.<name>.params.`
    pub params: Parset,
}

impl TaskDesc {
    /// Read `tasks.tasklist` and each listed task's type and parameters
    pub fn from_parset(parset: &Parset) -> Result<Vec<TaskDesc>, ConfigError> {
        let names = parset.get_list("tasks.tasklist")?;
        let mut descs: Vec<TaskDesc> = Vec::with_capacity(names.len());
        for name in names {
            if descs.iter().any(|d| d.name == name) {
                return Err(ConfigError::invalid(
                    "tasks.tasklist",
                    &name,
                    "task listed twice",
                ));
            }
            let type_key = format!("tasks.{name}.type");
            let kind = parset.get_parsed(&type_key)?;
            let params = parset.subset(&format!("tasks.{name}.params."));
            descs.push(TaskDesc { name, kind, params });
        }
        Ok(descs)
    }
}

/// Build the task a description names
pub fn build_task(desc: &TaskDesc, config: &ObsConfig) -> Result<Box<dyn Task>, TaskError> {
    let name = desc.name.clone();
    let params = &desc.params;
    Ok(match desc.kind {
        TaskKind::Noop => Box::new(NoopTask::new(name)),
        TaskKind::CalcUvw => Box::new(CalcUvwTask::new(name, config)),
        TaskKind::ChannelAvg => Box::new(ChannelAvgTask::from_params(name, params)?),
        TaskKind::ChannelSel => Box::new(ChannelSelTask::from_params(name, params)?),
        TaskKind::Cal => Box::new(CalTask::from_params(name, params, config)?),
        TaskKind::PhaseTrack => Box::new(PhaseTrackTask::new(name)),
        TaskKind::AmplitudeFlag => Box::new(AmplitudeFlagTask::from_params(name, params)?),
        TaskKind::FileSink => Box::new(FileSinkTask::from_params(name, params)?),
        TaskKind::NullSink => Box::new(NullSinkTask::new(name)),
        TaskKind::Monitor => Box::new(MonitorTask::new(name)),
    })
}

/// Leaves the chunk untouched
pub struct NoopTask {
    name: String,
}

impl NoopTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Task for NoopTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, _chunk: &mut VisChunk) -> Result<(), TaskError> {
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Task {task} failed: {source}")]
pub struct ChainError {
    pub task: String,
    #[source]
    pub source: TaskError,
}

#[derive(Default)]
pub struct TaskChain {
    tasks: Vec<Box<dyn Task>>,
}

impl fmt::Debug for TaskChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl TaskChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descs(descs: &[TaskDesc], config: &ObsConfig) -> Result<Self, ChainError> {
        let mut chain = TaskChain::new();
        for desc in descs {
            let task = build_task(desc, config).map_err(|source| ChainError {
                task: desc.name.clone(),
                source,
            })?;
            chain.push(task);
        }
        info!(tasks = ?chain.names(), "Task chain built");
        Ok(chain)
    }

    pub fn push(&mut self, task: Box<dyn Task>) {
        self.tasks.push(task);
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task over the chunk in order, stopping at the first failure
    pub fn process(&mut self, chunk: &mut VisChunk) -> Result<(), ChainError> {
        for task in &mut self.tasks {
            let result = task
                .process(chunk)
                .and_then(|()| chunk.validate().map_err(TaskError::from));
            if let Err(source) = result {
                return Err(ChainError {
                    task: task.name().to_owned(),
                    source,
                });
            }
            debug!(task = task.name(), "Task done");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::EXAMPLE;
    use std::sync::{Arc, Mutex};

    /// Records the order it ran in, optionally failing
    struct Tracer {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Task for Tracer {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(self.name.clone());
            chunk.scan_id += 1;
            if self.fail {
                Err(TaskError::Invalid("tracer failure".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn tracer(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Box<dyn Task> {
        Box::new(Tracer {
            name: name.to_owned(),
            log: log.clone(),
            fail,
        })
    }

    #[test]
    fn test_runs_in_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut chain = TaskChain::new();
        for name in ["a", "b", "c"] {
            chain.push(tracer(name, &log, false));
        }
        let mut chunk = VisChunk::new(1, 1, 1, 0);
        chain.process(&mut chunk).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(chunk.scan_id, 3);
    }

    #[test]
    fn test_stops_at_failure() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut chain = TaskChain::new();
        chain.push(tracer("a", &log, false));
        chain.push(tracer("b", &log, true));
        chain.push(tracer("sink", &log, false));
        let mut chunk = VisChunk::new(1, 1, 1, 0);
        let err = chain.process(&mut chunk).unwrap_err();
        assert_eq!(err.task, "b");
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_shape_breakage_is_attributed() {
        struct Breaker;
        impl Task for Breaker {
            fn name(&self) -> &str {
                "breaker"
            }
            fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
                chunk.antenna1.clear();
                Ok(())
            }
        }
        let mut chain = TaskChain::new();
        chain.push(Box::new(Breaker));
        let err = chain.process(&mut VisChunk::new(2, 1, 1, 0)).unwrap_err();
        assert_eq!(err.task, "breaker");
        assert!(matches!(err.source, TaskError::Shape(_)));
    }

    #[test]
    fn test_descs_from_parset() {
        let parset = Parset::parse(EXAMPLE).unwrap();
        let descs = TaskDesc::from_parset(&parset).unwrap();
        let kinds: Vec<_> = descs.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::CalcUvw, TaskKind::ChannelAvg, TaskKind::NullSink]
        );
        assert_eq!(descs[1].params.get("averaging"), Some("4"));
    }

    #[test]
    fn test_unknown_task_type() {
        let parset = Parset::parse("tasks.tasklist = [x]\ntasks.x.type = BogusTask").unwrap();
        assert!(matches!(
            TaskDesc::from_parset(&parset),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_chain_from_config() {
        let parset = Parset::parse(EXAMPLE).unwrap();
        let config = ObsConfig::from_parset(&parset, 0).unwrap();
        let chain = TaskChain::from_descs(&config.tasks, &config).unwrap();
        assert_eq!(chain.names(), vec!["uvw", "avg", "sink"]);
    }

    #[test]
    fn test_bad_params_name_the_task() {
        let mut parset = Parset::parse(EXAMPLE).unwrap();
        parset.insert("tasks.avg.params.averaging", "0");
        let config = ObsConfig::from_parset(&parset, 0).unwrap();
        let err = TaskChain::from_descs(&config.tasks, &config).unwrap_err();
        assert_eq!(err.task, "avg");
    }
}
