//! Coordinator
//!
//! Owns the environment and the one runtime model of the process. The model
//! variant is chosen once, from the runtime's major version, the first time
//! [`ProfilerGuard::initialize`] runs; later calls return the first result
//! and touch nothing.

use crate::config::{Config, RuntimeTarget, RuntimeVersion};
use crate::detectors::{ArbiterReport, ControlBlockDetector, ProfilerStatus, StatusFlagDetector};
use crate::engine::environment::Environment;
use crate::platform;

/// The runtime model matching the runtime's layout.
#[derive(Debug)]
pub enum RuntimeModel {
    /// 2.x runtimes: single bit-flag status word.
    StatusFlag(StatusFlagDetector),
    /// 4.x runtimes: control block plus attach-channel race.
    ControlBlock(ControlBlockDetector),
}

impl RuntimeModel {
    pub fn for_version(version: RuntimeVersion) -> Option<Self> {
        match version.major {
            2 => Some(RuntimeModel::StatusFlag(StatusFlagDetector::new())),
            4 => Some(RuntimeModel::ControlBlock(ControlBlockDetector::new())),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuntimeModel::StatusFlag(_) => "status-flag",
            RuntimeModel::ControlBlock(_) => "control-block",
        }
    }

    fn initialize(&mut self, env: &Environment, config: &Config, version: RuntimeVersion) -> bool {
        match self {
            RuntimeModel::StatusFlag(d) => d.initialize(env),
            RuntimeModel::ControlBlock(d) => d.initialize(env, config, version),
        }
    }

    /// Address of the status word or field, once located.
    pub fn status_address(&self) -> Option<usize> {
        match self {
            RuntimeModel::StatusFlag(d) => d.address(),
            RuntimeModel::ControlBlock(d) => d.block().map(|b| b.status_address()),
        }
    }

    fn status(&self, env: &Environment) -> Option<ProfilerStatus> {
        match self {
            RuntimeModel::StatusFlag(d) => d.status(&*env.memory),
            RuntimeModel::ControlBlock(d) => d.status(&*env.memory),
        }
    }

    fn is_attached(&self, env: &Environment) -> bool {
        match self {
            RuntimeModel::StatusFlag(d) => d.is_attached(&*env.memory),
            RuntimeModel::ControlBlock(d) => d.is_attached(&*env.memory),
        }
    }

    fn was_attached(&self) -> bool {
        match self {
            RuntimeModel::StatusFlag(d) => d.was_attached(),
            RuntimeModel::ControlBlock(d) => d.was_attached(),
        }
    }

    fn mitigate(&self, env: &Environment) -> bool {
        match self {
            RuntimeModel::StatusFlag(d) => d.mitigate(&*env.memory),
            RuntimeModel::ControlBlock(d) => d.mitigate(&*env.memory),
        }
    }
}

/// Outcome of the one initialization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub runtime: Option<RuntimeTarget>,
    pub model: Option<&'static str>,
    /// Whether the status structure was found. This is what `initialize`
    /// returns.
    pub located: bool,
    pub status_address: Option<usize>,
    pub was_attached: bool,
    /// Attach-channel race, for the control block model.
    pub arbiter: Option<ArbiterReport>,
}

impl InitReport {
    fn inert(runtime: Option<RuntimeTarget>) -> Self {
        Self {
            runtime,
            model: None,
            located: false,
            status_address: None,
            was_attached: false,
            arbiter: None,
        }
    }
}

/// Detection and mitigation service for the runtime hosted in this process.
#[derive(Debug)]
pub struct ProfilerGuard {
    config: Config,
    env: Option<Environment>,
    model: Option<RuntimeModel>,
    report: Option<InitReport>,
}

impl ProfilerGuard {
    /// Guard that builds the native environment on initialization.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            env: None,
            model: None,
            report: None,
        }
    }

    /// Guard running against caller-supplied collaborators.
    pub fn with_environment(config: Config, env: Environment) -> Self {
        Self {
            env: Some(env),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the configuration. Ignored once initialized.
    pub fn configure(&mut self, config: Config) {
        if self.report.is_some() {
            log::debug!("[GUARD] Already initialized, configuration unchanged");
            return;
        }
        self.config = config;
    }

    pub fn is_initialized(&self) -> bool {
        self.report.is_some()
    }

    /// Runs the one initialization pass. Returns whether the status
    /// structure was located.
    pub fn initialize(&mut self) -> bool {
        if let Some(report) = &self.report {
            log::debug!("[GUARD] Already initialized");
            return report.located;
        }

        let report = self.run_initialization();
        log::info!(
            "[GUARD] Initialized: model={:?} located={} was_attached={}",
            report.model,
            report.located,
            report.was_attached
        );
        let located = report.located;
        self.report = Some(report);
        located
    }

    fn run_initialization(&mut self) -> InitReport {
        let Some(target) = self.config.runtime.clone().or_else(platform::detect_runtime) else {
            log::info!("[GUARD] No supported runtime loaded");
            return InitReport::inert(None);
        };

        let Some(mut model) = RuntimeModel::for_version(target.version) else {
            log::info!("[GUARD] No signatures for runtime version {}", target.version);
            return InitReport::inert(Some(target));
        };

        if self.env.is_none() {
            match platform::native_environment(&target) {
                Ok(env) => self.env = Some(env),
                Err(e) => {
                    log::warn!("[GUARD] Cannot inspect {}: {}", target.module, e);
                    return InitReport::inert(Some(target));
                }
            }
        }
        let Some(env) = self.env.as_ref() else {
            return InitReport::inert(Some(target));
        };

        log::debug!("[GUARD] Using {} model for {:?}", model.name(), env);
        let located = model.initialize(env, &self.config, target.version);
        let report = InitReport {
            model: Some(model.name()),
            located,
            status_address: model.status_address(),
            was_attached: model.was_attached(),
            arbiter: match &model {
                RuntimeModel::ControlBlock(d) => d.arbiter_report().cloned(),
                RuntimeModel::StatusFlag(_) => None,
            },
            runtime: Some(target),
        };
        self.model = Some(model);
        report
    }

    fn active(&self) -> Option<(&RuntimeModel, &Environment)> {
        Some((self.model.as_ref()?, self.env.as_ref()?))
    }

    /// Current attach state. `false` before initialization or when the
    /// status structure was not found.
    pub fn is_profiler_attached(&self) -> bool {
        self.active()
            .is_some_and(|(model, env)| model.is_attached(env))
    }

    /// Attach state captured during initialization.
    pub fn was_profiler_attached(&self) -> bool {
        self.model.as_ref().is_some_and(RuntimeModel::was_attached)
    }

    /// Clears the status so an attached profiler stops receiving callbacks.
    /// Returns whether anything was written.
    pub fn prevent_active_profiler_from_receiving_messages(&self) -> bool {
        let Some((model, env)) = self.active() else {
            return false;
        };
        let written = model.mitigate(env);
        log::info!("[GUARD] Profiler status cleared: {}", written);
        written
    }

    pub fn status(&self) -> Option<ProfilerStatus> {
        self.active().and_then(|(model, env)| model.status(env))
    }

    /// Event mask of the control block, for diagnostics.
    pub fn event_mask(&self) -> Option<u32> {
        match self.active()? {
            (RuntimeModel::ControlBlock(d), env) => d.event_mask(&*env.memory),
            (RuntimeModel::StatusFlag(_), _) => None,
        }
    }

    pub fn report(&self) -> Option<InitReport> {
        self.report.clone()
    }
}
