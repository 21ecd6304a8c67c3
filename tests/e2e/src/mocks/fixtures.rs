//! Test Fixtures
//!
//! Provides scripted stand-ins for everything outside the engine:
//! - Migrations that record their runs and fail on demand
//! - Service manager recording stop/start events
//! - Command runner recording command lines without executing them

use semver::Version;
use std::io;
use std::sync::{Arc, Mutex};
use stepwise_core::{
    CommandOutput, CommandRunner, HookKind, Migration, MigrationContext, MigrationError,
    MigrationId, Mode, RestoreHook, ServiceManager,
};

/// Shared, ordered record of what ran
pub type RunLog = Arc<Mutex<Vec<String>>>;

/// Migration whose behavior is fully scripted
///
/// Runs append the migration id to the shared log; hooks append
/// `<hook>:<id>` (plus `:<app_id>` for application hooks).
///
/// # Example
///
/// ```rust,ignore
/// let log = RunLog::default();
/// let b = ScriptedMigration::new("0002_b", &log).depends_on("0001_a").failing("disk full");
/// ```
pub struct ScriptedMigration {
    id: MigrationId,
    mode: Mode,
    dependencies: Vec<String>,
    disclaimer: Option<String>,
    introduced: Option<Version>,
    failure: Option<String>,
    hooks: Vec<HookKind>,
    failing_hooks: bool,
    log: RunLog,
}

impl ScriptedMigration {
    pub fn new(id: &str, log: &RunLog) -> Self {
        Self {
            id: MigrationId::parse(id).expect("fixture id must be valid"),
            mode: Mode::Auto,
            dependencies: Vec::new(),
            disclaimer: None,
            introduced: None,
            failure: None,
            hooks: Vec::new(),
            failing_hooks: false,
            log: log.clone(),
        }
    }

    pub fn depends_on(mut self, reference: &str) -> Self {
        self.dependencies.push(reference.to_string());
        self
    }

    pub fn manual(mut self) -> Self {
        self.mode = Mode::Manual;
        self
    }

    pub fn disclaimer(mut self, text: &str) -> Self {
        self.disclaimer = Some(text.to_string());
        self
    }

    pub fn introduced_in(mut self, version: &str) -> Self {
        self.introduced = Some(Version::parse(version).expect("fixture version must be semver"));
        self
    }

    /// `run` raises with this message
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn hook(mut self, kind: HookKind) -> Self {
        self.hooks.push(kind);
        self
    }

    pub fn failing_hooks(mut self) -> Self {
        self.failing_hooks = true;
        self
    }

    pub fn boxed(self) -> Box<dyn Migration> {
        Box::new(self)
    }
}

impl Migration for ScriptedMigration {
    fn id(&self) -> &MigrationId {
        &self.id
    }

    fn description(&self) -> String {
        format!("Scripted migration {}", self.id.slug())
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn disclaimer(&self) -> Option<String> {
        self.disclaimer.clone()
    }

    fn introduced_in_version(&self) -> Option<&Version> {
        self.introduced.as_ref()
    }

    fn run(&self, _ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        self.log.lock().unwrap().push(self.id.to_string());
        match &self.failure {
            Some(message) => Err(MigrationError::Precondition(message.clone())),
            None => Ok(()),
        }
    }

    fn supports_hook(&self, kind: HookKind) -> bool {
        self.hooks.contains(&kind)
    }

    fn run_hook(&self, hook: &RestoreHook<'_>, _ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        let entry = match hook {
            RestoreHook::AfterSystemRestore => format!("{}:{}", hook.kind(), self.id),
            RestoreHook::BeforeAppRestore { app_id } => format!("{}:{}:{}", hook.kind(), self.id, app_id),
        };
        self.log.lock().unwrap().push(entry);
        if self.failing_hooks {
            return Err(MigrationError::Precondition(format!("hook of {} failed", self.id)));
        }
        Ok(())
    }
}

/// Service manager that only records what it was asked
#[derive(Default)]
pub struct FakeServices {
    events: Mutex<Vec<String>>,
    fail_stop: bool,
}

impl FakeServices {
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    /// `"stop <name>"` / `"start <name>"`, in call order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ServiceManager for FakeServices {
    fn stop(&self, service: &str) -> Result<(), MigrationError> {
        self.events.lock().unwrap().push(format!("stop {}", service));
        if self.fail_stop {
            return Err(MigrationError::Precondition(format!("{} refused to stop", service)));
        }
        Ok(())
    }

    fn start(&self, service: &str) -> Result<(), MigrationError> {
        self.events.lock().unwrap().push(format!("start {}", service));
        Ok(())
    }
}

/// Command runner that records command lines and never executes them
///
/// Commands containing one of the failing patterns exit with code 1.
#[derive(Default)]
pub struct FakeRunner {
    commands: Mutex<Vec<String>>,
    failing: Vec<String>,
}

impl FakeRunner {
    pub fn failing_on(patterns: &[&str]) -> Self {
        Self {
            failing: patterns.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, command: &str) -> io::Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        let fails = self.failing.iter().any(|p| command.contains(p.as_str()));
        Ok(CommandOutput {
            exit_code: if fails { 1 } else { 0 },
            stdout: String::new(),
            stderr: if fails { format!("{}: scripted failure", command) } else { String::new() },
        })
    }
}
