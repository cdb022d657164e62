// File: src/debugger.rs
//
// In-process debugger hook (spec §4.6): breakpoints keyed by (file, line), step
// modes, conditional breakpoints, and a pause event a host can inspect before
// releasing the VM to continue. No direct teacher analogue — the teacher ships no
// debug protocol — so this is built from spec §4.6 directly, reusing the crate's
// own `FrameInfo`/`SourceLocation` types for introspection and `serde`/`serde_json`
// (a teacher dependency) for the pause-event payload shape, anticipating an
// out-of-scope wire bridge serializing it over a socket.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::FrameInfo;
use crate::value::Value;

/// How the debugger should behave the next time it's consulted (spec §4.6 "Step
/// modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// Run until a breakpoint or an explicit `pause()` request.
    #[default]
    Run,
    /// Stop at the next line, regardless of call depth.
    StepLine,
    /// Stop at the next line, but only within the current call frame or shallower
    /// (skips over any calls the current line makes).
    StepOver { depth_ceiling: usize },
    /// Stop at the next line within a call made from the current frame (the first
    /// line inside whatever gets called next), or at the current frame if nothing
    /// is called before it returns.
    StepInto,
    /// Run until the current frame returns to its caller.
    StepOut { depth_ceiling: usize },
}

/// One conditional or unconditional breakpoint (spec §4.6 "Breakpoints").
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub file: Option<String>,
    pub line: u32,
    /// A Skiff source expression; the breakpoint only fires when this evaluates
    /// truthy in the paused frame's scope. Evaluation is the host's responsibility
    /// (the debugger only stores the text) since it requires re-entering the VM.
    pub condition: Option<String>,
    pub enabled: bool,
}

/// Snapshot handed to the host when execution pauses: enough to render a call
/// stack and inspect locals without exposing the VM's internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseEvent {
    pub file: Option<String>,
    pub line: u32,
    pub reason: PauseReason,
    pub frames: Vec<PauseFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    Breakpoint,
    Step,
    PauseRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseFrame {
    pub function_name: String,
    pub file: Option<String>,
    pub line: u32,
}

impl From<&FrameInfo> for PauseFrame {
    fn from(f: &FrameInfo) -> Self {
        PauseFrame { function_name: f.function_name.clone(), file: f.file.clone(), line: f.line }
    }
}

/// Breakpoint table, step-mode state machine, and pause gate. Owned by a `Host`
/// (spec §4.8), consulted by the VM at statement boundaries before each line
/// executes. The VM itself never blocks on I/O here — `should_pause` is a pure
/// predicate, and the host decides what "paused" means (block a thread, await a
/// channel, etc).
#[derive(Default)]
pub struct Debugger {
    breakpoints: Vec<Breakpoint>,
    step_mode: StepMode,
    /// One-shot: set by `request_pause`, cleared the next time `should_pause` fires.
    pause_requested: bool,
    last_paused_line: Option<(Option<String>, u32)>,
    watch_files: HashSet<String>,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger::default()
    }

    pub fn add_breakpoint(&mut self, file: Option<String>, line: u32, condition: Option<String>) {
        if let Some(f) = &file {
            self.watch_files.insert(f.clone());
        }
        self.breakpoints.push(Breakpoint { file, line, condition, enabled: true });
    }

    pub fn remove_breakpoint(&mut self, file: Option<&str>, line: u32) {
        self.breakpoints.retain(|b| !(b.file.as_deref() == file && b.line == line));
    }

    pub fn set_breakpoint_enabled(&mut self, file: Option<&str>, line: u32, enabled: bool) {
        for b in self.breakpoints.iter_mut() {
            if b.file.as_deref() == file && b.line == line {
                b.enabled = enabled;
            }
        }
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn set_step_mode(&mut self, mode: StepMode) {
        self.step_mode = mode;
    }

    pub fn request_pause(&mut self) {
        self.pause_requested = true;
    }

    /// Called by the VM before executing the statement at `(file, line)` with the
    /// call stack at `depth`. Returns `Some(reason)` if execution should pause;
    /// `condition_holds` lets the caller pre-evaluate a breakpoint's guard
    /// expression in the paused scope (the debugger has no VM access to do this
    /// itself).
    pub fn should_pause(
        &mut self,
        file: Option<&str>,
        line: u32,
        depth: usize,
        condition_holds: impl Fn(&str) -> bool,
    ) -> Option<PauseReason> {
        if self.pause_requested {
            self.pause_requested = false;
            self.last_paused_line = Some((file.map(str::to_string), line));
            return Some(PauseReason::PauseRequested);
        }
        for bp in &self.breakpoints {
            if !bp.enabled || bp.line != line {
                continue;
            }
            if bp.file.is_some() && bp.file.as_deref() != file {
                continue;
            }
            if let Some(cond) = &bp.condition {
                if !condition_holds(cond) {
                    continue;
                }
            }
            self.last_paused_line = Some((file.map(str::to_string), line));
            return Some(PauseReason::Breakpoint);
        }
        let hit = match self.step_mode {
            StepMode::Run => false,
            StepMode::StepLine => true,
            StepMode::StepInto => true,
            StepMode::StepOver { depth_ceiling } => depth <= depth_ceiling,
            StepMode::StepOut { depth_ceiling } => depth < depth_ceiling,
        };
        if hit {
            self.step_mode = StepMode::Run;
            self.last_paused_line = Some((file.map(str::to_string), line));
            return Some(PauseReason::Step);
        }
        None
    }

    pub fn build_pause_event(&self, file: Option<String>, line: u32, reason: PauseReason, frames: &[FrameInfo]) -> PauseEvent {
        PauseEvent { file, line, reason, frames: frames.iter().map(PauseFrame::from).collect() }
    }
}

/// Reads a script-level value's display form for a debugger locals inspection
/// panel, without exposing `Value`'s internal heap representation to a host that
/// only wants strings.
pub fn describe_value(value: &Value) -> String {
    crate::value::to_display_string(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconditional_breakpoint_fires_on_matching_line() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(Some("main.skiff".into()), 10, None);
        let reason = dbg.should_pause(Some("main.skiff"), 10, 0, |_| true);
        assert_eq!(reason, Some(PauseReason::Breakpoint));
    }

    #[test]
    fn breakpoint_with_false_condition_does_not_fire() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(Some("main.skiff".into()), 10, Some("x > 5".into()));
        let reason = dbg.should_pause(Some("main.skiff"), 10, 0, |_| false);
        assert_eq!(reason, None);
    }

    #[test]
    fn step_over_ignores_deeper_frames() {
        let mut dbg = Debugger::new();
        dbg.set_step_mode(StepMode::StepOver { depth_ceiling: 2 });
        assert_eq!(dbg.should_pause(None, 1, 3, |_| true), None);
        assert_eq!(dbg.should_pause(None, 2, 2, |_| true), Some(PauseReason::Step));
    }

    #[test]
    fn pause_request_is_one_shot() {
        let mut dbg = Debugger::new();
        dbg.request_pause();
        assert_eq!(dbg.should_pause(None, 1, 0, |_| true), Some(PauseReason::PauseRequested));
        assert_eq!(dbg.should_pause(None, 2, 0, |_| true), None);
    }

    #[test]
    fn disabled_breakpoint_does_not_fire() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(Some("a.skiff".into()), 5, None);
        dbg.set_breakpoint_enabled(Some("a.skiff"), 5, false);
        assert_eq!(dbg.should_pause(Some("a.skiff"), 5, 0, |_| true), None);
    }
}
