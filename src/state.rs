//! Runtime state shared by the layout engine, process watcher and lights.

/// The active program, its pid and the layout number in use.
///
/// Layout 0 means no program is active. Every mutator compares old and new
/// values and only marks the state dirty on a real change.
#[derive(Debug, Default)]
pub struct SharedState {
    program: Option<usize>,
    pid: Option<i32>,
    layout: usize,
    changed: bool,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the active program in the current config
    pub fn program(&self) -> Option<usize> {
        self.program
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn layout(&self) -> usize {
        self.layout
    }

    pub fn set_layout(&mut self, layout: usize) {
        if self.layout != layout {
            self.layout = layout;
            self.changed = true;
        }
    }

    pub fn set_program(&mut self, program: Option<usize>, pid: Option<i32>) {
        if self.program != program || self.pid != pid {
            self.program = program;
            self.pid = pid;
            self.changed = true;
        }
    }

    /// Read and clear the dirty flag.
    pub fn has_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}
