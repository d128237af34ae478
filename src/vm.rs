//! Minimal view of the guest the console controller needs: a lifecycle
//! state it can poll plus a watch stream of changes. The embedder maps its
//! virtualization backend onto this.

use crate::connection::GraphicsDescriptor;

/// Coarse guest lifecycle states as far as the console cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmRunState {
    Running,
    Paused,
    Shutoff,
    Crashed,
}

impl VmRunState {
    /// Running or paused guests have a live display server.
    pub fn is_active(self) -> bool {
        matches!(self, VmRunState::Running | VmRunState::Paused)
    }
}

/// Handle to the guest whose console is being shown.
pub trait VmHandle: Send + Sync {
    fn run_state(&self) -> VmRunState;

    /// Current graphics device description, refreshed from the backend.
    /// `None` when the guest has no graphical display at all.
    fn graphics(&self) -> Option<GraphicsDescriptor>;

    fn name(&self) -> String;

    fn is_active(&self) -> bool {
        self.run_state().is_active()
    }

    fn is_paused(&self) -> bool {
        self.run_state() == VmRunState::Paused
    }

    fn is_shutoff(&self) -> bool {
        self.run_state() == VmRunState::Shutoff
    }

    fn is_crashed(&self) -> bool {
        self.run_state() == VmRunState::Crashed
    }
}
