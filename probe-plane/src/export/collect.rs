//! In-memory command sink

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use probe_plane_common::{Command, CommandKind, CommandListener};

/// Stores delivered commands in a vector shared with its clones
///
/// Give one clone to the runtime and keep another to inspect what was
/// delivered.
#[derive(Clone, Default)]
pub struct CollectingSink {
    commands: Arc<Mutex<Vec<Command>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.commands.lock().iter().filter(|cmd| cmd.kind() == kind).count()
    }

    /// Text of every delivered `Message`, in order
    pub fn messages(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter_map(|cmd| match cmd {
                Command::Message { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl CommandListener for CollectingSink {
    fn on_command(&mut self, cmd: Command) -> io::Result<()> {
        self.commands.lock().push(cmd);
        Ok(())
    }
}
