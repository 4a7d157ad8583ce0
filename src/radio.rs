use std::process::Command;

use tracing::{error, info};

use crate::error::RadioError;

/// Coarse control over the wireless radio carrying peer discovery.
///
/// Called from the discovery event loop, so implementations must not block.
pub trait RadioControl: Send {
    fn set_radio_enabled(&mut self, enabled: bool) -> Result<(), RadioError>;
}

/// Toggles the radio by running an external command such as
/// `nmcli radio wifi off`.
pub struct CommandRadio {
    off_command: Vec<String>,
    on_command: Vec<String>,
}

impl CommandRadio {
    pub fn new(off_command: Vec<String>, on_command: Vec<String>) -> Self {
        Self {
            off_command,
            on_command,
        }
    }

    fn run(command: &[String]) -> Result<(), RadioError> {
        let (program, args) = command.split_first().ok_or(RadioError::NotConfigured)?;
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|source| RadioError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(RadioError::ExitStatus {
                program: program.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl RadioControl for CommandRadio {
    fn set_radio_enabled(&mut self, enabled: bool) -> Result<(), RadioError> {
        let command = if enabled {
            &self.on_command
        } else {
            &self.off_command
        };
        if command.is_empty() {
            return Err(RadioError::NotConfigured);
        }
        info!(enabled, command = %command.join(" "), "Switching wireless radio");

        // The command outcome is only reported through the log.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let command = command.clone();
                runtime.spawn_blocking(move || {
                    if let Err(e) = Self::run(&command) {
                        error!(enabled, error = %e, "Radio switch failed");
                    }
                });
                Ok(())
            }
            Err(_) => Self::run(command).inspect_err(|e| error!(error = %e, "Radio switch failed")),
        }
    }
}
