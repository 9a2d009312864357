//! Maps dispatched commands onto service requests.

use std::sync::Arc;

use log::debug;
use serde_json::Value;

use super::{ServiceHandle, ServiceState, ServiceStatus, TrackingSessionConfig};
use crate::command::{Command, CommandError, CommandHandler, CommandType};
use crate::error::Error;

/// Command handler of a Data Source process.
///
/// Every mapped command answers with the resulting status, so a polling
/// caller always gets a result.
#[derive(Clone)]
pub struct ServiceCommandHandler {
    service: Arc<ServiceHandle>,
}

impl ServiceCommandHandler {
    pub fn new(service: Arc<ServiceHandle>) -> Self {
        Self { service }
    }

    fn start_tracking(&self, command: &Command) -> Result<Option<Value>, CommandError> {
        let config = command
            .data
            .get_as::<TrackingSessionConfig>(TrackingSessionConfig::DATA_KEY)
            .map_err(|e| {
                CommandError::bad_request(format!("invalid {}: {}", TrackingSessionConfig::DATA_KEY, e))
            })?
            .ok_or_else(|| {
                CommandError::bad_request(format!("missing {}", TrackingSessionConfig::DATA_KEY))
            })?;

        let status = self.service.start_tracking(config).map_err(into_command_error)?;
        if status.state != ServiceState::Running {
            let reason = status
                .last_error
                .clone()
                .unwrap_or_else(|| "streaming subsystem failed to start".to_string());
            return Err(CommandError::internal(reason));
        }
        status_value(&status)
    }
}

fn into_command_error(error: Error) -> CommandError {
    match error {
        Error::Rejected(reason) => CommandError::conflict(reason),
        other => CommandError::internal(other.to_string()),
    }
}

fn status_value(status: &ServiceStatus) -> Result<Option<Value>, CommandError> {
    serde_json::to_value(status)
        .map(Some)
        .map_err(|e| CommandError::internal(format!("encoding status: {}", e)))
}

impl CommandHandler for ServiceCommandHandler {
    fn handle(&self, command: &Command) -> Result<Option<Value>, CommandError> {
        debug!(
            "service: handling {} ({})",
            command.command_type, command.request_id
        );
        match command.command_type {
            CommandType::GetStatus => status_value(&self.service.status()),
            CommandType::EnableAutoDiscovery => {
                let status = self
                    .service
                    .enable_auto_discovery()
                    .map_err(into_command_error)?;
                status_value(&status)
            }
            CommandType::StartTracking => self.start_tracking(command),
            CommandType::StopTracking => {
                let status = self.service.stop_tracking().map_err(into_command_error)?;
                status_value(&status)
            }
            CommandType::Reboot => {
                let status = self.service.reboot().map_err(into_command_error)?;
                status_value(&status)
            }
            CommandType::Undefined => Ok(None),
        }
    }
}
