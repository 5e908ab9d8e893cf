use std::sync::Arc;

use crate::endpoint::{EndpointManager, MgcpEndpoint};
use crate::message::{MgcpParameterType, MgcpRequest, Parameters};

use super::{CommandError, MgcpCommand, MgcpCommandResult};

/// AUEP: エンドポイント監査
/// `*`はドメイン内のエンドポイント一覧をZパラメータで返す
pub struct AuepCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
}

impl AuepCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self { request, endpoints }
    }

    fn audit_one(&self, endpoint: &Arc<MgcpEndpoint>) -> Parameters {
        let mut parameters = Parameters::new();
        if let Some(notification) = endpoint.notification() {
            parameters.set(MgcpParameterType::RequestId, notification.request_id);
            parameters.set(
                MgcpParameterType::RequestedEvents,
                notification.requested_events.join(","),
            );
        }
        parameters
    }
}

impl MgcpCommand for AuepCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        if self.request.endpoint_id.is_wildcard_any() {
            return Err(CommandError::protocol_error(
                "AUEP does not accept the any-endpoint wildcard",
            ));
        }

        if self.request.endpoint_id.is_wildcard_all() {
            let mut parameters = Parameters::new();
            for id in self.endpoints.list(&self.request.endpoint_id.domain) {
                parameters.add(MgcpParameterType::SpecificEndpointId, id.to_string());
            }
            return Ok(MgcpCommandResult::new(
                self.request.transaction_id,
                200,
                "Endpoints listed",
            )
            .with_parameters(parameters));
        }

        let endpoint = self.endpoints.lookup(&self.request.endpoint_id)?;
        let parameters = self.audit_one(&endpoint);
        Ok(
            MgcpCommandResult::new(self.request.transaction_id, 200, "Endpoint audited")
                .with_parameters(parameters),
        )
    }

    fn rollback(&mut self, code: u16, message: &str) -> Result<MgcpCommandResult, CommandError> {
        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            code,
            message,
        ))
    }

    fn reset(&mut self) {}
}

/// AUCX: コネクション監査
pub struct AucxCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
}

impl AucxCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self { request, endpoints }
    }
}

impl MgcpCommand for AucxCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        if self.request.endpoint_id.is_wildcard_all() || self.request.endpoint_id.is_wildcard_any()
        {
            return Err(CommandError::protocol_error(
                "AUCX requires a concrete endpoint id",
            ));
        }
        let endpoint = self.endpoints.lookup(&self.request.endpoint_id)?;

        let connection_value = self
            .request
            .parameters
            .get(MgcpParameterType::ConnectionId)
            .ok_or_else(|| CommandError::protocol_error("AUCX requires a connection id"))?;
        let connection_id = u32::from_str_radix(connection_value, 16).map_err(|_| {
            CommandError::protocol_error(format!("Invalid connection id {}", connection_value))
        })?;

        let connection = endpoint.find_connection(connection_id).ok_or_else(|| {
            CommandError::new(
                515,
                format!("Connection {} is unknown", connection_value),
            )
        })?;

        let mut parameters = Parameters::new();
        parameters.set(MgcpParameterType::CallId, connection.call_id.clone());
        parameters.set(
            MgcpParameterType::ConnectionMode,
            connection.mode.as_symbol().to_string(),
        );
        Ok(
            MgcpCommandResult::new(self.request.transaction_id, 200, "Connection audited")
                .with_parameters(parameters),
        )
    }

    fn rollback(&mut self, code: u16, message: &str) -> Result<MgcpCommandResult, CommandError> {
        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            code,
            message,
        ))
    }

    fn reset(&mut self) {}
}
