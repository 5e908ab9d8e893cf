use std::sync::Arc;

use crate::endpoint::{ConnectionMode, EndpointManager, MgcpEndpoint};
use crate::message::{MgcpParameterType, MgcpRequest, Parameters};

use super::{CommandError, MgcpCommand, MgcpCommandResult};

/// 16進のコネクションIDパラメータをパースする
fn parse_connection_id(value: &str) -> Result<u32, CommandError> {
    u32::from_str_radix(value, 16)
        .map_err(|_| CommandError::protocol_error(format!("Invalid connection id {}", value)))
}

/// ワイルドカードを許さないコマンドのエンドポイント解決
fn require_concrete(
    request: &MgcpRequest,
    endpoints: &Arc<dyn EndpointManager>,
) -> Result<Arc<MgcpEndpoint>, CommandError> {
    if request.endpoint_id.is_wildcard_all() || request.endpoint_id.is_wildcard_any() {
        return Err(CommandError::protocol_error(format!(
            "{} requires a concrete endpoint id",
            request.verb
        )));
    }
    endpoints.lookup(&request.endpoint_id)
}

/// CRCX: コネクション生成
/// `$`は空きエンドポイントを割り当て、具体IDをZパラメータで返す
pub struct CrcxCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
    created: Option<(Arc<MgcpEndpoint>, u32)>,
}

impl CrcxCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self {
            request,
            endpoints,
            created: None,
        }
    }
}

impl MgcpCommand for CrcxCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        if self.request.endpoint_id.is_wildcard_all() {
            return Err(CommandError::protocol_error(
                "CRCX does not accept the all-endpoints wildcard",
            ));
        }

        let allocated = self.request.endpoint_id.is_wildcard_any();
        let endpoint = if allocated {
            self.endpoints.allocate_any(&self.request.endpoint_id.domain)?
        } else {
            self.endpoints.lookup(&self.request.endpoint_id)?
        };

        let call_id = self
            .request
            .parameters
            .get(MgcpParameterType::CallId)
            .ok_or_else(|| CommandError::protocol_error("CRCX requires a call id"))?;
        let mode_value = self
            .request
            .parameters
            .get(MgcpParameterType::ConnectionMode)
            .ok_or_else(|| CommandError::protocol_error("CRCX requires a connection mode"))?;
        let mode = ConnectionMode::from_symbol(mode_value).ok_or_else(|| {
            CommandError::protocol_error(format!("Unknown connection mode {}", mode_value))
        })?;

        let connection = endpoint.register_connection(call_id, mode)?;
        self.created = Some((endpoint.clone(), connection.id));

        let mut parameters = Parameters::new();
        parameters.set(MgcpParameterType::ConnectionId, connection.hex_id());
        if allocated {
            parameters.set(
                MgcpParameterType::SpecificEndpointId,
                endpoint.id().to_string(),
            );
        }
        Ok(
            MgcpCommandResult::new(self.request.transaction_id, 200, "Connection created")
                .with_parameters(parameters),
        )
    }

    fn rollback(&mut self, code: u16, message: &str) -> Result<MgcpCommandResult, CommandError> {
        // 登録済みのコネクションを取り消す
        if let Some((endpoint, connection_id)) = self.created.take() {
            endpoint.unregister_connection(connection_id);
        }
        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            code,
            message,
        ))
    }

    fn reset(&mut self) {
        self.created = None;
    }
}

/// MDCX: コネクションモード変更
pub struct MdcxCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
    previous: Option<(Arc<MgcpEndpoint>, u32, ConnectionMode)>,
}

impl MdcxCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self {
            request,
            endpoints,
            previous: None,
        }
    }
}

impl MgcpCommand for MdcxCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        let endpoint = require_concrete(&self.request, &self.endpoints)?;

        let connection_value = self
            .request
            .parameters
            .get(MgcpParameterType::ConnectionId)
            .ok_or_else(|| CommandError::protocol_error("MDCX requires a connection id"))?;
        let connection_id = parse_connection_id(connection_value)?;

        if let Some(mode_value) = self.request.parameters.get(MgcpParameterType::ConnectionMode) {
            let mode = ConnectionMode::from_symbol(mode_value).ok_or_else(|| {
                CommandError::protocol_error(format!("Unknown connection mode {}", mode_value))
            })?;
            let current = endpoint.find_connection(connection_id).ok_or_else(|| {
                CommandError::new(
                    515,
                    format!("Connection {} is unknown", connection_value),
                )
            })?;
            endpoint.modify_connection(connection_id, mode)?;
            self.previous = Some((endpoint.clone(), connection_id, current.mode));
        } else if endpoint.find_connection(connection_id).is_none() {
            return Err(CommandError::new(
                515,
                format!("Connection {} is unknown", connection_value),
            ));
        }

        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            200,
            "Connection modified",
        ))
    }

    fn rollback(&mut self, code: u16, message: &str) -> Result<MgcpCommandResult, CommandError> {
        // 変更済みモードを巻き戻す
        if let Some((endpoint, connection_id, mode)) = self.previous.take() {
            let _ = endpoint.modify_connection(connection_id, mode);
        }
        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            code,
            message,
        ))
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

/// DLCX: コネクション削除
/// Iがあれば単一、Cのみなら同一コールの全コネクション、どちらも無ければ全削除。
/// 未登録IDの削除は冪等に成功する。
pub struct DlcxCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
}

impl DlcxCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self { request, endpoints }
    }
}

impl MgcpCommand for DlcxCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        let endpoint = require_concrete(&self.request, &self.endpoints)?;

        if let Some(connection_value) = self.request.parameters.get(MgcpParameterType::ConnectionId)
        {
            let connection_id = parse_connection_id(connection_value)?;
            endpoint.unregister_connection(connection_id);
        } else if let Some(call_id) = self.request.parameters.get(MgcpParameterType::CallId) {
            endpoint.unregister_call(call_id);
        } else {
            endpoint.unregister_all();
        }

        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            250,
            "Connection deleted",
        ))
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
