use std::sync::Arc;

use tracing::info;

use crate::endpoint::{EndpointManager, MgcpEndpoint, NotificationRequest};
use crate::message::{MgcpParameterType, MgcpRequest};
use crate::pkg::{parse_signal_request, split_signal_requests};
use crate::signal::MgcpSignal;

use super::{CommandError, MgcpCommand, MgcpCommandResult};

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

/// RQNT: 通知リクエストの確立とシグナル起動
///
/// Sパラメータのシグナル要求を全て構築してからエンドポイントに適用する。
/// シグナル生成の失敗（518/538等）は一切の副作用なしにコマンドを失敗させる。
pub struct RqntCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
    applied: Option<Arc<MgcpEndpoint>>,
}

impl RqntCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self {
            request,
            endpoints,
            applied: None,
        }
    }
}

impl MgcpCommand for RqntCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        let endpoint = require_concrete(&self.request, &self.endpoints)?;

        let request_id = self
            .request
            .parameters
            .get(MgcpParameterType::RequestId)
            .ok_or_else(|| CommandError::protocol_error("RQNT requires a request id"))?
            .to_string();
        let notified_entity = self
            .request
            .parameters
            .get(MgcpParameterType::NotifiedEntity)
            .map(str::to_string);
        let requested_events = self
            .request
            .parameters
            .get(MgcpParameterType::RequestedEvents)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // シグナルは起動前に全て構築し、生成エラーで副作用を残さない
        let mut signals: Vec<Arc<dyn MgcpSignal>> = Vec::new();
        if let Some(signal_requests) = self.request.parameters.get(MgcpParameterType::SignalRequests)
        {
            for piece in split_signal_requests(signal_requests) {
                let (package, symbol, parameters) = parse_signal_request(piece)?;
                let signal = crate::pkg::create_signal(
                    &package,
                    &symbol,
                    parameters,
                    endpoint.player(),
                    endpoint.detector(),
                )?;
                signals.push(signal);
            }
        }

        endpoint.request_notification(NotificationRequest {
            request_id,
            notified_entity,
            requested_events,
        });
        self.applied = Some(endpoint.clone());

        for signal in signals {
            endpoint.clone().activate_signal(signal)?;
        }

        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            200,
            "Notification requested",
        ))
    }

    fn rollback(&mut self, code: u16, message: &str) -> Result<MgcpCommandResult, CommandError> {
        // 起動済みのシグナルを取り消す
        if let Some(endpoint) = self.applied.take() {
            endpoint.cancel_active_signal();
        }
        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            code,
            message,
        ))
    }

    fn reset(&mut self) {
        self.applied = None;
    }
}

/// NTFY: 観測イベント通知の受理
pub struct NtfyCommand {
    request: MgcpRequest,
    endpoints: Arc<dyn EndpointManager>,
}

impl NtfyCommand {
    pub fn new(request: MgcpRequest, endpoints: Arc<dyn EndpointManager>) -> Self {
        Self { request, endpoints }
    }
}

impl MgcpCommand for NtfyCommand {
    fn transaction_id(&self) -> u32 {
        self.request.transaction_id
    }

    fn execute(&mut self) -> Result<MgcpCommandResult, CommandError> {
        let endpoint = require_concrete(&self.request, &self.endpoints)?;

        let request_id = self
            .request
            .parameters
            .get(MgcpParameterType::RequestId)
            .ok_or_else(|| CommandError::protocol_error("NTFY requires a request id"))?;
        let observed_events = self
            .request
            .parameters
            .get(MgcpParameterType::ObservedEvents)
            .ok_or_else(|| CommandError::protocol_error("NTFY requires observed events"))?;

        info!(
            endpoint = %endpoint.id(),
            request_id,
            observed_events,
            "notification received"
        );

        Ok(MgcpCommandResult::new(
            self.request.transaction_id,
            200,
            "Notification received",
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
