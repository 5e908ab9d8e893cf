pub mod au;

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::CommandError;
use crate::signal::{DtmfDetector, MgcpSignal, Player};

/// パッケージ名でシグナル生成をディスパッチする
/// 未サポートのパッケージはコード518
pub fn create_signal(
    package: &str,
    symbol: &str,
    parameters: HashMap<String, String>,
    player: Arc<dyn Player>,
    detector: Arc<dyn DtmfDetector>,
) -> Result<Arc<dyn MgcpSignal>, CommandError> {
    match package.to_ascii_uppercase().as_str() {
        au::PACKAGE_NAME => au::create_signal(symbol, parameters, player, detector),
        other => Err(CommandError::unknown_extension(other)),
    }
}

/// SignalRequestsパラメータ値をトップレベルのシグナル要求に分割する
/// 括弧内のカンマでは分割しない
pub fn split_signal_requests(value: &str) -> Vec<&str> {
    let mut requests = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, ch) in value.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let piece = value[start..index].trim();
                if !piece.is_empty() {
                    requests.push(piece);
                }
                start = index + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        requests.push(tail);
    }
    requests
}

/// `PKG/sym(k=v k=v)` 形式のシグナル要求をパースする
/// パラメータは空白区切り、値はカンマを含んでよい（例: ip=a.wav,b.wav）
pub fn parse_signal_request(
    value: &str,
) -> Result<(String, String, HashMap<String, String>), CommandError> {
    let value = value.trim();
    let (head, body) = match value.split_once('(') {
        Some((head, rest)) => {
            let body = rest
                .strip_suffix(')')
                .ok_or_else(|| CommandError::protocol_error(format!(
                    "Unbalanced parentheses in signal request {}",
                    value
                )))?;
            (head, Some(body))
        }
        None => (value, None),
    };

    let (package, symbol) = head
        .split_once('/')
        .ok_or_else(|| CommandError::protocol_error(format!(
            "Signal request {} is missing a package qualifier",
            value
        )))?;
    if package.is_empty() || symbol.is_empty() {
        return Err(CommandError::protocol_error(format!(
            "Malformed signal request {}",
            value
        )));
    }

    let mut parameters = HashMap::new();
    if let Some(body) = body {
        for token in body.split_whitespace() {
            let (name, parameter_value) = token.split_once('=').ok_or_else(|| {
                CommandError::protocol_error(format!(
                    "Malformed signal parameter {} in {}",
                    token, value
                ))
            })?;
            parameters.insert(name.to_string(), parameter_value.to_string());
        }
    }

    Ok((package.to_string(), symbol.to_string(), parameters))
}
