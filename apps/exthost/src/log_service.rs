//! `ExtHostLogService` actor: lets the host change the log level at runtime

use exthost_config::{LogHandle, LogLevel};
use exthost_protocol::{
    async_trait, decode_arg, Actor, CancellationToken, Reply, RpcError, RpcResult,
};
use serde_json::Value;

pub const LOG_SERVICE_ACTOR: &str = "ExtHostLogService";

pub struct LogService {
    handle: LogHandle,
}

impl LogService {
    pub fn new(handle: LogHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Actor for LogService {
    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        _cancellation: CancellationToken,
    ) -> RpcResult<Reply> {
        match method {
            "$setLevel" => {
                let code: u8 = decode_arg(method, &args, 0)?;
                let level = LogLevel::try_from(code)
                    .map_err(|e| RpcError::invalid_arguments(method, e))?;
                self.handle
                    .set_level(level)
                    .map_err(|e| RpcError::remote("Error", e.to_string()))?;
                Ok(Reply::Empty)
            }
            other => Err(RpcError::unknown_method(other)),
        }
    }
}
