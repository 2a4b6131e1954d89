//! Route-port RPC client: one request, one response, bounded wait.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::errors::RpcError;
use crate::config::Config;
use crate::constants::WAIT_RESPONSE_TIMEOUT_IN_S;
use crate::proto::{self, RequestBody, ResponseBody, read_frame, write_frame};
use crate::Result;

/// Send one request to `host:port` and wait for its response.
pub async fn send_request(
    host: &str,
    port: u16,
    body: &RequestBody,
    config: &Config,
) -> Result<ResponseBody> {
    let addr = format!("{host}:{port}");
    let wait = Duration::from_secs(WAIT_RESPONSE_TIMEOUT_IN_S);
    trace!(addr = %addr, code = ?body.code(), "Issuing request");

    let mut stream = timeout(wait, TcpStream::connect(&addr))
        .await
        .map_err(|_| RpcError::Timeout { addr: addr.clone() })?
        .map_err(|e| RpcError::ConnectFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

    let key = config.account_key().ok();
    let envelope = proto::encode_request(&config.device_uuid(), body, key.as_ref())?;

    timeout(wait, write_frame(&mut stream, &envelope))
        .await
        .map_err(|_| RpcError::Timeout { addr: addr.clone() })??;

    let reply = timeout(wait, read_frame(&mut stream))
        .await
        .map_err(|_| RpcError::Timeout { addr: addr.clone() })??
        .ok_or(RpcError::ConnectFailed {
            addr: addr.clone(),
            reason: "connection closed before response".to_string(),
        })?;

    let response = proto::decode_response(&reply, key.as_ref())?;
    if let ResponseBody::Error { code, message } = response {
        return Err(RpcError::Peer { code, message }.into());
    }
    Ok(response)
}
