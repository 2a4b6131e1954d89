//! Issue-requests fan-out.
//!
//! One logical request goes out to every known endpoint of the target
//! device; the first successful response wins and the rest are cancelled.
//! Failures stamp the per-endpoint no-response time; once every endpoint
//! has been failing past the offline threshold, the endpoints are dropped
//! and the device transitions OFFLINE.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info};

use super::client;
use super::errors::RpcError;
use crate::clock::Clock;
use crate::config::Config;
use crate::constants::DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S;
use crate::events::{EngineEvent, EventNotifier, StatusUpdate};
use crate::proto::{RequestBody, ResponseBody};
use crate::store::{Device, DeviceStatus, MetaStore};
use crate::Result;

/// A winning response and the endpoint that produced it.
#[derive(Debug)]
pub struct IssueOutcome {
    pub ip: String,
    pub response: ResponseBody,
}

/// Fan a request out over every endpoint of `device`.
pub async fn issue_to_device(
    store: &Arc<MetaStore>,
    config: &Arc<Config>,
    clock: &Arc<dyn Clock>,
    events: &Arc<EventNotifier>,
    device: &Device,
    body: &RequestBody,
) -> Result<IssueOutcome> {
    let ips = store.device_ips(device.id).await?;
    if ips.is_empty() {
        offline(store, events, device).await?;
        return Err(RpcError::AllEndpointsFailed {
            device_uuid: device.uuid.clone(),
        }
        .into());
    }

    let mut join_set = JoinSet::new();
    for endpoint in &ips {
        let host = endpoint.ip.clone();
        let port = device.route_port as u16;
        let body = body.clone();
        let config = Arc::clone(config);
        join_set.spawn(async move {
            let result = client::send_request(&host, port, &body, &config).await;
            (host, result)
        });
    }

    let mut last_error: Option<crate::Error> = None;
    while let Some(joined) = join_set.join_next().await {
        let Ok((ip, result)) = joined else { continue };
        match result {
            Ok(response) => {
                // Winner cancels the rest.
                join_set.abort_all();
                store.clear_ip_no_response(device.id, &ip).await?;
                if device.status != DeviceStatus::Online {
                    store.set_device_status(device.id, DeviceStatus::Online).await?;
                    events.update(StatusUpdate::Event(EngineEvent::DeviceStatusChanged {
                        device_uuid: device.uuid.clone(),
                        online: true,
                    }));
                }
                return Ok(IssueOutcome { ip, response });
            }
            Err(e) => {
                debug!(device = %device.uuid, ip = %ip, "Endpoint failed: {e}");
                store
                    .mark_ip_no_response(device.id, &ip, clock.now_secs())
                    .await?;
                last_error = Some(e);
            }
        }
    }

    maybe_offline(store, clock, events, device).await?;
    Err(last_error.unwrap_or_else(|| {
        RpcError::AllEndpointsFailed {
            device_uuid: device.uuid.clone(),
        }
        .into()
    }))
}

/// Transition the device OFFLINE when every endpoint has been failing past
/// the threshold (or it has none left).
pub async fn maybe_offline(
    store: &Arc<MetaStore>,
    clock: &Arc<dyn Clock>,
    events: &Arc<EventNotifier>,
    device: &Device,
) -> Result<()> {
    let cutoff = clock.now_secs() - DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S;
    let ips = store.device_ips(device.id).await?;
    let all_expired = ips
        .iter()
        .all(|ip| matches!(ip.earliest_no_response_time, Some(t) if t <= cutoff));
    if ips.is_empty() || all_expired {
        if !ips.is_empty() {
            store.delete_device_ips(device.id).await?;
        }
        offline(store, events, device).await?;
    }
    Ok(())
}

async fn offline(
    store: &Arc<MetaStore>,
    events: &Arc<EventNotifier>,
    device: &Device,
) -> Result<()> {
    if device.status != DeviceStatus::Offline {
        store
            .set_device_status(device.id, DeviceStatus::Offline)
            .await?;
        info!(device = %device.uuid, "Device transitioned offline");
        events.update(StatusUpdate::Event(EngineEvent::DeviceStatusChanged {
            device_uuid: device.uuid.clone(),
            online: false,
        }));
    }
    Ok(())
}
