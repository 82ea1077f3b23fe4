//! Out-calls to the front end
//!
//! Typed wrappers over the pending-call machinery: encode the request,
//! queue it, wait for the correlated response and decode it. Internal
//! paths that are guaranteed to be resolved by the transport (a reset
//! completes every pending call) wait unbounded; administrative paths
//! pass an explicit timeout.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;

use crate::context::AppContext;
use crate::protocol::{icp, status};
use crate::rpc::messages::{
    ConnectionStatsRequest, ConnectionStatsResponse, DisconnectUserSessionRequest,
    DisconnectUserSessionResponse, LogonInfoRequest, LogoffUserSessionRequest,
    LogoffUserSessionResponse, MessageRequest, MessageResponse, StartRemoteControlRequest,
    StartRemoteControlResponse, StopRemoteControlRequest, StopRemoteControlResponse,
    SwitchToRequest, SwitchToResponse, VirtualChannelCloseRequest, VirtualChannelCloseResponse,
    VirtualChannelOpenRequest, VirtualChannelOpenResponse,
};
use crate::rpc::CallOutcome;

/// Failed out-call: one of the [`status`] codes plus the peer's error
/// text, if any.
#[derive(Debug, Clone)]
pub struct CallFailure {
    pub code: u32,
    pub description: Option<String>,
}

impl CallFailure {
    fn from_outcome(outcome: &CallOutcome) -> Self {
        Self {
            code: outcome.code,
            description: outcome.error_description.clone(),
        }
    }
}

async fn roundtrip<Req: Message, Resp: Message + Default>(
    ctx: &Arc<AppContext>,
    call_type: u16,
    request: &Req,
    timeout: Option<Duration>,
) -> Result<Resp, CallFailure> {
    let payload = request.encode_to_vec();
    let outcome = match timeout {
        Some(timeout) => ctx.rpc.call(call_type, payload, timeout).await,
        None => ctx.rpc.call_unbounded(call_type, payload).await,
    };
    if !outcome.is_success() {
        return Err(CallFailure::from_outcome(&outcome));
    }
    outcome.decode::<Resp>().map_err(|_| CallFailure {
        code: status::BAD_RESPONSE,
        description: None,
    })
}

/// Ask the front end to log a connection off.
pub async fn logoff_user_session(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    timeout: Duration,
) -> Result<bool, CallFailure> {
    let response: LogoffUserSessionResponse = roundtrip(
        ctx,
        icp::LOGOFF_USER_SESSION,
        &LogoffUserSessionRequest { connection_id },
        Some(timeout),
    )
    .await?;
    Ok(response.logged_off)
}

/// Ask the front end to drop a connection without logging it off.
pub async fn disconnect_user_session(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    timeout: Duration,
) -> Result<bool, CallFailure> {
    let response: DisconnectUserSessionResponse = roundtrip(
        ctx,
        icp::DISCONNECT_USER_SESSION,
        &DisconnectUserSessionRequest { connection_id },
        Some(timeout),
    )
    .await?;
    Ok(response.disconnected)
}

/// Re-attach a connection to another backend pipe. Unbounded wait;
/// resolved by the response or by a transport reset.
pub async fn switch_to(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    service_endpoint: &str,
    max_width: u32,
    max_height: u32,
    ogon_cookie: &str,
    backend_cookie: &str,
) -> Result<bool, CallFailure> {
    let response: SwitchToResponse = roundtrip(
        ctx,
        icp::SWITCH_TO,
        &SwitchToRequest {
            connection_id,
            service_endpoint: service_endpoint.to_string(),
            max_width,
            max_height,
            ogon_cookie: ogon_cookie.to_string(),
            backend_cookie: backend_cookie.to_string(),
        },
        None,
    )
    .await?;
    Ok(response.success)
}

/// Show a message box on the client; returns the button id or
/// `IDTIMEOUT`.
#[allow(clippy::too_many_arguments)]
pub async fn message(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    message_type: u32,
    style: u32,
    timeout_secs: u32,
    parameters: &[String],
    wait: Duration,
) -> Result<u32, CallFailure> {
    let mut request = MessageRequest {
        connection_id,
        message_type,
        style,
        timeout: timeout_secs,
        parameter_num: parameters.len().min(5) as u32,
        ..Default::default()
    };
    let mut params = parameters.iter();
    request.parameter1 = params.next().cloned().unwrap_or_default();
    request.parameter2 = params.next().cloned().unwrap_or_default();
    request.parameter3 = params.next().cloned().unwrap_or_default();
    request.parameter4 = params.next().cloned().unwrap_or_default();
    request.parameter5 = params.next().cloned().unwrap_or_default();

    let response: MessageResponse =
        roundtrip(ctx, icp::MESSAGE, &request, Some(wait)).await?;
    Ok(response.result)
}

pub async fn virtual_channel_open(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    virtual_name: &str,
    dynamic_channel: bool,
    flags: u32,
    timeout: Duration,
) -> Result<(String, u32), CallFailure> {
    let response: VirtualChannelOpenResponse = roundtrip(
        ctx,
        icp::OTSAPI_VIRTUAL_CHANNEL_OPEN,
        &VirtualChannelOpenRequest {
            connection_id,
            virtual_name: virtual_name.to_string(),
            dynamic_channel,
            flags,
        },
        Some(timeout),
    )
    .await?;
    Ok((response.pipe_name, response.instance))
}

pub async fn virtual_channel_close(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    virtual_name: &str,
    instance: u32,
    timeout: Duration,
) -> Result<bool, CallFailure> {
    let response: VirtualChannelCloseResponse = roundtrip(
        ctx,
        icp::OTSAPI_VIRTUAL_CHANNEL_CLOSE,
        &VirtualChannelCloseRequest {
            connection_id,
            virtual_name: virtual_name.to_string(),
            instance,
        },
        Some(timeout),
    )
    .await?;
    Ok(response.success)
}

pub async fn start_remote_control(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    target_connection_id: u32,
    hotkey_vk: u8,
    hotkey_modifiers: u16,
    flags: u32,
    timeout: Duration,
) -> Result<bool, CallFailure> {
    let response: StartRemoteControlResponse = roundtrip(
        ctx,
        icp::OTSAPI_START_REMOTE_CONTROL,
        &StartRemoteControlRequest {
            connection_id,
            target_connection_id,
            hotkey_vk: hotkey_vk as u32,
            hotkey_modifiers: hotkey_modifiers as u32,
            flags,
        },
        Some(timeout),
    )
    .await?;
    Ok(response.success)
}

pub async fn stop_remote_control(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    timeout: Duration,
) -> Result<bool, CallFailure> {
    let response: StopRemoteControlResponse = roundtrip(
        ctx,
        icp::OTSAPI_STOP_REMOTE_CONTROL,
        &StopRemoteControlRequest { connection_id },
        Some(timeout),
    )
    .await?;
    Ok(response.success)
}

/// Fetch transport statistics for a connection from the front end.
pub async fn connection_stats(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    timeout: Duration,
) -> Result<ConnectionStatsResponse, CallFailure> {
    roundtrip(
        ctx,
        icp::CONNECTION_STATS,
        &ConnectionStatsRequest { connection_id },
        Some(timeout),
    )
    .await
}

/// Inform the front end about a completed logon. Fire-and-forget: the
/// response is not awaited.
pub fn post_logon_info(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    session_id: u32,
    user_name: &str,
    domain: &str,
) {
    let request = LogonInfoRequest {
        connection_id,
        session_id,
        user_name: user_name.to_string(),
        domain: domain.to_string(),
    };
    let _ = ctx.rpc.post(icp::LOGON_INFO, request.encode_to_vec());
}
