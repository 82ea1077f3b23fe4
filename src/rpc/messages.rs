//! Call payload messages
//!
//! Protobuf bodies carried inside [`crate::rpc::envelope::RpcEnvelope`]
//! frames, one request/response pair per call family. Field numbers
//! are wire contract; append-only.

/// Property kind discriminator used by the bulk query.
pub mod property_kind {
    pub const BOOL: u32 = 1;
    pub const NUMBER: u32 = 2;
    pub const STRING: u32 = 3;
}

// ---------------------------------------------------------------------
// ICP: front end -> session manager
// ---------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(bool, tag = "1")]
    pub pong: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogonUserRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(string, tag = "2")]
    pub user_name: String,
    #[prost(string, tag = "3")]
    pub domain: String,
    #[prost(string, tag = "4")]
    pub password: String,
    #[prost(uint32, tag = "5")]
    pub width: u32,
    #[prost(uint32, tag = "6")]
    pub height: u32,
    #[prost(uint32, tag = "7")]
    pub color_depth: u32,
    #[prost(string, tag = "8")]
    pub client_host_name: String,
    #[prost(string, tag = "9")]
    pub client_address: String,
    #[prost(uint32, tag = "10")]
    pub client_build_number: u32,
    #[prost(uint32, tag = "11")]
    pub client_product_id: u32,
    #[prost(uint32, tag = "12")]
    pub client_hardware_id: u32,
    #[prost(uint32, tag = "13")]
    pub client_protocol_type: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogonUserResponse {
    #[prost(string, tag = "1")]
    pub service_endpoint: String,
    #[prost(uint32, tag = "2")]
    pub max_width: u32,
    #[prost(uint32, tag = "3")]
    pub max_height: u32,
    #[prost(string, tag = "4")]
    pub ogon_cookie: String,
    #[prost(string, tag = "5")]
    pub backend_cookie: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct DisconnectUserSessionRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct DisconnectUserSessionResponse {
    #[prost(bool, tag = "1")]
    pub disconnected: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PropertyBoolResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(bool, tag = "2")]
    pub value: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PropertyNumberResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyStringResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyBulkEntry {
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyBulkRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub properties: Vec<PropertyBulkEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyBulkValue {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(bool, tag = "2")]
    pub bool_value: bool,
    #[prost(int64, tag = "3")]
    pub number_value: i64,
    #[prost(string, tag = "4")]
    pub string_value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyBulkResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<PropertyBulkValue>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RemoteControlEndedRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub target_connection_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RemoteControlEndedResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

// ---------------------------------------------------------------------
// ICP: session manager -> front end
// ---------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SwitchToRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(string, tag = "2")]
    pub service_endpoint: String,
    #[prost(uint32, tag = "3")]
    pub max_width: u32,
    #[prost(uint32, tag = "4")]
    pub max_height: u32,
    #[prost(string, tag = "5")]
    pub ogon_cookie: String,
    #[prost(string, tag = "6")]
    pub backend_cookie: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SwitchToResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LogoffUserSessionRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LogoffUserSessionResponse {
    #[prost(bool, tag = "1")]
    pub logged_off: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub message_type: u32,
    #[prost(uint32, tag = "3")]
    pub style: u32,
    #[prost(uint32, tag = "4")]
    pub timeout: u32,
    #[prost(uint32, tag = "5")]
    pub parameter_num: u32,
    #[prost(string, tag = "6")]
    pub parameter1: String,
    #[prost(string, tag = "7")]
    pub parameter2: String,
    #[prost(string, tag = "8")]
    pub parameter3: String,
    #[prost(string, tag = "9")]
    pub parameter4: String,
    #[prost(string, tag = "10")]
    pub parameter5: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MessageResponse {
    #[prost(uint32, tag = "1")]
    pub result: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VirtualChannelOpenRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(string, tag = "2")]
    pub virtual_name: String,
    #[prost(bool, tag = "3")]
    pub dynamic_channel: bool,
    #[prost(uint32, tag = "4")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VirtualChannelOpenResponse {
    #[prost(string, tag = "1")]
    pub pipe_name: String,
    #[prost(uint32, tag = "2")]
    pub instance: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VirtualChannelCloseRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(string, tag = "2")]
    pub virtual_name: String,
    #[prost(uint32, tag = "3")]
    pub instance: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VirtualChannelCloseResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StartRemoteControlRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub target_connection_id: u32,
    #[prost(uint32, tag = "3")]
    pub hotkey_vk: u32,
    #[prost(uint32, tag = "4")]
    pub hotkey_modifiers: u32,
    #[prost(uint32, tag = "5")]
    pub flags: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StartRemoteControlResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StopRemoteControlRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StopRemoteControlResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogonInfoRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub session_id: u32,
    #[prost(string, tag = "3")]
    pub user_name: String,
    #[prost(string, tag = "4")]
    pub domain: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LogonInfoResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ConnectionStatsRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ConnectionStatsResponse {
    #[prost(uint64, tag = "1")]
    pub incoming_bytes: u64,
    #[prost(uint64, tag = "2")]
    pub outgoing_bytes: u64,
    #[prost(uint64, tag = "3")]
    pub incoming_frames: u64,
    #[prost(uint64, tag = "4")]
    pub outgoing_frames: u64,
}

// ---------------------------------------------------------------------
// SBP: backend -> session manager (relayed by the front end)
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SbpVersionRequest {
    #[prost(uint32, tag = "1")]
    pub session_id: u32,
    #[prost(uint32, tag = "2")]
    pub vmajor: u32,
    #[prost(uint32, tag = "3")]
    pub vminor: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SbpVersionResponse {
    #[prost(bool, tag = "1")]
    pub compatible: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthenticateUserRequest {
    #[prost(uint32, tag = "1")]
    pub session_id: u32,
    #[prost(string, tag = "2")]
    pub user_name: String,
    #[prost(string, tag = "3")]
    pub domain: String,
    #[prost(string, tag = "4")]
    pub password: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AuthenticateUserResponse {
    #[prost(uint32, tag = "1")]
    pub auth_status: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct EndSessionRequest {
    #[prost(uint32, tag = "1")]
    pub session_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct EndSessionResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}
