pub(crate) mod codec;
pub(crate) mod header;
mod message;

pub use codec::{
    MAX_BODY_SIZE, RawFrame, Request, Response, decode_request, decode_response, encode_request,
    encode_request_into, encode_response, read_frame, read_request, read_response,
    write_request, write_response,
};
pub use header::{HEADER_SIZE, Header, MAGIC, OpCode, RespHeader, ResponseKind};
pub use message::{
    CONN_INFO_SIZE, IPC_HANDLE_SIZE, IpcMemHandle, KeysRequest, LOCAL_RESULT_SIZE, LocalMeta,
    LocalResult, RdmaConnInfo, RemoteMetaRequest, RemoteMetaResponse, TcpPayload,
};
