use serde::{Deserialize, Serialize};

pub const RPC_MESSAGE_PATH: &str = "/rpc/v1/message";
pub const RPC_HEALTH_PATH: &str = "/healthz";

/// Body of a single RPC call: one serialized [`crate::Message`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcCall {
    pub message: String,
}

/// The gateway always answers with text; errors are reported in-band.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcReply {
    pub result: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_body_uses_message_field() {
        let body = serde_json::to_string(&RpcCall {
            message: "1|op|pw|string|homing".to_string(),
        })
        .expect("serialize");
        assert_eq!(body, r#"{"message":"1|op|pw|string|homing"}"#);
    }

    #[test]
    fn reply_body_decodes() {
        let reply: RpcReply = serde_json::from_str(r#"{"result":"Robot conectado."}"#).expect("decode");
        assert_eq!(reply.result, "Robot conectado.");
    }
}
