mod envelope;
mod phrases;
mod rpc;

pub use envelope::{EnvelopeError, FIELD_SEPARATOR, Message, Payload, SERVER_SENDER};
pub use phrases::{
    ABSOLUTE_MODE, CATALOGUE, CONNECT_DEVICE, DISCONNECT_DEVICE, FINISH_RECORDING, GRIPPER_OFF,
    GRIPPER_ON, HELP, HELP_ALIASES, HOMING, MOTORS_OFF, MOTORS_ON, MOVE_ARM, RELATIVE_MODE, REPORT,
    START_RECORDING, normalize,
};
pub use rpc::{RPC_HEALTH_PATH, RPC_MESSAGE_PATH, RpcCall, RpcReply};
