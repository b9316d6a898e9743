//! Remote method calls over the control pipe.
//!
//! # Call Flow
//!
//! ```text
//! proxy.set_settings_static(s)
//!   → RpcClient::call("set_settings_static", (s,))      [debug: signature check]
//!   → CallEnvelope { method, args: [ArgValue { decl, bincode bytes }] }
//!   → control pipe
//!   → RpcServer::process_message → MethodRegistry::dispatch
//!   → ReturnEnvelope { Ok | ProtocolError | RemoteException }
//!   → RpcError::{Remote, Communication} or the decoded value
//! ```

pub mod args;
pub mod client;
pub mod envelope;
pub mod error;
pub mod interfaces;
pub mod registry;
pub mod server;

pub use args::{ArgDecodeError, ArgTuple};
pub use client::RpcClient;
pub use envelope::{ArgDecl, ArgValue, CallEnvelope, RemoteFault, ReturnEnvelope, ReturnStatus};
pub use error::RpcError;
pub use interfaces::{
    camera_flow_registry, methods, register_camera, register_output, register_start_stop,
    CAMERA_FLOW_SIGNATURE,
};
pub use registry::{CapabilityBuilder, InterfaceSignature, MethodRegistry, MethodSignature, ParamSignature};
pub use server::{RpcServer, SessionSignal};
